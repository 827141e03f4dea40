//! Direct no-watermark strategy for TikTok.
//!
//! Asks the public tikwm.com API for the unwatermarked play URL and streams
//! the media straight to disk, skipping the generic extractor entirely.
//! Every failure here is non-fatal: the orchestrator falls through to the
//! generic strategy without surfacing the error.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use thiserror::Error;
use tokio::{
    io::AsyncWriteExt,
    time::{Duration, timeout},
};
use tracing::debug;
use uuid::Uuid;

const TIKWM_API_URL: &str = "https://www.tikwm.com/api/";
const METADATA_TIMEOUT_SECONDS: u64 = 10;
const MEDIA_TIMEOUT_SECONDS: u64 = 180;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct DirectError(pub String);

/// Provider-specific fast path that can produce a finished media file
/// without the generic extractor.
#[async_trait]
pub trait DirectStrategy: Send + Sync {
    /// Whether this strategy applies to the URL, by domain substring.
    fn supports(&self, url: &str) -> bool;

    async fn download(
        &self,
        url: &str,
        output_dir: &Path,
        request_id: Uuid,
    ) -> Result<PathBuf, DirectError>;
}

#[derive(Debug, Deserialize)]
struct TikwmResponse {
    code: i64,
    msg: Option<String>,
    data: Option<TikwmData>,
}

#[derive(Debug, Deserialize)]
struct TikwmData {
    play: Option<String>,
    hdplay: Option<String>,
}

pub struct TikTokDirect {
    client: reqwest::Client,
}

impl TikTokDirect {
    pub fn new() -> Result<Self, DirectError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(METADATA_TIMEOUT_SECONDS))
            .build()
            .map_err(|error| DirectError(format!("could not build HTTP client: {error}")))?;
        Ok(Self { client })
    }

    async fn media_url(&self, url: &str) -> Result<String, DirectError> {
        let response = self
            .client
            .get(TIKWM_API_URL)
            .query(&[("url", url), ("hd", "1")])
            .send()
            .await
            .map_err(|error| DirectError(format!("metadata request failed: {error}")))?;

        if !response.status().is_success() {
            return Err(DirectError(format!(
                "metadata API returned HTTP {}",
                response.status()
            )));
        }

        let info: TikwmResponse = response
            .json()
            .await
            .map_err(|error| DirectError(format!("malformed metadata response: {error}")))?;

        if info.code != 0 {
            return Err(DirectError(format!(
                "metadata API rejected the URL: {}",
                info.msg.unwrap_or_else(|| format!("code {}", info.code))
            )));
        }

        let data = info
            .data
            .ok_or_else(|| DirectError("metadata response carried no data".to_string()))?;
        let play = data
            .hdplay
            .or(data.play)
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| DirectError("metadata response carried no play URL".to_string()))?;

        Ok(resolve_media_url(&play))
    }
}

/// tikwm sometimes returns the play URL as a path relative to its own host.
fn resolve_media_url(play: &str) -> String {
    if play.starts_with("http://") || play.starts_with("https://") {
        play.to_string()
    } else {
        format!("https://www.tikwm.com{}", play)
    }
}

#[async_trait]
impl DirectStrategy for TikTokDirect {
    fn supports(&self, url: &str) -> bool {
        url.contains("tiktok.com")
    }

    async fn download(
        &self,
        url: &str,
        output_dir: &Path,
        request_id: Uuid,
    ) -> Result<PathBuf, DirectError> {
        let media_url = self.media_url(url).await?;
        debug!(%request_id, "Direct TikTok media URL resolved");

        let output_path = output_dir.join(format!("{request_id}.mp4"));
        let transfer = async {
            let response = self
                .client
                .get(&media_url)
                .send()
                .await
                .map_err(|error| DirectError(format!("media request failed: {error}")))?;

            if !response.status().is_success() {
                return Err(DirectError(format!(
                    "media host returned HTTP {}",
                    response.status()
                )));
            }

            let mut file = tokio::fs::File::create(&output_path)
                .await
                .map_err(|error| DirectError(format!("could not create output file: {error}")))?;

            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk =
                    chunk.map_err(|error| DirectError(format!("media stream failed: {error}")))?;
                file.write_all(&chunk)
                    .await
                    .map_err(|error| DirectError(format!("could not write media: {error}")))?;
            }
            file.flush()
                .await
                .map_err(|error| DirectError(format!("could not flush media file: {error}")))?;
            Ok(())
        };

        match timeout(Duration::from_secs(MEDIA_TIMEOUT_SECONDS), transfer).await {
            Ok(Ok(())) => Ok(output_path),
            Ok(Err(error)) => {
                remove_incomplete(&output_path).await;
                Err(error)
            }
            Err(_) => {
                remove_incomplete(&output_path).await;
                Err(DirectError("media transfer timed out".to_string()))
            }
        }
    }
}

async fn remove_incomplete(path: &Path) {
    let _ = tokio::fs::remove_file(path).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn relative_play_urls_are_anchored_to_the_api_host() {
        assert_eq!(
            resolve_media_url("/video/media/hdplay/v1.mp4"),
            "https://www.tikwm.com/video/media/hdplay/v1.mp4"
        );
        assert_eq!(
            resolve_media_url("https://cdn.example.com/v1.mp4"),
            "https://cdn.example.com/v1.mp4"
        );
    }

    #[test]
    fn metadata_response_parses_and_prefers_hd() {
        let info: TikwmResponse = serde_json::from_str(
            r#"{"code":0,"msg":"success","data":{"play":"/sd.mp4","hdplay":"/hd.mp4"}}"#,
        )
        .unwrap();
        assert_eq!(info.code, 0);
        let data = info.data.unwrap();
        assert_eq!(data.hdplay.as_deref(), Some("/hd.mp4"));
        assert_eq!(data.play.as_deref(), Some("/sd.mp4"));
    }

    #[test]
    fn supports_matches_tiktok_hosts_only() {
        let strategy = TikTokDirect::new().unwrap();
        assert!(strategy.supports("https://www.tiktok.com/@user/video/1"));
        assert!(strategy.supports("https://vm.tiktok.com/ZMabcdef/"));
        assert!(!strategy.supports("https://www.instagram.com/reel/xyz/"));
    }
}

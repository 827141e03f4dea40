//! The generic extraction strategy: shell out to yt-dlp and hand back the
//! exact file it produced.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{
    process::Command,
    time::{Duration, timeout},
};
use tracing::debug;
use uuid::Uuid;

const YT_DLP_TIMEOUT_SECONDS: u64 = 180;

/// Suffixes yt-dlp uses for in-progress or helper files. Anything matching
/// these is never counted as a produced output.
const PARTIAL_SUFFIXES: [&str; 4] = [".part", ".ytdl", ".temp", ".download"];

#[derive(Debug, Error)]
pub enum ExtractError {
    /// The extractor exited with an error; the message is its last
    /// non-empty stderr line.
    #[error("{0}")]
    Failed(String),

    /// The extractor claimed success but no non-partial output file with
    /// the request's identifier exists.
    #[error("no output file found after extraction")]
    OutputMissing,
}

/// External capability that fetches and muxes media from a URL into the
/// output directory, naming the file after the request identifier. Safe to
/// retry with the same identifier: a retry overwrites rather than appends.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(
        &self,
        url: &str,
        output_dir: &Path,
        request_id: Uuid,
        cookie_file: Option<&Path>,
    ) -> Result<PathBuf, ExtractError>;
}

pub struct YtDlpExtractor {
    binary: String,
}

impl YtDlpExtractor {
    pub fn new() -> Self {
        Self {
            binary: "yt-dlp".to_string(),
        }
    }
}

impl Default for YtDlpExtractor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Extractor for YtDlpExtractor {
    async fn extract(
        &self,
        url: &str,
        output_dir: &Path,
        request_id: Uuid,
        cookie_file: Option<&Path>,
    ) -> Result<PathBuf, ExtractError> {
        let output_template = output_dir
            .join(format!("{request_id}.%(ext)s"))
            .to_string_lossy()
            .into_owned();

        let mut args = vec![
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            "--newline".to_string(),
            "--retries".to_string(),
            "3".to_string(),
            "--fragment-retries".to_string(),
            "3".to_string(),
            "-f".to_string(),
            "bestvideo+bestaudio/best".to_string(),
            "--merge-output-format".to_string(),
            "mp4".to_string(),
            "--print".to_string(),
            "after_move:filepath".to_string(),
            "-o".to_string(),
            output_template,
        ];

        if let Some(cookie_file) = cookie_file {
            args.push("--cookies".to_string());
            args.push(cookie_file.to_string_lossy().into_owned());
        }

        args.push(url.to_string());

        debug!(%request_id, "Running {} for {url}", self.binary);
        let command_future = Command::new(&self.binary).args(args).output();
        let output = timeout(Duration::from_secs(YT_DLP_TIMEOUT_SECONDS), command_future)
            .await
            .map_err(|_| ExtractError::Failed("extraction timed out".to_string()))?
            .map_err(|error| {
                if error.kind() == ErrorKind::NotFound {
                    ExtractError::Failed(format!(
                        "{} is not installed or not on PATH",
                        self.binary
                    ))
                } else {
                    ExtractError::Failed(format!("could not spawn {}: {error}", self.binary))
                }
            })?;

        if !output.status.success() {
            return Err(ExtractError::Failed(last_stderr_line(&output.stderr)));
        }

        // Trust the printed path when it checks out, otherwise fall back to
        // scanning for the identifier prefix. Either way the result must be
        // an existing non-partial file: success is verified by filesystem
        // presence, not by exit status.
        if let Some(printed) = last_stdout_line(&output.stdout) {
            let path = PathBuf::from(&printed);
            if path.is_file() && !is_partial_output(&printed) {
                return Ok(path);
            }
        }

        find_output_by_prefix(output_dir, request_id)
            .await?
            .ok_or(ExtractError::OutputMissing)
    }
}

pub fn is_partial_output(name: &str) -> bool {
    PARTIAL_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)) || name.contains(".part-Frag")
}

fn last_stderr_line(stderr: &[u8]) -> String {
    String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("extractor failed without diagnostics")
        .to_string()
}

fn last_stdout_line(stdout: &[u8]) -> Option<String> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .map(ToString::to_string)
}

/// Locate the produced file by identifier prefix. Exactly the non-partial
/// files count; partial and helper files are ignored.
pub async fn find_output_by_prefix(
    output_dir: &Path,
    request_id: Uuid,
) -> Result<Option<PathBuf>, ExtractError> {
    let prefix = request_id.to_string();
    let mut entries = tokio::fs::read_dir(output_dir).await.map_err(|error| {
        ExtractError::Failed(format!("could not open output directory: {error}"))
    })?;

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|error| ExtractError::Failed(format!("could not list output directory: {error}")))?
    {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(&prefix) || is_partial_output(&name) {
            continue;
        }
        let path = entry.path();
        if path.is_file() {
            return Ok(Some(path));
        }
    }

    Ok(None)
}

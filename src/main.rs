use std::{io::ErrorKind, path::PathBuf, sync::Arc};

use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxumPath, State},
    http::{
        HeaderMap, HeaderValue, Method,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, HOST},
    },
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use uuid::Uuid;

mod classify;
mod config;
mod cookies;
mod direct;
mod error;
mod extract;
mod orchestrator;
mod refresh;

use config::Config;
use cookies::CookieStore;
use direct::TikTokDirect;
use error::ApiError;
use extract::YtDlpExtractor;
use orchestrator::Orchestrator;
use refresh::ChromiumRefresher;

#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
    download_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct DownloadRequest {
    url: Option<String>,
}

#[derive(Debug, Serialize)]
struct DownloadResponse {
    download_url: String,
    file: String,
    request_id: Uuid,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "onetap_backend=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let config = Config::from_env();

    tokio::fs::create_dir_all(&config.download_dir)
        .await
        .map_err(|error| {
            ApiError::internal(format!("Could not create the download directory: {error}"))
        })?;
    tokio::fs::create_dir_all(&config.cookies_dir)
        .await
        .map_err(|error| {
            ApiError::internal(format!("Could not create the cookies directory: {error}"))
        })?;

    let cookies = Arc::new(CookieStore::new(config.cookies_dir.clone()));
    let extractor = Arc::new(YtDlpExtractor::new());
    let refresher = Arc::new(ChromiumRefresher::new(config.credentials.clone()));
    let tiktok = Arc::new(TikTokDirect::new().map_err(|error| {
        ApiError::internal(format!("Could not set up the TikTok client: {error}"))
    })?);

    let orchestrator = Arc::new(Orchestrator::new(
        config.download_dir.clone(),
        cookies,
        extractor,
        refresher,
        tiktok,
    ));

    // Establish sessions at startup so the first authenticated request is
    // not also the one paying the browser-login latency.
    if !config.credentials.is_empty() {
        let warm = Arc::clone(&orchestrator);
        let domains: Vec<String> = config.credentials.keys().cloned().collect();
        tokio::spawn(async move {
            warm.warm_refresh(domains).await;
        });
    }

    let state = AppState {
        orchestrator,
        download_dir: config.download_dir.clone(),
    };

    let app = Router::new()
        .route("/", get(health))
        .route("/download", post(start_download))
        .route("/files/{filename}", get(serve_file))
        .with_state(state)
        .layer(build_cors_layer())
        .layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .map_err(|error| {
            ApiError::internal(format!("Could not bind {}: {error}", config.bind_addr))
        })?;

    info!("OneTap backend listening on http://{}", config.bind_addr);

    axum::serve(listener, app)
        .await
        .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}

async fn health() -> &'static str {
    "OneTap server is running"
}

async fn start_download(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<DownloadRequest>,
) -> Result<Json<DownloadResponse>, ApiError> {
    let url = payload
        .url
        .as_deref()
        .and_then(config::non_empty)
        .ok_or_else(|| ApiError::bad_request("No URL provided"))?;

    let download = state.orchestrator.fetch(url).await?;

    Ok(Json(DownloadResponse {
        download_url: absolute_file_url(&headers, &download.file_name),
        file: download.file_name.clone(),
        request_id: download.request_id,
    }))
}

async fn serve_file(
    State(state): State<AppState>,
    AxumPath(filename): AxumPath<String>,
) -> Result<Response, ApiError> {
    if !is_safe_file_name(&filename) {
        return Err(ApiError::not_found("File not found"));
    }

    let candidate = state.download_dir.join(&filename);
    let canonical_dir = tokio::fs::canonicalize(&state.download_dir)
        .await
        .map_err(|error| {
            ApiError::internal(format!("Could not resolve the download directory: {error}"))
        })?;
    let canonical = match tokio::fs::canonicalize(&candidate).await {
        Ok(path) => path,
        Err(error) if error.kind() == ErrorKind::NotFound => {
            return Err(ApiError::not_found("File not found"));
        }
        Err(error) => {
            return Err(ApiError::internal(format!(
                "Could not resolve the requested file: {error}"
            )));
        }
    };

    if !canonical.starts_with(&canonical_dir) {
        warn!("Blocked a file request escaping the download directory: {filename:?}");
        return Err(ApiError::not_found("File not found"));
    }

    let metadata = tokio::fs::metadata(&canonical)
        .await
        .map_err(|error| ApiError::internal(format!("Could not read file metadata: {error}")))?;
    if !metadata.is_file() {
        return Err(ApiError::not_found("File not found"));
    }

    let file = tokio::fs::File::open(&canonical)
        .await
        .map_err(|error| ApiError::internal(format!("Could not open the file: {error}")))?;
    let body = Body::from_stream(ReaderStream::new(file));

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(content_type_for_filename(&filename)),
    );
    headers.insert(
        CONTENT_LENGTH,
        HeaderValue::from_str(&metadata.len().to_string())
            .map_err(|_| ApiError::internal("Could not build the length header."))?,
    );
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&filename))
            .map_err(|_| ApiError::internal("Could not build the attachment header."))?,
    );

    Ok((headers, body).into_response())
}

/// Absolute URL the client can fetch the file from, preferring https for
/// anything that is not plainly a local address.
fn absolute_file_url(headers: &HeaderMap, file_name: &str) -> String {
    let host = headers
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("localhost");
    let scheme = if host.starts_with("localhost") || host.starts_with("127.") {
        "http"
    } else {
        "https"
    };

    format!("{scheme}://{host}/files/{}", urlencoding::encode(file_name))
}

/// Only plain file names are served; anything that could climb out of the
/// download directory is rejected outright.
fn is_safe_file_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains("..")
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
}

fn build_cors_layer() -> CorsLayer {
    let configured: Vec<HeaderValue> = std::env::var("ALLOWED_ORIGINS")
        .ok()
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .filter_map(|origin| HeaderValue::from_str(origin).ok())
                .collect()
        })
        .unwrap_or_default();

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .expose_headers([CONTENT_DISPOSITION]);

    if configured.is_empty() {
        warn!("ALLOWED_ORIGINS is not set; allowing any origin.");
        cors.allow_origin(Any)
    } else {
        cors.allow_origin(AllowOrigin::list(configured))
    }
}

fn content_type_for_filename(filename: &str) -> &'static str {
    let extension = std::path::Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "aac" => "audio/aac",
        "ogg" | "opus" => "audio/ogg",
        _ => "application/octet-stream",
    }
}

fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    let sanitized: String = value
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric()
                || matches!(character, '.' | '-' | '_' | ' ' | '(' | ')')
            {
                character
            } else {
                '_'
            }
        })
        .collect();

    let compact = sanitized.trim();
    if compact.is_empty() {
        "download.bin".to_string()
    } else {
        compact.to_string()
    }
}

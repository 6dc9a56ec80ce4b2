#![forbid(unsafe_code)]

//! HTTP front for the audio pipeline.
//!
//! `/download` hands a validated request to the pipeline and answers with
//! either the finished file or a live stream. `/search` and `/formats` are
//! small JSON helpers for the bundled frontend, which is served from
//! `WWW_ROOT` by the fallback handler when one is configured.

use std::{
    net::{IpAddr, SocketAddr},
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use audiopipe::{
    artifact::WorkDir,
    cleanup::{CleanupPolicy, CleanupSweeper},
    config::{ConfigOverrides, DEFAULT_ENV_PATH, load_config},
    error::PipelineError,
    logging::init_logging,
    metadata::SearchResult,
    pipeline::{FinishedDownload, Pipeline, PipelineOutput, StreamedAudio},
    request::{AudioFormat, DownloadQuery, DownloadRequest, FormatCatalog},
};
use axum::{
    Json, Router,
    body::Body,
    extract::{Query, State},
    http::{HeaderValue, Request, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use clap::Parser;
use futures_util::StreamExt;
use mime_guess::MimeGuess;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Deserialize;
use tokio::{fs::File, signal};
use tokio_util::io::ReaderStream;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

/// Message for every failure that is not the caller's fault.
const GENERIC_FAILURE: &str = "Error processing your request";

#[derive(Debug, Parser)]
#[command(name = "backend", about = "Serve audio downloads over HTTP")]
struct BackendArgs {
    /// Listen address (AUDIOPIPE_HOST).
    #[arg(long)]
    host: Option<String>,
    /// Listen port (AUDIOPIPE_PORT).
    #[arg(long)]
    port: Option<u16>,
    /// Shared working directory (WORK_DIR).
    #[arg(long)]
    work_dir: Option<PathBuf>,
    /// Bundled frontend to serve at `/` (WWW_ROOT).
    #[arg(long)]
    www_root: Option<PathBuf>,
    /// Downloader program (YTDLP_BIN).
    #[arg(long = "yt-dlp", value_name = "PATH")]
    downloader: Option<PathBuf>,
    /// Encoder program (FFMPEG_BIN).
    #[arg(long = "ffmpeg", value_name = "PATH")]
    encoder: Option<PathBuf>,
    /// `request` or `sweep-all` (CLEANUP_POLICY).
    #[arg(long)]
    cleanup_policy: Option<String>,
    #[arg(long, default_value = DEFAULT_ENV_PATH)]
    env_file: PathBuf,
}

impl BackendArgs {
    fn into_overrides(self) -> ConfigOverrides {
        ConfigOverrides {
            host: self.host,
            port: self.port,
            work_dir: self.work_dir,
            www_root: self.www_root,
            downloader: self.downloader,
            encoder: self.encoder,
            cleanup_policy: self.cleanup_policy,
            env_path: Some(self.env_file),
        }
    }
}

#[derive(Clone)]
struct AppState {
    pipeline: Arc<Pipeline>,
    sweeper: CleanupSweeper,
    www_root: Option<Arc<PathBuf>>,
    search_limit: usize,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: GENERIC_FAILURE.to_string(),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        if err.is_client_error() {
            warn!(%err, "rejected request");
            Self::bad_request(err.to_string())
        } else {
            // Tool output and paths stay in the log.
            error!(error = %err, "request failed");
            Self::internal()
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config(BackendArgs::parse().into_overrides())?;
    init_logging(config.log_format)?;

    let work_dir = WorkDir::prepare(config.work_dir.clone())
        .await
        .with_context(|| format!("preparing {}", config.work_dir.display()))?;
    let sweeper = CleanupSweeper::new(
        work_dir.root(),
        config.cleanup_grace,
        config.cleanup_policy,
    );
    if config.cleanup_policy == CleanupPolicy::SweepAll {
        warn!("cleanup policy sweep-all can delete files of requests still in flight");
    }

    let state = AppState {
        pipeline: Arc::new(Pipeline::new(config.toolchain(), work_dir, config.timeouts)),
        sweeper: sweeper.clone(),
        www_root: config.www_root.clone().map(Arc::new),
        search_limit: config.search_limit,
    };

    let host: IpAddr = config
        .host
        .parse()
        .with_context(|| format!("invalid listen host {}", config.host))?;
    let addr = SocketAddr::new(host, config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!(
        %addr,
        work_dir = %config.work_dir.display(),
        policy = %config.cleanup_policy,
        "API server listening"
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    sweeper.shutdown().await;
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/download", get(download))
        .route("/search", get(search))
        .route("/formats", get(formats))
        .fallback(static_fallback)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!(%err, "failed to install Ctrl+C handler");
    }
}

async fn download(
    State(state): State<AppState>,
    Query(query): Query<DownloadQuery>,
) -> ApiResult<Response> {
    let request = DownloadRequest::try_from(query)?;
    match state.pipeline.run(&request).await? {
        PipelineOutput::File(finished) => file_response(&state.sweeper, finished).await,
        PipelineOutput::Stream(streamed) => Ok(stream_response(streamed)),
    }
}

/// Streams the finished file; its workspace is scheduled for cleanup once
/// the body is done or abandoned.
async fn file_response(sweeper: &CleanupSweeper, finished: FinishedDownload) -> ApiResult<Response> {
    let guard = sweeper.guard(finished.scope.clone());
    let file = File::open(finished.artifact.path()).await.map_err(|err| {
        error!(path = %finished.artifact.path().display(), %err, "opening finished download");
        ApiError::internal()
    })?;
    let size = file.metadata().await.ok().map(|meta| meta.len());

    let body = ReaderStream::new(file).map(move |chunk| {
        let _ = &guard;
        chunk
    });
    let mut response = Body::from_stream(body).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(finished.format.mime_type()),
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        content_disposition(&finished.file_name()),
    );
    if let Some(size) = size {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    }
    Ok(response)
}

fn stream_response(streamed: StreamedAudio) -> Response {
    let file_name = streamed.file_name();
    let format = streamed.format;
    let mut response = Body::from_stream(streamed.session).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(format.mime_type()),
    );
    headers.insert(header::CONTENT_DISPOSITION, content_disposition(&file_name));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

/// `attachment` with an ASCII `filename` and an RFC 5987 `filename*`.
fn content_disposition(file_name: &str) -> HeaderValue {
    let fallback: String = file_name
        .chars()
        .map(|c| {
            if c == ' ' || (c.is_ascii_graphic() && c != '"' && c != '\\') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let encoded = utf8_percent_encode(file_name, NON_ALPHANUMERIC);
    let value = format!("attachment; filename=\"{fallback}\"; filename*=UTF-8''{encoded}");
    HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

#[derive(Debug, Default, Deserialize)]
struct SearchQuery {
    query: Option<String>,
}

async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchQuery>,
) -> ApiResult<Json<Vec<SearchResult>>> {
    let query = params.query.unwrap_or_default();
    let results = state.pipeline.search(&query, state.search_limit).await?;
    Ok(Json(results))
}

async fn formats() -> Json<FormatCatalog> {
    Json(FormatCatalog::current())
}

async fn static_fallback(State(state): State<AppState>, req: Request<Body>) -> Response {
    let path = req.uri().path();
    let result = match state.www_root.as_deref() {
        Some(root) => serve_www_path(root, path).await,
        None if path == "/" => Ok(welcome_text().into_response()),
        None => Err(ApiError::not_found("endpoint not found")),
    };
    match result {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

fn welcome_text() -> String {
    let formats: Vec<String> = AudioFormat::ALL
        .iter()
        .map(|format| format.as_str().to_ascii_uppercase())
        .collect();
    format!(
        "Welcome to the audiopipe downloader! Supports: {}",
        formats.join(", ")
    )
}

async fn serve_www_path(root: &Path, request_path: &str) -> ApiResult<Response> {
    let target = resolve_www_path(root, request_path)?;
    let index = root.join("index.html");

    match tokio::fs::metadata(&target).await {
        Ok(meta) if meta.is_dir() => stream_file(index).await,
        Ok(_) => stream_file(target).await,
        Err(_) if should_fallback_to_index(request_path) => stream_file(index).await,
        Err(_) => Err(ApiError::not_found("file not found")),
    }
}

fn resolve_www_path(root: &Path, request_path: &str) -> ApiResult<PathBuf> {
    let trimmed = request_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Ok(root.join("index.html"));
    }
    let candidate = Path::new(trimmed);
    if candidate
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(ApiError::not_found("file not found"));
    }
    Ok(root.join(candidate))
}

/// Extensionless paths are client-side routes of the frontend.
fn should_fallback_to_index(request_path: &str) -> bool {
    let trimmed = request_path.trim_start_matches('/');
    trimmed.is_empty() || Path::new(trimmed).extension().is_none()
}

async fn stream_file(path: PathBuf) -> ApiResult<Response> {
    let file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let guessed = MimeGuess::from_path(&path).first();

    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    if let Some(mime) = guessed
        && let Ok(value) = HeaderValue::from_str(mime.as_ref())
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use audiopipe::{pipeline::PipelineTimeouts, process::Toolchain};
    use axum::body::to_bytes;
    use serde_json::Value;
    use std::{fs, os::unix::fs::PermissionsExt, time::Duration};
    use tempfile::{TempDir, tempdir};

    struct BackendTestContext {
        temp: TempDir,
        state: AppState,
    }

    impl BackendTestContext {
        async fn new(download_exit: i32, www_root: Option<PathBuf>) -> Self {
            let temp = tempdir().unwrap();
            let downloader = install_ytdlp_stub(temp.path(), download_exit);
            let encoder = write_script(temp.path(), "ffmpeg", "exec cat\n");
            let work_dir = WorkDir::prepare(temp.path().join("downloads")).await.unwrap();
            let sweeper = CleanupSweeper::new(
                work_dir.root(),
                Duration::from_secs(3600),
                CleanupPolicy::RequestScoped,
            );
            let timeouts = PipelineTimeouts {
                metadata: Duration::from_secs(10),
                download: Duration::from_secs(10),
                transcode: Duration::from_secs(10),
                stream_idle: Duration::from_secs(10),
            };
            Self {
                state: AppState {
                    pipeline: Arc::new(Pipeline::new(
                        Toolchain::new(downloader, encoder),
                        work_dir,
                        timeouts,
                    )),
                    sweeper,
                    www_root: www_root.map(Arc::new),
                    search_limit: 5,
                },
                temp,
            }
        }

        fn calls(&self) -> Vec<String> {
            fs::read_to_string(self.temp.path().join("calls.log"))
                .map(|raw| raw.lines().map(str::to_string).collect())
                .unwrap_or_default()
        }

        fn work_entries(&self) -> usize {
            fs::read_dir(self.temp.path().join("downloads"))
                .unwrap()
                .count()
        }
    }

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/usr/bin/env bash\nset -eu\n{body}")).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn install_ytdlp_stub(dir: &Path, download_exit: i32) -> PathBuf {
        let log = dir.join("calls.log");
        let body = format!(
            r#"echo "yt-dlp $*" >> '{log}'
args=("$@")
output=""
audio_format=""
while [[ $# -gt 0 ]]; do
  case "$1" in
    -o) shift; output="$1" ;;
    --audio-format) shift; audio_format="$1" ;;
  esac
  shift
done
if printf '%s\n' "${{args[@]}}" | grep -q -- '--dump-json'; then
  if printf '%s\n' "${{args[@]}}" | grep -q '^ytsearch'; then
    echo '{{"title":"Hit","webpage_url":"https://example.com/hit","thumbnail":"https://img/hit.jpg","duration":3}}'
    exit 0
  fi
  echo '{{"title":"Café Song","duration":5}}'
  exit 0
fi
if [[ "$output" == "-" ]]; then
  if [[ {download_exit} -ne 0 ]]; then
    echo "ERROR: video unavailable" >&2
    exit {download_exit}
  fi
  printf 'live-audio'
  exit 0
fi
if [[ {download_exit} -ne 0 ]]; then
  echo "ERROR: /secret/path exploded" >&2
  exit {download_exit}
fi
printf 'file-audio' > "${{output//%(ext)s/$audio_format}}"
"#,
            log = log.display(),
        );
        write_script(dir, "yt-dlp", &body)
    }

    fn query(url: &str, format: &str, method: &str) -> DownloadQuery {
        DownloadQuery {
            url: Some(url.to_string()),
            format: Some(format.to_string()),
            bitrate: Some("192".to_string()),
            method: Some(method.to_string()),
        }
    }

    async fn error_body(err: ApiError) -> (StatusCode, String) {
        let response = err.into_response();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        (status, parsed["error"].as_str().unwrap().to_string())
    }

    #[tokio::test]
    async fn download_serves_file_and_schedules_cleanup() {
        let ctx = BackendTestContext::new(0, None).await;
        let response = download(
            State(ctx.state.clone()),
            Query(query("https://example.com/watch", "mp3", "auto")),
        )
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "audio/mpeg"
        );
        let disposition = response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(disposition.contains("filename=\"Caf_ Song.mp3\""));
        assert!(disposition.contains("filename*=UTF-8''Caf%C3%A9%20Song%2Emp3"));
        assert_eq!(ctx.state.sweeper.pending(), 0);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.as_ref(), b"file-audio");
        assert_eq!(ctx.state.sweeper.pending(), 1);

        ctx.state.sweeper.shutdown().await;
        assert_eq!(ctx.work_entries(), 0);
        assert!(ctx.calls()[1].contains("--audio-quality 192K"));
    }

    #[tokio::test]
    async fn stream_download_is_not_cached() {
        let ctx = BackendTestContext::new(0, None).await;
        let response = download(
            State(ctx.state.clone()),
            Query(query("https://example.com/watch", "aac", "stream")),
        )
        .await
        .unwrap();

        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).unwrap(),
            "no-cache"
        );
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "audio/aac"
        );
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.as_ref(), b"live-audio");
        assert_eq!(ctx.work_entries(), 0);
    }

    #[tokio::test]
    async fn invalid_format_is_a_bad_request_without_calls() {
        let ctx = BackendTestContext::new(0, None).await;
        let err = download(
            State(ctx.state.clone()),
            Query(query("https://example.com/watch", "xyz", "auto")),
        )
        .await
        .unwrap_err();

        let (status, message) = error_body(err).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(message.starts_with("Invalid audio format"));
        assert!(ctx.calls().is_empty());
    }

    #[tokio::test]
    async fn lossless_stream_is_a_bad_request() {
        let ctx = BackendTestContext::new(0, None).await;
        let err = download(
            State(ctx.state.clone()),
            Query(query("https://example.com/watch", "flac", "stream")),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(ctx.calls().is_empty());
    }

    #[tokio::test]
    async fn tool_failure_is_generic_server_error() {
        let ctx = BackendTestContext::new(2, None).await;
        let err = download(
            State(ctx.state.clone()),
            Query(query("https://example.com/watch", "mp3", "fast")),
        )
        .await
        .unwrap_err();

        let (status, message) = error_body(err).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(message, GENERIC_FAILURE);
        assert_eq!(ctx.work_entries(), 0);
    }

    #[tokio::test]
    async fn stream_failing_before_audio_is_a_server_error() {
        let ctx = BackendTestContext::new(2, None).await;
        let err = download(
            State(ctx.state.clone()),
            Query(query("https://example.com/watch", "mp3", "stream")),
        )
        .await
        .unwrap_err();

        let (status, message) = error_body(err).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(message, GENERIC_FAILURE);
        assert!(ctx.calls().iter().any(|call| call.contains("-o -")));
    }

    #[tokio::test]
    async fn search_returns_results_and_rejects_blank_query() {
        let ctx = BackendTestContext::new(0, None).await;
        let Json(results) = search(
            State(ctx.state.clone()),
            Query(SearchQuery {
                query: Some("lofi".into()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].url.as_deref(), Some("https://example.com/hit"));
        assert!(ctx.calls()[0].contains("ytsearch5:lofi"));

        let err = search(State(ctx.state.clone()), Query(SearchQuery::default()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn formats_lists_both_groups() {
        let Json(catalog) = formats().await;
        let value = serde_json::to_value(catalog).unwrap();
        assert_eq!(value["formats"]["fast"]["formats"], serde_json::json!(["mp3", "aac"]));
        assert_eq!(
            value["formats"]["quality"]["formats"],
            serde_json::json!(["alac", "flac", "wav", "ogg"])
        );
        assert!(
            value["formats"]["quality"]["description"]
                .as_str()
                .unwrap()
                .contains("alac is delivered as .m4a")
        );
        assert_eq!(value["methods"].as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn root_without_frontend_shows_welcome_text() {
        let ctx = BackendTestContext::new(0, None).await;
        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        let response = static_fallback(State(ctx.state.clone()), request).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(
            String::from_utf8(body.to_vec()).unwrap(),
            "Welcome to the audiopipe downloader! Supports: MP3, AAC, ALAC, FLAC, WAV, OGG"
        );

        let request = Request::builder().uri("/nope").body(Body::empty()).unwrap();
        let response = static_fallback(State(ctx.state.clone()), request).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn frontend_routes_fall_back_to_index() {
        let www = tempdir().unwrap();
        fs::write(www.path().join("index.html"), "<html>app</html>").unwrap();
        fs::write(www.path().join("app.js"), "console.log(1)").unwrap();
        let ctx = BackendTestContext::new(0, Some(www.path().to_path_buf())).await;

        let response = serve_www_path(www.path(), "/player/queue").await.unwrap();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.as_ref(), b"<html>app</html>");

        let request = Request::builder().uri("/app.js").body(Body::empty()).unwrap();
        let response = static_fallback(State(ctx.state.clone()), request).await;
        assert_eq!(response.status(), StatusCode::OK);

        let err = serve_www_path(www.path(), "/missing.css").await.unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        let err = serve_www_path(www.path(), "/../secret.txt").await.unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn disposition_keeps_ascii_names_readable() {
        let value = content_disposition("Artist - Song.flac");
        assert_eq!(
            value.to_str().unwrap(),
            "attachment; filename=\"Artist - Song.flac\"; filename*=UTF-8''Artist%20%2D%20Song%2Eflac"
        );
    }

    #[test]
    fn backend_args_map_to_overrides() {
        let args = BackendArgs::try_parse_from([
            "backend",
            "--port",
            "9000",
            "--work-dir",
            "/tmp/work",
            "--yt-dlp",
            "/opt/yt-dlp",
            "--cleanup-policy",
            "sweep-all",
        ])
        .unwrap();
        let overrides = args.into_overrides();
        assert_eq!(overrides.port, Some(9000));
        assert_eq!(overrides.work_dir, Some(PathBuf::from("/tmp/work")));
        assert_eq!(overrides.downloader, Some(PathBuf::from("/opt/yt-dlp")));
        assert_eq!(overrides.cleanup_policy.as_deref(), Some("sweep-all"));
        assert_eq!(overrides.env_path, Some(PathBuf::from(DEFAULT_ENV_PATH)));
        assert!(overrides.host.is_none());
    }

    #[test]
    fn unknown_arguments_are_rejected() {
        assert!(BackendArgs::try_parse_from(["backend", "--media-root", "/x"]).is_err());
    }
}

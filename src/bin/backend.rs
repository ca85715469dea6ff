#![forbid(unsafe_code)]

//! Axum service sitting in front of the resolver executable.
//!
//! `/info` turns a page URL into a compact list of downloadable formats and
//! `/download` delivers one of those formats, either by piping the resolver's
//! output or by redirecting the client to the format URL. Nothing is cached
//! and no state is shared between requests besides read-only configuration.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::{Query, State, rejection::QueryRejection},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use clap::Parser;
use serde::Deserialize;
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use vidproxy::{
    config::{RuntimeOverrides, RuntimeSettings, resolve_runtime_settings},
    download::{DownloadMode, STREAM_CONTENT_DISPOSITION, STREAM_CONTENT_TYPE},
    formats::VideoSummary,
    resolver::{ResolveError, Resolver, YtDlp},
};

#[derive(Debug, Parser)]
#[command(name = "backend", about = "Video metadata and download proxy")]
struct BackendArgs {
    /// Port to listen on (PORT).
    #[arg(long)]
    port: Option<u16>,
    /// Address to bind (HOST).
    #[arg(long)]
    host: Option<IpAddr>,
    /// `streaming` or `redirect` (DOWNLOAD_MODE).
    #[arg(long = "download-mode", value_parser = parse_mode_arg)]
    download_mode: Option<DownloadMode>,
    /// Resolver executable (YTDLP_PATH).
    #[arg(long = "ytdlp")]
    resolver_bin: Option<PathBuf>,
    /// Seconds to wait on the resolver, 0 disables (RESOLVER_TIMEOUT_SECS).
    #[arg(long = "resolver-timeout")]
    resolver_timeout_secs: Option<u64>,
    /// dotenv file consulted after the process environment.
    #[arg(long = "env-file")]
    env_file: Option<PathBuf>,
}

impl BackendArgs {
    fn into_settings(self) -> Result<(SocketAddr, RuntimeSettings)> {
        let settings = resolve_runtime_settings(RuntimeOverrides {
            port: self.port,
            host: self.host,
            download_mode: self.download_mode,
            resolver_bin: self.resolver_bin,
            resolver_timeout_secs: self.resolver_timeout_secs,
            env_path: self.env_file,
        })?;
        Ok((SocketAddr::new(settings.host, settings.port), settings))
    }
}

fn parse_mode_arg(value: &str) -> Result<DownloadMode, String> {
    DownloadMode::parse(value).ok_or_else(|| format!("unknown download mode `{value}`"))
}

#[derive(Clone)]
struct AppState {
    resolver: Arc<dyn Resolver>,
    download_mode: DownloadMode,
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

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    /// Collapses a resolver failure into a generic message. Timeouts get their
    /// own status so callers can tell a slow origin from a broken one.
    fn from_resolver(err: &ResolveError, message: &str, timeout_message: &str) -> Self {
        if err.is_timeout() {
            Self {
                status: StatusCode::GATEWAY_TIMEOUT,
                message: timeout_message.to_string(),
            }
        } else {
            Self::internal(message)
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

#[derive(Debug, Deserialize)]
struct InfoQuery {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DownloadQuery {
    #[serde(rename = "formatUrl")]
    format_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let (addr, settings) = BackendArgs::parse().into_settings()?;
    let resolver =
        YtDlp::new(settings.resolver_bin.clone()).with_timeout(settings.resolver_timeout);
    info!(
        resolver = %resolver.program().display(),
        mode = %settings.download_mode,
        timeout_secs = settings.resolver_timeout.map(|limit| limit.as_secs()),
        "configured resolver"
    );

    let state = AppState {
        resolver: Arc::new(resolver),
        download_mode: settings.download_mode,
    };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!("proxy listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running proxy server")?;

    Ok(())
}

/// `RUST_LOG` picks the filter (default `info`), `LOG_FORMAT=json` switches to
/// structured output for log shippers.
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let use_json = std::env::var("LOG_FORMAT")
        .map(|value| value.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true))
            .with(env_filter)
            .init();
    }
}

fn build_router(state: AppState) -> Router {
    // The gallery UI is served from a different origin.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/info", get(get_info))
        .route("/download", get(download))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!("failed to install Ctrl+C handler: {}", err);
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Keeps malformed query strings on the same JSON error shape as every other
/// failure instead of axum's plain-text rejection.
fn query_error(rejection: QueryRejection) -> ApiError {
    ApiError::bad_request(rejection.body_text())
}

/// Treats absent and blank parameters the same way.
fn required_param(value: Option<String>, message: &str) -> ApiResult<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::bad_request(message))
}

async fn get_info(
    State(state): State<AppState>,
    query: Result<Query<InfoQuery>, QueryRejection>,
) -> ApiResult<Json<VideoSummary>> {
    let Query(query) = query.map_err(query_error)?;
    let url = required_param(query.url, "Missing url parameter")?;

    let info = state.resolver.fetch_info(&url).await.map_err(|err| {
        error!(%url, "failed to fetch video info: {err}");
        ApiError::from_resolver(
            &err,
            "Could not fetch video info",
            "Timed out fetching video info",
        )
    })?;

    Ok(Json(VideoSummary::from_info(&info)))
}

async fn download(
    State(state): State<AppState>,
    query: Result<Query<DownloadQuery>, QueryRejection>,
) -> ApiResult<Response> {
    let Query(query) = query.map_err(query_error)?;
    let format_url = required_param(query.format_url, "Missing formatUrl parameter")?;

    match state.download_mode {
        DownloadMode::Redirect => redirect_to(&format_url),
        DownloadMode::Streaming => stream_format(state.resolver.as_ref(), &format_url).await,
    }
}

fn redirect_to(format_url: &str) -> ApiResult<Response> {
    let location = HeaderValue::from_str(format_url)
        .map_err(|_| ApiError::bad_request("Invalid formatUrl parameter"))?;
    Ok((StatusCode::FOUND, [(header::LOCATION, location)]).into_response())
}

/// Once the headers below are flushed a resolver failure can only cut the
/// connection short; the stream yields an error and hyper aborts the body.
async fn stream_format(resolver: &dyn Resolver, format_url: &str) -> ApiResult<Response> {
    let stream = resolver.open_stream(format_url).await.map_err(|err| {
        error!(url = %format_url, "failed to stream video: {err}");
        ApiError::from_resolver(&err, "Failed to stream video", "Timed out starting video stream")
    })?;

    let mut response = Body::from_stream(stream).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(STREAM_CONTENT_TYPE),
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_static(STREAM_CONTENT_DISPOSITION),
    );
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::{body::to_bytes, http::Request};
    use bytes::Bytes;
    use futures::stream;
    use serde_json::{Value, json};
    use std::{
        io::{self, Write},
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };
    use tower::ServiceExt;
    use vidproxy::{formats::RawVideoInfo, resolver::MediaStream};

    #[derive(Default)]
    enum Behavior {
        #[default]
        Succeed,
        Fail,
        TimeOut,
    }

    /// In-process resolver: info documents are derived from the requested URL
    /// so concurrent callers can check they got their own data back.
    #[derive(Default)]
    struct FakeResolver {
        behavior: Behavior,
        delay: Option<Duration>,
        chunks: Vec<&'static str>,
        calls: AtomicUsize,
    }

    impl FakeResolver {
        fn failing() -> Self {
            Self {
                behavior: Behavior::Fail,
                ..Self::default()
            }
        }

        fn failure(&self) -> Option<ResolveError> {
            match self.behavior {
                Behavior::Succeed => None,
                Behavior::Fail => Some(ResolveError::Stream(io::Error::other(
                    "ERROR: Private video",
                ))),
                Behavior::TimeOut => Some(ResolveError::Timeout(Duration::from_secs(60))),
            }
        }
    }

    #[async_trait]
    impl Resolver for FakeResolver {
        async fn fetch_info(&self, url: &str) -> Result<RawVideoInfo, ResolveError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(err) = self.failure() {
                return Err(err);
            }
            let info = json!({
                "title": format!("title of {url}"),
                "thumbnail": format!("{url}/thumb.jpg"),
                "formats": [
                    { "format_note": "storyboard", "vcodec": "none", "ext": "mhtml", "url": format!("{url}/sb") },
                    { "format_note": "", "vcodec": "none", "ext": "bin", "url": format!("{url}/junk") },
                    { "format_note": "medium", "vcodec": "none", "ext": "m4a", "url": format!("{url}/a") },
                    { "format_note": "", "vcodec": "avc1.4d401f", "ext": "mp4", "url": format!("{url}/v") },
                    { "ext": "webm", "url": format!("{url}/no-codec") }
                ]
            });
            Ok(serde_json::from_value(info).expect("fake info"))
        }

        async fn open_stream(&self, _url: &str) -> Result<MediaStream, ResolveError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.failure() {
                return Err(err);
            }
            let chunks = self
                .chunks
                .iter()
                .copied()
                .map(|chunk| Ok::<_, io::Error>(Bytes::from_static(chunk.as_bytes())))
                .collect::<Vec<_>>();
            Ok(Box::pin(stream::iter(chunks)))
        }
    }

    fn app_with(resolver: Arc<FakeResolver>, download_mode: DownloadMode) -> Router {
        build_router(AppState {
            resolver,
            download_mode,
        })
    }

    async fn send(app: Router, uri: &str) -> Response {
        app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn info_without_url_is_bad_request() {
        let resolver = Arc::new(FakeResolver::default());
        for uri in ["/info", "/info?url=", "/info?url=%20%20"] {
            let response = send(app_with(resolver.clone(), DownloadMode::Streaming), uri).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            let body = json_body(response).await;
            assert!(!body["error"].as_str().unwrap().is_empty());
        }
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn download_without_format_url_is_bad_request() {
        for mode in [DownloadMode::Streaming, DownloadMode::Redirect] {
            let resolver = Arc::new(FakeResolver::default());
            let response = send(app_with(resolver.clone(), mode), "/download").await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            let body = json_body(response).await;
            assert_eq!(body["error"], "Missing formatUrl parameter");
            assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);
        }
    }

    #[tokio::test]
    async fn malformed_query_is_json_bad_request() {
        let resolver = Arc::new(FakeResolver::default());
        for (mode, uri) in [
            (DownloadMode::Streaming, "/download?formatUrl=a&formatUrl=b"),
            (DownloadMode::Redirect, "/download?formatUrl=a&formatUrl=b"),
            (DownloadMode::Streaming, "/info?url=a&url=b"),
        ] {
            let response = send(app_with(resolver.clone(), mode), uri).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            assert_eq!(
                response.headers().get(header::CONTENT_TYPE).unwrap(),
                "application/json"
            );
            let body = json_body(response).await;
            assert!(!body["error"].as_str().unwrap().is_empty());
        }
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn info_filters_and_classifies_formats() {
        let app = app_with(Arc::new(FakeResolver::default()), DownloadMode::Streaming);
        let response = send(app, "/info?url=https://videos.example.com/watch?v=abc").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        let base = "https://videos.example.com/watch?v=abc";
        assert_eq!(body["title"], format!("title of {base}"));
        assert_eq!(body["thumbnail"], format!("{base}/thumb.jpg"));
        assert_eq!(
            body["formats"],
            json!([
                { "quality": "storyboard", "ext": "mhtml", "url": format!("{base}/sb"), "type": "audio" },
                { "quality": "medium", "ext": "m4a", "url": format!("{base}/a"), "type": "audio" },
                { "quality": "", "ext": "mp4", "url": format!("{base}/v"), "type": "video" },
                { "quality": "", "ext": "webm", "url": format!("{base}/no-codec"), "type": "video" }
            ])
        );
    }

    #[tokio::test]
    async fn info_resolver_failure_is_isolated() {
        let resolver = Arc::new(FakeResolver::failing());
        let app = app_with(resolver, DownloadMode::Streaming);

        let response = send(app.clone(), "/info?url=https://example.com/private").await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert_eq!(body["error"], "Could not fetch video info");

        let response = send(app, "/health").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!({ "status": "ok" }));
    }

    #[tokio::test]
    async fn resolver_timeout_maps_to_gateway_timeout() {
        let resolver = Arc::new(FakeResolver {
            behavior: Behavior::TimeOut,
            ..FakeResolver::default()
        });
        let response = send(
            app_with(resolver.clone(), DownloadMode::Streaming),
            "/info?url=https://example.com/slow",
        )
        .await;
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);

        let response = send(
            app_with(resolver, DownloadMode::Streaming),
            "/download?formatUrl=https://example.com/slow.mp4",
        )
        .await;
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn redirect_mode_points_at_format_url() {
        let resolver = Arc::new(FakeResolver::default());
        let response = send(
            app_with(resolver.clone(), DownloadMode::Redirect),
            "/download?formatUrl=https://example.com/v.mp4",
        )
        .await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "https://example.com/v.mp4"
        );
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn redirect_mode_rejects_unrepresentable_url() {
        let response = send(
            app_with(Arc::new(FakeResolver::default()), DownloadMode::Redirect),
            "/download?formatUrl=https://example.com/a%0Ab",
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn streaming_mode_sets_fixed_headers_and_forwards_bytes() {
        let resolver = Arc::new(FakeResolver {
            chunks: vec!["first-", "second-", "third"],
            ..FakeResolver::default()
        });
        let response = send(
            app_with(resolver, DownloadMode::Streaming),
            "/download?formatUrl=https://cdn.example.com/audio.webm",
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_DISPOSITION).unwrap(),
            "attachment; filename=video.mp4"
        );
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "video/mp4"
        );
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"first-second-third");
    }

    #[tokio::test]
    async fn streaming_failure_before_first_byte_is_internal_error() {
        let response = send(
            app_with(Arc::new(FakeResolver::failing()), DownloadMode::Streaming),
            "/download?formatUrl=https://cdn.example.com/v.mp4",
        )
        .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert_eq!(body["error"], "Failed to stream video");
    }

    #[tokio::test]
    async fn concurrent_info_requests_stay_isolated() {
        let resolver = Arc::new(FakeResolver {
            delay: Some(Duration::from_millis(50)),
            ..FakeResolver::default()
        });
        let app = app_with(resolver.clone(), DownloadMode::Streaming);

        let (first, second) = tokio::join!(
            send(app.clone(), "/info?url=https://example.com/one"),
            send(app.clone(), "/info?url=https://example.com/two"),
        );
        let first = json_body(first).await;
        let second = json_body(second).await;

        assert_eq!(first["title"], "title of https://example.com/one");
        assert_eq!(second["title"], "title of https://example.com/two");
        for (body, url) in [(&first, "one"), (&second, "two")] {
            for format in body["formats"].as_array().unwrap() {
                assert!(format["url"].as_str().unwrap().contains(url));
            }
        }
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn api_error_serializes_json() {
        let response = ApiError::bad_request("missing").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let parsed = json_body(response).await;
        assert_eq!(parsed["error"], "missing");
    }

    #[test]
    fn backend_args_cli_overrides_win() {
        let args = BackendArgs::try_parse_from([
            "backend",
            "--port",
            "9000",
            "--host",
            "127.0.0.1",
            "--download-mode",
            "redirect",
            "--ytdlp",
            "/opt/yt-dlp",
            "--resolver-timeout",
            "0",
        ])
        .unwrap();
        let (addr, settings) = args.into_settings().unwrap();
        assert_eq!(addr, "127.0.0.1:9000".parse::<SocketAddr>().unwrap());
        assert_eq!(settings.download_mode, DownloadMode::Redirect);
        assert_eq!(settings.resolver_bin, PathBuf::from("/opt/yt-dlp"));
        assert_eq!(settings.resolver_timeout, None);
    }

    #[test]
    fn backend_args_reads_env_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "RESOLVER_TIMEOUT_SECS=15").unwrap();
        let path = file.path().to_string_lossy().into_owned();
        let args = BackendArgs::try_parse_from([
            "backend",
            "--env-file",
            path.as_str(),
            "--port",
            "4000",
            "--host",
            "::1",
        ])
        .unwrap();
        let (addr, settings) = args.into_settings().unwrap();
        assert_eq!(addr, "[::1]:4000".parse::<SocketAddr>().unwrap());
        assert_eq!(settings.resolver_timeout, Some(Duration::from_secs(15)));
    }

    #[test]
    fn backend_args_rejects_host_name() {
        assert!(BackendArgs::try_parse_from(["backend", "--host", "localhost"]).is_err());
    }

    #[test]
    fn backend_args_rejects_unknown_mode() {
        let err = BackendArgs::try_parse_from(["backend", "--download-mode", "teleport"])
            .unwrap_err();
        assert!(err.to_string().contains("unknown download mode"));
    }
}

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

pub mod auth;

use crate::config::AppConfig;
use crate::error::RenderError;
use crate::pipeline::{RenderPipeline, RenderRequest, RenderedVideo};

pub const JOB_ID_HEADER: &str = "x-render-job-id";
const BANNER: &str = "MP4 service is running. Use POST /render-video";

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    api_key: String,
    body_limit_bytes: usize,
    pipeline: RenderPipeline,
}

impl AppState {
    pub fn new(config: &AppConfig, pipeline: RenderPipeline) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                api_key: config.auth.api_key.clone(),
                body_limit_bytes: config.server.body_limit_bytes,
                pipeline,
            }),
        }
    }

    pub(crate) fn pipeline(&self) -> &RenderPipeline {
        &self.inner.pipeline
    }
}

// ─── Wire types ──────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct RenderVideoRequest {
    #[serde(default)]
    pub html: Option<String>,
    #[serde(default, alias = "mp3_base64")]
    pub audio_base64: Option<String>,
}

impl From<RenderVideoRequest> for RenderRequest {
    fn from(body: RenderVideoRequest) -> Self {
        RenderRequest::new(
            body.html.unwrap_or_default(),
            body.audio_base64.unwrap_or_default(),
        )
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub ok: bool,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Serialize)]
pub struct RenderFailedResponse {
    pub error: &'static str,
    pub details: String,
    pub kind: &'static str,
}

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum AppError {
    Unauthorized,
    BadRequest(String),
    PayloadTooLarge(String),
    RenderFailed {
        kind: &'static str,
        details: String,
    },
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized").into_response(),
            AppError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse { error: message }),
            )
                .into_response(),
            AppError::PayloadTooLarge(message) => (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(ErrorResponse { error: message }),
            )
                .into_response(),
            AppError::RenderFailed { kind, details } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(RenderFailedResponse {
                    error: "render failed",
                    details,
                    kind,
                }),
            )
                .into_response(),
        }
    }
}

impl From<RenderError> for AppError {
    fn from(err: RenderError) -> Self {
        match err {
            RenderError::Unauthorized => AppError::Unauthorized,
            RenderError::Validation(message) => AppError::BadRequest(message),
            other => AppError::RenderFailed {
                kind: other.kind(),
                details: other.to_string(),
            },
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            AppError::PayloadTooLarge(rejection.body_text())
        } else {
            AppError::BadRequest(rejection.body_text())
        }
    }
}

// ─── Router ──────────────────────────────────────────────────────────────────

pub fn app_router(state: AppState) -> Router {
    let body_limit = state.inner.body_limit_bytes;

    let render_routes = Router::new()
        .route("/render-video", post(render_video))
        .route("/render-mp4", post(render_video))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .merge(render_routes)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn index() -> &'static str {
    BANNER
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { ok: true })
}

/// Runs ahead of body extraction: unauthenticated callers never get their
/// payload parsed.
async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if let Err(err) = auth::verify_api_key(request.headers(), &state.inner.api_key) {
        warn!(
            path = %request.uri().path(),
            "Rejected render request with missing or invalid API key"
        );
        return Err(err.into());
    }
    Ok(next.run(request).await)
}

async fn render_video(
    State(state): State<AppState>,
    payload: Result<Json<RenderVideoRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(body) = payload?;
    let request = RenderRequest::from(body);

    match state.pipeline().run(&request).await {
        Ok(video) => Ok(video_response(video)),
        Err(err) => {
            if err.is_client_error() {
                info!(kind = err.kind(), error = %err, "Render request rejected");
            } else {
                error!(kind = err.kind(), error = %err, "Render request failed");
            }
            Err(err.into())
        }
    }
}

fn video_response(video: RenderedVideo) -> Response {
    let disposition = format!("inline; filename=\"{}\"", video.filename);
    let mut response = (
        StatusCode::OK,
        [(header::CONTENT_TYPE, HeaderValue::from_static("video/mp4"))],
        video.bytes,
    )
        .into_response();

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    if let Ok(value) = HeaderValue::from_str(video.job_id.as_str()) {
        headers.insert(JOB_ID_HEADER, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::atomic::Ordering;

    use axum::body::Body;
    use tempfile::tempdir;
    use tower::{Service, ServiceExt};

    use super::*;
    use crate::render::Viewport;
    use crate::scratch::ScratchManager;
    use crate::test_support::{
        scratch_entries, FakeEncoder, FakeRenderer, RenderBehavior, AUDIO_B64, AUDIO_BYTES,
    };

    const KEY: &str = "test-key";

    struct Harness {
        router: Router,
        renderer: Arc<FakeRenderer>,
        encoder: Arc<FakeEncoder>,
    }

    fn harness(root: &Path, behavior: RenderBehavior, encoder: FakeEncoder) -> Harness {
        let renderer = Arc::new(FakeRenderer::new(behavior));
        let encoder = Arc::new(encoder);
        let pipeline = RenderPipeline::new(
            ScratchManager::new(Some(root.to_path_buf())),
            renderer.clone(),
            encoder.clone(),
            Viewport::default(),
        );

        let mut config = AppConfig::default();
        config.auth.api_key = KEY.to_string();
        config.server.body_limit_bytes = 64 * 1024;

        Harness {
            router: app_router(AppState::new(&config, pipeline)),
            renderer,
            encoder,
        }
    }

    async fn send_request(router: &mut Router, request: Request<Body>) -> Response {
        router
            .as_service()
            .ready()
            .await
            .unwrap()
            .call(request)
            .await
            .unwrap()
    }

    fn render_request(path: &str, key: Option<&str>, body: impl Into<Body>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(path)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(key) = key {
            builder = builder.header(auth::API_KEY_HEADER, key);
        }
        builder.body(body.into()).unwrap()
    }

    fn valid_body() -> String {
        serde_json::json!({ "html": "<h1>Hi</h1>", "audio_base64": AUDIO_B64 }).to_string()
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        serde_json::from_slice(&body_bytes(response).await).unwrap()
    }

    fn download_name(response: &Response) -> String {
        let disposition = response.headers()[header::CONTENT_DISPOSITION]
            .to_str()
            .unwrap();
        disposition
            .strip_prefix("inline; filename=\"")
            .and_then(|rest| rest.strip_suffix('"'))
            .unwrap()
            .to_string()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let root = tempdir().unwrap();
        let mut h = harness(root.path(), RenderBehavior::Succeed, FakeEncoder::succeeding());
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();

        let resp = send_request(&mut h.router, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await, serde_json::json!({ "ok": true }));
    }

    #[tokio::test]
    async fn index_returns_banner() {
        let root = tempdir().unwrap();
        let h = harness(root.path(), RenderBehavior::Succeed, FakeEncoder::succeeding());
        let req = Request::builder().uri("/").body(Body::empty()).unwrap();

        let resp = h.router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_bytes(resp).await, BANNER.as_bytes());
    }

    #[tokio::test]
    async fn render_returns_inline_mp4() {
        let root = tempdir().unwrap();
        let mut h = harness(root.path(), RenderBehavior::Succeed, FakeEncoder::succeeding());

        let resp = send_request(
            &mut h.router,
            render_request("/render-video", Some(KEY), valid_body()),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "video/mp4");

        let name = download_name(&resp);
        let id = name
            .strip_prefix("presentation_")
            .and_then(|rest| rest.strip_suffix(".mp4"))
            .unwrap();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(resp.headers()[JOB_ID_HEADER], id);

        let body = body_bytes(resp).await;
        assert!(body.starts_with(b"mp4:"));
        assert!(body.ends_with(AUDIO_BYTES));
        assert_eq!(scratch_entries(root.path()), 0);
    }

    #[tokio::test]
    async fn identical_requests_get_distinct_filenames() {
        let root = tempdir().unwrap();
        let mut h = harness(root.path(), RenderBehavior::Succeed, FakeEncoder::succeeding());

        let first = send_request(
            &mut h.router,
            render_request("/render-video", Some(KEY), valid_body()),
        )
        .await;
        let second = send_request(
            &mut h.router,
            render_request("/render-video", Some(KEY), valid_body()),
        )
        .await;

        assert_ne!(download_name(&first), download_name(&second));
    }

    #[tokio::test]
    async fn legacy_route_and_field_name_are_accepted() {
        let root = tempdir().unwrap();
        let mut h = harness(root.path(), RenderBehavior::Succeed, FakeEncoder::succeeding());
        let body = serde_json::json!({ "html": "<p>x</p>", "mp3_base64": AUDIO_B64 }).to_string();

        let resp = send_request(&mut h.router, render_request("/render-mp4", Some(KEY), body)).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_key_is_unauthorized_without_side_effects() {
        let root = tempdir().unwrap();
        let mut h = harness(root.path(), RenderBehavior::Succeed, FakeEncoder::succeeding());

        let resp = send_request(
            &mut h.router,
            render_request("/render-video", None, valid_body()),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_bytes(resp).await, b"Unauthorized");
        assert_eq!(h.renderer.calls.load(Ordering::SeqCst), 0);
        assert_eq!(scratch_entries(root.path()), 0);
    }

    #[tokio::test]
    async fn wrong_key_wins_over_malformed_body() {
        let root = tempdir().unwrap();
        let mut h = harness(root.path(), RenderBehavior::Succeed, FakeEncoder::succeeding());

        let resp = send_request(
            &mut h.router,
            render_request("/render-video", Some("wrong"), "{not json"),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn missing_fields_are_bad_request() {
        let root = tempdir().unwrap();
        let mut h = harness(root.path(), RenderBehavior::Succeed, FakeEncoder::succeeding());

        for body in [
            serde_json::json!({ "html": "<p>x</p>" }),
            serde_json::json!({ "audio_base64": AUDIO_B64 }),
            serde_json::json!({ "html": "", "audio_base64": AUDIO_B64 }),
        ] {
            let resp = send_request(
                &mut h.router,
                render_request("/render-video", Some(KEY), body.to_string()),
            )
            .await;
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
            assert_eq!(
                body_json(resp).await,
                serde_json::json!({ "error": "html and audio_base64 required" })
            );
        }
        assert_eq!(h.renderer.calls.load(Ordering::SeqCst), 0);
        assert_eq!(scratch_entries(root.path()), 0);
    }

    #[tokio::test]
    async fn malformed_json_and_base64_are_bad_request() {
        let root = tempdir().unwrap();
        let mut h = harness(root.path(), RenderBehavior::Succeed, FakeEncoder::succeeding());

        let resp = send_request(
            &mut h.router,
            render_request("/render-video", Some(KEY), "{not json"),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(resp).await["error"].is_string());

        let body = serde_json::json!({ "html": "<p>x</p>", "audio_base64": "%%%" }).to_string();
        let resp = send_request(&mut h.router, render_request("/render-video", Some(KEY), body)).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(scratch_entries(root.path()), 0);
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let root = tempdir().unwrap();
        let mut h = harness(root.path(), RenderBehavior::Succeed, FakeEncoder::succeeding());
        let body = serde_json::json!({
            "html": "x".repeat(128 * 1024),
            "audio_base64": AUDIO_B64,
        })
        .to_string();

        let resp = send_request(&mut h.router, render_request("/render-video", Some(KEY), body)).await;
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(h.renderer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn encoder_failure_is_render_failed_with_kind() {
        let root = tempdir().unwrap();
        let mut h = harness(root.path(), RenderBehavior::Succeed, FakeEncoder::failing());

        let resp = send_request(
            &mut h.router,
            render_request("/render-video", Some(KEY), valid_body()),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let json = body_json(resp).await;
        assert_eq!(json["error"], "render failed");
        assert_eq!(json["kind"], "encoding_error");
        assert!(json["details"]
            .as_str()
            .unwrap()
            .contains("Invalid data found when processing input"));
        assert_eq!(h.encoder.calls.load(Ordering::SeqCst), 1);
        assert_eq!(scratch_entries(root.path()), 0);
    }

    #[tokio::test]
    async fn render_timeout_is_render_failed() {
        let root = tempdir().unwrap();
        let mut h = harness(root.path(), RenderBehavior::TimeOut, FakeEncoder::succeeding());

        let resp = send_request(
            &mut h.router,
            render_request("/render-video", Some(KEY), valid_body()),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(resp).await["kind"], "render_timeout_error");
        assert_eq!(h.encoder.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn render_errors_map_to_statuses() {
        let cases = [
            (RenderError::Unauthorized, StatusCode::UNAUTHORIZED),
            (RenderError::validation("bad"), StatusCode::BAD_REQUEST),
            (RenderError::resource("disk full"), StatusCode::INTERNAL_SERVER_ERROR),
            (RenderError::Cancelled, StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).into_response().status(), status);
        }
    }
}

//! Render-and-mux orchestration for one request.
//!
//! Stages run strictly in order, each at most once:
//! `Validating → ScratchAcquired → AudioWritten → ImageRendered → Muxed →
//! Completed`, with `Failed` reachable from any non-terminal stage. Cleanup
//! always follows: the job's scratch space is released whether the stages
//! succeeded, failed, or were cancelled, and the browser process never
//! outlives the render stage.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::assets::write_audio;
use crate::config::AppConfig;
use crate::encode::{Encoder, FfmpegEncoder};
use crate::error::RenderError;
use crate::render::{ChromiumRenderer, Renderer, Viewport};
use crate::scratch::{Job, JobId, ScratchManager};

pub const MISSING_FIELDS_MESSAGE: &str = "html and audio_base64 required";

#[derive(Debug, Clone, Default)]
pub struct RenderRequest {
    pub html: String,
    pub audio_base64: String,
}

impl RenderRequest {
    pub fn new(html: impl Into<String>, audio_base64: impl Into<String>) -> Self {
        Self {
            html: html.into(),
            audio_base64: audio_base64.into(),
        }
    }

    pub fn validate(&self) -> Result<(), RenderError> {
        if self.html.is_empty() || self.audio_base64.trim().is_empty() {
            return Err(RenderError::validation(MISSING_FIELDS_MESSAGE));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RenderedVideo {
    pub job_id: JobId,
    pub filename: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Validating,
    ScratchAcquired,
    AudioWritten,
    ImageRendered,
    Muxed,
    Completed,
    Failed,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Idle => "idle",
            Stage::Validating => "validating",
            Stage::ScratchAcquired => "scratch_acquired",
            Stage::AudioWritten => "audio_written",
            Stage::ImageRendered => "image_rendered",
            Stage::Muxed => "muxed",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage bookkeeping for one run; every transition is logged.
#[derive(Debug)]
struct Progress {
    stage: Stage,
    started: Instant,
}

impl Progress {
    fn new() -> Self {
        Self {
            stage: Stage::Idle,
            started: Instant::now(),
        }
    }

    fn advance(&mut self, next: Stage, job_id: Option<&JobId>) {
        debug!(
            job_id = job_id.map(JobId::as_str).unwrap_or("-"),
            from = %self.stage,
            to = %next,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "Pipeline stage"
        );
        self.stage = next;
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

#[derive(Clone)]
pub struct RenderPipeline {
    scratch: ScratchManager,
    renderer: Arc<dyn Renderer>,
    encoder: Arc<dyn Encoder>,
    viewport: Viewport,
    permits: Option<Arc<Semaphore>>,
    shutdown: CancellationToken,
}

impl RenderPipeline {
    pub fn new(
        scratch: ScratchManager,
        renderer: Arc<dyn Renderer>,
        encoder: Arc<dyn Encoder>,
        viewport: Viewport,
    ) -> Self {
        Self {
            scratch,
            renderer,
            encoder,
            viewport,
            permits: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Chromium renderer + ffmpeg encoder wired from config.
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            ScratchManager::new(config.paths.scratch_root.clone()),
            Arc::new(ChromiumRenderer::new(config.render.clone())),
            Arc::new(FfmpegEncoder::new(config.encoder.clone())),
            config.render.viewport(),
        )
        .with_max_concurrent(config.limits.max_concurrent_renders)
    }

    /// Bound concurrent runs. 0 means unbounded.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.permits = (max > 0).then(|| Arc::new(Semaphore::new(max)));
        self
    }

    /// Runs in flight when `token` is cancelled abort their current stage
    /// and clean up.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub async fn run(&self, request: &RenderRequest) -> Result<RenderedVideo, RenderError> {
        let mut progress = Progress::new();
        progress.advance(Stage::Validating, None);
        request.validate()?;

        let _permit = self.acquire_permit().await?;
        let job = Job::create(&self.scratch)?;
        progress.advance(Stage::ScratchAcquired, Some(job.id()));

        let result = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(RenderError::Cancelled),
            result = self.run_stages(&job, request, &mut progress) => result,
        };

        let reached = progress.stage;
        match &result {
            Ok(video) => info!(
                job_id = %job.id(),
                bytes = video.bytes.len(),
                elapsed_ms = progress.elapsed_ms(),
                "Render completed"
            ),
            Err(error) => warn!(
                job_id = %job.id(),
                stage = %reached,
                kind = error.kind(),
                error = %error,
                elapsed_ms = progress.elapsed_ms(),
                "Render failed"
            ),
        }

        let terminal = if result.is_ok() {
            Stage::Completed
        } else {
            Stage::Failed
        };
        progress.advance(terminal, Some(job.id()));

        job.release();
        result
    }

    async fn run_stages(
        &self,
        job: &Job,
        request: &RenderRequest,
        progress: &mut Progress,
    ) -> Result<RenderedVideo, RenderError> {
        write_audio(&request.audio_base64, job.audio_path()).await?;
        progress.advance(Stage::AudioWritten, Some(job.id()));

        self.renderer
            .render_to_image(&request.html, job.image_path(), self.viewport)
            .await?;
        progress.advance(Stage::ImageRendered, Some(job.id()));

        self.encoder
            .mux(job.image_path(), job.audio_path(), job.video_path())
            .await?;
        progress.advance(Stage::Muxed, Some(job.id()));

        let bytes = tokio::fs::read(job.video_path()).await.map_err(|e| {
            RenderError::resource(format!(
                "failed to read encoded video {}: {e}",
                job.video_path().display()
            ))
        })?;
        if bytes.is_empty() {
            return Err(RenderError::encoding("encoder produced an empty video"));
        }

        Ok(RenderedVideo {
            job_id: job.id().clone(),
            filename: job.video_filename(),
            bytes,
        })
    }

    async fn acquire_permit(&self) -> Result<Option<OwnedSemaphorePermit>, RenderError> {
        let Some(permits) = &self.permits else {
            return Ok(None);
        };

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(RenderError::Cancelled),
            permit = permits.clone().acquire_owned() => permit
                .map(Some)
                .map_err(|_| RenderError::resource("render permit pool closed")),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use tempfile::tempdir;

    use super::*;
    use crate::test_support::{
        scratch_entries, FakeEncoder, FakeRenderer, RenderBehavior, AUDIO_B64, AUDIO_BYTES,
    };

    fn pipeline(
        root: &std::path::Path,
        renderer: &Arc<FakeRenderer>,
        encoder: &Arc<FakeEncoder>,
    ) -> RenderPipeline {
        RenderPipeline::new(
            ScratchManager::new(Some(root.to_path_buf())),
            renderer.clone(),
            encoder.clone(),
            Viewport::default(),
        )
    }

    fn valid_request() -> RenderRequest {
        RenderRequest::new("<h1>Quarterly update</h1>", AUDIO_B64)
    }

    #[test]
    fn validate_rejects_missing_fields() {
        for request in [
            RenderRequest::new("", AUDIO_B64),
            RenderRequest::new("<p>x</p>", ""),
            RenderRequest::new("<p>x</p>", "  "),
        ] {
            let err = request.validate().expect_err("missing field");
            assert_eq!(err.to_string(), MISSING_FIELDS_MESSAGE);
        }
        valid_request().validate().expect("valid");
    }

    #[tokio::test]
    async fn whitespace_only_markup_is_still_rendered() {
        let root = tempdir().expect("tempdir");
        let renderer = Arc::new(FakeRenderer::new(RenderBehavior::Succeed));
        let encoder = Arc::new(FakeEncoder::succeeding());
        let pipeline = pipeline(root.path(), &renderer, &encoder);

        pipeline
            .run(&RenderRequest::new("  \n", AUDIO_B64))
            .await
            .expect("blank markup renders a blank frame");
        assert_eq!(renderer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn successful_run_returns_video_and_cleans_scratch() {
        let root = tempdir().expect("tempdir");
        let renderer = Arc::new(FakeRenderer::new(RenderBehavior::Succeed));
        let encoder = Arc::new(FakeEncoder::succeeding());

        let video = pipeline(root.path(), &renderer, &encoder)
            .run(&valid_request())
            .await
            .expect("render succeeds");

        assert_eq!(video.filename, format!("presentation_{}.mp4", video.job_id));
        assert!(video.bytes.ends_with(AUDIO_BYTES));
        assert_eq!(renderer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(encoder.calls.load(Ordering::SeqCst), 1);
        assert_eq!(scratch_entries(root.path()), 0);
    }

    #[tokio::test]
    async fn invalid_request_allocates_nothing() {
        let root = tempdir().expect("tempdir");
        let renderer = Arc::new(FakeRenderer::new(RenderBehavior::Succeed));
        let encoder = Arc::new(FakeEncoder::succeeding());

        let err = pipeline(root.path(), &renderer, &encoder)
            .run(&RenderRequest::new("", AUDIO_B64))
            .await
            .expect_err("missing html");

        assert!(matches!(err, RenderError::Validation(_)));
        assert_eq!(renderer.calls.load(Ordering::SeqCst), 0);
        assert_eq!(scratch_entries(root.path()), 0);
    }

    #[tokio::test]
    async fn malformed_audio_stops_before_render_and_cleans_scratch() {
        let root = tempdir().expect("tempdir");
        let renderer = Arc::new(FakeRenderer::new(RenderBehavior::Succeed));
        let encoder = Arc::new(FakeEncoder::succeeding());

        let err = pipeline(root.path(), &renderer, &encoder)
            .run(&RenderRequest::new("<p>x</p>", "***not-base64***"))
            .await
            .expect_err("bad base64");

        assert!(matches!(err, RenderError::Validation(_)));
        assert_eq!(renderer.calls.load(Ordering::SeqCst), 0);
        assert_eq!(scratch_entries(root.path()), 0);
    }

    #[tokio::test]
    async fn render_failure_skips_encoder_and_cleans_scratch() {
        let root = tempdir().expect("tempdir");
        let renderer = Arc::new(FakeRenderer::new(RenderBehavior::Fail));
        let encoder = Arc::new(FakeEncoder::succeeding());

        let err = pipeline(root.path(), &renderer, &encoder)
            .run(&valid_request())
            .await
            .expect_err("render fails");

        assert!(matches!(err, RenderError::Render(_)));
        assert_eq!(encoder.calls.load(Ordering::SeqCst), 0);
        assert_eq!(scratch_entries(root.path()), 0);
    }

    #[tokio::test]
    async fn render_timeout_is_reported_as_timeout() {
        let root = tempdir().expect("tempdir");
        let renderer = Arc::new(FakeRenderer::new(RenderBehavior::TimeOut));
        let encoder = Arc::new(FakeEncoder::succeeding());

        let err = pipeline(root.path(), &renderer, &encoder)
            .run(&valid_request())
            .await
            .expect_err("render times out");

        assert_eq!(err.kind(), "render_timeout_error");
        assert_eq!(scratch_entries(root.path()), 0);
    }

    #[tokio::test]
    async fn encoder_failure_is_encoding_error_and_cleans_scratch() {
        let root = tempdir().expect("tempdir");
        let renderer = Arc::new(FakeRenderer::new(RenderBehavior::Succeed));
        let encoder = Arc::new(FakeEncoder::failing());

        let err = pipeline(root.path(), &renderer, &encoder)
            .run(&valid_request())
            .await
            .expect_err("encode fails");

        assert_eq!(err.kind(), "encoding_error");
        assert_eq!(scratch_entries(root.path()), 0);
    }

    #[tokio::test]
    async fn repeated_requests_get_distinct_identifiers() {
        let root = tempdir().expect("tempdir");
        let renderer = Arc::new(FakeRenderer::new(RenderBehavior::Succeed));
        let encoder = Arc::new(FakeEncoder::succeeding());
        let pipeline = pipeline(root.path(), &renderer, &encoder);

        let first = pipeline.run(&valid_request()).await.expect("first");
        let second = pipeline.run(&valid_request()).await.expect("second");

        assert_ne!(first.job_id, second.job_id);
        assert_ne!(first.filename, second.filename);
        assert_eq!(first.bytes, second.bytes);
    }

    #[tokio::test]
    async fn concurrent_runs_do_not_interfere() {
        let root = tempdir().expect("tempdir");
        let renderer = Arc::new(
            FakeRenderer::new(RenderBehavior::Succeed).with_delay(Duration::from_millis(50)),
        );
        let encoder = Arc::new(FakeEncoder::succeeding());
        let pipeline = pipeline(root.path(), &renderer, &encoder);

        let ok_request = valid_request();
        let bad_request = RenderRequest::new("<p>x</p>", "%%%");
        let (ok, bad) = tokio::join!(pipeline.run(&ok_request), pipeline.run(&bad_request));

        assert!(ok.expect("valid run completes").bytes.ends_with(AUDIO_BYTES));
        assert!(matches!(bad, Err(RenderError::Validation(_))));
        assert_eq!(scratch_entries(root.path()), 0);
    }

    #[tokio::test]
    async fn permit_limit_serialises_renders() {
        let root = tempdir().expect("tempdir");
        let renderer = Arc::new(
            FakeRenderer::new(RenderBehavior::Succeed).with_delay(Duration::from_millis(30)),
        );
        let encoder = Arc::new(FakeEncoder::succeeding());
        let pipeline = pipeline(root.path(), &renderer, &encoder).with_max_concurrent(1);

        let request = valid_request();
        let (a, b, c) = tokio::join!(
            pipeline.run(&request),
            pipeline.run(&request),
            pipeline.run(&request)
        );
        a.expect("a");
        b.expect("b");
        c.expect("c");

        assert_eq!(renderer.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_cancels_in_flight_render_and_cleans_scratch() {
        let root = tempdir().expect("tempdir");
        let renderer = Arc::new(FakeRenderer::new(RenderBehavior::Hang));
        let encoder = Arc::new(FakeEncoder::succeeding());
        let token = CancellationToken::new();
        let pipeline = pipeline(root.path(), &renderer, &encoder).with_shutdown(token.clone());

        let request = valid_request();
        let run = pipeline.run(&request);
        let cancel = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        };
        let (result, ()) = tokio::join!(run, cancel);

        assert!(matches!(result, Err(RenderError::Cancelled)));
        assert_eq!(scratch_entries(root.path()), 0);
    }

    #[test]
    fn stage_names_are_snake_case() {
        assert_eq!(Stage::Failed.to_string(), "failed");
        assert_eq!(Stage::ImageRendered.to_string(), "image_rendered");
    }
}

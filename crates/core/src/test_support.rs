//! In-process stand-ins for the browser and the encoder.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::encode::Encoder;
use crate::error::RenderError;
use crate::render::{Renderer, Viewport};

pub const AUDIO_BYTES: &[u8] = b"ID3\x04\0\0fake-mp3";
pub const AUDIO_B64: &str = "SUQzBAAAZmFrZS1tcDM=";
pub const PNG_BYTES: &[u8] = b"\x89PNG\r\n\x1a\nfake";

#[derive(Debug, Clone, Copy)]
pub enum RenderBehavior {
    Succeed,
    Fail,
    TimeOut,
    Hang,
}

pub struct FakeRenderer {
    behavior: RenderBehavior,
    delay: Duration,
    pub calls: AtomicUsize,
    active: AtomicUsize,
    pub max_active: AtomicUsize,
}

impl FakeRenderer {
    pub fn new(behavior: RenderBehavior) -> Self {
        Self {
            behavior,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl Renderer for FakeRenderer {
    async fn render_to_image(
        &self,
        _markup: &str,
        image_path: &Path,
        _viewport: Viewport,
    ) -> Result<(), RenderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let result = match self.behavior {
            RenderBehavior::Succeed => tokio::fs::write(image_path, PNG_BYTES)
                .await
                .map_err(|e| RenderError::resource(e.to_string())),
            RenderBehavior::Fail => Err(RenderError::render("page crashed")),
            RenderBehavior::TimeOut => Err(RenderError::RenderTimeout(Duration::from_secs(60))),
            RenderBehavior::Hang => futures::future::pending().await,
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Writes `mp4:` followed by the audio bytes, so callers can tell which
/// request a video came from.
pub struct FakeEncoder {
    fail: bool,
    pub calls: AtomicUsize,
}

impl FakeEncoder {
    pub fn succeeding() -> Self {
        Self {
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Encoder for FakeEncoder {
    async fn mux(&self, image: &Path, audio: &Path, video: &Path) -> Result<(), RenderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(RenderError::encoding(
                "ffmpeg exited with status 1: Invalid data found when processing input",
            ));
        }

        let still = tokio::fs::read(image)
            .await
            .map_err(|e| RenderError::encoding(format!("missing still: {e}")))?;
        assert_eq!(still, PNG_BYTES);
        let audio = tokio::fs::read(audio)
            .await
            .map_err(|e| RenderError::encoding(format!("missing audio: {e}")))?;

        let mut output = b"mp4:".to_vec();
        output.extend_from_slice(&audio);
        tokio::fs::write(video, output)
            .await
            .map_err(|e| RenderError::encoding(e.to_string()))
    }
}

/// Entries currently present under a scratch root.
pub fn scratch_entries(root: &Path) -> usize {
    std::fs::read_dir(root)
        .map(|entries| entries.count())
        .unwrap_or(0)
}

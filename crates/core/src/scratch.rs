//! Request-scoped scratch space.
//!
//! Every render job owns a private temporary directory. The directory is
//! removed when the owning [`ScratchSpace`] is released or dropped, so every
//! exit path of the pipeline (success, error, panic, cancelled future)
//! cleans up. Removal failures are logged and never propagated.

use std::fmt;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::RenderError;

const SCRATCH_DIR_PREFIX: &str = "stillframe-";

/// Random per-job identifier: 128 bits rendered as 32 lowercase hex chars.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobId(String);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScratchManager {
    root: Option<PathBuf>,
}

impl ScratchManager {
    pub fn new(root: Option<PathBuf>) -> Self {
        Self { root }
    }

    /// Directory under which scratch spaces are created.
    pub fn root(&self) -> PathBuf {
        self.root.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn acquire(&self, id: &JobId) -> Result<ScratchSpace, RenderError> {
        let root = self.root();
        let prefix = format!("{SCRATCH_DIR_PREFIX}{id}-");
        let dir = tempfile::Builder::new()
            .prefix(&prefix)
            .tempdir_in(&root)
            .map_err(|e| {
                RenderError::resource(format!(
                    "failed to create scratch directory under {}: {e}",
                    root.display()
                ))
            })?;

        let path = dir.path().to_path_buf();
        debug!(job_id = %id, path = %path.display(), "Scratch space acquired");

        Ok(ScratchSpace {
            job_id: id.clone(),
            path,
            dir: Some(dir),
        })
    }
}

/// Guard over one scratch directory. Recursively removed on release or drop.
#[derive(Debug)]
pub struct ScratchSpace {
    job_id: JobId,
    path: PathBuf,
    dir: Option<TempDir>,
}

impl ScratchSpace {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn join(&self, name: impl AsRef<Path>) -> PathBuf {
        self.path.join(name)
    }

    /// Remove the directory now. Failure is logged, not returned.
    pub fn release(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };

        match dir.close() {
            Ok(()) => debug!(
                job_id = %self.job_id,
                path = %self.path.display(),
                "Scratch space released"
            ),
            Err(error) => warn!(
                job_id = %self.job_id,
                path = %self.path.display(),
                error = %error,
                "Failed to remove scratch space"
            ),
        }
    }
}

impl Drop for ScratchSpace {
    fn drop(&mut self) {
        self.remove();
    }
}

/// Ephemeral per-request unit: identifier, scratch space, and the file
/// paths derived from the identifier.
#[derive(Debug)]
pub struct Job {
    id: JobId,
    scratch: ScratchSpace,
    image_path: PathBuf,
    audio_path: PathBuf,
    video_path: PathBuf,
}

impl Job {
    pub fn create(manager: &ScratchManager) -> Result<Self, RenderError> {
        let id = JobId::new();
        let scratch = manager.acquire(&id)?;
        let image_path = scratch.join(format!("{id}.png"));
        let audio_path = scratch.join(format!("{id}.mp3"));
        let video_path = scratch.join(format!("{id}.mp4"));

        Ok(Self {
            id,
            scratch,
            image_path,
            audio_path,
            video_path,
        })
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn dir(&self) -> &Path {
        self.scratch.path()
    }

    pub fn image_path(&self) -> &Path {
        &self.image_path
    }

    pub fn audio_path(&self) -> &Path {
        &self.audio_path
    }

    pub fn video_path(&self) -> &Path {
        &self.video_path
    }

    /// Suggested download name for the finished video.
    pub fn video_filename(&self) -> String {
        format!("presentation_{}.mp4", self.id)
    }

    pub fn release(self) {
        self.scratch.release();
    }
}

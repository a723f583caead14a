//! Encoder invoker: multiplexes the rendered still and the audio track into
//! an MP4 with an external `ffmpeg` process.
//!
//! The still is looped for the length of the audio (`-loop 1` + `-shortest`),
//! video is H.264 in 4:2:0 for broad player support, audio is AAC at the
//! configured bitrate. One invocation yields either a complete file at the
//! output path or no file at all.

use std::io::ErrorKind;
use std::path::Path;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::EncoderConfig;
use crate::error::RenderError;

/// Lines of encoder stderr carried in the error detail.
const STDERR_TAIL_LINES: usize = 20;

#[async_trait]
pub trait Encoder: Send + Sync {
    async fn mux(&self, image: &Path, audio: &Path, video: &Path) -> Result<(), RenderError>;
}

pub fn build_ffmpeg_args(
    config: &EncoderConfig,
    image: &Path,
    audio: &Path,
    video: &Path,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-y".into(),
        "-loop".into(),
        "1".into(),
        "-i".into(),
        image.to_string_lossy().into_owned(),
        "-i".into(),
        audio.to_string_lossy().into_owned(),
        "-c:v".into(),
        config.video_codec.clone(),
    ];

    if !config.preset.trim().is_empty() {
        args.extend(["-preset".into(), config.preset.clone()]);
    }

    args.extend([
        "-pix_fmt".into(),
        config.pixel_format.clone(),
        "-c:a".into(),
        config.audio_codec.clone(),
        "-b:a".into(),
        config.audio_bitrate.clone(),
        "-shortest".into(),
        video.to_string_lossy().into_owned(),
    ]);

    args
}

#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    config: EncoderConfig,
}

impl FfmpegEncoder {
    pub fn new(config: EncoderConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    async fn mux(&self, image: &Path, audio: &Path, video: &Path) -> Result<(), RenderError> {
        let args = build_ffmpeg_args(&self.config, image, audio, video);
        debug!(
            cmd = %format!("{} {}", self.config.binary, args.join(" ")),
            "launching FFmpeg encoder"
        );

        let mut command = crate::runtime::command_for(&self.config.binary);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let timeout = self.config.timeout();
        let output = match tokio::time::timeout(timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(error)) => {
                return Err(RenderError::resource(format!(
                    "failed to launch {}: {error}",
                    self.config.binary
                )));
            }
            Err(_) => {
                discard_partial_output(video).await;
                return Err(RenderError::encoding(format!(
                    "ffmpeg did not finish within {}s",
                    timeout.as_secs()
                )));
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stderr.lines().filter(|line| !line.trim().is_empty()) {
            debug!(target: "ffmpeg_stderr", "{}", line);
        }

        if !output.status.success() {
            discard_partial_output(video).await;
            return Err(RenderError::encoding(format!(
                "ffmpeg {}: {}",
                describe_exit(output.status),
                stderr_tail(&stderr, STDERR_TAIL_LINES)
            )));
        }

        match tokio::fs::metadata(video).await {
            Ok(meta) if meta.len() > 0 => {
                debug!(path = %video.display(), bytes = meta.len(), "FFmpeg encoder finished");
                Ok(())
            }
            Ok(_) => {
                discard_partial_output(video).await;
                Err(RenderError::encoding("ffmpeg produced an empty output file"))
            }
            Err(_) => Err(RenderError::encoding("ffmpeg produced no output file")),
        }
    }
}

fn describe_exit(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exited with status {code}"),
        None => "was terminated by a signal".to_string(),
    }
}

fn stderr_tail(stderr: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = stderr
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .collect();

    if lines.is_empty() {
        return "<no stderr output>".to_string();
    }

    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}

async fn discard_partial_output(video: &Path) {
    match tokio::fs::remove_file(video).await {
        Ok(()) => debug!(path = %video.display(), "Removed partial encoder output"),
        Err(error) if error.kind() == ErrorKind::NotFound => {}
        Err(error) => warn!(
            path = %video.display(),
            error = %error,
            "Failed to remove partial encoder output"
        ),
    }
}

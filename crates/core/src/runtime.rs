use std::env;
use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::{debug, info, warn};

/// Browser binaries probed next to the executable, in order, when no
/// executable is configured.
const BROWSER_BINARY_NAMES: [&str; 5] = [
    "chromium",
    "chromium-browser",
    "google-chrome",
    "google-chrome-stable",
    "chrome",
];

fn candidate_bin_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            dirs.push(exe_dir.to_path_buf());
            dirs.push(exe_dir.join("bin"));
            if let Some(parent) = exe_dir.parent() {
                dirs.push(parent.join("bin"));
            }
        }
    }

    if let Ok(cwd) = env::current_dir() {
        if !dirs.contains(&cwd) {
            dirs.push(cwd.clone());
        }
        let cwd_bin = cwd.join("bin");
        if !dirs.contains(&cwd_bin) {
            dirs.push(cwd_bin);
        }
    }

    dirs
}

#[cfg(unix)]
fn candidate_binary_names(binary: &str) -> Vec<String> {
    vec![binary.to_string()]
}

#[cfg(windows)]
fn candidate_binary_names(binary: &str) -> Vec<String> {
    let lower = binary.to_ascii_lowercase();
    if lower.ends_with(".exe") || lower.ends_with(".cmd") || lower.ends_with(".bat") {
        return vec![binary.to_string()];
    }

    vec![format!("{binary}.exe"), binary.to_string()]
}

fn find_binary_in_dirs(binary: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    let names = candidate_binary_names(binary);
    for dir in dirs {
        for name in &names {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}

fn is_explicit_path(binary: &str) -> bool {
    Path::new(binary).components().count() > 1
}

/// Resolve `binary` against the bundled bin directories, falling back to the
/// bare name so the OS searches `PATH`. Explicit paths are used verbatim.
pub fn resolve_binary(binary: &str) -> PathBuf {
    if is_explicit_path(binary) {
        return PathBuf::from(binary);
    }
    find_binary_in_dirs(binary, &candidate_bin_dirs()).unwrap_or_else(|| PathBuf::from(binary))
}

/// Child processes built here die with their handle: dropping the future
/// that awaits them (timeout, cancellation) kills the process.
pub fn command_for(binary: &str) -> Command {
    let mut command = Command::new(resolve_binary(binary));
    command.kill_on_drop(true);
    command
}

/// Pick the browser executable: the configured path if any, else a bundled
/// binary next to the executable. `None` lets the CDP client run its own
/// system-wide detection.
pub fn resolve_browser_executable(configured: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = configured {
        return Some(path.to_path_buf());
    }

    let dirs = candidate_bin_dirs();
    BROWSER_BINARY_NAMES
        .iter()
        .find_map(|name| find_binary_in_dirs(name, &dirs))
}

/// Log which external binaries were resolved, for diagnostics.
/// Call after tracing is initialized.
pub fn log_external_binaries(ffmpeg_binary: &str, browser_executable: Option<&Path>) {
    let ffmpeg = resolve_binary(ffmpeg_binary);
    if ffmpeg.components().count() > 1 && !ffmpeg.is_file() {
        warn!(path = %ffmpeg.display(), "Configured ffmpeg binary does not exist");
    } else {
        info!(path = %ffmpeg.display(), "ffmpeg binary");
    }

    match resolve_browser_executable(browser_executable) {
        Some(path) if path.is_file() => info!(path = %path.display(), "Browser executable"),
        Some(path) => warn!(
            path = %path.display(),
            "Configured browser executable does not exist"
        ),
        None => debug!("No browser executable configured; relying on system detection"),
    }
}

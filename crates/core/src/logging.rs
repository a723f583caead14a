//! Logging plumbing shared by the binaries: filter selection, the rolling
//! file sink, secret redaction for sink output, and the crash-report panic
//! hook.

use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::fs;
use std::io::{self, Write};
use std::ops::Range;
use std::panic::{self, PanicHookInfo};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::thread;

use chrono::{DateTime, Utc};
use tracing::Metadata;
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::MakeWriter;

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_RETENTION_FILES: usize = 14;
pub const LOG_DIR_NAME: &str = "logs";
pub const CRASH_DIR_NAME: &str = "crash";
pub const LOG_FILE_PREFIX: &str = "stillframe";
pub const REDACTED: &str = "[redacted]";

/// Target carrying encoder stderr lines.
pub const FFMPEG_STDERR_TARGET: &str = "ffmpeg_stderr";

/// Chatty targets and the level they are held to when the filter was not
/// chosen explicitly. The file sink keeps encoder stderr at debug.
const QUIET_TARGETS: [(&str, &str); 4] = [
    ("chromiumoxide", "warn"),
    ("tungstenite", "warn"),
    ("hyper", "warn"),
    (FFMPEG_STDERR_TARGET, "error"),
];

const SENSITIVE_KEYS: [&str; 9] = [
    "x-api-key",
    "api_key",
    "api-key",
    "apikey",
    "authorization",
    "access_token",
    "token",
    "secret",
    "password",
];

static CRASH_HOOK_LOCK: Mutex<()> = Mutex::new(());
static CRASH_DIR: OnceLock<PathBuf> = OnceLock::new();
static CRASH_WRITE_ACTIVE: AtomicBool = AtomicBool::new(false);
static CRASH_SEQUENCE: AtomicU64 = AtomicU64::new(0);

// ─── Filters ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogSettings {
    pub data_dir: Option<PathBuf>,
    /// `-v` count.
    pub verbose: u8,
    /// `--log-filter`.
    pub filter_override: Option<String>,
    /// `RUST_LOG`.
    pub env_filter: Option<String>,
    /// 0 selects [`DEFAULT_RETENTION_FILES`].
    pub retention_files: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilters {
    /// Filter the user asked for, before quiet targets are added.
    pub requested: String,
    pub console: String,
    pub file: String,
}

impl LogFilters {
    /// Precedence: `--log-filter`, then `-v`/`-vv`, then `RUST_LOG`, then
    /// [`DEFAULT_LOG_FILTER`]. Quiet targets are only added when neither of
    /// the first two was given.
    pub fn resolve(settings: &LogSettings) -> Self {
        let (requested, explicit) = if let Some(filter) = settings.filter_override.as_deref() {
            (filter.to_string(), true)
        } else if settings.verbose >= 2 {
            ("trace".to_string(), true)
        } else if settings.verbose == 1 {
            ("debug".to_string(), true)
        } else if let Some(filter) = settings.env_filter.as_deref() {
            (filter.to_string(), false)
        } else {
            (DEFAULT_LOG_FILTER.to_string(), false)
        };

        if explicit {
            return Self {
                console: requested.clone(),
                file: requested.clone(),
                requested,
            };
        }

        Self {
            console: format!("{},{requested}", quiet_directives(false)),
            file: format!("{},{requested}", quiet_directives(true)),
            requested,
        }
    }
}

fn quiet_directives(for_file: bool) -> String {
    QUIET_TARGETS
        .iter()
        .map(|(target, level)| {
            let level = if for_file && *target == FFMPEG_STDERR_TARGET {
                "debug"
            } else {
                level
            };
            format!("{target}={level}")
        })
        .collect::<Vec<_>>()
        .join(",")
}

// ─── File sink ───────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum FileSinkError {
    #[error("file logging disabled: no data directory configured")]
    NoDataDir,
    #[error("failed to create log directory {}: {source}", .path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to open rolling log file in {}: {source}", .path.display())]
    Appender {
        path: PathBuf,
        #[source]
        source: InitError,
    },
}

#[derive(Debug)]
pub struct FileSink {
    pub log_dir: PathBuf,
    pub retention_files: usize,
    pub appender: RollingFileAppender,
}

/// Daily-rotated `stillframe.*.log` files under `<data_dir>/logs`.
pub fn open_file_sink(settings: &LogSettings) -> Result<FileSink, FileSinkError> {
    let data_dir = settings
        .data_dir
        .as_deref()
        .ok_or(FileSinkError::NoDataDir)?;
    let log_dir = data_dir.join(LOG_DIR_NAME);
    fs::create_dir_all(&log_dir).map_err(|source| FileSinkError::CreateDir {
        path: log_dir.clone(),
        source,
    })?;

    let retention_files = match settings.retention_files {
        0 => DEFAULT_RETENTION_FILES,
        n => n,
    };
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .max_log_files(retention_files)
        .build(&log_dir)
        .map_err(|source| FileSinkError::Appender {
            path: log_dir.clone(),
            source,
        })?;

    Ok(FileSink {
        log_dir,
        retention_files,
        appender,
    })
}

// ─── Redaction ───────────────────────────────────────────────────────────────

/// Mask credentials in one chunk of log output: URL userinfo and the
/// values of key/secret/token style assignments (`key=value`, `key: value`,
/// JSON `"key":"value"`, `Authorization: Bearer value`).
pub fn redact_secrets(input: &str) -> String {
    redact_key_values(&redact_url_userinfo(input))
}

fn redact_url_userinfo(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(scheme_end) = rest.find("://") {
        let (head, tail) = rest.split_at(scheme_end + 3);
        out.push_str(head);

        let authority_len = tail
            .find(|c: char| matches!(c, '/' | '?' | '#' | '"' | '\'' | '<' | '>') || c.is_whitespace())
            .unwrap_or(tail.len());
        let authority = &tail[..authority_len];
        match authority.rfind('@') {
            Some(at) if at > 0 => {
                out.push_str(REDACTED);
                out.push_str(&authority[at..]);
            }
            _ => out.push_str(authority),
        }
        rest = &tail[authority_len..];
    }

    out.push_str(rest);
    out
}

fn redact_key_values(input: &str) -> String {
    let lower = input.to_ascii_lowercase();
    let bytes = input.as_bytes();
    let mut out = String::with_capacity(input.len());
    let mut copied = 0;
    let mut cursor = 0;

    while let Some((key_start, key)) = next_sensitive_key(&lower, cursor) {
        let key_end = key_start + key.len();
        cursor = key_end;

        if key_start > 0 && is_key_byte(bytes[key_start - 1]) {
            continue;
        }
        let Some(value) = assigned_value(input, key_end) else {
            continue;
        };

        out.push_str(&input[copied..value.start]);
        out.push_str(REDACTED);
        copied = value.end;
        cursor = value.end;
    }

    out.push_str(&input[copied..]);
    out
}

/// Earliest key occurrence at or after `from`; the longest key wins a tie.
fn next_sensitive_key(lower: &str, from: usize) -> Option<(usize, &'static str)> {
    SENSITIVE_KEYS
        .iter()
        .filter_map(|key| lower[from..].find(key).map(|offset| (from + offset, *key)))
        .min_by_key(|(start, key)| (*start, std::cmp::Reverse(key.len())))
}

fn assigned_value(input: &str, key_end: usize) -> Option<Range<usize>> {
    let bytes = input.as_bytes();
    let skip_spaces = |mut at: usize| {
        while bytes.get(at).is_some_and(|b| *b == b' ' || *b == b'\t') {
            at += 1;
        }
        at
    };

    let mut at = key_end;
    match bytes.get(at).copied() {
        Some(b) if is_key_byte(b) => return None,
        Some(b'"' | b'\'') => at += 1,
        _ => {}
    }
    at = skip_spaces(at);
    if !matches!(bytes.get(at).copied(), Some(b'=' | b':')) {
        return None;
    }
    at = skip_spaces(at + 1);

    if input
        .get(at..at + 7)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("bearer "))
    {
        at += 7;
    }

    match bytes.get(at).copied()? {
        quote @ (b'"' | b'\'') => {
            let start = at + 1;
            let end = input[start..]
                .find(quote as char)
                .map_or(input.len(), |offset| start + offset);
            (end > start).then_some(start..end)
        }
        _ => {
            let end = input[at..]
                .find(|c: char| {
                    c.is_whitespace() || matches!(c, '&' | ',' | ';' | '"' | '\'' | ')' | ']' | '}')
                })
                .map_or(input.len(), |offset| at + offset);
            (end > at).then_some(at..end)
        }
    }
}

fn is_key_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-'
}

/// [`MakeWriter`] wrapper that runs every complete line through
/// [`redact_secrets`] before it reaches the inner writer.
#[derive(Debug)]
pub struct RedactingMakeWriter<M> {
    inner: M,
}

impl<M> RedactingMakeWriter<M> {
    pub fn new(inner: M) -> Self {
        Self { inner }
    }
}

impl<'a, M> MakeWriter<'a> for RedactingMakeWriter<M>
where
    M: MakeWriter<'a>,
{
    type Writer = RedactingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::new(self.inner.make_writer())
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        RedactingWriter::new(self.inner.make_writer_for(meta))
    }
}

/// Buffers partial lines so a secret split across `write` calls is still
/// masked.
#[derive(Debug)]
pub struct RedactingWriter<W: Write> {
    inner: W,
    buffered: Vec<u8>,
}

impl<W: Write> RedactingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buffered: Vec::new(),
        }
    }

    fn emit(&mut self, upto: usize) -> io::Result<()> {
        let chunk: Vec<u8> = self.buffered.drain(..upto).collect();
        let text = String::from_utf8_lossy(&chunk);
        self.inner.write_all(redact_secrets(&text).as_bytes())
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffered.extend_from_slice(buf);
        if let Some(last_newline) = self.buffered.iter().rposition(|b| *b == b'\n') {
            self.emit(last_newline + 1)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.buffered.is_empty() {
            self.emit(self.buffered.len())?;
        }
        self.inner.flush()
    }
}

impl<W: Write> Drop for RedactingWriter<W> {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

// ─── Crash reports ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrashReporter {
    Installed(PathBuf),
    AlreadyInstalled(PathBuf),
    Disabled(String),
}

/// Install a process-wide panic hook that writes one report per panic to
/// `<data_dir>/logs/crash` and then defers to the previous hook.
///
/// Idempotent. Write failures inside the hook are reported on stderr and
/// never panic again.
pub fn install_crash_reporter(data_dir: Option<&Path>) -> CrashReporter {
    if let Some(dir) = CRASH_DIR.get() {
        return CrashReporter::AlreadyInstalled(dir.clone());
    }
    let Some(data_dir) = data_dir else {
        return CrashReporter::Disabled("no data directory configured".to_string());
    };

    let crash_dir = data_dir.join(LOG_DIR_NAME).join(CRASH_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&crash_dir) {
        return CrashReporter::Disabled(format!(
            "failed to create {}: {error}",
            crash_dir.display()
        ));
    }

    let _guard = CRASH_HOOK_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(dir) = CRASH_DIR.get() {
        return CrashReporter::AlreadyInstalled(dir.clone());
    }

    let previous = panic::take_hook();
    let hook_dir = crash_dir.clone();
    panic::set_hook(Box::new(move |info| {
        report_panic(&hook_dir, info);
        previous(info);
    }));

    let _ = CRASH_DIR.set(crash_dir.clone());
    CrashReporter::Installed(crash_dir)
}

#[derive(Debug)]
struct CrashReport {
    time: DateTime<Utc>,
    thread: String,
    location: String,
    message: String,
    backtrace_status: &'static str,
    backtrace: String,
}

impl CrashReport {
    fn capture(info: &PanicHookInfo<'_>) -> Self {
        let backtrace = Backtrace::capture();
        let (backtrace_status, backtrace) = match backtrace.status() {
            BacktraceStatus::Captured => ("captured", backtrace.to_string()),
            BacktraceStatus::Disabled => ("disabled (set RUST_BACKTRACE=1 to enable)", String::new()),
            BacktraceStatus::Unsupported => ("unsupported", String::new()),
            _ => ("unknown", String::new()),
        };

        Self {
            time: Utc::now(),
            thread: thread::current().name().unwrap_or("<unnamed>").to_string(),
            location: info
                .location()
                .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
                .unwrap_or_else(|| "<unknown>".to_string()),
            message: panic_message(info.payload()),
            backtrace_status,
            backtrace,
        }
    }

    fn write_to(&self, crash_dir: &Path) -> io::Result<PathBuf> {
        fs::create_dir_all(crash_dir)?;
        let sequence = CRASH_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let path = crash_dir.join(format!(
            "crash-{}-{sequence:04}.log",
            self.time.format("%Y%m%dT%H%M%S%.6f")
        ));

        let mut file = fs::File::create(&path)?;
        writeln!(file, "version={}", env!("CARGO_PKG_VERSION"))?;
        writeln!(file, "time={}", self.time.to_rfc3339())?;
        writeln!(file, "thread={}", self.thread)?;
        writeln!(file, "location={}", self.location)?;
        writeln!(file, "message={}", redact_secrets(&self.message))?;
        writeln!(file, "backtrace_status={}", self.backtrace_status)?;
        if !self.backtrace.is_empty() {
            writeln!(file, "backtrace:\n{}", self.backtrace)?;
        }
        file.flush()?;
        Ok(path)
    }
}

fn report_panic(crash_dir: &Path, info: &PanicHookInfo<'_>) {
    if CRASH_WRITE_ACTIVE.swap(true, Ordering::AcqRel) {
        return;
    }

    let outcome = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        CrashReport::capture(info).write_to(crash_dir)
    }));
    match outcome {
        Ok(Ok(_)) => {}
        Ok(Err(error)) => eprintln!(
            "warning: could not write crash report under {}: {error}",
            crash_dir.display()
        ),
        Err(_) => eprintln!(
            "warning: crash reporter failed under {}",
            crash_dir.display()
        ),
    }

    CRASH_WRITE_ACTIVE.store(false, Ordering::Release);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "<non-string panic payload>".to_string())
}

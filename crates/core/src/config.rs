use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::render::{Viewport, CONTAINER_LAUNCH_FLAGS};

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "STILLFRAME_DATA_DIR";
const ENV_API_KEY: &str = "API_KEY";
const ENV_PORT: &str = "PORT";
const ENV_CHROME_EXECUTABLE: &str = "CHROME_EXECUTABLE";
const ENV_PUPPETEER_EXECUTABLE: &str = "PUPPETEER_EXECUTABLE_PATH";
const ENV_FFMPEG_BINARY: &str = "FFMPEG_BINARY";

/// Placeholder secret shipped in the default config. Accepted, but the app
/// warns loudly at startup while it is in use.
pub const DEFAULT_API_KEY: &str = "CHANGE_ME";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub render: RenderConfig,
    pub encoder: EncoderConfig,
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct PathsConfig {
    /// Parent of per-request scratch directories. `None` uses the system
    /// temporary directory.
    pub scratch_root: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub body_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AuthConfig {
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RenderConfig {
    pub width: u32,
    pub height: u32,
    pub device_scale_factor: f64,
    /// Upper bound for one render, from browser launch to the written
    /// screenshot. Browser teardown runs after it on its own grace period.
    pub timeout_secs: u64,
    /// How long the page must stay free of in-flight requests.
    pub idle_ms: u64,
    pub executable: Option<PathBuf>,
    /// Browser command-line flags. Defaults disable the OS sandbox layers,
    /// GPU, zygote and multi-process mode for constrained container hosts.
    pub launch_flags: Vec<String>,
    pub full_page: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EncoderConfig {
    pub binary: String,
    pub video_codec: String,
    pub preset: String,
    pub pixel_format: String,
    pub audio_codec: String,
    pub audio_bitrate: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct LimitsConfig {
    /// 0 leaves concurrent renders unbounded.
    pub max_concurrent_renders: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            host: "0.0.0.0".to_string(),
            body_limit_bytes: 80 * 1024 * 1024,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key: DEFAULT_API_KEY.to_string(),
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            device_scale_factor: 1.0,
            timeout_secs: 60,
            idle_ms: 500,
            executable: None,
            launch_flags: CONTAINER_LAUNCH_FLAGS
                .iter()
                .map(|flag| flag.to_string())
                .collect(),
            full_page: false,
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            binary: "ffmpeg".to_string(),
            video_codec: "libx264".to_string(),
            preset: "ultrafast".to_string(),
            pixel_format: "yuv420p".to_string(),
            audio_codec: "aac".to_string(),
            audio_bitrate: "128k".to_string(),
            timeout_secs: 300,
        }
    }
}

impl RenderConfig {
    pub fn viewport(&self) -> Viewport {
        Viewport {
            width: self.width,
            height: self.height,
            device_scale_factor: self.device_scale_factor,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn idle_window(&self) -> Duration {
        Duration::from_millis(self.idle_ms)
    }
}

impl EncoderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Apply process environment overrides on top of file values.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| env::var(key).ok())
    }

    /// Override precedence within the environment: `CHROME_EXECUTABLE` wins
    /// over `PUPPETEER_EXECUTABLE_PATH`. Empty values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(api_key) = value(ENV_API_KEY) {
            self.auth.api_key = api_key;
        }

        if let Some(port) = value(ENV_PORT) {
            self.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("invalid {ENV_PORT} value: {port}"))?;
        }

        if let Some(executable) =
            value(ENV_CHROME_EXECUTABLE).or_else(|| value(ENV_PUPPETEER_EXECUTABLE))
        {
            self.render.executable = Some(PathBuf::from(executable));
        }

        if let Some(binary) = value(ENV_FFMPEG_BINARY) {
            self.encoder.binary = binary;
        }

        Ok(())
    }

    pub fn uses_default_api_key(&self) -> bool {
        self.auth.api_key == DEFAULT_API_KEY
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. STILLFRAME_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

/// Returns the path to config.toml within the given data directory.
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create the data directory and write a default config.toml, leaving an
/// existing config untouched.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

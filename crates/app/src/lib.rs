use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use stillframe_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use stillframe_core::logging::{
    self, CrashReporter, LogFilters, LogSettings, RedactingMakeWriter, DEFAULT_LOG_FILTER,
};
use stillframe_core::pipeline::RenderPipeline;
use stillframe_core::runtime::log_external_binaries;
use stillframe_core::server::{app_router, AppState};

#[derive(Parser, Debug)]
#[command(
    name = "stillframe",
    version,
    about = "Render HTML and an audio track into a single-frame MP4 over HTTP"
)]
struct Cli {
    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(short, long, help = "Listen port (overrides PORT and config)")]
    port: Option<u16>,

    #[arg(long, help = "Listen address")]
    host: Option<String>,

    #[arg(long, help = "Directory for config.toml and logs")]
    data_dir: Option<PathBuf>,

    #[arg(long, value_name = "FILE", help = "Config file (default: <data-dir>/config.toml)")]
    config: Option<PathBuf>,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(&resolved_data_dir, cli.verbose, cli.log_filter.as_deref());

    let cfg_path = cli
        .config
        .clone()
        .unwrap_or_else(|| config_path(&resolved_data_dir));
    log_startup_metadata(&resolved_data_dir, &cfg_path);

    let config = load_config(&cli, &resolved_data_dir, &cfg_path, |key| {
        std::env::var(key).ok()
    })?;
    run_server(config).await
}

fn init_logging(data_dir: &Path, verbose: u8, cli_log_filter: Option<&str>) {
    let crash_reporter = logging::install_crash_reporter(Some(data_dir));
    if let CrashReporter::Disabled(reason) = &crash_reporter {
        eprintln!("Warning: crash reports disabled ({reason}). Panics will not be persisted.");
    }

    let settings = LogSettings {
        data_dir: Some(data_dir.to_path_buf()),
        verbose,
        filter_override: cli_log_filter.map(ToString::to_string),
        env_filter: std::env::var("RUST_LOG").ok(),
        retention_files: 0,
    };
    let filters = LogFilters::resolve(&settings);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(RedactingMakeWriter::new(std::io::stderr))
        .with_filter(parse_env_filter_with_fallback(&filters.console, "console"));

    let (file_layer, file_sink_error) = match logging::open_file_sink(&settings) {
        Ok(sink) => (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(RedactingMakeWriter::new(sink.appender))
                    .with_filter(parse_env_filter_with_fallback(&filters.file, "file")),
            ),
            None,
        ),
        Err(error) => (None, Some(error)),
    };

    let subscriber = tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer);
    if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!(
            "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
        );
        return;
    }

    if let Some(error) = file_sink_error {
        warn!(
            error = %error,
            "Persistent file logging unavailable; continuing with console-only logging"
        );
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: &Path, cfg_path: &Path) {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        data_dir = %data_dir.display(),
        config_path = %cfg_path.display(),
        "Runtime startup metadata"
    );
}

/// File values, then environment, then command-line flags.
fn load_config<F>(cli: &Cli, data_dir: &Path, cfg_path: &Path, env: F) -> Result<AppConfig>
where
    F: Fn(&str) -> Option<String>,
{
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }

    let mut config = match AppConfig::load_from_path(cfg_path) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "Failed to load config file, using defaults");
            AppConfig::default()
        }
    };
    config.apply_overrides(env)?;
    apply_cli_overrides(&mut config, cli);
    Ok(config)
}

fn apply_cli_overrides(config: &mut AppConfig, cli: &Cli) {
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(host) = &cli.host {
        config.server.host = host.clone();
    }
}

async fn run_server(config: AppConfig) -> Result<()> {
    if config.uses_default_api_key() {
        warn!("API_KEY is not set; the placeholder key is accepted. Set API_KEY before exposing this service");
    }
    log_external_binaries(&config.encoder.binary, config.render.executable.as_deref());
    info!(
        width = config.render.width,
        height = config.render.height,
        render_timeout_secs = config.render.timeout_secs,
        encoder_timeout_secs = config.encoder.timeout_secs,
        max_concurrent_renders = config.limits.max_concurrent_renders,
        "Render settings"
    );

    let shutdown = CancellationToken::new();
    let pipeline = RenderPipeline::from_config(&config).with_shutdown(shutdown.clone());
    let app = app_router(AppState::new(&config, pipeline));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "Starting stillframe server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;
    info!("Server stopped");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM and cancels in-flight renders so their
/// browser and encoder processes are torn down before exit.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(error = %error, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(error) => {
                warn!(error = %error, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Shutdown requested; cancelling in-flight renders");
    token.cancel();
}

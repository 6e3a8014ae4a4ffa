//! cofferd: coffer vault daemon
//!
//! Usage:
//!   cofferd [--config /etc/coffer/config.toml] [--log debug] [--log-format json]
//!
//! Runs the expiry reaper and limiter housekeeping against the configured
//! metadata store and object store, and serves /metrics, /healthz, /readyz.

mod daemon;
mod metrics;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use coffer_core::config::CofferConfig;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "cofferd", version, about = "coffer vault daemon")]
struct Cli {
    /// Path to coffer.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "COFFER_CONFIG",
        default_value = "/etc/coffer/config.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides [daemon] log_level
    #[arg(long, env = "COFFER_LOG")]
    log: Option<String>,

    /// Log format; overrides [daemon] log_format
    #[arg(long, env = "COFFER_LOG_FORMAT")]
    log_format: Option<LogFormat>,
}

#[derive(Clone, Debug, ValueEnum, PartialEq)]
enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    fn from_config(value: &str) -> Self {
        if value.eq_ignore_ascii_case("text") {
            LogFormat::Text
        } else {
            LogFormat::Json
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Config first: it carries the logging defaults
    let (config, found) = load_config(&cli.config).await?;

    let level = cli.log.clone().unwrap_or_else(|| config.daemon.log_level.clone());
    let format = cli
        .log_format
        .clone()
        .unwrap_or_else(|| LogFormat::from_config(&config.daemon.log_format));
    init_logging(&level, &format);

    if !found {
        tracing::warn!(
            "config file not found: {}  (using defaults)",
            cli.config.display()
        );
    }
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "cofferd starting"
    );

    daemon::run(config).await
}

/// Parse `path`, or fall back to defaults when it does not exist. The flag
/// reports whether the file was found.
async fn load_config(path: &Path) -> Result<(CofferConfig, bool)> {
    if !path.exists() {
        return Ok((CofferConfig::default(), false));
    }
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| anyhow::anyhow!("reading config {}: {e}", path.display()))?;
    let config = toml::from_str(&content)
        .map_err(|e| anyhow::anyhow!("parsing config {}: {e}", path.display()))?;
    Ok((config, true))
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }
}

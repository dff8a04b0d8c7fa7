//! zkvd: zkvault custodian daemon
//!
//! Usage:
//!   zkvd [--config /etc/zkv/config.toml] <command>
//!
//! Commands:
//!   run           - Republish every enrolled entity until SIGTERM/SIGINT
//!   cycle         - Run a single republish cycle and print the report
//!   rotate-epoch  - Create a new custodian epoch
//!   status        - Show custodian epochs and enrollments

mod custody;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use tracing::info;
use zkv_core::config::ZkvConfig;

#[derive(Parser, Debug)]
#[command(name = "zkvd", version, about = "zkvault custodian daemon")]
struct Cli {
    /// Path to zkv.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "ZKV_CONFIG",
        default_value = "/etc/zkv/config.toml",
        global = true
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, env = "ZKV_LOG", global = true)]
    log: Option<String>,

    /// Log format (json, text); overrides the config file
    #[arg(long, env = "ZKV_LOG_FORMAT", global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the republish scheduler until interrupted
    Run,
    /// Run one republish cycle and print the report as JSON
    Cycle,
    /// Create a new custodian epoch; the previous one enters its grace period
    RotateEpoch,
    /// Show custodian epochs and enrollments
    Status,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config).await?;

    let level = cli.log.clone().unwrap_or_else(|| config.daemon.log_level.clone());
    let format = match cli.log_format {
        Some(format) => format,
        None => LogFormat::from_str(&config.daemon.log_format, true)
            .map_err(|e| anyhow::anyhow!("daemon.log_format: {e}"))?,
    };
    init_logging(&level, format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        command = ?cli.command,
        config = %cli.config.display(),
        "zkvd starting"
    );

    match cli.command {
        Command::Run => custody::run(config).await,
        Command::Cycle => custody::cycle_once(config).await,
        Command::RotateEpoch => custody::rotate_epoch(config),
        Command::Status => custody::status(config),
    }
}

async fn load_config(path: &Path) -> Result<ZkvConfig> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| anyhow::anyhow!("reading config {}: {e}", path.display()))?;
        ZkvConfig::from_toml(&content)
            .map_err(|e| anyhow::anyhow!("parsing config {}: {e}", path.display()))
    } else {
        // Logging is not up yet.
        eprintln!("zkvd: config file not found: {}  (using defaults)", path.display());
        Ok(ZkvConfig::default())
    }
}

fn init_logging(level: &str, format: LogFormat) {
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

use anyhow::Result;
use clap::Parser;
use std::process::ExitCode;
use tracing::{error, info};

use automation_helper::{logging, Config, Daemon};

#[derive(Parser)]
#[command(name = "automation-helper")]
#[command(about = "Serve automation commands over a local socket with result caching")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("❌ Automation helper failed: {:#}", e);
            eprintln!("automation-helper: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load_or_default(cli.config.as_deref()).await?;

    let log_level = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else {
        "warn"
    };
    let _log_guards = logging::init(&config.server_config(), log_level)?;

    info!("🦀 Starting automation helper v{}", env!("CARGO_PKG_VERSION"));

    let config_path = Config::locate(cli.config.as_deref());
    Daemon::new(config, config_path).run().await
}

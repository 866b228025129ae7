use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use automation_helper::core::pidfile::{is_process_alive, read_pid};
use automation_helper::ipc::{ClientMessage, DaemonResponse, IpcClient};
use automation_helper::Config;

#[derive(Parser)]
#[command(name = "automation-helper-ctl")]
#[command(about = "Automation helper client - send commands to the running daemon")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Socket path, overriding the configuration
    #[arg(short, long)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an automation command
    Run {
        /// Automation name
        name: String,
        /// Arguments as a JSON document
        args: Option<String>,
    },
    /// Invalidate cached results and reload the daemon
    Reload,
    /// Show daemon health
    Health,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("❌ {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = Config::load_or_default(cli.config.as_deref()).await?;
    let server = config.server_config();
    let socket = cli.socket.unwrap_or(server.socket_path);

    let (command, args): (&str, Vec<String>) = match cli.command {
        Commands::Run { name, args } => ("run", std::iter::once(name).chain(args).collect()),
        Commands::Reload => ("reload", Vec::new()),
        Commands::Health => ("health", Vec::new()),
    };
    let message = ClientMessage::from_args(command, &args)?;

    if matches!(message, ClientMessage::Health) {
        match read_pid(&server.pid_file) {
            Some(pid) if is_process_alive(pid) => println!("🟢 Daemon running with PID {pid}"),
            Some(pid) => println!("🟠 Stale PID file for PID {pid}"),
            None => println!("⚪ No PID file at {:?}", server.pid_file),
        }
    }

    let response = IpcClient::new(socket).send(&message).await?;
    match response {
        DaemonResponse::Success { payload, cached } => {
            if cached {
                eprintln!("(cached)");
            }
            println!("{payload}");
        }
        DaemonResponse::Accepted { message } => println!("⚡ {message}"),
        DaemonResponse::Health(report) => println!("{}", serde_json::to_string_pretty(&report)?),
        DaemonResponse::Error { message } => {
            eprintln!("❌ {message}");
            return Ok(ExitCode::FAILURE);
        }
    }

    Ok(ExitCode::SUCCESS)
}

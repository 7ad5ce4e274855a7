use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use clamban::server::{DEFAULT_PORT, ServerConfig, start_server};

#[derive(Parser)]
#[command(name = "clamban")]
#[command(version, about = "Kanban board server that drives a Claude Code lead agent")]
struct Cli {
    /// Port for the local HTTP API
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Data directory (default: ~/.clamban)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// External teams directory (default: ~/.claude/teams)
    #[arg(long)]
    teams_dir: Option<PathBuf>,

    /// Bind 0.0.0.0 and allow any origin (UI development)
    #[arg(long)]
    dev: bool,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("clamban=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("clamban=info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    start_server(ServerConfig {
        port: cli.port,
        data_dir: cli.data_dir,
        teams_dir: cli.teams_dir,
        dev_mode: cli.dev,
        ..Default::default()
    })
    .await
}

//! ssh-agent-switcher: one stable agent socket in front of every forwarded agent.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use ssh_agent_switcher::config::Config;
use ssh_agent_switcher::proxy::{init_tracing, SwitcherServer};
use ssh_agent_switcher::signals::spawn_signal_bridge;

/// Serve a stable SSH agent socket that routes requests to forwarded agents
#[derive(Parser, Debug)]
#[command(name = "ssh-agent-switcher")]
#[command(version)]
struct Args {
    /// Socket to listen on (default: /tmp/ssh-agent.$USER)
    #[arg(long, alias = "socketPath", value_name = "PATH")]
    socket_path: Option<PathBuf>,

    /// Directory containing forwarded agent sockets (default: /tmp)
    #[arg(long, alias = "agentsDir", value_name = "DIR")]
    agents_dir: Option<PathBuf>,

    /// Path to configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, value_name = "LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(&args.log_level);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::load().context("Failed to load configuration")?,
    };
    if let Some(socket_path) = args.socket_path {
        config.switcher.socket_path = Some(socket_path);
    }
    if let Some(agents_dir) = args.agents_dir {
        config.switcher.agents_dir = agents_dir;
    }

    let mut server = SwitcherServer::new(&config).context("Invalid configuration")?;
    // Handlers go in before the socket appears so early signals are not fatal.
    let _signals =
        spawn_signal_bridge(server.control()).context("Failed to install signal handlers")?;
    server.bind().context("Failed to start listening")?;

    info!(version = env!("CARGO_PKG_VERSION"), "ssh-agent-switcher starting");
    server.run().await.context("Switcher stopped with an error")?;
    Ok(())
}

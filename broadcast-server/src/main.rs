use std::io::IsTerminal;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use broadcast_server::{
    cli::{self, Cli, Command},
    client::{self, ClientExit},
    server::Server,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(std::io::stdout().is_terminal())
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse_from(cli::normalize_command(std::env::args_os()));
    match cli.command {
        Command::Start(args) => {
            let server = Server::bind(&args.server_config()).await?;
            let addr = server.local_addr()?;
            info!("broadcast server listening on {}", addr);
            if let Err(err) = server.run_until_ctrl_c().await {
                warn!("broadcast server exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Connect(args) => {
            if client::run(&args).await? == ClientExit::Disconnected {
                // The runtime would otherwise wait on the blocking stdin read.
                std::process::exit(0);
            }
        }
    }

    Ok(())
}

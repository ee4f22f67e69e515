use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use outpost_agent::lifecycle;
use outpost_config::load_config;

#[derive(Parser)]
#[command(name = "outpostd", version, about = "Outpost edge device agent")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the agent.
    Run {
        #[arg(long, default_value = "/etc/outpost/config.yaml")]
        config: PathBuf,
    },
    /// Validate the configuration file and exit.
    CheckConfig {
        #[arg(long, default_value = "/etc/outpost/config.yaml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::CheckConfig { config } => {
            let cfg = load_config(&config)?;
            println!(
                "configuration ok: {} runtime(s), sync every {}s",
                cfg.runtimes.len(),
                cfg.state_seeking.interval.as_secs()
            );
            Ok(())
        }
        Command::Run { config } => {
            let cfg = load_config(&config)?;
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| EnvFilter::new(cfg.log_level.as_filter())),
                )
                .with_target(false)
                .init();

            let shutdown = CancellationToken::new();
            let interrupt = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("interrupt received");
                    interrupt.cancel();
                }
            });

            lifecycle::run(cfg, shutdown).await?;
            Ok(())
        }
    }
}

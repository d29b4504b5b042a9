//! WAL tailer entry point.

use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use savor_cdc::publisher::CdcPublisher;
use savor_cdc::Tailer;
use savor_config::Config;

#[derive(Parser, Debug)]
#[command(name = "savor-cdc", about = "Tail the WAL and publish CDC records")]
struct Cli {
    /// Path to the configuration file
    #[arg(long, env = "SAVOR_CONFIG", default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "savor_cdc=info".to_string());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    let publisher = CdcPublisher::connect(&config.nats).await?;
    let tailer = Tailer::new(config, publisher);

    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            shutdown.cancel();
        }
    });

    if let Err(e) = tailer.run(token).await {
        // Fatal by design: the supervisor restarts us and the slot
        // replays from the last confirmed LSN.
        error!(error = %e, "tailer exited with error");
        return Err(e.into());
    }
    Ok(())
}

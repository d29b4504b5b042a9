//! Embedding worker entry point.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use savor_common::Table;
use savor_config::Config;
use savor_embedder::{bus, consumer, EmbedHandler, WorkerPool};
use savor_llm::OllamaClient;
use savor_store::Store;

#[derive(Parser, Debug)]
#[command(name = "savor-embedder", about = "Consume CDC records and maintain embeddings")]
struct Cli {
    /// Path to the configuration file
    #[arg(long, env = "SAVOR_CONFIG", default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "savor_embedder=info".to_string());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    let store = Arc::new(Store::connect(&config.postgres.conn_str()).await?);
    let llm = OllamaClient::new(config.model.base_url.clone())?;
    let handler = Arc::new(EmbedHandler::new(
        Arc::clone(&store),
        llm,
        config.model.embedding_model.clone(),
    ));

    let jetstream = bus::connect(&config.nats).await?;

    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            shutdown.cancel();
        }
    });

    let mut tasks = JoinSet::new();
    for table in Table::all() {
        let subject = bus::subject_for(&config.nats, table).to_string();
        let jetstream = jetstream.clone();
        let nats_config = config.nats.clone();
        let handler = handler.clone();
        let token = token.clone();
        let workers = config.embedder.workers;
        let queue_size = config.embedder.queue_size;

        tasks.spawn(async move {
            let stream = match bus::ensure_stream(&jetstream, &nats_config).await {
                Ok(stream) => stream,
                Err(e) => return (subject, Err(e)),
            };
            let pool = WorkerPool::new(workers, queue_size, handler, token.clone());
            let result = consumer::consume(&stream, &subject, &pool, token).await;
            // Let in-flight messages finish before reporting.
            pool.shutdown().await;
            (subject, result)
        });
    }

    let mut failed = false;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((subject, Ok(()))) => info!(subject, "consumer finished"),
            Ok((subject, Err(e))) => {
                error!(subject, error = %e, "consumer failed");
                failed = true;
                token.cancel();
            }
            Err(e) => {
                error!(error = %e, "consumer task panicked");
                failed = true;
                token.cancel();
            }
        }
    }

    if failed {
        anyhow::bail!("one or more consumers failed");
    }
    Ok(())
}

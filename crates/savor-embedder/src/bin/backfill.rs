//! One-shot backfill: publish synthetic CDC records for every row that
//! has never been embedded. Useful after a fingerprint change or when the
//! pipeline is introduced over an existing dataset.

use std::path::PathBuf;

use clap::Parser;
use tracing::{info, warn};

use savor_common::{CdcRecord, ChangeKind, Table};
use savor_config::Config;
use savor_embedder::bus;
use savor_store::Store;

#[derive(Parser, Debug)]
#[command(name = "backfill", about = "Enqueue embedding jobs for unembedded rows")]
struct Cli {
    /// Path to the configuration file
    #[arg(long, env = "SAVOR_CONFIG", default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "backfill=info".to_string());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    let store = Store::connect(&config.postgres.conn_str()).await?;
    let jetstream = bus::connect(&config.nats).await?;

    let mut total = 0usize;
    for table in Table::all() {
        let ids = store.unembedded_ids(table).await?;
        info!(table = %table, count = ids.len(), "found unembedded rows");

        let subject = bus::subject_for(&config.nats, table).to_string();
        let mut published = 0usize;
        for id in ids {
            let record = CdcRecord::new(table, ChangeKind::Insert, id as u64);
            let payload = record.to_bytes()?;
            let publish = async {
                jetstream
                    .publish(subject.clone(), payload.into())
                    .await
                    .map_err(bus::bus_err)?
                    .await
                    .map_err(bus::bus_err)
            };
            match publish.await {
                Ok(_) => published += 1,
                Err(e) => warn!(table = %table, id, error = %e, "failed to publish"),
            }
        }
        info!(table = %table, published, "backfill published");
        total += published;
    }

    info!(total, "backfill complete");
    Ok(())
}

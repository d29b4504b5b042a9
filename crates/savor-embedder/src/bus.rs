//! Bus bootstrap shared by the embedder and the backfill utility.

use std::time::Duration;

use async_nats::jetstream::{self, stream::RetentionPolicy, stream::StorageType};
use tracing::info;

use savor_common::{Error, Result, Table};
use savor_config::NatsConfig;

/// How long the stream retains unconsumed CDC records.
const MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

pub fn bus_err<E: std::fmt::Display>(e: E) -> Error {
    Error::Bus(e.to_string())
}

/// Connect to the bus and make sure the CDC stream exists.
pub async fn connect(config: &NatsConfig) -> Result<jetstream::Context> {
    let client = async_nats::connect(config.url()).await.map_err(bus_err)?;
    let jetstream = jetstream::new(client);
    ensure_stream(&jetstream, config).await?;
    Ok(jetstream)
}

/// Create the CDC stream if absent, mirroring the tailer's definition.
pub async fn ensure_stream(
    jetstream: &jetstream::Context,
    config: &NatsConfig,
) -> Result<jetstream::stream::Stream> {
    let stream = jetstream
        .get_or_create_stream(jetstream::stream::Config {
            name: config.stream.clone(),
            subjects: config.subjects().to_vec(),
            storage: StorageType::File,
            retention: RetentionPolicy::Limits,
            max_age: MAX_AGE,
            ..Default::default()
        })
        .await
        .map_err(bus_err)?;
    info!(stream = %config.stream, "jetstream stream ensured");
    Ok(stream)
}

/// The subject a table's CDC records travel on.
pub fn subject_for(config: &NatsConfig, table: Table) -> &str {
    match table {
        Table::Restaurants => &config.restaurants_subject,
        Table::MenuItems => &config.menu_items_subject,
        Table::Categories => &config.categories_subject,
    }
}

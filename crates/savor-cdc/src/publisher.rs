//! JetStream publisher for CDC records.

use std::time::Duration;

use async_nats::jetstream::{self, stream::RetentionPolicy, stream::StorageType};
use tracing::info;

use savor_common::{CdcRecord, Error, Result, Table};
use savor_config::NatsConfig;

/// How long the stream retains unconsumed CDC records.
const MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Publishes CDC records onto one durable subject per table.
pub struct CdcPublisher {
    jetstream: jetstream::Context,
    config: NatsConfig,
}

impl CdcPublisher {
    /// Connect to the bus and create the stream if it is missing.
    pub async fn connect(config: &NatsConfig) -> Result<Self> {
        let client = async_nats::connect(config.url())
            .await
            .map_err(bus_err)?;
        let jetstream = jetstream::new(client);
        ensure_stream(&jetstream, config).await?;
        Ok(Self {
            jetstream,
            config: config.clone(),
        })
    }

    /// The subject a table's records are published on.
    pub fn subject_for(&self, table: Table) -> &str {
        match table {
            Table::Restaurants => &self.config.restaurants_subject,
            Table::MenuItems => &self.config.menu_items_subject,
            Table::Categories => &self.config.categories_subject,
        }
    }

    /// Publish a record and wait for the stream's ack.
    pub async fn publish(&self, record: &CdcRecord) -> Result<()> {
        let subject = self.subject_for(record.table).to_string();
        let payload = record.to_bytes()?;
        self.jetstream
            .publish(subject, payload.into())
            .await
            .map_err(bus_err)?
            .await
            .map_err(bus_err)?;
        Ok(())
    }
}

/// Create the CDC stream if absent: file storage, limits retention, a
/// week of history.
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

pub(crate) fn bus_err<E: std::fmt::Display>(e: E) -> Error {
    Error::Bus(e.to_string())
}

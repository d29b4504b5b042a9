//! Per-topic pull-consumer loop.

use std::time::Duration;

use async_nats::jetstream::consumer::{pull, AckPolicy};
use async_nats::jetstream::{self, Message};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use savor_common::Result;

use crate::bus::bus_err;
use crate::pool::WorkerPool;

/// Messages requested per fetch.
const FETCH_BATCH: usize = 10;

/// How long a fetch waits before returning short.
const FETCH_WAIT: Duration = Duration::from_millis(200);

/// Durable consumer name for a subject.
pub fn durable_name(subject: &str) -> String {
    format!("{}-consumer", subject.replace('.', "-"))
}

/// Fetch messages for one subject and feed them to the pool until
/// cancellation. The bounded pool's blocking submit is what slows this
/// loop down under load.
pub async fn consume(
    stream: &jetstream::stream::Stream,
    subject: &str,
    pool: &WorkerPool<Message>,
    token: CancellationToken,
) -> Result<()> {
    let durable = durable_name(subject);
    let consumer = stream
        .get_or_create_consumer(
            &durable,
            pull::Config {
                durable_name: Some(durable.clone()),
                filter_subject: subject.to_string(),
                ack_policy: AckPolicy::Explicit,
                ..Default::default()
            },
        )
        .await
        .map_err(bus_err)?;

    info!(subject, durable, "consumer started");

    loop {
        if token.is_cancelled() {
            info!(subject, "consumer stopping");
            return Ok(());
        }

        let mut batch = consumer
            .fetch()
            .max_messages(FETCH_BATCH)
            .expires(FETCH_WAIT)
            .messages()
            .await
            .map_err(bus_err)?;

        while let Some(message) = batch.next().await {
            match message {
                Ok(message) => {
                    if !pool.submit(message).await {
                        info!(subject, "pool cancelled, consumer stopping");
                        return Ok(());
                    }
                }
                Err(e) => {
                    warn!(subject, error = %e, "fetch error");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_durable_name_replaces_dots() {
        assert_eq!(durable_name("cdc.menu-items"), "cdc-menu-items-consumer");
        assert_eq!(durable_name("plain"), "plain-consumer");
    }
}

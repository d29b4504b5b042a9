//! The WAL tailer.
//!
//! Translates logical commits into table-scoped CDC records and keeps the
//! slot's confirmed LSN aligned with what has reached the bus. Connection
//! loss at any stage is fatal by design: the supervisor restarts the
//! process and the slot replays from the last confirmed position, so
//! duplicates are expected downstream and loss is not.

use std::time::Duration;

use tokio::time::Instant;
use tokio_postgres::NoTls;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use savor_common::{Error, Result};
use savor_config::Config;

use crate::lsn::Lsn;
use crate::publisher::CdcPublisher;
use crate::repl::{ReplicationClient, ReplicationEvent};
use crate::wal2json::{self, WalMessage};

/// The logical decoding output plugin.
const OUTPUT_PLUGIN: &str = "wal2json";

/// Keep the payload minimal: no pretty-printing, xids, timestamps or LSNs.
const PLUGIN_OPTIONS: &[(&str, &str)] = &[
    ("pretty-print", "false"),
    ("include-xids", "false"),
    ("include-timestamp", "false"),
    ("include-lsn", "false"),
];

/// Interval between periodic standby status updates.
const STANDBY_TIMEOUT: Duration = Duration::from_secs(10);

/// Follows logical replication and publishes CDC records.
pub struct Tailer {
    config: Config,
    publisher: CdcPublisher,
}

impl Tailer {
    pub fn new(config: Config, publisher: CdcPublisher) -> Self {
        Self { config, publisher }
    }

    /// Run the tailer until cancellation or a fatal error.
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        info!("starting WAL tailer");

        let (client, connection) =
            tokio_postgres::connect(&self.config.postgres.conn_str(), NoTls)
                .await
                .map_err(|e| Error::Database(e.to_string()))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "postgres connection terminated");
            }
        });

        self.ensure_publication(&client).await?;
        let slot_exists = self.slot_exists(&client).await?;

        let mut repl = ReplicationClient::connect(&self.config.postgres).await?;
        let identity = repl.identify_system().await?;
        info!(
            system_id = %identity.system_id,
            timeline = %identity.timeline,
            xlog_pos = %identity.xlog_pos,
            "identified system"
        );

        let slot = self.config.replication.slot.clone();
        let start_lsn = if slot_exists {
            let start = match self.slot_confirmed_lsn(&client).await {
                Ok(Some(lsn)) if lsn > Lsn::ZERO => lsn,
                // Slot exists but has never been confirmed.
                Ok(_) => identity.xlog_pos,
                Err(e) => {
                    warn!(error = %e, "failed to read slot position, using current");
                    identity.xlog_pos
                }
            };
            info!(%slot, lsn = %start, "resuming existing replication slot");
            start
        } else {
            let created = repl.create_replication_slot(&slot, OUTPUT_PLUGIN).await?;
            info!(%slot, lsn = %created.consistent_point, "created replication slot");
            created.consistent_point
        };

        repl.start_replication(&slot, start_lsn, PLUGIN_OPTIONS)
            .await?;
        info!(%slot, lsn = %start_lsn, "logical replication started");

        self.stream_changes(&mut repl, start_lsn, token).await
    }

    /// The main replication loop.
    async fn stream_changes(
        &self,
        repl: &mut ReplicationClient,
        start_lsn: Lsn,
        token: CancellationToken,
    ) -> Result<()> {
        let mut client_xlog_pos = start_lsn;
        let mut next_standby_deadline = Instant::now() + STANDBY_TIMEOUT;

        loop {
            if token.is_cancelled() {
                info!(lsn = %client_xlog_pos, "tailer stopping");
                return Ok(());
            }

            if Instant::now() >= next_standby_deadline {
                repl.standby_status_update(client_xlog_pos).await?;
                debug!(lsn = %client_xlog_pos, "sent standby status update");
                next_standby_deadline = Instant::now() + STANDBY_TIMEOUT;
            }

            let event = tokio::select! {
                _ = token.cancelled() => continue,
                event = repl.receive(next_standby_deadline) => event?,
            };

            match event {
                // Deadline passed or a skippable frame; loop back around.
                None => continue,
                Some(ReplicationEvent::Keepalive {
                    server_wal_end,
                    reply_requested,
                }) => {
                    if server_wal_end > client_xlog_pos {
                        client_xlog_pos = server_wal_end;
                    }
                    if reply_requested {
                        next_standby_deadline = Instant::now();
                    }
                }
                Some(ReplicationEvent::XLogData {
                    wal_start, payload, ..
                }) => {
                    if payload.is_empty() {
                        continue;
                    }
                    let message = match wal2json::decode(&payload) {
                        Ok(message) => message,
                        Err(e) => {
                            error!(error = %e, "failed to decode wal2json payload");
                            continue;
                        }
                    };

                    let all_published = self.process_changes(&message).await;

                    if wal_start > client_xlog_pos {
                        client_xlog_pos = wal_start;
                    }

                    // Confirm eagerly once the whole batch is on the bus;
                    // a failed publish leaves confirmation to the periodic
                    // update and the slot replays on restart.
                    if all_published && !message.change.is_empty() {
                        if let Err(e) = repl.standby_status_update(client_xlog_pos).await {
                            warn!(error = %e, "immediate standby status update failed");
                        } else {
                            debug!(lsn = %client_xlog_pos, "confirmed after publishing changes");
                        }
                    }
                }
                Some(ReplicationEvent::Other(_)) => continue,
            }
        }
    }

    /// Publish every change the pipeline cares about. Returns whether all
    /// publishes succeeded; failures are logged and retried via replay.
    async fn process_changes(&self, message: &WalMessage) -> bool {
        let mut all_published = true;
        for change in &message.change {
            let Some(record) = wal2json::to_record(change) else {
                continue;
            };
            match self.publisher.publish(&record).await {
                Ok(()) => {
                    debug!(table = %record.table, id = record.id, kind = ?record.kind, "published CDC record");
                }
                Err(e) => {
                    error!(error = %e, table = %record.table, id = record.id, "failed to publish CDC record");
                    all_published = false;
                }
            }
        }
        all_published
    }

    async fn ensure_publication(&self, client: &tokio_postgres::Client) -> Result<()> {
        let publication = &self.config.replication.publication;
        let row = client
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM pg_publication WHERE pubname = $1)",
                &[publication],
            )
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        let exists: bool = row.get(0);

        if !exists {
            client
                .batch_execute(&format!("CREATE PUBLICATION {publication} FOR ALL TABLES"))
                .await
                .map_err(|e| Error::Database(e.to_string()))?;
            info!(%publication, "created publication");
        }
        Ok(())
    }

    async fn slot_exists(&self, client: &tokio_postgres::Client) -> Result<bool> {
        let row = client
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM pg_replication_slots WHERE slot_name = $1)",
                &[&self.config.replication.slot],
            )
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(row.get(0))
    }

    /// The slot's confirmed position, or `None` when the slot has never
    /// been confirmed.
    async fn slot_confirmed_lsn(&self, client: &tokio_postgres::Client) -> Result<Option<Lsn>> {
        let row = client
            .query_opt(
                "SELECT confirmed_flush_lsn::text FROM pg_replication_slots WHERE slot_name = $1",
                &[&self.config.replication.slot],
            )
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        let Some(row) = row else {
            return Err(Error::NotFound(format!(
                "replication slot {} does not exist",
                self.config.replication.slot
            )));
        };
        let lsn: Option<String> = row.get(0);
        match lsn {
            Some(raw) => Ok(Some(raw.parse()?)),
            None => Ok(None),
        }
    }
}

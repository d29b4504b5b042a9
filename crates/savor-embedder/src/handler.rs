//! Per-message embedding maintenance.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use savor_common::vector::{l2_normalize, EMBEDDING_DIM};
use savor_common::{CdcRecord, Error, Result, Table};
use savor_llm::OllamaClient;
use savor_store::Store;

use crate::pool::CdcHandler;

/// Handles a CDC record: fetch the row, fingerprint it, embed, normalize,
/// write back.
///
/// Returning `Ok` acks the message; returning `Err` naks it for
/// redelivery. A missing row is `Ok` — the write was rolled back or the
/// row was deleted, so the embedding is obsolete either way.
pub struct EmbedHandler {
    store: Arc<Store>,
    llm: OllamaClient,
    embedding_model: String,
}

impl EmbedHandler {
    pub fn new(store: Arc<Store>, llm: OllamaClient, embedding_model: impl Into<String>) -> Self {
        Self {
            store,
            llm,
            embedding_model: embedding_model.into(),
        }
    }

    /// The fingerprint for the referenced row, or `None` when the row is
    /// gone.
    async fn fingerprint(&self, table: Table, id: i64) -> Result<Option<String>> {
        Ok(match table {
            Table::Restaurants => self.store.get_restaurant(id).await?.map(|r| r.fingerprint()),
            Table::MenuItems => self.store.get_menu_item(id).await?.map(|m| m.fingerprint()),
            Table::Categories => self.store.get_category(id).await?.map(|c| c.fingerprint()),
        })
    }
}

#[async_trait]
impl CdcHandler for EmbedHandler {
    async fn handle(&self, payload: &[u8]) -> Result<()> {
        let record = CdcRecord::from_bytes(payload)?;
        let id = i64::try_from(record.id)
            .map_err(|_| Error::InvalidInput(format!("row id out of range: {}", record.id)))?;

        let Some(fingerprint) = self.fingerprint(record.table, id).await? else {
            info!(table = %record.table, id, "row gone, dropping embedding job");
            return Ok(());
        };

        let mut vector = self.llm.embed(&self.embedding_model, &fingerprint).await?;
        if vector.len() != EMBEDDING_DIM {
            return Err(Error::Model(format!(
                "expected {EMBEDDING_DIM}-dim embedding, got {}",
                vector.len()
            )));
        }
        if !l2_normalize(&mut vector) {
            warn!(table = %record.table, id, "zero-norm embedding dropped");
            return Ok(());
        }

        let updated = self
            .store
            .update_embedding(record.table, id, &vector)
            .await?;
        if updated {
            debug!(table = %record.table, id, "embedding written");
        } else {
            info!(table = %record.table, id, "row deleted before embedding write");
        }
        Ok(())
    }
}

//! wal2json payload decoding.
//!
//! The output plugin emits one JSON document per transaction with a
//! `change` array. Only `kind`, `table`, `columnnames` and `columnvalues`
//! matter here; everything else is ignored.
//!
//! Updates that carry a non-null `embedding` column are the embedder's own
//! writes coming back around through the WAL. Dropping them terminates the
//! write → WAL → embed recursion. Content updates survive the filter
//! because the embedding column is TOASTed: wal2json omits unchanged
//! TOAST values, so a row update that does not touch the embedding arrives
//! without it.

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use savor_common::{CdcRecord, ChangeKind, Result, Table};

/// One decoded wal2json document.
#[derive(Debug, Deserialize)]
pub struct WalMessage {
    #[serde(default)]
    pub change: Vec<WalChange>,
}

/// One row change inside a wal2json document.
#[derive(Debug, Deserialize)]
pub struct WalChange {
    pub kind: String,
    pub table: String,
    #[serde(default)]
    pub columnnames: Vec<String>,
    #[serde(default)]
    pub columnvalues: Vec<Value>,
}

impl WalChange {
    /// Value of a named column, if present in the change.
    pub fn column(&self, name: &str) -> Option<&Value> {
        let idx = self.columnnames.iter().position(|n| n == name)?;
        self.columnvalues.get(idx)
    }

    /// The row id, when the change carries one.
    pub fn id(&self) -> Option<u64> {
        self.column("id").and_then(Value::as_u64)
    }

    /// Whether this update is an embedding write coming back via the WAL.
    pub fn is_embedding_writeback(&self) -> bool {
        self.kind == "update"
            && matches!(self.column("embedding"), Some(v) if !v.is_null())
    }
}

/// Decode a wal2json payload.
pub fn decode(data: &[u8]) -> Result<WalMessage> {
    Ok(serde_json::from_slice(data)?)
}

/// Turn a change into a publishable CDC record.
///
/// Returns `None` for everything the tailer drops: deletes and other
/// non-insert/update kinds, embedding write-backs, tables outside the
/// pipeline, and changes without a usable id.
pub fn to_record(change: &WalChange) -> Option<CdcRecord> {
    let kind = match change.kind.as_str() {
        "insert" => ChangeKind::Insert,
        "update" => ChangeKind::Update,
        other => {
            debug!(kind = other, table = %change.table, "dropping change kind");
            return None;
        }
    };

    if change.is_embedding_writeback() {
        debug!(table = %change.table, "dropping embedding write-back");
        return None;
    }

    let table: Table = change.table.parse().ok()?;
    let id = change.id()?;

    Some(CdcRecord::new(table, kind, id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(kind: &str, table: &str, columns: &[(&str, Value)]) -> WalChange {
        WalChange {
            kind: kind.to_string(),
            table: table.to_string(),
            columnnames: columns.iter().map(|(n, _)| n.to_string()).collect(),
            columnvalues: columns.iter().map(|(_, v)| v.clone()).collect(),
        }
    }

    #[test]
    fn test_decode_insert() {
        let payload = br#"{"change":[{"kind":"insert","schema":"public","table":"restaurants","columnnames":["id","name","rating"],"columnvalues":[7,"Ramen House",4.5]}]}"#;
        let msg = decode(payload).unwrap();
        assert_eq!(msg.change.len(), 1);
        let record = to_record(&msg.change[0]).unwrap();
        assert_eq!(record, CdcRecord::new(Table::Restaurants, ChangeKind::Insert, 7));
    }

    #[test]
    fn test_decode_empty_document() {
        let msg = decode(br#"{}"#).unwrap();
        assert!(msg.change.is_empty());
    }

    #[test]
    fn test_delete_dropped() {
        let c = change("delete", "restaurants", &[("id", 1.into())]);
        assert!(to_record(&c).is_none());
    }

    #[test]
    fn test_truncate_dropped() {
        let c = change("truncate", "menu_items", &[]);
        assert!(to_record(&c).is_none());
    }

    #[test]
    fn test_embedding_writeback_dropped() {
        let c = change(
            "update",
            "menu_items",
            &[("id", 3.into()), ("embedding", Value::String("[0.1,0.2]".into()))],
        );
        assert!(c.is_embedding_writeback());
        assert!(to_record(&c).is_none());
    }

    #[test]
    fn test_update_with_null_embedding_kept() {
        let c = change(
            "update",
            "menu_items",
            &[("id", 3.into()), ("embedding", Value::Null)],
        );
        assert!(!c.is_embedding_writeback());
        let record = to_record(&c).unwrap();
        assert_eq!(record.kind, ChangeKind::Update);
    }

    #[test]
    fn test_content_update_without_embedding_column_kept() {
        let c = change(
            "update",
            "restaurants",
            &[("id", 9.into()), ("name", Value::String("Ramen Palace".into()))],
        );
        let record = to_record(&c).unwrap();
        assert_eq!(record, CdcRecord::new(Table::Restaurants, ChangeKind::Update, 9));
    }

    #[test]
    fn test_insert_with_embedding_value_kept() {
        // The filter only applies to updates; an insert that somehow
        // carries an embedding still needs its first CDC record.
        let c = change(
            "insert",
            "categories",
            &[("id", 2.into()), ("embedding", Value::String("[1,0]".into()))],
        );
        assert!(to_record(&c).is_some());
    }

    #[test]
    fn test_unknown_table_dropped() {
        let c = change("insert", "audit_log", &[("id", 5.into())]);
        assert!(to_record(&c).is_none());
    }

    #[test]
    fn test_missing_id_dropped() {
        let c = change("insert", "restaurants", &[("name", Value::String("x".into()))]);
        assert!(to_record(&c).is_none());
    }
}

//! The CDC record envelope.
//!
//! This is the wire contract between the WAL tailer and the embedding
//! workers: a compact notification that a row changed, carrying only the
//! table, the change kind, and the row id. One JetStream subject per table.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Tables that participate in embedding maintenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Restaurants,
    MenuItems,
    Categories,
}

impl Table {
    /// The table name as it appears in wal2json output.
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Restaurants => "restaurants",
            Table::MenuItems => "menu_items",
            Table::Categories => "categories",
        }
    }

    /// All tables, in a fixed order.
    pub fn all() -> [Table; 3] {
        [Table::Restaurants, Table::MenuItems, Table::Categories]
    }
}

impl std::str::FromStr for Table {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "restaurants" => Ok(Table::Restaurants),
            "menu_items" => Ok(Table::MenuItems),
            "categories" => Ok(Table::Categories),
            other => Err(Error::InvalidInput(format!("unknown table: {other}"))),
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Row change kinds the pipeline reacts to.
///
/// Deletes are intentionally absent: the tailer drops them before they
/// reach the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
}

/// A single row-change notification as published on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CdcRecord {
    pub table: Table,
    pub kind: ChangeKind,
    pub id: u64,
}

impl CdcRecord {
    pub fn new(table: Table, kind: ChangeKind, id: u64) -> Self {
        Self { table, kind, id }
    }

    /// Decode a record from its bus payload.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Encode the record for publishing.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_wire_shape() {
        let record = CdcRecord::new(Table::MenuItems, ChangeKind::Update, 42);
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(json, r#"{"table":"menu_items","kind":"update","id":42}"#);
    }

    #[test]
    fn test_envelope_round_trip() {
        let record = CdcRecord::new(Table::Restaurants, ChangeKind::Insert, u64::MAX);
        let decoded = CdcRecord::from_bytes(&record.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_table_parse() {
        assert_eq!("restaurants".parse::<Table>().unwrap(), Table::Restaurants);
        assert_eq!("menu_items".parse::<Table>().unwrap(), Table::MenuItems);
        assert_eq!("categories".parse::<Table>().unwrap(), Table::Categories);
        assert!("orders".parse::<Table>().is_err());
    }

    #[test]
    fn test_delete_kind_rejected() {
        let result: std::result::Result<CdcRecord, _> =
            serde_json::from_str(r#"{"table":"restaurants","kind":"delete","id":1}"#);
        assert!(result.is_err());
    }
}

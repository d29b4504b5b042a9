//! Savor CDC
//!
//! The WAL tailer: follows Postgres logical replication through a
//! hand-written walsender client, decodes wal2json row changes, filters
//! out the embedder's own writes, and publishes compact CDC records to
//! one JetStream subject per table. The replication slot is the only
//! durable cursor; the tailer never acknowledges an LSN past work it has
//! not handed to the bus.

pub mod lsn;
pub mod publisher;
pub mod repl;
pub mod tailer;
pub mod wal2json;

pub use lsn::Lsn;
pub use tailer::Tailer;

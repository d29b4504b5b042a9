//! Savor Embedder
//!
//! Consumes CDC records from the bus and materialises row embeddings:
//! fetch the row, render its fingerprint, call the model server, unit
//! normalize, write back, ack. Messages are acked only after the database
//! write succeeds, so redelivery covers every transient failure and
//! duplicate deliveries converge on the same stored vector.

pub mod bus;
pub mod consumer;
pub mod handler;
pub mod pool;

pub use handler::EmbedHandler;
pub use pool::{CdcHandler, Delivery, WorkerPool};

//! Savor Common
//!
//! Shared types for the Savor pipeline: the error type used across crates,
//! the CDC record envelope that travels over the bus, and vector helpers.

pub mod cdc;
pub mod error;
pub mod vector;

pub use cdc::{CdcRecord, ChangeKind, Table};
pub use error::{Error, Result};

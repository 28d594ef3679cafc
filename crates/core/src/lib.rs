//! `chainsync-core`: primitives shared by the sync engine and its adapters.
//!
//! This crate contains **no I/O**: identifiers, the record/value model written
//! to the local store, table descriptions and validation errors.

pub mod error;
pub mod id;
pub mod record;
pub mod table;

pub use error::{CoreError, CoreResult};
pub use id::{RunId, WorkUnitId};
pub use record::{RecordKey, Row, SqlValue, SyncRecord, dedup_latest};
pub use table::{TableSpec, quote_identifier};

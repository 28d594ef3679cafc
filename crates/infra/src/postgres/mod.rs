//! Postgres adapters: upstream query source and bulk refresh store.

pub mod error;
pub mod refresh;
pub mod source;

pub use error::{classify_sqlx_error, is_retriable_code, map_store_error};
pub use refresh::{PostgresRefreshStore, build_upsert};
pub use source::PgQuerySource;

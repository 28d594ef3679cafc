//! Infrastructure layer: Postgres adapters, configuration, job scheduling.

pub mod config;
pub mod postgres;
pub mod scheduler;


pub use config::{ConfigError, SyncConfig};
pub use postgres::{PgQuerySource, PostgresRefreshStore, classify_sqlx_error};
pub use scheduler::{JobRecord, ScheduleSender, SchedulerHandle, TokioScheduler};

//! Postgres bulk refresh store.
//!
//! One `INSERT ... VALUES (..),(..) ON CONFLICT (keys) DO UPDATE` round trip
//! per batch. In [`RefreshMode::Atomic`] the delete and every batch share a
//! transaction; in [`RefreshMode::DeleteThenInsert`] each statement commits
//! on its own.

use async_trait::async_trait;
use sqlx::postgres::PgExecutor;
use sqlx::query_builder::Separated;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tokio::time::Instant;
use tracing::{debug, info, instrument};

use chainsync_core::{SqlValue, SyncRecord, TableSpec, quote_identifier};
use chainsync_sync::{
    ConcurrencyGate, RefreshConfig, RefreshMode, RefreshReport, RefreshStore, StoreError,
    prepare_rows,
};

use super::error::map_store_error;

/// Postgres caps a statement at 65535 bind parameters.
const MAX_BIND_PARAMS: usize = u16::MAX as usize;

#[derive(Debug, Clone)]
pub struct PostgresRefreshStore {
    pool: PgPool,
    gate: ConcurrencyGate,
    config: RefreshConfig,
}

impl PostgresRefreshStore {
    pub fn new(pool: PgPool, gate: ConcurrencyGate, config: RefreshConfig) -> Self {
        Self { pool, gate, config }
    }

    pub fn config(&self) -> &RefreshConfig {
        &self.config
    }

    /// Configured batch size, shrunk so one statement stays under the bind cap.
    fn batch_size(&self, table: &TableSpec) -> usize {
        let per_row = table.columns().len().max(1);
        self.config.batch_size.clamp(1, (MAX_BIND_PARAMS / per_row).max(1))
    }

    async fn delete_all<'e>(exec: impl PgExecutor<'e>, table: &TableSpec) -> Result<u64, StoreError> {
        let sql = format!("DELETE FROM {}", table.quoted_name());
        let done = sqlx::query(&sql)
            .execute(exec)
            .await
            .map_err(|e| map_store_error("delete", e))?;
        Ok(done.rows_affected())
    }

    async fn insert_batch<'e>(
        exec: impl PgExecutor<'e>,
        table: &TableSpec,
        rows: &[Vec<SqlValue>],
        batch: usize,
        total: usize,
    ) -> Result<u64, StoreError> {
        let mut qb = build_upsert(table, rows);
        let done = qb.build().execute(exec).await.map_err(|e| StoreError::Batch {
            table: table.name().to_string(),
            batch,
            total,
            message: map_store_error("insert", e).to_string(),
        })?;
        debug!(table = table.name(), batch, total, rows = rows.len(), "batch upserted");
        Ok(done.rows_affected())
    }
}

/// Build the multi-row upsert for one batch.
pub fn build_upsert<'a>(table: &TableSpec, rows: &'a [Vec<SqlValue>]) -> QueryBuilder<'a, Postgres> {
    let columns = table
        .columns()
        .iter()
        .map(|c| quote_identifier(c))
        .collect::<Vec<_>>()
        .join(", ");
    let keys = table
        .key_columns()
        .iter()
        .map(|c| quote_identifier(c))
        .collect::<Vec<_>>()
        .join(", ");

    let mut qb = QueryBuilder::new(format!("INSERT INTO {} ({columns}) ", table.quoted_name()));
    qb.push_values(rows, |mut b, row| {
        for value in row {
            push_value(&mut b, value);
        }
    });
    qb.push(format!(" ON CONFLICT ({keys}) "));

    let updates = table
        .non_key_columns()
        .map(|c| {
            let c = quote_identifier(c);
            format!("{c} = EXCLUDED.{c}")
        })
        .collect::<Vec<_>>();
    if updates.is_empty() {
        qb.push("DO NOTHING");
    } else {
        qb.push("DO UPDATE SET ");
        qb.push(updates.join(", "));
    }
    qb
}

fn push_value<'qb, 'a>(b: &mut Separated<'qb, 'a, Postgres, &'static str>, value: &'a SqlValue) {
    match value {
        SqlValue::Bool(v) => {
            b.push_bind(*v);
        }
        SqlValue::BigInt(v) => {
            b.push_bind(*v);
        }
        SqlValue::Double(v) => {
            b.push_bind(*v);
        }
        SqlValue::Numeric(v) => {
            b.push_bind(v.clone());
            b.push_unseparated("::numeric");
        }
        SqlValue::Text(v) => {
            b.push_bind(v.clone());
        }
        SqlValue::Json(v) => {
            b.push_bind(v.clone());
        }
        SqlValue::Timestamp(v) => {
            b.push_bind(*v);
        }
        SqlValue::Uuid(v) => {
            b.push_bind(*v);
        }
    }
}

#[async_trait]
impl RefreshStore for PostgresRefreshStore {
    #[instrument(skip(self, table, records), fields(table = %table.name(), mode = ?self.config.mode), err)]
    async fn refresh<R>(&self, table: &TableSpec, records: Vec<R>) -> Result<RefreshReport, StoreError>
    where
        R: SyncRecord + 'static,
    {
        let started = Instant::now();
        let prepared = prepare_rows(table, records)?;
        let batch_size = self.batch_size(table);
        let total = prepared.batch_count(batch_size);

        let _permit = self.gate.acquire().await;

        let deleted = match self.config.mode {
            RefreshMode::Atomic => {
                let mut tx = self
                    .pool
                    .begin()
                    .await
                    .map_err(|e| map_store_error("begin_transaction", e))?;
                let deleted = Self::delete_all(&mut *tx, table).await?;
                for (idx, batch) in prepared.batches(batch_size).enumerate() {
                    // Dropping `tx` on error rolls the whole refresh back.
                    Self::insert_batch(&mut *tx, table, batch, idx + 1, total).await?;
                }
                tx.commit().await.map_err(|e| map_store_error("commit", e))?;
                deleted
            }
            RefreshMode::DeleteThenInsert => {
                let deleted = Self::delete_all(&self.pool, table).await?;
                for (idx, batch) in prepared.batches(batch_size).enumerate() {
                    Self::insert_batch(&self.pool, table, batch, idx + 1, total).await?;
                }
                deleted
            }
        };

        let report = RefreshReport {
            table: table.name().to_string(),
            mode: self.config.mode,
            deleted,
            inserted: prepared.rows.len(),
            duplicates: prepared.duplicates,
            batches: total,
            duration: started.elapsed(),
        };
        info!(
            table = %report.table,
            deleted = report.deleted,
            inserted = report.inserted,
            duplicates = report.duplicates,
            batches = report.batches,
            duration_ms = report.duration.as_millis() as u64,
            "refresh complete"
        );
        Ok(report)
    }

    #[instrument(skip(self, table, records), fields(table = %table.name()), err)]
    async fn upsert<R>(&self, table: &TableSpec, records: Vec<R>) -> Result<usize, StoreError>
    where
        R: SyncRecord + 'static,
    {
        let prepared = prepare_rows(table, records)?;
        if prepared.rows.is_empty() {
            return Ok(0);
        }
        let batch_size = self.batch_size(table);
        let total = prepared.batch_count(batch_size);

        let _permit = self.gate.acquire().await;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_store_error("begin_transaction", e))?;
        for (idx, batch) in prepared.batches(batch_size).enumerate() {
            Self::insert_batch(&mut *tx, table, batch, idx + 1, total).await?;
        }
        tx.commit().await.map_err(|e| map_store_error("commit", e))?;
        Ok(prepared.rows.len())
    }
}

//! Postgres upstream data source.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres};
use tracing::{debug, instrument};

use chainsync_sync::{Query, QueryParam, QuerySource, SourceError};

use super::error::classify_sqlx_error;
use crate::config::SyncConfig;

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, PgArguments>;

/// One named upstream endpoint backed by its own lazily connected pool.
///
/// Nothing is dialled until the first query, so an unreachable backup does
/// not prevent startup.
#[derive(Debug, Clone)]
pub struct PgQuerySource {
    name: String,
    pool: PgPool,
}

impl PgQuerySource {
    pub fn from_pool(name: impl Into<String>, pool: PgPool) -> Self {
        Self {
            name: name.into(),
            pool,
        }
    }

    pub fn connect_lazy(
        name: impl Into<String>,
        url: &str,
        connection_timeout: Duration,
        max_connections: u32,
    ) -> Result<Self, SourceError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(connection_timeout)
            .connect_lazy(url)
            .map_err(|e| classify_sqlx_error("connect", e))?;
        Ok(Self::from_pool(name, pool))
    }

    /// Every configured endpoint, in failover order.
    pub fn from_config(config: &SyncConfig) -> anyhow::Result<Vec<Arc<Self>>> {
        let max_connections = u32::try_from(config.max_concurrent_operations).unwrap_or(u32::MAX);
        config
            .endpoints()
            .into_iter()
            .map(|(name, url)| {
                let source = Self::connect_lazy(&name, &url, config.connection_timeout(), max_connections)
                    .map_err(|e| anyhow::anyhow!("source `{name}`: {e}"))?;
                Ok(Arc::new(source))
            })
            .collect()
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn bind_param<'q>(query: PgQuery<'q>, param: &QueryParam) -> PgQuery<'q> {
    match param {
        QueryParam::Text(v) => query.bind(v.clone()),
        QueryParam::BigInt(v) => query.bind(*v),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::TextArray(v) => query.bind(v.clone()),
        QueryParam::BigIntArray(v) => query.bind(v.clone()),
        QueryParam::Json(v) => query.bind(v.clone()),
    }
}

#[async_trait]
impl QuerySource for PgQuerySource {
    type Row = PgRow;

    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, query), fields(source = %self.name, params = query.params.len()))]
    async fn query(&self, query: &Query) -> Result<Vec<PgRow>, SourceError> {
        let rows = query
            .params
            .iter()
            .fold(sqlx::query(&query.sql), bind_param)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| classify_sqlx_error("query", e))?;
        debug!(rows = rows.len(), "upstream query returned");
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lazy_pool_does_not_dial_on_construction() {
        let source = PgQuerySource::connect_lazy(
            "Backup1",
            "postgres://nobody@127.0.0.1:1/none",
            Duration::from_millis(50),
            2,
        )
        .unwrap();
        assert_eq!(source.name(), "Backup1");
        assert_eq!(source.pool().size(), 0);
    }

    #[tokio::test]
    async fn unreachable_endpoint_fails_retriably() {
        let source = PgQuerySource::connect_lazy(
            "Primary",
            "postgres://nobody@127.0.0.1:1/none",
            Duration::from_millis(200),
            1,
        )
        .unwrap();
        let err = source.query(&Query::new("select 1")).await.unwrap_err();
        assert!(err.is_retriable(), "{err}");
    }

    #[test]
    fn malformed_url_is_fatal() {
        let err = PgQuerySource::connect_lazy("Primary", "not a url", Duration::from_secs(1), 1)
            .unwrap_err();
        assert!(!err.is_retriable());
    }
}

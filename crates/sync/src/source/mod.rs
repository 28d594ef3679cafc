//! Upstream data-source boundary.
//!
//! A data source executes a parameterized, read-only query and returns raw
//! rows. The executor decides retries and failover; sources only report how
//! an attempt failed.

pub mod in_memory;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use in_memory::{InMemorySource, ScriptedResponse};

/// Whether a failed attempt is worth repeating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Timeout, socket error, server busy, transient protocol error.
    Retriable,
    /// Bad SQL, constraint violation, anything else.
    Fatal,
}

/// Failure of a single attempt against a single source.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind:?} source error: {message}")]
pub struct SourceError {
    pub kind: FailureKind,
    pub message: String,
}

impl SourceError {
    pub fn retriable(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Retriable,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Fatal,
            message: message.into(),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::retriable(format!("command timed out after {}ms", after.as_millis()))
    }

    pub fn is_retriable(&self) -> bool {
        self.kind == FailureKind::Retriable
    }
}

/// A bound query parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum QueryParam {
    Text(String),
    BigInt(i64),
    Bool(bool),
    TextArray(Vec<String>),
    BigIntArray(Vec<i64>),
    Json(serde_json::Value),
}

/// A parameterized query descriptor (function-style: key array in, rows out).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub sql: String,
    pub params: Vec<QueryParam>,
}

impl Query {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn bind(mut self, param: QueryParam) -> Self {
        self.params.push(param);
        self
    }

    /// Convenience for the common "function over a key array" shape.
    pub fn with_keys(self, keys: &[String]) -> Self {
        self.bind(QueryParam::TextArray(keys.to_vec()))
    }
}

/// A named upstream data source.
#[async_trait]
pub trait QuerySource: Send + Sync {
    /// Raw row type handed to the caller's mapper.
    type Row: Send;

    /// Identity used in failover order and circuit-breaker bookkeeping.
    fn name(&self) -> &str;

    /// Run one attempt of `query`.
    ///
    /// Implementations apply their own connection timeout; the executor adds
    /// the per-command timeout around this call.
    async fn query(&self, query: &Query) -> Result<Vec<Self::Row>, SourceError>;
}

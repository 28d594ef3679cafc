//! In-memory data source for tests/dev.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::{Query, QuerySource, SourceError};

type Handler<R> = Box<dyn Fn(&Query) -> Result<Vec<R>, SourceError> + Send + Sync>;

/// One scripted reaction to a query attempt.
#[derive(Debug, Clone)]
pub enum ScriptedResponse<R> {
    Rows(Vec<R>),
    Fail(SourceError),
    /// Sleep before answering with no rows (exercises command timeouts).
    Stall(Duration),
}

/// Scripted source.
///
/// Responses are consumed in order; once the script is exhausted every call
/// goes to the fallback handler (default: empty result).
pub struct InMemorySource<R> {
    name: String,
    script: Mutex<VecDeque<ScriptedResponse<R>>>,
    fallback: Handler<R>,
    calls: AtomicUsize,
}

impl<R> core::fmt::Debug for InMemorySource<R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemorySource")
            .field("name", &self.name)
            .field("calls", &self.calls.load(Ordering::Acquire))
            .finish()
    }
}

impl<R> InMemorySource<R>
where
    R: Clone + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(VecDeque::new()),
            fallback: Box::new(|_| Ok(Vec::new())),
            calls: AtomicUsize::new(0),
        }
    }

    /// Source that always answers with `rows`.
    pub fn with_rows(name: impl Into<String>, rows: Vec<R>) -> Self {
        Self::new(name).with_handler(move |_| Ok(rows.clone()))
    }

    /// Source that always fails with `error`.
    pub fn failing(name: impl Into<String>, error: SourceError) -> Self {
        Self::new(name).with_handler(move |_| Err(error.clone()))
    }

    pub fn with_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Query) -> Result<Vec<R>, SourceError> + Send + Sync + 'static,
    {
        self.fallback = Box::new(handler);
        self
    }

    pub fn push(&self, response: ScriptedResponse<R>) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(response);
        }
    }

    /// Number of attempts made against this source.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Acquire)
    }
}

#[async_trait]
impl<R> QuerySource for InMemorySource<R>
where
    R: Clone + Send + Sync + 'static,
{
    type Row = R;

    fn name(&self) -> &str {
        &self.name
    }

    async fn query(&self, query: &Query) -> Result<Vec<R>, SourceError> {
        self.calls.fetch_add(1, Ordering::AcqRel);

        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match next {
            Some(ScriptedResponse::Rows(rows)) => Ok(rows),
            Some(ScriptedResponse::Fail(err)) => Err(err),
            Some(ScriptedResponse::Stall(d)) => {
                tokio::time::sleep(d).await;
                Ok(Vec::new())
            }
            None => (self.fallback)(query),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn script_runs_before_fallback() {
        let src = InMemorySource::with_rows("Primary", vec![1i64]);
        src.push(ScriptedResponse::Fail(SourceError::retriable("socket reset")));

        assert!(src.query(&Query::new("q")).await.is_err());
        assert_eq!(src.query(&Query::new("q")).await.unwrap(), vec![1]);
        assert_eq!(src.calls(), 2);
    }

    #[test]
    fn debug_shows_name_and_calls() {
        let src = InMemorySource::<i64>::new("Backup1");
        let shown = format!("{src:?}");
        assert!(shown.contains("Backup1"));
        assert!(shown.contains("calls: 0"));
    }
}

//! Bounded retries for connection failures.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;
use crate::metadata::{CompletenessRequest, CompletenessRow, MetadataSource};
use crate::sink::{OutputRow, PolygonSink};
use crate::source::{Observation, SelectQuery, TimeSeriesSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
        }
    }
}

/// Runs `op` until it succeeds, fails with a non-connection error, or the
/// attempts are used up. Backoff doubles after every failed attempt.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, name: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    let mut backoff = Duration::from_millis(policy.initial_backoff_ms);
    let max_backoff = Duration::from_millis(policy.max_backoff_ms);
    loop {
        match op().await {
            Err(e) if e.is_connection() && attempt < policy.max_attempts => {
                warn!(
                    op = name,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Connection failure, retrying"
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(max_backoff);
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// Wraps a source or sink so every call goes through [`with_retry`].
pub struct Retrying<T> {
    inner: T,
    policy: RetryPolicy,
}

impl<T> Retrying<T> {
    pub fn new(inner: T, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    /// Establishes the wrapped connection under the same policy as its calls.
    pub async fn connect<F, Fut>(policy: RetryPolicy, name: &str, op: F) -> Result<Self>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        Ok(Self::new(with_retry(&policy, name, op).await?, policy))
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

#[async_trait]
impl<T: TimeSeriesSource> TimeSeriesSource for Retrying<T> {
    async fn fetch(&self, query: &SelectQuery, limit: usize) -> Result<Vec<Observation>> {
        with_retry(&self.policy, "fetch", || self.inner.fetch(query, limit)).await
    }

    async fn has_rows(&self, query: &SelectQuery) -> Result<bool> {
        with_retry(&self.policy, "prefetch", || self.inner.has_rows(query)).await
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        with_retry(&self.policy, "list_tables", || self.inner.list_tables()).await
    }
}

#[async_trait]
impl<T: MetadataSource> MetadataSource for Retrying<T> {
    async fn completeness(&self, req: &CompletenessRequest) -> Result<Vec<CompletenessRow>> {
        with_retry(&self.policy, "completeness", || self.inner.completeness(req)).await
    }
}

#[async_trait]
impl<T: PolygonSink> PolygonSink for Retrying<T> {
    async fn bootstrap(&self) -> Result<()> {
        with_retry(&self.policy, "bootstrap", || self.inner.bootstrap()).await
    }

    async fn write_window(&self, window_id: &str, rows: Vec<OutputRow>) -> Result<usize> {
        with_retry(&self.policy, "write_window", || {
            self.inner.write_window(window_id, rows.clone())
        })
        .await
    }
}

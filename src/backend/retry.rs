//! Bounded retry with capped exponential backoff around any backend.

use super::{KvBackend, Namespace};
use crate::Result;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 2_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the given (1-based) failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let multiplier = self
            .backoff_multiplier
            .powi(attempt.saturating_sub(1) as i32);
        let delay = (self.initial_delay_ms as f64 * multiplier) as u64;
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent.
    pub async fn run<T, F, Fut>(&self, op_name: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        op = op_name,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Backend call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_retryable() {
                        error!(op = op_name, attempts = attempt, error = %e, "Backend retry budget exhausted");
                    }
                    return Err(e);
                }
            }
        }
    }
}

/// Decorator that applies a [`RetryPolicy`] to every backend call.
pub struct RetryingBackend {
    inner: Arc<dyn KvBackend>,
    policy: RetryPolicy,
}

impl RetryingBackend {
    pub fn new(inner: Arc<dyn KvBackend>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait::async_trait]
impl KvBackend for RetryingBackend {
    async fn get(&self, ns: Namespace, key: &str) -> Result<Option<Vec<u8>>> {
        let inner = &*self.inner;
        self.policy.run("GET", move || inner.get(ns, key)).await
    }

    async fn set(&self, ns: Namespace, key: &str, value: &[u8], ttl_secs: Option<u64>) -> Result<()> {
        let inner = &*self.inner;
        self.policy
            .run("SET", move || inner.set(ns, key, value, ttl_secs))
            .await
    }

    async fn expire(&self, ns: Namespace, key: &str, ttl_secs: u64) -> Result<()> {
        let inner = &*self.inner;
        self.policy
            .run("EXPIRE", move || inner.expire(ns, key, ttl_secs))
            .await
    }

    async fn ttl(&self, ns: Namespace, key: &str) -> Result<Option<u64>> {
        let inner = &*self.inner;
        self.policy.run("TTL", move || inner.ttl(ns, key)).await
    }

    async fn delete(&self, ns: Namespace, key: &str) -> Result<()> {
        let inner = &*self.inner;
        self.policy.run("DELETE", move || inner.delete(ns, key)).await
    }

    async fn list_append(&self, ns: Namespace, key: &str, value: &[u8]) -> Result<()> {
        let inner = &*self.inner;
        self.policy
            .run("LIST_APPEND", move || inner.list_append(ns, key, value))
            .await
    }

    async fn list_range(&self, ns: Namespace, key: &str, start: i64, end: i64) -> Result<Vec<Vec<u8>>> {
        let inner = &*self.inner;
        self.policy
            .run("LIST_RANGE", move || inner.list_range(ns, key, start, end))
            .await
    }

    async fn list_trim(&self, ns: Namespace, key: &str, start: i64, end: i64) -> Result<()> {
        let inner = &*self.inner;
        self.policy
            .run("LIST_TRIM", move || inner.list_trim(ns, key, start, end))
            .await
    }

    async fn list_len(&self, ns: Namespace, key: &str) -> Result<usize> {
        let inner = &*self.inner;
        self.policy.run("LIST_LEN", move || inner.list_len(ns, key)).await
    }

    async fn hash_set(&self, ns: Namespace, key: &str, field: &str, value: &[u8]) -> Result<()> {
        let inner = &*self.inner;
        self.policy
            .run("HASH_SET", move || inner.hash_set(ns, key, field, value))
            .await
    }

    async fn hash_get_all(&self, ns: Namespace, key: &str) -> Result<HashMap<String, Vec<u8>>> {
        let inner = &*self.inner;
        self.policy
            .run("HASH_GET_ALL", move || inner.hash_get_all(ns, key))
            .await
    }

    async fn hash_delete(&self, ns: Namespace, key: &str, field: &str) -> Result<()> {
        let inner = &*self.inner;
        self.policy
            .run("HASH_DELETE", move || inner.hash_delete(ns, key, field))
            .await
    }

    async fn scan_prefix(&self, ns: Namespace, prefix: &str) -> Result<Vec<String>> {
        let inner = &*self.inner;
        self.policy
            .run("SCAN", move || inner.scan_prefix(ns, prefix))
            .await
    }

    async fn ping(&self, ns: Namespace) -> Result<()> {
        let inner = &*self.inner;
        self.policy.run("PING", move || inner.ping(ns)).await
    }
}

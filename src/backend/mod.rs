//! Key-value backend abstraction
//!
//! Both stores talk to the backend only through [`KvBackend`]. The concrete
//! client is constructed once per process and passed in, never reached
//! through module state.

pub mod in_memory;
pub mod redis_store;
pub mod retry;

pub use in_memory::InMemoryBackend;
pub use redis_store::RedisBackend;
pub use retry::{RetryPolicy, RetryingBackend};

use crate::config::{BackendKind, StoreConfig};
use crate::Result;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// Logical partition of the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// Session message logs
    Memory,
    /// User profiles and the session index
    Users,
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Namespace::Memory => "memory",
            Namespace::Users => "users",
        };
        write!(f, "{}", s)
    }
}

/// Operations the stores need from a key-value backend.
///
/// List indices are inclusive and negative values count from the end
/// (`-1` is the last element), matching Redis `LRANGE`/`LTRIM`.
#[async_trait::async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, ns: Namespace, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, ns: Namespace, key: &str, value: &[u8], ttl_secs: Option<u64>) -> Result<()>;
    /// No-op when the key does not exist.
    async fn expire(&self, ns: Namespace, key: &str, ttl_secs: u64) -> Result<()>;
    /// Remaining lifetime; `None` when the key is absent or never expires.
    async fn ttl(&self, ns: Namespace, key: &str) -> Result<Option<u64>>;
    async fn delete(&self, ns: Namespace, key: &str) -> Result<()>;

    async fn list_append(&self, ns: Namespace, key: &str, value: &[u8]) -> Result<()>;
    async fn list_range(&self, ns: Namespace, key: &str, start: i64, end: i64) -> Result<Vec<Vec<u8>>>;
    async fn list_trim(&self, ns: Namespace, key: &str, start: i64, end: i64) -> Result<()>;
    async fn list_len(&self, ns: Namespace, key: &str) -> Result<usize>;

    async fn hash_set(&self, ns: Namespace, key: &str, field: &str, value: &[u8]) -> Result<()>;
    async fn hash_get_all(&self, ns: Namespace, key: &str) -> Result<HashMap<String, Vec<u8>>>;
    async fn hash_delete(&self, ns: Namespace, key: &str, field: &str) -> Result<()>;

    /// Every live key starting with `prefix`.
    async fn scan_prefix(&self, ns: Namespace, prefix: &str) -> Result<Vec<String>>;
    async fn ping(&self, ns: Namespace) -> Result<()>;
}

/// Build the backend selected by the configuration.
pub async fn connect(config: &StoreConfig) -> Result<Arc<dyn KvBackend>> {
    match config.backend {
        BackendKind::Redis => {
            let backend = RedisBackend::connect(config).await?;
            Ok(Arc::new(backend))
        }
        BackendKind::InMemory => {
            info!("Key-value backend: in-memory");
            Ok(Arc::new(InMemoryBackend::new()))
        }
    }
}

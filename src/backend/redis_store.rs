//! Redis-backed key-value store
//!
//! Each namespace maps to its own logical Redis database and gets one
//! multiplexed connection, opened at startup and dropped with the backend.

use super::{KvBackend, Namespace};
use crate::config::StoreConfig;
use crate::error::MemoryError;
use crate::Result;
use redis::aio::MultiplexedConnection;
use std::collections::HashMap;
use tracing::{debug, info};

const SCAN_BATCH: usize = 200;

pub struct RedisBackend {
    memory: MultiplexedConnection,
    users: MultiplexedConnection,
}

impl RedisBackend {
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let memory = open(config, config.memory_db).await?;
        let users = open(config, config.user_db).await?;

        info!(
            host = %config.redis_host,
            port = config.redis_port,
            memory_db = config.memory_db,
            user_db = config.user_db,
            "Key-value backend: redis"
        );

        Ok(Self { memory, users })
    }

    /// Multiplexed connections are cheap to clone and share one socket.
    fn conn(&self, ns: Namespace) -> MultiplexedConnection {
        match ns {
            Namespace::Memory => self.memory.clone(),
            Namespace::Users => self.users.clone(),
        }
    }
}

async fn open(config: &StoreConfig, db: u32) -> Result<MultiplexedConnection> {
    let client = redis::Client::open(config.redis_url(db)).map_err(|e| {
        MemoryError::InvalidInput(format!("Invalid redis connection settings: {}", e))
    })?;

    client
        .get_multiplexed_async_connection()
        .await
        .map_err(|e| {
            MemoryError::BackendUnavailable(format!(
                "Failed to connect to redis at {}:{} (db {}): {}",
                config.redis_host, config.redis_port, db, e
            ))
        })
}

/// Escape glob metacharacters so a literal prefix can be used with MATCH.
fn glob_escape(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('*');
    escaped
}

#[async_trait::async_trait]
impl KvBackend for RedisBackend {
    async fn get(&self, ns: Namespace, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn(ns);
        let value: Option<Vec<u8>> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, ns: Namespace, key: &str, value: &[u8], ttl_secs: Option<u64>) -> Result<()> {
        let mut conn = self.conn(ns);
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(secs) = ttl_secs {
            cmd.arg("EX").arg(secs);
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn expire(&self, ns: Namespace, key: &str, ttl_secs: u64) -> Result<()> {
        let mut conn = self.conn(ns);
        let _: i64 = redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn ttl(&self, ns: Namespace, key: &str) -> Result<Option<u64>> {
        let mut conn = self.conn(ns);
        // -2: missing key, -1: no expiry
        let remaining: i64 = redis::cmd("TTL").arg(key).query_async(&mut conn).await?;
        Ok(u64::try_from(remaining).ok())
    }

    async fn delete(&self, ns: Namespace, key: &str) -> Result<()> {
        let mut conn = self.conn(ns);
        let removed: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        debug!(namespace = %ns, key, removed, "DEL");
        Ok(())
    }

    async fn list_append(&self, ns: Namespace, key: &str, value: &[u8]) -> Result<()> {
        let mut conn = self.conn(ns);
        let _: i64 = redis::cmd("RPUSH")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn list_range(&self, ns: Namespace, key: &str, start: i64, end: i64) -> Result<Vec<Vec<u8>>> {
        let mut conn = self.conn(ns);
        let items: Vec<Vec<u8>> = redis::cmd("LRANGE")
            .arg(key)
            .arg(start)
            .arg(end)
            .query_async(&mut conn)
            .await?;
        Ok(items)
    }

    async fn list_trim(&self, ns: Namespace, key: &str, start: i64, end: i64) -> Result<()> {
        let mut conn = self.conn(ns);
        let _: () = redis::cmd("LTRIM")
            .arg(key)
            .arg(start)
            .arg(end)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn list_len(&self, ns: Namespace, key: &str) -> Result<usize> {
        let mut conn = self.conn(ns);
        let len: usize = redis::cmd("LLEN").arg(key).query_async(&mut conn).await?;
        Ok(len)
    }

    async fn hash_set(&self, ns: Namespace, key: &str, field: &str, value: &[u8]) -> Result<()> {
        let mut conn = self.conn(ns);
        let _: i64 = redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn hash_get_all(&self, ns: Namespace, key: &str) -> Result<HashMap<String, Vec<u8>>> {
        let mut conn = self.conn(ns);
        let fields: HashMap<String, Vec<u8>> =
            redis::cmd("HGETALL").arg(key).query_async(&mut conn).await?;
        Ok(fields)
    }

    async fn hash_delete(&self, ns: Namespace, key: &str, field: &str) -> Result<()> {
        let mut conn = self.conn(ns);
        let _: i64 = redis::cmd("HDEL")
            .arg(key)
            .arg(field)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn scan_prefix(&self, ns: Namespace, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.conn(ns);
        let pattern = glob_escape(prefix);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn ping(&self, ns: Namespace) -> Result<()> {
        let mut conn = self.conn(ns);
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

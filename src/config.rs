//! Environment-driven configuration
//!
//! Binaries call `dotenv::dotenv().ok()` before `StoreConfig::from_env()`, so
//! values may come from the process environment or a local `.env` file.

use crate::backend::RetryPolicy;
use crate::error::MemoryError;
use crate::Result;
use std::env;
use std::str::FromStr;

/// Which key-value backend the process talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Redis,
    InMemory,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backend: BackendKind,
    pub redis_host: String,
    pub redis_port: u16,
    pub redis_password: Option<String>,
    /// Database index holding session/message data
    pub memory_db: u32,
    /// Database index holding user profiles and the session index
    pub user_db: u32,
    pub session_ttl_secs: u64,
    pub max_messages: usize,
    /// How many recent messages the context assembler loads
    pub recent_count: usize,
    pub retry: RetryPolicy,
    pub log_level: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Redis,
            redis_host: "localhost".to_string(),
            redis_port: 6379,
            redis_password: None,
            memory_db: 0,
            user_db: 1,
            session_ttl_secs: 86_400,
            max_messages: 50,
            recent_count: 10,
            retry: RetryPolicy::default(),
            log_level: "info".to_string(),
        }
    }
}

impl StoreConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let backend = match lookup("KV_BACKEND").as_deref().map(str::trim) {
            None | Some("") | Some("redis") => BackendKind::Redis,
            Some("memory") | Some("in-memory") => BackendKind::InMemory,
            Some(other) => {
                return Err(MemoryError::InvalidInput(format!(
                    "KV_BACKEND must be 'redis' or 'memory', got '{}'",
                    other
                )))
            }
        };

        let retry = RetryPolicy {
            max_attempts: parse_or(&lookup, "KV_RETRY_ATTEMPTS", defaults.retry.max_attempts)?,
            initial_delay_ms: parse_or(
                &lookup,
                "KV_RETRY_INITIAL_DELAY_MS",
                defaults.retry.initial_delay_ms,
            )?,
            max_delay_ms: parse_or(&lookup, "KV_RETRY_MAX_DELAY_MS", defaults.retry.max_delay_ms)?,
            backoff_multiplier: defaults.retry.backoff_multiplier,
        };

        let config = Self {
            backend,
            redis_host: lookup("REDIS_HOST")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.redis_host),
            redis_port: parse_or(&lookup, "REDIS_PORT", defaults.redis_port)?,
            redis_password: lookup("REDIS_PASSWORD").filter(|v| !v.is_empty()),
            memory_db: parse_or(&lookup, "REDIS_MEMORY_DB", defaults.memory_db)?,
            user_db: parse_or(&lookup, "REDIS_USER_DB", defaults.user_db)?,
            session_ttl_secs: parse_or(&lookup, "SESSION_TTL_SECONDS", defaults.session_ttl_secs)?,
            max_messages: parse_or(&lookup, "MAX_MESSAGES", defaults.max_messages)?,
            recent_count: parse_or(&lookup, "RECENT_MESSAGE_COUNT", defaults.recent_count)?,
            retry,
            log_level: lookup("LOG_LEVEL")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.log_level),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_messages == 0 {
            return Err(MemoryError::InvalidInput("MAX_MESSAGES must be at least 1".into()));
        }
        if self.session_ttl_secs == 0 {
            return Err(MemoryError::InvalidInput(
                "SESSION_TTL_SECONDS must be at least 1".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(MemoryError::InvalidInput(
                "KV_RETRY_ATTEMPTS must be at least 1".into(),
            ));
        }
        if self.memory_db == self.user_db {
            return Err(MemoryError::InvalidInput(format!(
                "REDIS_MEMORY_DB and REDIS_USER_DB must differ (both {})",
                self.memory_db
            )));
        }
        Ok(())
    }

    /// Connection URL for one logical database.
    pub fn redis_url(&self, db: u32) -> String {
        match &self.redis_password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.redis_host, self.redis_port, db
            ),
            None => format!("redis://{}:{}/{}", self.redis_host, self.redis_port, db),
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw.trim().parse::<T>().map_err(|_| {
            MemoryError::InvalidInput(format!("{} has an invalid value: '{}'", key, raw))
        }),
        _ => Ok(default),
    }
}

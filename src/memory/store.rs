//! Session message log storage
//!
//! A session is a bounded, TTL'd list of JSON-encoded messages under
//! `chat_history:{session}` plus a small `chat_meta:{session}` hash holding
//! the creation time. Every append refreshes the TTL of both keys (sliding
//! expiration) and trims the list to the newest `max_messages` entries.
//!
//! Appends to the same session from two callers are not coordinated: each
//! message lands durably, but trims and TTL refreshes may interleave.

use crate::backend::{KvBackend, Namespace, RetryPolicy, RetryingBackend};
use crate::config::StoreConfig;
use crate::error::MemoryError;
use crate::models::{Message, Role, SessionInfo};
use crate::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

const HISTORY_PREFIX: &str = "chat_history:";
const META_PREFIX: &str = "chat_meta:";
const CREATED_AT_FIELD: &str = "created_at";

/// Settings for a [`MemoryStore`]
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    pub session_ttl_secs: u64,
    pub max_messages: usize,
    pub retry: RetryPolicy,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: 86_400,
            max_messages: 50,
            retry: RetryPolicy::default(),
        }
    }
}

impl From<&StoreConfig> for MemoryConfig {
    fn from(config: &StoreConfig) -> Self {
        Self {
            session_ttl_secs: config.session_ttl_secs,
            max_messages: config.max_messages,
            retry: config.retry.clone(),
        }
    }
}

/// Conversation message log for all sessions
#[derive(Clone)]
pub struct MemoryStore {
    backend: Arc<dyn KvBackend>,
    config: MemoryConfig,
}

fn history_key(session_key: &str) -> String {
    format!("{}{}", HISTORY_PREFIX, session_key)
}

fn meta_key(session_key: &str) -> String {
    format!("{}{}", META_PREFIX, session_key)
}

fn validate_session_key(session_key: &str) -> Result<()> {
    if session_key.trim().is_empty() {
        return Err(MemoryError::InvalidInput("session key must not be empty".into()));
    }
    Ok(())
}

/// Decode stored messages, skipping any entry that no longer parses.
fn decode_messages(session_key: &str, raw: Vec<Vec<u8>>) -> Vec<Message> {
    raw.into_iter()
        .filter_map(|bytes| match serde_json::from_slice::<Message>(&bytes) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!(session_key, error = %e, "Skipping malformed stored message");
                None
            }
        })
        .collect()
}

impl MemoryStore {
    /// Wraps `backend` in the configured retry policy.
    pub fn new(backend: Arc<dyn KvBackend>, config: MemoryConfig) -> Self {
        let retrying: Arc<dyn KvBackend> =
            Arc::new(RetryingBackend::new(backend, config.retry.clone()));
        Self {
            backend: retrying,
            config,
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Append one message, refresh the session TTL and enforce the size bound.
    pub async fn append(&self, session_key: &str, role: Role, text: &str) -> Result<Message> {
        validate_session_key(session_key)?;
        if text.trim().is_empty() {
            return Err(MemoryError::InvalidInput("message text must not be empty".into()));
        }

        let message = Message::new(role, text.to_string());
        let encoded = serde_json::to_vec(&message)?;
        let history = history_key(session_key);
        let meta = meta_key(session_key);
        let ttl = self.config.session_ttl_secs;
        let keep = self.config.max_messages.max(1) as i64;

        // Meta is stamped and expired before the log so it never outlives it.
        let meta_fields = self.backend.hash_get_all(Namespace::Memory, &meta).await?;
        if !meta_fields.contains_key(CREATED_AT_FIELD) {
            self.backend
                .hash_set(
                    Namespace::Memory,
                    &meta,
                    CREATED_AT_FIELD,
                    message.timestamp.to_rfc3339().as_bytes(),
                )
                .await?;
        }
        self.backend.expire(Namespace::Memory, &meta, ttl).await?;

        self.backend
            .list_append(Namespace::Memory, &history, &encoded)
            .await?;
        self.backend
            .list_trim(Namespace::Memory, &history, -keep, -1)
            .await?;
        self.backend.expire(Namespace::Memory, &history, ttl).await?;

        debug!(session_key, role = %role, message_id = %message.id, "Appended message");
        Ok(message)
    }

    /// Append a human turn followed by the assistant reply.
    pub async fn append_exchange(
        &self,
        session_key: &str,
        human: &str,
        assistant: &str,
    ) -> Result<(Message, Message)> {
        // Validate both halves before writing either.
        validate_session_key(session_key)?;
        if human.trim().is_empty() || assistant.trim().is_empty() {
            return Err(MemoryError::InvalidInput(
                "both sides of an exchange must have text".into(),
            ));
        }

        let human_msg = self.append(session_key, Role::Human, human).await?;
        let assistant_msg = self.append(session_key, Role::Assistant, assistant).await?;
        Ok((human_msg, assistant_msg))
    }

    /// The `count` most recent messages, oldest first.
    pub async fn recent(&self, session_key: &str, count: usize) -> Result<Vec<Message>> {
        if count == 0 || session_key.trim().is_empty() {
            return Ok(Vec::new());
        }

        let start = -(count.min(i64::MAX as usize) as i64);
        let raw = self
            .backend
            .list_range(Namespace::Memory, &history_key(session_key), start, -1)
            .await?;
        Ok(decode_messages(session_key, raw))
    }

    /// Full retained history, oldest first.
    pub async fn history(&self, session_key: &str) -> Result<Vec<Message>> {
        if session_key.trim().is_empty() {
            return Ok(Vec::new());
        }

        let raw = self
            .backend
            .list_range(Namespace::Memory, &history_key(session_key), 0, -1)
            .await?;
        Ok(decode_messages(session_key, raw))
    }

    /// Case-insensitive substring search over the retained history.
    ///
    /// The query is matched as given, whitespace included; an empty query
    /// matches every message.
    ///
    /// A linear scan; history is bounded by `max_messages`.
    pub async fn search(&self, session_key: &str, query: &str) -> Result<Vec<Message>> {
        let needle = query.to_lowercase();
        let matches: Vec<Message> = self
            .history(session_key)
            .await?
            .into_iter()
            .filter(|m| m.content.to_lowercase().contains(&needle))
            .collect();

        debug!(session_key, query, hits = matches.len(), "Searched session history");
        Ok(matches)
    }

    /// Delete the session immediately. Clearing an absent session is fine.
    pub async fn clear(&self, session_key: &str) -> Result<()> {
        validate_session_key(session_key)?;

        self.backend
            .delete(Namespace::Memory, &history_key(session_key))
            .await?;
        self.backend
            .delete(Namespace::Memory, &meta_key(session_key))
            .await?;

        info!(session_key, "Cleared session memory");
        Ok(())
    }

    pub async fn info(&self, session_key: &str) -> Result<SessionInfo> {
        let mut info = SessionInfo {
            session_key: session_key.to_string(),
            exists: false,
            message_count: 0,
            created_at: None,
            ttl_remaining_secs: None,
            max_messages: self.config.max_messages,
        };
        if session_key.trim().is_empty() {
            return Ok(info);
        }

        let history = history_key(session_key);
        let message_count = self.backend.list_len(Namespace::Memory, &history).await?;
        if message_count == 0 {
            return Ok(info);
        }

        let meta = self
            .backend
            .hash_get_all(Namespace::Memory, &meta_key(session_key))
            .await?;

        info.exists = true;
        info.message_count = message_count;
        info.ttl_remaining_secs = self.backend.ttl(Namespace::Memory, &history).await?;
        info.created_at = meta
            .get(CREATED_AT_FIELD)
            .and_then(|raw| std::str::from_utf8(raw).ok())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        Ok(info)
    }

    /// Keys of every live session.
    pub async fn list_sessions(&self) -> Result<Vec<String>> {
        let keys = self
            .backend
            .scan_prefix(Namespace::Memory, HISTORY_PREFIX)
            .await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(HISTORY_PREFIX).map(str::to_string))
            .collect())
    }

    /// Check the memory namespace is reachable.
    pub async fn ping(&self) -> Result<()> {
        self.backend.ping(Namespace::Memory).await
    }
}

//! Context assembly
//!
//! Combines a session's recent messages with the attached user's profile
//! facts into one read-only [`Context`]. Never writes.
//!
//! Conversation history is essential: memory errors propagate. The user
//! section is optional: an unknown user or an unavailable user store yields a
//! context without it.

use crate::error::ErrorKind;
use crate::memory::MemoryStore;
use crate::models::{Message, UserContext};
use crate::users::UserStore;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Configuration for context assembly
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Number of recent messages to include
    pub recent_count: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self { recent_count: 10 }
    }
}

/// Everything the agent gets to see about a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Context {
    pub session_key: String,
    pub messages: Vec<Message>,
    pub user: Option<UserContext>,
    /// Set when a user was requested but the user store could not be reached
    pub user_degraded: bool,
    pub assembled_at: DateTime<Utc>,
}

impl Context {
    /// Render the messages as `Human: ...` / `AI: ...` lines.
    pub fn transcript(&self) -> String {
        self.messages
            .iter()
            .map(|m| format!("{}: {}", m.role.transcript_label(), m.content))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn has_history(&self) -> bool {
        !self.messages.is_empty()
    }
}

/// Reads from both stores and merges the results
#[derive(Clone)]
pub struct ContextAssembler {
    memory: MemoryStore,
    users: UserStore,
    config: ContextConfig,
}

impl ContextAssembler {
    pub fn new(memory: MemoryStore, users: UserStore) -> Self {
        Self::with_config(memory, users, ContextConfig::default())
    }

    pub fn with_config(memory: MemoryStore, users: UserStore, config: ContextConfig) -> Self {
        Self {
            memory,
            users,
            config,
        }
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub async fn assemble(&self, session_key: &str, user_id: Option<&str>) -> Result<Context> {
        let messages = self
            .memory
            .recent(session_key, self.config.recent_count)
            .await?;

        let mut user_degraded = false;
        let user = match user_id.filter(|id| !id.trim().is_empty()) {
            None => None,
            Some(user_id) => match self.users.get_user_context(user_id).await {
                Ok(ctx) => Some(ctx),
                Err(e) => match e.kind() {
                    ErrorKind::NotFound => {
                        debug!(user_id, "No stored user, assembling anonymous context");
                        None
                    }
                    ErrorKind::BackendUnavailable => {
                        warn!(user_id, error = %e, "User store unavailable, continuing without user context");
                        user_degraded = true;
                        None
                    }
                    _ => return Err(e),
                },
            },
        };

        debug!(
            session_key,
            messages = messages.len(),
            has_user = user.is_some(),
            "Assembled context"
        );

        Ok(Context {
            session_key: session_key.to_string(),
            messages,
            user,
            user_degraded,
            assembled_at: Utc::now(),
        })
    }
}

//! Conversation memory facade
//!
//! The request path for one turn of a chat:
//! 1. `load_context` before the agent runs (recent history + user facts)
//! 2. `record_exchange` after it replies (append the human/assistant pair and
//!    index the session under the user, if one is attached)
//!
//! All handles are injected; nothing here is process-global.

use crate::backend::KvBackend;
use crate::config::StoreConfig;
use crate::context::{Context, ContextAssembler, ContextConfig};
use crate::memory::{MemoryConfig, MemoryStore};
use crate::models::Message;
use crate::users::UserStore;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome of recording one exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedExchange {
    pub session_key: String,
    pub human: Message,
    pub assistant: Message,
    /// Whether the session was indexed under the given user
    pub indexed: bool,
}

#[derive(Clone)]
pub struct ConversationMemory {
    memory: MemoryStore,
    users: UserStore,
    assembler: ContextAssembler,
}

impl ConversationMemory {
    pub fn new(memory: MemoryStore, users: UserStore, context: ContextConfig) -> Self {
        let assembler = ContextAssembler::with_config(memory.clone(), users.clone(), context);
        Self {
            memory,
            users,
            assembler,
        }
    }

    /// Wire both stores onto one backend handle using the process config.
    pub fn from_config(backend: Arc<dyn KvBackend>, config: &StoreConfig) -> Self {
        let memory = MemoryStore::new(backend.clone(), MemoryConfig::from(config));
        let users = UserStore::new(backend, config.retry.clone());
        Self::new(
            memory,
            users,
            ContextConfig {
                recent_count: config.recent_count,
            },
        )
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    pub fn users(&self) -> &UserStore {
        &self.users
    }

    pub async fn load_context(&self, session_key: &str, user_id: Option<&str>) -> Result<Context> {
        self.assembler.assemble(session_key, user_id).await
    }

    /// Persist one human/assistant turn.
    ///
    /// The messages are durable once appended; a failure to index the session
    /// afterwards is logged and reported through `indexed`, not returned.
    pub async fn record_exchange(
        &self,
        session_key: &str,
        user_id: Option<&str>,
        human: &str,
        assistant: &str,
    ) -> Result<RecordedExchange> {
        let (human, assistant) = self
            .memory
            .append_exchange(session_key, human, assistant)
            .await?;

        let indexed = match user_id.filter(|id| !id.trim().is_empty()) {
            None => false,
            Some(user_id) => self.index_session(user_id, session_key).await,
        };

        Ok(RecordedExchange {
            session_key: session_key.to_string(),
            human,
            assistant,
            indexed,
        })
    }

    /// Attach the session to the user; returns false on failure.
    pub(crate) async fn index_session(&self, user_id: &str, session_key: &str) -> bool {
        match self.users.attach_session(user_id, session_key).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    user_id,
                    session_key,
                    error = %e,
                    "Messages stored but session index not updated"
                );
                false
            }
        }
    }

    /// Check both namespaces are reachable.
    pub async fn health_check(&self) -> Result<()> {
        self.memory.ping().await?;
        self.users.ping().await?;
        info!("Session memory backend healthy");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::models::NewUser;

    fn conversation_memory(max_messages: usize) -> ConversationMemory {
        let config = StoreConfig {
            max_messages,
            recent_count: 10,
            ..Default::default()
        };
        ConversationMemory::from_config(Arc::new(InMemoryBackend::new()), &config)
    }

    #[tokio::test]
    async fn test_walkthrough_clear_keeps_index() {
        let cm = conversation_memory(50);
        cm.users()
            .create_user(NewUser {
                user_id: "u1".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        for text in ["first", "second", "third"] {
            cm.memory()
                .append("s1", crate::models::Role::Human, text)
                .await
                .unwrap();
        }
        cm.users().attach_session("u1", "s1").await.unwrap();

        let sessions = cm.users().get_user_sessions("u1").await.unwrap();
        assert_eq!(sessions.into_iter().collect::<Vec<_>>(), vec!["s1"]);

        let recent = cm.memory().recent("s1", 2).await.unwrap();
        let texts: Vec<_> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(texts, vec!["second", "third"]);

        cm.memory().clear("s1").await.unwrap();
        assert!(cm.memory().recent("s1", 2).await.unwrap().is_empty());
        assert!(cm.users().get_user_sessions("u1").await.unwrap().contains("s1"));
    }

    #[tokio::test]
    async fn test_record_exchange_indexes_known_user() {
        let cm = conversation_memory(50);
        cm.users()
            .create_user(NewUser {
                user_id: "u1".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let recorded = cm
            .record_exchange("s1", Some("u1"), "What time is it?", "It is 10:42.")
            .await
            .unwrap();
        assert!(recorded.indexed);
        assert_eq!(cm.users().session_owner("s1").await.unwrap().as_deref(), Some("u1"));

        let ctx = cm.load_context("s1", Some("u1")).await.unwrap();
        assert_eq!(ctx.messages.len(), 2);
        assert_eq!(ctx.user.map(|u| u.session_count), Some(1));
    }

    #[tokio::test]
    async fn test_record_exchange_for_unregistered_user_still_stores_messages() {
        let cm = conversation_memory(50);

        let recorded = cm
            .record_exchange("s1", Some("stranger"), "hello", "hi!")
            .await
            .unwrap();
        assert!(!recorded.indexed);
        assert_eq!(cm.memory().history("s1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_record_exchange_respects_bound() {
        let cm = conversation_memory(4);
        for i in 0..5 {
            cm.record_exchange("s1", None, &format!("q{}", i), &format!("a{}", i))
                .await
                .unwrap();
        }

        let history = cm.memory().history("s1").await.unwrap();
        let texts: Vec<_> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(texts, vec!["q3", "a3", "q4", "a4"]);
    }

    #[tokio::test]
    async fn test_health_check_on_in_memory_backend() {
        assert!(conversation_memory(10).health_check().await.is_ok());
    }
}

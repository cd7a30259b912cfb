//! Session Memory
//!
//! Durable conversational state for a chat agent:
//! - Bounded, sliding-TTL message logs per session
//! - User profiles with merge-style updates
//! - A session -> user index with one owner per session
//! - Read-only context assembly for the agent
//!
//! REQUEST PATH:
//! LOAD CONTEXT → (agent replies) → RECORD EXCHANGE → INDEX SESSION

pub mod api;
pub mod backend;
pub mod config;
pub mod context;
pub mod conversational;
pub mod error;
pub mod memory;
pub mod models;
pub mod users;

pub use error::{ErrorKind, MemoryError, Result};

// Re-export common types
pub use models::*;
pub use backend::{KvBackend, Namespace};
pub use context::{Context, ContextAssembler};
pub use conversational::ConversationMemory;
pub use memory::MemoryStore;
pub use users::UserStore;

//! Session Memory
//!
//! Durable, size- and time-bounded conversation logs keyed by session

pub mod store;

pub use store::{MemoryConfig, MemoryStore};

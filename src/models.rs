//! Core data models for session memory and user profiles

use crate::error::MemoryError;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use uuid::Uuid;

//
// ================= Messages =================
//

/// Role of a message sender
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Human,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Human => "human",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    /// Speaker label used when rendering a transcript.
    pub fn transcript_label(&self) -> &'static str {
        match self {
            Role::Human => "Human",
            Role::Assistant => "AI",
            Role::System => "System",
        }
    }
}

impl FromStr for Role {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "human" => Ok(Role::Human),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(MemoryError::InvalidInput(format!(
                "Unknown message role '{}': expected human, assistant or system",
                other
            ))),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A stored conversation message. Never mutated after it is appended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Stamp a new message with the store clock.
    pub fn new(role: Role, content: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content,
            timestamp: monotonic_now(),
        }
    }
}

/// Point-in-time view of a session. Absent sessions report `exists: false`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionInfo {
    pub session_key: String,
    pub exists: bool,
    pub message_count: usize,
    pub created_at: Option<DateTime<Utc>>,
    pub ttl_remaining_secs: Option<u64>,
    pub max_messages: usize,
}

static LAST_MICROS: AtomicI64 = AtomicI64::new(i64::MIN);

/// Wall-clock time that never goes backwards within this process.
pub fn monotonic_now() -> DateTime<Utc> {
    let now = Utc::now().timestamp_micros();
    let mut last = LAST_MICROS.load(Ordering::Relaxed);
    loop {
        let next = if now > last { now } else { last + 1 };
        match LAST_MICROS.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => {
                return Utc
                    .timestamp_micros(next)
                    .single()
                    .unwrap_or_else(Utc::now)
            }
            Err(observed) => last = observed,
        }
    }
}

//
// ================= Preferences =================
//

/// Any JSON value a client may store as a preference.
///
/// Variant order matters for untagged decoding: integers are tried before
/// floats so `14` reads back as `14`, not `14.0`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum PreferenceValue {
    Null,
    Bool(bool),
    Integer(i64),
    Number(f64),
    Text(String),
    List(Vec<PreferenceValue>),
    Map(BTreeMap<String, PreferenceValue>),
}

impl From<&str> for PreferenceValue {
    fn from(value: &str) -> Self {
        PreferenceValue::Text(value.to_string())
    }
}

impl From<String> for PreferenceValue {
    fn from(value: String) -> Self {
        PreferenceValue::Text(value)
    }
}

impl From<bool> for PreferenceValue {
    fn from(value: bool) -> Self {
        PreferenceValue::Bool(value)
    }
}

impl From<f64> for PreferenceValue {
    fn from(value: f64) -> Self {
        PreferenceValue::Number(value)
    }
}

impl From<i64> for PreferenceValue {
    fn from(value: i64) -> Self {
        PreferenceValue::Integer(value)
    }
}

impl<T: Into<PreferenceValue>> From<Vec<T>> for PreferenceValue {
    fn from(values: Vec<T>) -> Self {
        PreferenceValue::List(values.into_iter().map(Into::into).collect())
    }
}

pub type Preferences = BTreeMap<String, PreferenceValue>;

/// Deep-merge `updates` into `base`: nested maps merge key by key, every
/// other value overwrites, keys absent from `updates` are left alone.
pub fn merge_preferences(base: &mut Preferences, updates: Preferences) {
    for (key, incoming) in updates {
        match (base.get_mut(&key), incoming) {
            (Some(PreferenceValue::Map(existing)), PreferenceValue::Map(nested)) => {
                merge_preferences(existing, nested);
            }
            (_, incoming) => {
                base.insert(key, incoming);
            }
        }
    }
}

//
// ================= Users =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserProfile {
    pub user_id: String,
    pub name: Option<String>,
    pub email: Option<String>,
    #[serde(default)]
    pub preferences: Preferences,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

/// Registration payload
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewUser {
    pub user_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub preferences: Option<Preferences>,
}

/// Partial update; only fields that are present are applied.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub preferences: Option<Preferences>,
}

impl UserUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.email.is_none() && self.preferences.is_none()
    }
}

/// User facts shaped for prompt assembly.
///
/// `registered` is false when only the session index survives (the profile
/// was deleted); profile fields are then empty.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserContext {
    pub user_id: String,
    pub registered: bool,
    pub name: Option<String>,
    pub email: Option<String>,
    pub preferences: Preferences,
    pub session_count: usize,
    pub created_at: Option<DateTime<Utc>>,
    pub last_active: Option<DateTime<Utc>>,
}

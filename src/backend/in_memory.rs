//! In-process key-value backend
//!
//! Mirrors the Redis semantics the stores rely on: empty lists and hashes
//! disappear, `EXPIRE` on a missing key does nothing, and expired entries
//! behave as absent. Used for development and as the test fixture.

use super::{KvBackend, Namespace};
use crate::error::MemoryError;
use crate::Result;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone)]
enum Value {
    Bytes(Vec<u8>),
    List(VecDeque<Vec<u8>>),
    Hash(HashMap<String, Vec<u8>>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

type Slot = (Namespace, String);

/// In-memory backend for development
pub struct InMemoryBackend {
    entries: Arc<RwLock<HashMap<Slot, Entry>>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn slot(ns: Namespace, key: &str) -> Slot {
    (ns, key.to_string())
}

fn wrong_type(key: &str) -> MemoryError {
    MemoryError::InvalidInput(format!(
        "WRONGTYPE operation against key '{}' holding the wrong kind of value",
        key
    ))
}

/// Look up an entry, treating expired ones as absent.
fn live<'a>(entries: &'a HashMap<Slot, Entry>, ns: Namespace, key: &str) -> Option<&'a Entry> {
    entries
        .get(&slot(ns, key))
        .filter(|entry| entry.is_live(Instant::now()))
}

/// Mutable lookup that drops an expired entry first.
fn live_mut<'a>(
    entries: &'a mut HashMap<Slot, Entry>,
    ns: Namespace,
    key: &str,
) -> Option<&'a mut Entry> {
    let slot = slot(ns, key);
    if entries
        .get(&slot)
        .is_some_and(|entry| !entry.is_live(Instant::now()))
    {
        entries.remove(&slot);
    }
    entries.get_mut(&slot)
}

/// Resolve Redis-style inclusive indices against a length.
fn normalize_range(len: usize, start: i64, end: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (start + len).max(0) } else { start };
    let end = if end < 0 { end + len } else { end.min(len - 1) };

    if len == 0 || start > end || start >= len || end < 0 {
        return None;
    }
    Some((start as usize, end as usize))
}

#[async_trait::async_trait]
impl KvBackend for InMemoryBackend {
    async fn get(&self, ns: Namespace, key: &str) -> Result<Option<Vec<u8>>> {
        let entries = self.entries.read().await;
        match live(&entries, ns, key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Bytes(bytes)) => Ok(Some(bytes.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn set(&self, ns: Namespace, key: &str, value: &[u8], ttl_secs: Option<u64>) -> Result<()> {
        let mut entries = self.entries.write().await;
        let mut entry = Entry::new(Value::Bytes(value.to_vec()));
        entry.expires_at = ttl_secs.map(|secs| Instant::now() + Duration::from_secs(secs));
        entries.insert(slot(ns, key), entry);
        Ok(())
    }

    async fn expire(&self, ns: Namespace, key: &str, ttl_secs: u64) -> Result<()> {
        let mut entries = self.entries.write().await;
        if let Some(entry) = live_mut(&mut entries, ns, key) {
            entry.expires_at = Some(Instant::now() + Duration::from_secs(ttl_secs));
        }
        Ok(())
    }

    async fn ttl(&self, ns: Namespace, key: &str) -> Result<Option<u64>> {
        let entries = self.entries.read().await;
        let now = Instant::now();
        Ok(live(&entries, ns, key)
            .and_then(|entry| entry.expires_at)
            .map(|at| {
                // Round up like Redis so a fresh TTL reads back unchanged.
                let remaining = at.saturating_duration_since(now);
                let secs = remaining.as_secs();
                if remaining.subsec_nanos() > 0 {
                    secs + 1
                } else {
                    secs
                }
            }))
    }

    async fn delete(&self, ns: Namespace, key: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.remove(&slot(ns, key));
        Ok(())
    }

    async fn list_append(&self, ns: Namespace, key: &str, value: &[u8]) -> Result<()> {
        let mut entries = self.entries.write().await;
        match live_mut(&mut entries, ns, key) {
            Some(Entry {
                value: Value::List(items),
                ..
            }) => {
                items.push_back(value.to_vec());
                Ok(())
            }
            Some(_) => Err(wrong_type(key)),
            None => {
                let items = VecDeque::from(vec![value.to_vec()]);
                entries.insert(slot(ns, key), Entry::new(Value::List(items)));
                Ok(())
            }
        }
    }

    async fn list_range(&self, ns: Namespace, key: &str, start: i64, end: i64) -> Result<Vec<Vec<u8>>> {
        let entries = self.entries.read().await;
        match live(&entries, ns, key).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::List(items)) => Ok(match normalize_range(items.len(), start, end) {
                Some((from, to)) => items.range(from..=to).cloned().collect(),
                None => Vec::new(),
            }),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn list_trim(&self, ns: Namespace, key: &str, start: i64, end: i64) -> Result<()> {
        let mut entries = self.entries.write().await;
        let emptied = match live_mut(&mut entries, ns, key) {
            None => return Ok(()),
            Some(Entry {
                value: Value::List(items),
                ..
            }) => match normalize_range(items.len(), start, end) {
                Some((from, to)) => {
                    items.truncate(to + 1);
                    items.drain(..from);
                    items.is_empty()
                }
                None => true,
            },
            Some(_) => return Err(wrong_type(key)),
        };

        if emptied {
            entries.remove(&slot(ns, key));
        }
        Ok(())
    }

    async fn list_len(&self, ns: Namespace, key: &str) -> Result<usize> {
        let entries = self.entries.read().await;
        match live(&entries, ns, key).map(|e| &e.value) {
            None => Ok(0),
            Some(Value::List(items)) => Ok(items.len()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn hash_set(&self, ns: Namespace, key: &str, field: &str, value: &[u8]) -> Result<()> {
        let mut entries = self.entries.write().await;
        match live_mut(&mut entries, ns, key) {
            Some(Entry {
                value: Value::Hash(fields),
                ..
            }) => {
                fields.insert(field.to_string(), value.to_vec());
                Ok(())
            }
            Some(_) => Err(wrong_type(key)),
            None => {
                let mut fields = HashMap::new();
                fields.insert(field.to_string(), value.to_vec());
                entries.insert(slot(ns, key), Entry::new(Value::Hash(fields)));
                Ok(())
            }
        }
    }

    async fn hash_get_all(&self, ns: Namespace, key: &str) -> Result<HashMap<String, Vec<u8>>> {
        let entries = self.entries.read().await;
        match live(&entries, ns, key).map(|e| &e.value) {
            None => Ok(HashMap::new()),
            Some(Value::Hash(fields)) => Ok(fields.clone()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn hash_delete(&self, ns: Namespace, key: &str, field: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        let emptied = match live_mut(&mut entries, ns, key) {
            None => return Ok(()),
            Some(Entry {
                value: Value::Hash(fields),
                ..
            }) => {
                fields.remove(field);
                fields.is_empty()
            }
            Some(_) => return Err(wrong_type(key)),
        };

        if emptied {
            entries.remove(&slot(ns, key));
        }
        Ok(())
    }

    async fn scan_prefix(&self, ns: Namespace, prefix: &str) -> Result<Vec<String>> {
        let entries = self.entries.read().await;
        let now = Instant::now();
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|((entry_ns, key), entry)| {
                *entry_ns == ns && key.starts_with(prefix) && entry.is_live(now)
            })
            .map(|((_, key), _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn ping(&self, _ns: Namespace) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let backend = InMemoryBackend::new();
        backend.set(Namespace::Memory, "k", b"memory", None).await.unwrap();

        assert_eq!(backend.get(Namespace::Users, "k").await.unwrap(), None);
        assert_eq!(
            backend.get(Namespace::Memory, "k").await.unwrap(),
            Some(b"memory".to_vec())
        );
    }

    #[tokio::test]
    async fn test_list_range_uses_negative_indices() {
        let backend = InMemoryBackend::new();
        for item in ["a", "b", "c", "d"] {
            backend
                .list_append(Namespace::Memory, "l", item.as_bytes())
                .await
                .unwrap();
        }

        let tail = backend.list_range(Namespace::Memory, "l", -2, -1).await.unwrap();
        assert_eq!(tail, vec![b"c".to_vec(), b"d".to_vec()]);

        let all = backend.list_range(Namespace::Memory, "l", -10, 100).await.unwrap();
        assert_eq!(all.len(), 4);

        let none = backend.list_range(Namespace::Memory, "l", 3, 1).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_list_trim_keeps_tail_and_drops_empty_lists() {
        let backend = InMemoryBackend::new();
        for i in 0..5 {
            backend
                .list_append(Namespace::Memory, "l", format!("{}", i).as_bytes())
                .await
                .unwrap();
        }

        backend.list_trim(Namespace::Memory, "l", -3, -1).await.unwrap();
        let kept = backend.list_range(Namespace::Memory, "l", 0, -1).await.unwrap();
        assert_eq!(kept, vec![b"2".to_vec(), b"3".to_vec(), b"4".to_vec()]);

        backend.list_trim(Namespace::Memory, "l", 5, 1).await.unwrap();
        assert_eq!(backend.list_len(Namespace::Memory, "l").await.unwrap(), 0);
        assert!(backend.scan_prefix(Namespace::Memory, "l").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let backend = InMemoryBackend::new();
        backend.list_append(Namespace::Memory, "l", b"x").await.unwrap();
        backend.expire(Namespace::Memory, "l", 10).await.unwrap();
        assert_eq!(backend.ttl(Namespace::Memory, "l").await.unwrap(), Some(10));

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(backend.ttl(Namespace::Memory, "l").await.unwrap(), Some(6));

        tokio::time::advance(Duration::from_secs(7)).await;
        assert_eq!(backend.list_len(Namespace::Memory, "l").await.unwrap(), 0);
        assert_eq!(backend.ttl(Namespace::Memory, "l").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expire_on_missing_key_is_noop() {
        let backend = InMemoryBackend::new();
        backend.expire(Namespace::Memory, "ghost", 10).await.unwrap();
        assert_eq!(backend.ttl(Namespace::Memory, "ghost").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_hash_delete_removes_empty_hash() {
        let backend = InMemoryBackend::new();
        backend.hash_set(Namespace::Users, "h", "a", b"1").await.unwrap();
        backend.hash_set(Namespace::Users, "h", "b", b"2").await.unwrap();
        backend.hash_delete(Namespace::Users, "h", "a").await.unwrap();

        let fields = backend.hash_get_all(Namespace::Users, "h").await.unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields.get("b"), Some(&b"2".to_vec()));

        backend.hash_delete(Namespace::Users, "h", "b").await.unwrap();
        assert!(backend.scan_prefix(Namespace::Users, "h").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_type_mismatch_is_invalid_input() {
        let backend = InMemoryBackend::new();
        backend.set(Namespace::Memory, "s", b"plain", None).await.unwrap();

        let err = backend
            .list_append(Namespace::Memory, "s", b"x")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidInput);
    }
}

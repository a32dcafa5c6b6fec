//! In-memory keyspace
//!
//! This module implements the expiring string keyspace behind a
//! reader–writer lock. Expiry is lazy: expired entries are detected on read
//! and simply behave as absent, no background sweeper runs.

use std::collections::{HashMap, VecDeque};
use std::time::SystemTime;

use bytes::Bytes;
use parking_lot::RwLock;

/// Value types stored in the keyspace
///
/// Only `String` is operational; `List` is declared for the wrong-type reply
/// path but nothing constructs it.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// String value
    String(Bytes),
    /// List value
    List(VecDeque<Bytes>),
}

impl Value {
    /// Type name as reported in WRONGTYPE-style checks
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::String(_) => "string",
            Value::List(_) => "list",
        }
    }
}

/// A single entry in the keyspace
#[derive(Debug, Clone)]
pub struct Entry {
    /// The stored value
    pub value: Value,

    /// Expiration time (if any)
    pub expires_at: Option<SystemTime>,
}

impl Entry {
    /// Create a new entry with a value
    pub fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    /// Create a new entry with a value and optional expiration
    pub fn with_expiry(value: Value, expires_at: Option<SystemTime>) -> Self {
        Self { value, expires_at }
    }

    /// Check if the entry has expired
    #[inline]
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .map(|exp| SystemTime::now() >= exp)
            .unwrap_or(false)
    }
}

/// The shared keyspace
///
/// Readers proceed concurrently; every mutation, including the
/// read-modify-write of `SET ... GET`, holds the write lock for its whole
/// duration.
#[derive(Debug, Default)]
pub struct Store {
    data: RwLock<HashMap<Bytes, Entry>>,
}

impl Store {
    /// Create a new empty store
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
        }
    }

    /// Get a value by key, honoring lazy expiry
    pub fn get(&self, key: &[u8]) -> Option<Value> {
        let data = self.data.read();
        let entry = data.get(key)?;
        if entry.is_expired() {
            return None;
        }
        Some(entry.value.clone())
    }

    /// Set a value, replacing any previous entry
    pub fn set(&self, key: Bytes, value: Value, expires_at: Option<SystemTime>) {
        self.data
            .write()
            .insert(key, Entry::with_expiry(value, expires_at));
    }

    /// Set a value and return the previous live value, atomically
    pub fn set_fetch_prev(
        &self,
        key: Bytes,
        value: Value,
        expires_at: Option<SystemTime>,
    ) -> Option<Value> {
        let mut data = self.data.write();
        let prev = data.insert(key, Entry::with_expiry(value, expires_at));
        prev.filter(|entry| !entry.is_expired())
            .map(|entry| entry.value)
    }

    /// All live (non-expired) keys
    pub fn keys(&self) -> Vec<Bytes> {
        let data = self.data.read();
        data.iter()
            .filter(|(_, entry)| !entry.is_expired())
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let data = self.data.read();
        data.values().filter(|entry| !entry.is_expired()).count()
    }

    /// Check if the store has no live keys
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all live entries, for RDB export
    pub fn snapshot(&self) -> Vec<(Bytes, Value, Option<SystemTime>)> {
        let data = self.data.read();
        data.iter()
            .filter(|(_, entry)| !entry.is_expired())
            .map(|(key, entry)| (key.clone(), entry.value.clone(), entry.expires_at))
            .collect()
    }

    /// Insert an entry loaded from an RDB snapshot
    pub fn restore(&self, key: Bytes, value: Value, expires_at: Option<SystemTime>) {
        self.set(key, value, expires_at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn string(s: &str) -> Value {
        Value::String(Bytes::copy_from_slice(s.as_bytes()))
    }

    #[test]
    fn test_set_get() {
        let store = Store::new();
        store.set(Bytes::from("k"), string("v"), None);
        assert_eq!(store.get(b"k"), Some(string("v")));
        assert_eq!(store.get(b"missing"), None);
    }

    #[test]
    fn test_overwrite() {
        let store = Store::new();
        store.set(Bytes::from("k"), string("v1"), None);
        store.set(Bytes::from("k"), string("v2"), None);
        assert_eq!(store.get(b"k"), Some(string("v2")));
    }

    #[test]
    fn test_lazy_expiry() {
        let store = Store::new();
        let past = SystemTime::now() - Duration::from_millis(10);
        store.set(Bytes::from("k"), string("v"), Some(past));
        assert_eq!(store.get(b"k"), None);
        assert_eq!(store.len(), 0);
        assert!(store.keys().is_empty());
    }

    #[test]
    fn test_future_expiry_still_live() {
        let store = Store::new();
        let future = SystemTime::now() + Duration::from_secs(60);
        store.set(Bytes::from("k"), string("v"), Some(future));
        assert_eq!(store.get(b"k"), Some(string("v")));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_set_fetch_prev() {
        let store = Store::new();
        assert_eq!(store.set_fetch_prev(Bytes::from("k"), string("v1"), None), None);
        assert_eq!(
            store.set_fetch_prev(Bytes::from("k"), string("v2"), None),
            Some(string("v1"))
        );
        assert_eq!(store.get(b"k"), Some(string("v2")));
    }

    #[test]
    fn test_set_fetch_prev_expired_counts_as_absent() {
        let store = Store::new();
        let past = SystemTime::now() - Duration::from_millis(10);
        store.set(Bytes::from("k"), string("stale"), Some(past));
        assert_eq!(store.set_fetch_prev(Bytes::from("k"), string("v"), None), None);
    }

    #[test]
    fn test_snapshot_skips_expired() {
        let store = Store::new();
        let past = SystemTime::now() - Duration::from_millis(10);
        store.set(Bytes::from("dead"), string("x"), Some(past));
        store.set(Bytes::from("live"), string("y"), None);
        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].0, Bytes::from("live"));
    }

    #[test]
    fn test_value_type_name() {
        assert_eq!(string("x").type_name(), "string");
        assert_eq!(Value::List(VecDeque::new()).type_name(), "list");
    }
}

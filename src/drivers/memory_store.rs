//! A [`Store`] living in process memory.
//!
//! This allows running the shared-store driver without an external
//! server, e.g. to share rate state between several drivers in one
//! process, or in tests.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::drivers::shared::{Store, StoreResult};
use crate::errors::StoreError;

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: i64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// An in-memory store with Redis-like counter and list semantics.
///
/// Expired keys are purged lazily, when they are next accessed.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, Entry>>,
    lists: Mutex<HashMap<String, VecDeque<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of elements in `list`.
    pub fn list_len(&self, list: &str) -> usize {
        self.lists.lock().get(list).map_or(0, VecDeque::len)
    }

    /// Returns the number of live (unexpired) integer keys.
    pub fn key_count(&self) -> usize {
        let now = Instant::now();
        self.values
            .lock()
            .values()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    fn add(&self, key: &str, delta: i64) -> StoreResult<i64> {
        let now = Instant::now();
        let mut values = self.values.lock();
        let entry = values.entry(key.to_owned()).or_insert(Entry {
            value: 0,
            expires_at: None,
        });
        if !entry.is_live(now) {
            *entry = Entry {
                value: 0,
                expires_at: None,
            };
        }
        entry.value = entry
            .value
            .checked_add(delta)
            .ok_or_else(|| StoreError::NotAnInteger(key.to_owned()))?;
        Ok(entry.value)
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &str) -> StoreResult<Option<i64>> {
        let now = Instant::now();
        let mut values = self.values.lock();
        match values.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value)),
            Some(_) => {
                values.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn incr(&self, key: &str) -> StoreResult<i64> {
        self.add(key, 1)
    }

    fn decr(&self, key: &str) -> StoreResult<i64> {
        self.add(key, -1)
    }

    fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let now = Instant::now();
        let mut values = self.values.lock();
        match values.get_mut(key) {
            Some(entry) if entry.is_live(now) => {
                // A TTL beyond what an `Instant` can hold never expires.
                entry.expires_at = now.checked_add(ttl);
                Ok(true)
            }
            Some(_) => {
                values.remove(key);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    fn del(&self, key: &str) -> StoreResult<u64> {
        let now = Instant::now();
        match self.values.lock().remove(key) {
            Some(entry) if entry.is_live(now) => Ok(1),
            _ => Ok(0),
        }
    }

    fn push(&self, list: &str, value: String) -> StoreResult<()> {
        self.lists
            .lock()
            .entry(list.to_owned())
            .or_default()
            .push_front(value);
        Ok(())
    }

    fn pop(&self, list: &str) -> StoreResult<Option<String>> {
        let mut lists = self.lists.lock();
        let value = lists.get_mut(list).and_then(VecDeque::pop_back);
        if lists.get(list).map_or(false, VecDeque::is_empty) {
            lists.remove(list);
        }
        Ok(value)
    }
}

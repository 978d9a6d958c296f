//! A driver keeping rate state in an external key-value store.

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::clock::{self, Clock, SystemClock};
use crate::drivers::Driver;
use crate::errors::{Error, Result, StoreError};
use crate::worker::{Signal, Worker};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// The capabilities the shared-store driver needs from an external
/// store: atomic integer counters with expiry, and a list usable as a
/// FIFO queue.
///
/// The semantics follow Redis: `incr`/`decr` on a missing key treat
/// it as 0, `push` adds to the head of a list and `pop` takes from its
/// tail.
pub trait Store: Send + Sync + 'static {
    /// Returns the integer at `key`, if there is one.
    fn get(&self, key: &str) -> StoreResult<Option<i64>>;

    fn incr(&self, key: &str) -> StoreResult<i64>;

    fn decr(&self, key: &str) -> StoreResult<i64>;

    /// Makes `key` disappear after `ttl`. Returns `false` if there is
    /// no such key.
    fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// Deletes `key`, returning the number of keys removed.
    fn del(&self, key: &str) -> StoreResult<u64>;

    fn push(&self, list: &str, value: String) -> StoreResult<()>;

    fn pop(&self, list: &str) -> StoreResult<Option<String>>;
}

impl<S: Store> Store for Arc<S> {
    fn get(&self, key: &str) -> StoreResult<Option<i64>> {
        (**self).get(key)
    }

    fn incr(&self, key: &str) -> StoreResult<i64> {
        (**self).incr(key)
    }

    fn decr(&self, key: &str) -> StoreResult<i64> {
        (**self).decr(key)
    }

    fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        (**self).expire(key, ttl)
    }

    fn del(&self, key: &str) -> StoreResult<u64> {
        (**self).del(key)
    }

    fn push(&self, list: &str, value: String) -> StoreResult<()> {
        (**self).push(list, value)
    }

    fn pop(&self, list: &str) -> StoreResult<Option<String>> {
        (**self).pop(list)
    }
}

/// The key prefix used if none is given.
pub const DEFAULT_PREFIX: &str = "secure";

/// A decay event as it is stored in the wait list.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueuedEvent {
    /// The store key of the counter, prefix included.
    pub key: String,
    /// Milliseconds since the UNIX epoch.
    pub admitted_at: u64,
}

impl QueuedEvent {
    fn admitted_at(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.admitted_at)
    }
}

fn unix_millis(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

struct Shared<S: Store> {
    store: S,
    prefix: String,
    wait_list: String,
    window: OnceCell<Duration>,
    running: AtomicBool,
    clock: SystemClock,
}

impl<S: Store> Shared<S> {
    fn count_key(&self, key: &str) -> String {
        format!("{}-{}", self.prefix, key)
    }

    fn ban_key(&self, key: &str) -> String {
        format!("{}-ban-{}", self.prefix, key)
    }

    fn decay(&self, window: Duration, signal: Signal) {
        while !signal.is_stopped() {
            let raw = match self.store.pop(&self.wait_list) {
                Ok(Some(raw)) => raw,
                Ok(None) => {
                    signal.sleep(window);
                    continue;
                }
                Err(err) => {
                    tracing::warn!(%err, list = %self.wait_list, "failed to poll wait list");
                    signal.sleep(window);
                    continue;
                }
            };
            let event: QueuedEvent = match serde_json::from_str(&raw) {
                Ok(event) => event,
                Err(err) => {
                    tracing::warn!(%err, raw = %raw, "dropping malformed decay event");
                    continue;
                }
            };
            if let Some(wait) = clock::remaining(window, event.admitted_at(), self.clock.now()) {
                if !signal.sleep(wait) {
                    self.requeue(raw);
                    break;
                }
            }
            self.expire(&event.key);
        }
    }

    fn expire(&self, key: &str) {
        match self.store.decr(key) {
            Ok(left) if left <= 0 => {
                if let Err(err) = self.store.del(key) {
                    tracing::warn!(%err, key, "failed to remove decayed counter");
                }
            }
            Ok(left) => tracing::trace!(key, left, "decayed admission"),
            Err(err) => tracing::warn!(%err, key, "failed to decay admission"),
        }
    }

    fn requeue(&self, raw: String) {
        if let Err(err) = self.store.push(&self.wait_list, raw) {
            tracing::warn!(%err, "failed to requeue decay event on shutdown");
        }
    }
}

/// A rate driver that keeps counters in an external [`Store`], so
/// that several processes can share them.
///
/// Keys are laid out as follows, with `<prefix>` defaulting to
/// `"secure"`:
///
/// * `<prefix>-<key>`: the count for a client, expiring one window
///   after the last admission.
/// * `<prefix>-wait-list`: a list of JSON-serialized
///   [`QueuedEvent`]s waiting to be decayed.
/// * `<prefix>-ban-<key>`: present while a client is banned; expires
///   with the ban duration, in case nobody is left to lift the ban.
///
/// Every process runs its own decay worker popping from the shared
/// wait list; the counts are best-effort.
///
/// Banning a key deletes its count, but not the decay events of the
/// admissions that led up to the ban. If the ban ends before those
/// events are a window old, they are taken off the key's new count,
/// so a key that was just unbanned may briefly be undercounted.
pub struct SharedStoreDriver<S: Store> {
    shared: Arc<Shared<S>>,
    worker: Mutex<Option<Worker>>,
}

impl<S: Store> fmt::Debug for SharedStoreDriver<S> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SharedStoreDriver{{prefix: {:?}}}", self.shared.prefix)
    }
}

impl<S: Store> SharedStoreDriver<S> {
    /// Constructs a driver using the default key prefix.
    pub fn new(store: S) -> Self {
        Self::with_prefix(store, DEFAULT_PREFIX)
    }

    /// Constructs a driver whose keys all start with `prefix`.
    pub fn with_prefix(store: S, prefix: &str) -> Self {
        SharedStoreDriver {
            shared: Arc::new(Shared {
                store,
                prefix: prefix.to_owned(),
                wait_list: format!("{}-wait-list", prefix),
                window: OnceCell::new(),
                running: AtomicBool::new(false),
                clock: SystemClock,
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &S {
        &self.shared.store
    }

    /// The name of the list holding queued decay events.
    pub fn wait_list(&self) -> &str {
        &self.shared.wait_list
    }

    fn window(&self) -> Result<Duration> {
        if !self.shared.running.load(Ordering::Acquire) {
            return Err(Error::NotInitialized);
        }
        self.shared.window.get().copied().ok_or(Error::NotInitialized)
    }

    fn read_count(&self, store_key: &str) -> Result<u64> {
        match self.shared.store.get(store_key) {
            Ok(count) => Ok(count.unwrap_or(0).max(0) as u64),
            Err(StoreError::NotAnInteger(key)) => {
                tracing::warn!(key = %key, "treating non-integer counter as 0");
                Ok(0)
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl<S: Store> Driver for SharedStoreDriver<S> {
    /// Starts the decay worker. A driver keeps the window it was first
    /// initialized with; re-initializing it after `shutdown` with a
    /// different window is rejected.
    fn init(&self, window: Duration) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Err(Error::AlreadyInitialized);
        }
        let configured = *self.shared.window.get_or_init(|| window);
        if configured != window {
            return Err(Error::InvalidConfig(format!(
                "driver was initialized with window {:?}, not {:?}",
                configured, window
            )));
        }
        let shared = Arc::clone(&self.shared);
        *worker = Some(Worker::spawn("admission-shared-decay", move |signal| {
            shared.decay(window, signal)
        })?);
        self.shared.running.store(true, Ordering::Release);
        tracing::debug!(?window, prefix = %self.shared.prefix, "started shared-store decay worker");
        Ok(())
    }

    fn add_request(&self, key: &str) -> Result<u64> {
        let window = self.window()?;
        let store = &self.shared.store;
        let key = self.shared.count_key(key);
        let event = serde_json::to_string(&QueuedEvent {
            key: key.clone(),
            admitted_at: unix_millis(self.shared.clock.now()),
        })?;
        store.push(&self.shared.wait_list, event)?;
        let count = store.incr(&key)?;
        store.expire(&key, window)?;
        Ok(count.max(0) as u64)
    }

    fn request_rate(&self, key: &str) -> Result<u64> {
        self.read_count(&self.shared.count_key(key))
    }

    fn remove_ip(&self, key: &str) -> Result<u64> {
        let count_key = self.shared.count_key(key);
        let previous = self.read_count(&count_key)?;
        self.shared.store.del(&count_key)?;
        self.shared.store.del(&self.shared.ban_key(key))?;
        Ok(previous)
    }

    fn ban(&self, key: &str, duration: Duration) -> Result<bool> {
        let store = &self.shared.store;
        let ban_key = self.shared.ban_key(key);
        store.del(&self.shared.count_key(key))?;
        let bans = store.incr(&ban_key)?;
        store.expire(&ban_key, duration)?;
        Ok(bans == 1)
    }

    fn is_banned(&self, key: &str) -> Result<bool> {
        Ok(self.read_count(&self.shared.ban_key(key))? > 0)
    }

    fn shutdown(&self) {
        self.shared.running.store(false, Ordering::Release);
        drop(self.worker.lock().take());
    }
}

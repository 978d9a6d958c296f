//! The concurrent per-key counter store used by the in-process driver.

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// The count value that marks a key as banned.
pub const BANNED: i64 = -1;

/// The state of a single key, guarded by the key's own mutex.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CounterState {
    count: i64,
    generation: u64,
    retired: bool,
}

impl CounterState {
    /// The raw count; [`BANNED`] if the key is banned.
    pub fn count(&self) -> i64 {
        self.count
    }

    /// Identifies the counter instance. No two counters created by
    /// the same store share a generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_banned(&self) -> bool {
        self.count == BANNED
    }

    /// The number of admissions still counting against the key; 0
    /// while the key is banned.
    pub fn rate(&self) -> u64 {
        if self.is_banned() {
            0
        } else {
            self.count as u64
        }
    }

    /// Counts one admission and returns the new count. Must not be
    /// called on a banned counter.
    pub fn increment(&mut self) -> u64 {
        debug_assert!(!self.is_banned());
        self.count += 1;
        self.count as u64
    }

    /// Takes one admission off the count and returns what's left.
    /// Banned counters are left alone.
    pub fn decrement(&mut self) -> i64 {
        if !self.is_banned() && self.count > 0 {
            self.count -= 1;
        }
        self.count
    }

    /// Puts the counter into the banned state.
    pub fn ban(&mut self) {
        self.count = BANNED;
    }
}

/// A counter for a single key. Lock it to read or mutate its state.
pub struct Counter(Mutex<CounterState>);

impl Counter {
    fn new(generation: u64) -> Self {
        Counter(Mutex::new(CounterState {
            count: 0,
            generation,
            retired: false,
        }))
    }

    pub fn lock(&self) -> MutexGuard<CounterState> {
        self.0.lock()
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        write!(f, "Counter{{{:?}}}", *self.0.lock())
    }
}

/// What should happen to a counter after an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fate {
    Keep,
    Remove,
}

/// A concurrent mapping from client keys to their counters.
///
/// The map is sharded, so looking up or creating counters for
/// different keys rarely contends; mutating a counter only takes that
/// counter's lock.
///
/// Removal happens under the removed counter's lock, and marks the
/// counter as retired: anyone who looked the counter up before it got
/// removed will notice that when they lock it, and retry against the
/// live map.
pub struct CounterStore {
    counters: DashMap<String, Arc<Counter>>,
    generations: AtomicU64,
}

impl Default for CounterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CounterStore {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        write!(f, "CounterStore{{keys: {}}}", self.counters.len())
    }
}

impl CounterStore {
    pub fn new() -> Self {
        CounterStore {
            counters: DashMap::new(),
            generations: AtomicU64::new(1),
        }
    }

    /// Returns the counter for `key`, creating it if there is none.
    /// Concurrent callers for the same new key all get the same
    /// counter.
    pub fn load_or_create(&self, key: &str) -> Arc<Counter> {
        if let Some(counter) = self.load(key) {
            return counter;
        }
        let entry = self
            .counters
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new(Counter::new(self.next_generation())));
        Arc::clone(entry.value())
    }

    /// Returns the counter for `key`, if there is one.
    pub fn load(&self, key: &str) -> Option<Arc<Counter>> {
        self.counters
            .get(key)
            .map(|counter| Arc::clone(counter.value()))
    }

    /// Runs `f` against the live counter for `key` (creating it if
    /// necessary) under the counter's lock, and returns what `f`
    /// returns. If `f` decides the counter should go, it is removed
    /// before the lock is released.
    ///
    /// `f` is called exactly once.
    pub fn update<F, R>(&self, key: &str, mut f: F) -> R
    where
        F: FnMut(&mut CounterState) -> (R, Fate),
    {
        loop {
            let counter = self.load_or_create(key);
            let mut state = counter.lock();
            if state.retired {
                continue;
            }
            let (result, fate) = f(&mut state);
            if fate == Fate::Remove {
                self.retire(key, &counter, &mut state);
            }
            return result;
        }
    }

    /// Like [`update`](#method.update), but never creates a counter:
    /// returns `None` without calling `f` if `key` has none.
    pub fn update_existing<F, R>(&self, key: &str, mut f: F) -> Option<R>
    where
        F: FnMut(&mut CounterState) -> (R, Fate),
    {
        loop {
            let counter = self.load(key)?;
            let mut state = counter.lock();
            if state.retired {
                continue;
            }
            let (result, fate) = f(&mut state);
            if fate == Fate::Remove {
                self.retire(key, &counter, &mut state);
            }
            return Some(result);
        }
    }

    /// Returns the current rate for `key`, 0 if it is unknown or
    /// banned.
    pub fn rate(&self, key: &str) -> u64 {
        self.update_existing(key, |state| (state.rate(), Fate::Keep))
            .unwrap_or(0)
    }

    /// Removes the counter for `key` no matter what state it's in,
    /// returning its last state's count. Returns `None` if there was
    /// no counter.
    pub fn delete(&self, key: &str) -> Option<i64> {
        self.update_existing(key, |state| (state.count(), Fate::Remove))
    }

    /// Rebuilds the backing storage from the live entries, releasing
    /// memory left behind by removed keys. Live counters are
    /// untouched.
    pub fn garbage_collect(&self) {
        let live = self.counters.len();
        self.counters.shrink_to_fit();
        tracing::debug!(live, "compacted counter store");
    }

    /// Returns the number of keys with a counter.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Returns how many keys the store can hold without reallocating.
    pub fn capacity(&self) -> usize {
        self.counters.capacity()
    }

    fn retire(&self, key: &str, counter: &Arc<Counter>, state: &mut CounterState) {
        state.retired = true;
        self.counters
            .remove_if(key, |_, live| Arc::ptr_eq(live, counter));
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed)
    }
}

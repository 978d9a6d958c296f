//! A driver keeping all rate state in local memory.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{self, Clock, DefaultClock};
use crate::config::Settings;
use crate::decision::{decide, Decision};
use crate::drivers::Driver;
use crate::errors::{Error, Result};
use crate::queue::LockFreeQueue;
use crate::store::{CounterStore, Fate};
use crate::worker::{Signal, Worker};

/// A request that was counted against `key` at `admitted_at`, and
/// that has to be taken off the count one window later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecayEvent<P> {
    pub key: String,
    pub admitted_at: P,
    /// The generation of the counter the request was counted against.
    /// If the key's counter has been replaced since, the event is
    /// stale and gets dropped.
    pub generation: u64,
}

struct Shared<C: Clock> {
    counters: CounterStore,
    queue: LockFreeQueue<DecayEvent<C::Instant>>,
    clock: C,
    running: AtomicBool,
}

impl<C: Clock> Shared<C> {
    /// Must be called with the key's counter locked, so that events
    /// for one key are queued in the order they were counted.
    fn schedule_decay(&self, key: &str, generation: u64) {
        self.queue.push(DecayEvent {
            key: key.to_owned(),
            admitted_at: self.clock.now(),
            generation,
        });
    }

    fn expire(&self, event: &DecayEvent<C::Instant>) {
        let left = self.counters.update_existing(&event.key, |state| {
            if state.generation() != event.generation || state.is_banned() {
                return (None, Fate::Keep);
            }
            match state.decrement() {
                0 => (Some(0), Fate::Remove),
                left => (Some(left), Fate::Keep),
            }
        });
        match left.flatten() {
            Some(left) => tracing::trace!(key = %event.key, left, "decayed admission"),
            None => tracing::trace!(key = %event.key, "dropped decay event for replaced or banned counter"),
        }
    }

    fn decay(&self, window: Duration, signal: Signal) {
        // Compact the store once each time the queue drains, not on
        // every empty poll.
        let mut drained = true;
        while !signal.is_stopped() {
            let event = match self.queue.pop() {
                Some(event) => event,
                None => {
                    if !drained {
                        drained = true;
                        self.counters.garbage_collect();
                    }
                    signal.sleep(window);
                    continue;
                }
            };
            drained = false;
            if let Some(wait) = clock::remaining(window, event.admitted_at, self.clock.now()) {
                if !signal.sleep(wait) {
                    // Requeue so a later `init` still decays it; this
                    // one event may end up behind younger ones.
                    self.queue.push(event);
                    break;
                }
            }
            self.expire(&event);
        }
    }
}

/// A rate driver that counts admissions in a local [`CounterStore`]
/// and decays them through a lock-free queue and a background thread.
///
/// The admission step ([`Driver::admit`]) runs entirely under the
/// key's counter lock, so it is atomic with respect to other requests
/// for the same key, and never contends with requests for other keys.
///
/// # Example
/// ```
/// use admission_meter::{Driver, InProcessDriver};
/// use std::time::Duration;
///
/// let driver = InProcessDriver::new();
/// driver.init(Duration::from_secs(60)).unwrap();
/// assert_eq!(1, driver.add_request("10.0.0.1").unwrap());
/// assert_eq!(2, driver.add_request("10.0.0.1").unwrap());
/// assert_eq!(2, driver.request_rate("10.0.0.1").unwrap());
/// assert_eq!(2, driver.remove_ip("10.0.0.1").unwrap());
/// assert_eq!(0, driver.request_rate("10.0.0.1").unwrap());
/// ```
pub struct InProcessDriver<C: Clock = DefaultClock> {
    shared: Arc<Shared<C>>,
    worker: Mutex<Option<Worker>>,
}

impl<C: Clock> fmt::Debug for InProcessDriver<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "InProcessDriver{{{counters:?}, running: {running}}}",
            counters = self.shared.counters,
            running = self.shared.running.load(Ordering::Relaxed)
        )
    }
}

impl Default for InProcessDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcessDriver {
    /// Constructs a driver that timestamps admissions with the
    /// monotonic clock.
    pub fn new() -> Self {
        Self::with_clock(DefaultClock::default())
    }
}

impl<C: Clock> InProcessDriver<C> {
    /// Constructs a driver that timestamps admissions with `clock`.
    pub fn with_clock(clock: C) -> Self {
        InProcessDriver {
            shared: Arc::new(Shared {
                counters: CounterStore::new(),
                queue: LockFreeQueue::new(),
                clock,
                running: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    /// The counters this driver keeps.
    pub fn counters(&self) -> &CounterStore {
        &self.shared.counters
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shared.running.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::NotInitialized)
        }
    }
}

impl<C: Clock> Driver for InProcessDriver<C> {
    fn init(&self, window: Duration) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Err(Error::AlreadyInitialized);
        }
        let shared = Arc::clone(&self.shared);
        *worker = Some(Worker::spawn("admission-decay", move |signal| {
            shared.decay(window, signal)
        })?);
        self.shared.running.store(true, Ordering::Release);
        tracing::debug!(?window, "started in-process decay worker");
        Ok(())
    }

    /// Counts one admission. Banned keys are not counted; their count
    /// is reported as 0.
    fn add_request(&self, key: &str) -> Result<u64> {
        self.ensure_running()?;
        let shared = &self.shared;
        Ok(shared.counters.update(key, |state| {
            if state.is_banned() {
                return (0, Fate::Keep);
            }
            let count = state.increment();
            shared.schedule_decay(key, state.generation());
            (count, Fate::Keep)
        }))
    }

    fn request_rate(&self, key: &str) -> Result<u64> {
        Ok(self.shared.counters.rate(key))
    }

    fn remove_ip(&self, key: &str) -> Result<u64> {
        let previous = self.shared.counters.delete(key).unwrap_or(0);
        Ok(previous.max(0) as u64)
    }

    fn ban(&self, key: &str, _duration: Duration) -> Result<bool> {
        Ok(self.shared.counters.update(key, |state| {
            let newly = !state.is_banned();
            state.ban();
            (newly, Fate::Keep)
        }))
    }

    fn is_banned(&self, key: &str) -> Result<bool> {
        Ok(self
            .shared
            .counters
            .update_existing(key, |state| (state.is_banned(), Fate::Keep))
            .unwrap_or(false))
    }

    fn admit(&self, key: &str, settings: &Settings) -> Result<Decision> {
        self.ensure_running()?;
        let shared = &self.shared;
        Ok(shared.counters.update(key, |state| {
            let decision = decide(state, &settings.limits);
            if decision.is_counted() {
                shared.schedule_decay(key, state.generation());
            }
            (decision, Fate::Keep)
        }))
    }

    fn collect_garbage(&self) {
        self.shared.counters.garbage_collect();
    }

    fn shutdown(&self) {
        self.shared.running.store(false, Ordering::Release);
        // Dropping the worker joins its thread.
        drop(self.worker.lock().take());
    }
}

//! Rate drivers: where admissions get counted and decayed.
//!
//! A [`Driver`] keeps one counter per client key. Every admission
//! bumps the key's counter and schedules a decay event; a background
//! worker takes the admission off the count again once it is one
//! window old.
//!
//! Two drivers are provided:
//!
//! * [`InProcessDriver`] keeps counters in a local sharded map and
//!   schedules decay through a lock-free queue. It is the fastest
//!   option, and its admission step is atomic per key, but the state
//!   is lost on restart and not shared between processes.
//!
//! * [`SharedStoreDriver`] keeps counters in an external key-value
//!   [`Store`], so that several processes can share rate state. Each
//!   process runs its own decay worker against the shared event list;
//!   the accounting is best-effort, not linearizable.

pub mod in_process;

#[cfg(feature = "shared_store")]
pub mod memory_store;
#[cfg(feature = "shared_store")]
pub mod shared;

pub use self::in_process::{DecayEvent, InProcessDriver};

#[cfg(feature = "shared_store")]
pub use self::memory_store::MemoryStore;
#[cfg(feature = "shared_store")]
pub use self::shared::{SharedStoreDriver, Store, StoreResult};

use std::time::Duration;

use crate::config::Settings;
use crate::decision::{verdict, Decision, Verdict};
use crate::errors::Result;

/// The operations every rate driver supports.
///
/// Unknown keys are never an error: they have a rate of 0, and
/// removing them does nothing.
pub trait Driver: Send + Sync + 'static {
    /// Starts the driver's background workers. `window` is the span of
    /// time an admission counts against its key.
    ///
    /// Returns [`Error::AlreadyInitialized`](../enum.Error.html) if
    /// the workers are already running.
    fn init(&self, window: Duration) -> Result<()>;

    /// Counts one admission for `key`, schedules its decay and returns
    /// the key's new count.
    fn add_request(&self, key: &str) -> Result<u64>;

    /// Returns the current count for `key` without changing it.
    fn request_rate(&self, key: &str) -> Result<u64>;

    /// Clears all state for `key`, including a ban, and returns the
    /// count it had.
    fn remove_ip(&self, key: &str) -> Result<u64>;

    /// Puts `key` into the banned state. `duration` is how long the
    /// caller intends to keep it banned; lifting the ban is up to the
    /// caller (via [`remove_ip`](#tymethod.remove_ip)), but drivers
    /// may use it as a safety net. Returns `true` if the key was not
    /// banned before.
    fn ban(&self, key: &str, duration: Duration) -> Result<bool>;

    fn is_banned(&self, key: &str) -> Result<bool>;

    /// Runs the admission state machine for one request for `key`.
    ///
    /// The provided implementation composes the operations above; it
    /// is not atomic with respect to other requests for the same key,
    /// so drivers that can do better should override it.
    ///
    /// It reads the key's rate before counting, so that the request
    /// that trips the ban isn't counted and leaves no decay event
    /// behind. A concurrent request can still slip in between the read
    /// and the count; it then bans the key after being counted.
    fn admit(&self, key: &str, settings: &Settings) -> Result<Decision> {
        if self.is_banned(key)? {
            return Ok(Decision::Banned);
        }
        if verdict(&settings.limits, self.request_rate(key)?) == Verdict::Ban {
            return ban_for_admission(self, key, settings);
        }
        let count = self.add_request(key)?;
        let decision = match verdict(&settings.limits, count.saturating_sub(1)) {
            Verdict::Ban => return ban_for_admission(self, key, settings),
            Verdict::Throttle => Decision::Throttle { count },
            Verdict::Admit => Decision::Admit { count },
        };
        Ok(decision)
    }

    /// Releases memory held for keys that are gone. Called when the
    /// ban list runs empty.
    fn collect_garbage(&self) {}

    /// Stops the background workers and waits for them to exit.
    /// Queued decay events stay queued; `init` may be called again
    /// afterwards to resume processing them.
    fn shutdown(&self);
}

/// Bans `key`; only the request that actually banned it gets
/// [`Decision::Ban`].
fn ban_for_admission<D: Driver + ?Sized>(driver: &D, key: &str, settings: &Settings) -> Result<Decision> {
    if driver.ban(key, settings.ban_duration)? {
        Ok(Decision::Ban)
    } else {
        Ok(Decision::Banned)
    }
}

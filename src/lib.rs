//! # Per-client admission control in Rust
//!
//! This crate decides, request by request, whether a client may
//! proceed. It counts how many requests each client key (usually an
//! address) made within a sliding window, throttles keys that go over
//! a soft limit, and bans keys that reach a hard limit for a while.
//!
//! ## Interface
//!
//! The entry point is the [`Sentry`], which combines a rate
//! [`Driver`] with a [`Blacklist`](blacklist/struct.Blacklist.html):
//!
//! ``` rust
//! use admission_meter::{Config, InProcessDriver, Sentry};
//!
//! let sentry = Sentry::new(&Config::default(), InProcessDriver::new()).unwrap();
//! if sentry.check("192.0.2.1").is_admitted() {
//!     // handle the request
//! }
//! ```
//!
//! The default configuration counts each admission for a minute,
//! throttles keys above 120 admissions in that minute, and bans keys
//! reaching 300 for half an hour.
//!
//! ## Counting and decay
//!
//! Instead of recomputing a key's rate from timestamps on every
//! request, every admission increments the key's counter and queues a
//! decay event. A background worker pops those events in the order
//! they were queued, sleeps until each one is a window old, and
//! decrements the counter again; counters that reach zero are
//! removed. Requests never wait for the worker: queueing a decay event
//! is a lock-free push (see [`LockFreeQueue`]).
//!
//! ## Drivers
//!
//! The [`InProcessDriver`] keeps counters in a sharded in-memory map,
//! with one lock per key, so requests for different keys don't
//! contend. The [`SharedStoreDriver`] keeps them in an external
//! key-value [`Store`], so that several processes can share rate
//! state, at the cost of a round-trip per request and best-effort
//! consistency.
//!
//! ## Failure behavior
//!
//! If a driver can't determine a key's rate (e.g. the store is
//! down), the sentry logs that and lets the request through.

#[macro_use]
extern crate nonzero_ext;

pub mod blacklist;
pub mod clock;
pub mod config;
pub mod decision;
pub mod drivers;
pub mod errors;
pub mod prelude;
pub mod queue;
pub mod sentry;
pub mod store;

#[doc(hidden)]
pub mod test_utilities;

mod worker;

pub use self::config::{AdmissionOrder, Config, Limits, Settings};
pub use self::decision::Decision;
pub use self::drivers::{DecayEvent, Driver, InProcessDriver};
#[cfg(feature = "shared_store")]
pub use self::drivers::{MemoryStore, SharedStoreDriver, Store};
pub use self::errors::*;
pub use self::queue::LockFreeQueue;
pub use self::sentry::Sentry;
pub use self::store::{CounterStore, BANNED};

#![doc(hidden)]
//! A module for code shared between integration tests & benchmarks in this crate.

use std::num::NonZeroU64;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::{Config, Settings};

/// Settings with short timings, so that tests can watch counters
/// decay and bans end.
pub fn quick_settings(window: Duration, soft: NonZeroU64, hard: NonZeroU64, ban: Duration) -> Settings {
    Config::builder()
        .window(window)
        .limits(soft, hard)
        .ban_for(ban)
        .build()
        .expect("test settings are consistent")
}

/// Polls `condition` until it holds or `timeout` passes. Returns
/// whether it held.
pub fn eventually<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

/// Returns `n` distinct client keys.
pub fn client_keys(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("10.{}.{}.{}", (i >> 16) & 0xff, (i >> 8) & 0xff, i & 0xff)).collect()
}

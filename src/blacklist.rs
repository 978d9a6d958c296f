//! Timed bans.
//!
//! Banned keys are queued in the order they were banned, together
//! with the moment their ban ends. Since every ban lasts equally long,
//! that order is also the order in which bans end, so a FIFO queue is
//! all the worker needs: it sleeps until the oldest ban ends, lifts
//! it, and moves on to the next one.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::drivers::Driver;
use crate::config::check_duration;
use crate::errors::Result;
use crate::queue::LockFreeQueue;
use crate::worker::{Signal, Worker};

/// A banned key and the moment its ban ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanEntry {
    pub key: String,
    pub unban_at: Instant,
}

/// Schedules the end of bans on a driver.
pub struct Blacklist {
    queue: Arc<LockFreeQueue<BanEntry>>,
    ban_duration: Duration,
    worker: Mutex<Option<Worker>>,
}

impl fmt::Debug for Blacklist {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Blacklist{{ban_duration: {:?}}}", self.ban_duration)
    }
}

impl Blacklist {
    /// Starts a worker that lifts bans on `driver` once they're
    /// `ban_duration` old.
    pub fn start<D: Driver>(driver: Arc<D>, ban_duration: Duration) -> Result<Blacklist> {
        check_duration("ban duration", ban_duration)?;
        let queue = Arc::new(LockFreeQueue::new());
        let worker_queue = Arc::clone(&queue);
        let worker = Worker::spawn("admission-blacklist", move |signal| {
            sweep(&*driver, &worker_queue, ban_duration, signal)
        })?;
        Ok(Blacklist {
            queue,
            ban_duration,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Schedules the ban on `key` to be lifted one ban duration from
    /// now. The caller is responsible for putting the key into the
    /// banned state.
    pub fn schedule_unban(&self, key: &str) {
        match Instant::now().checked_add(self.ban_duration) {
            Some(unban_at) => self.queue.push(BanEntry {
                key: key.to_owned(),
                unban_at,
            }),
            None => tracing::warn!(key, "ban ends too far in the future, not scheduling its end"),
        }
    }

    /// Stops the worker. Bans that are still scheduled stay in place
    /// until the driver expires them by other means.
    pub fn shutdown(&self) {
        drop(self.worker.lock().take());
    }
}

fn sweep<D: Driver>(driver: &D, queue: &LockFreeQueue<BanEntry>, idle: Duration, signal: Signal) {
    let mut drained = true;
    while !signal.is_stopped() {
        let entry = match queue.pop() {
            Some(entry) => entry,
            None => {
                if !drained {
                    drained = true;
                    driver.collect_garbage();
                }
                // New bans end at least `idle` from now, so they can't
                // come due while we sleep.
                signal.sleep(idle);
                continue;
            }
        };
        drained = false;
        let now = Instant::now();
        if entry.unban_at > now && !signal.sleep(entry.unban_at - now) {
            break;
        }
        match driver.remove_ip(&entry.key) {
            Ok(_) => tracing::debug!(key = %entry.key, "lifted ban"),
            Err(err) => tracing::warn!(%err, key = %entry.key, "failed to lift ban"),
        }
    }
}

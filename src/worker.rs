//! Long-lived background threads that can be told to stop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::errors::Result;

/// Handed to a worker's body so it can sleep and find out when to
/// stop.
#[derive(Debug, Clone)]
pub(crate) struct Signal {
    stop: Arc<AtomicBool>,
}

impl Signal {
    pub(crate) fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Sleeps for `period`. Returns `false` if the worker was told to
    /// stop in the meantime.
    ///
    /// A `period` too long to be represented as an `Instant` sleeps
    /// until the worker is stopped.
    pub(crate) fn sleep(&self, period: Duration) -> bool {
        let deadline = Instant::now().checked_add(period);
        loop {
            if self.is_stopped() {
                return false;
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return true;
                    }
                    // Spurious wakeups just go around the loop again.
                    thread::park_timeout(deadline - now);
                }
                None => thread::park(),
            }
        }
    }
}

/// Owns a background thread. Dropping the worker stops it and waits
/// for it to exit.
#[derive(Debug)]
pub(crate) struct Worker {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    pub(crate) fn spawn<F>(name: &str, body: F) -> Result<Worker>
    where
        F: FnOnce(Signal) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let signal = Signal {
            stop: Arc::clone(&stop),
        };
        let thread = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || body(signal))?;
        Ok(Worker {
            stop,
            thread: Some(thread),
        })
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            if thread.join().is_err() {
                tracing::error!("background worker panicked");
            }
        }
    }
}

//! The per-request entry point.

use std::fmt;
use std::sync::Arc;

use crate::blacklist::Blacklist;
use crate::config::{Config, Settings};
use crate::decision::Decision;
use crate::drivers::Driver;
use crate::errors::Result;

type DenyHandler = Box<dyn Fn(&str, &Decision) + Send + Sync>;

/// Decides, per request, whether a client may proceed.
///
/// A sentry owns a rate [`Driver`] and a [`Blacklist`]: it asks the
/// driver to run the admission step for the request's client key,
/// and schedules the end of any ban that step caused.
///
/// # Example
/// ```
/// # #[macro_use] extern crate nonzero_ext;
/// # fn main() {
/// use admission_meter::{Config, Decision, InProcessDriver, Sentry};
/// use std::time::Duration;
///
/// let settings = Config::builder()
///     .limits(nonzero!(3u64), nonzero!(5u64))
///     .window(Duration::from_secs(60))
///     .build()
///     .unwrap();
/// let sentry = Sentry::with_settings(settings, InProcessDriver::new()).unwrap();
///
/// for count in 1..=3 {
///     assert_eq!(Decision::Admit { count }, sentry.check("203.0.113.9"));
/// }
/// assert_eq!(Decision::Throttle { count: 4 }, sentry.check("203.0.113.9"));
/// assert_eq!(Decision::Ban, sentry.check("203.0.113.9"));
/// assert_eq!(Decision::Banned, sentry.check("203.0.113.9"));
/// # }
/// ```
pub struct Sentry<D: Driver> {
    driver: Arc<D>,
    settings: Settings,
    blacklist: Blacklist,
    on_deny: DenyHandler,
}

impl<D: Driver + fmt::Debug> fmt::Debug for Sentry<D> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Sentry{{{driver:?}, {settings:?}}}",
            driver = self.driver,
            settings = self.settings
        )
    }
}

impl<D: Driver> Sentry<D> {
    /// Validates `config`, initializes `driver` and starts the
    /// blacklist worker.
    pub fn new(config: &Config, driver: D) -> Result<Self> {
        Self::with_settings(Settings::try_from(config)?, driver)
    }

    /// Like [`new`](#method.new), for settings made with
    /// [`Config::builder`].
    pub fn with_settings(settings: Settings, driver: D) -> Result<Self> {
        let driver = Arc::new(driver);
        driver.init(settings.window)?;
        let blacklist = Blacklist::start(Arc::clone(&driver), settings.ban_duration)?;
        Ok(Sentry {
            driver,
            settings,
            blacklist,
            on_deny: Box::new(|key, decision| {
                tracing::debug!(key, ?decision, "denied request");
            }),
        })
    }

    /// Sets the function that [`handle`](#method.handle) calls for
    /// denied requests, e.g. to abort the request with a 403.
    pub fn with_deny_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, &Decision) + Send + Sync + 'static,
    {
        self.on_deny = Box::new(handler);
        self
    }

    /// Runs the admission step for one request from `key`.
    ///
    /// If the driver fails, the failure is logged and the request is
    /// let through as [`Decision::Unavailable`].
    pub fn check(&self, key: &str) -> Decision {
        match self.driver.admit(key, &self.settings) {
            Ok(Decision::Ban) => {
                tracing::debug!(key, ban_duration = ?self.settings.ban_duration, "banned key");
                self.blacklist.schedule_unban(key);
                Decision::Ban
            }
            Ok(decision) => decision,
            Err(err) => {
                tracing::warn!(%err, key, "could not determine rate, letting request through");
                Decision::Unavailable
            }
        }
    }

    /// Runs [`check`](#method.check), calls the deny handler if the
    /// request is denied, and returns whether it may proceed.
    pub fn handle(&self, key: &str) -> bool {
        let decision = self.check(key);
        if decision.is_denied() {
            (self.on_deny)(key, &decision);
            false
        } else {
            true
        }
    }

    /// Returns the current count for `key`.
    pub fn rate(&self, key: &str) -> Result<u64> {
        self.driver.request_rate(key)
    }

    /// Lifts a ban on `key` (if any) and resets its count, returning
    /// the count it had.
    pub fn unban(&self, key: &str) -> Result<u64> {
        self.driver.remove_ip(key)
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Stops the blacklist and the driver's workers.
    pub fn shutdown(&self) {
        self.blacklist.shutdown();
        self.driver.shutdown();
    }
}

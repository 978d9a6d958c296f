//! Admission thresholds and timings.

use serde::Deserialize;
use std::num::NonZeroU64;
use std::time::{Duration, Instant};

use crate::errors::{Error, Result};

/// In which order the admission step counts a request and checks the
/// thresholds. This decides whether the request that crosses a
/// threshold is itself throttled or banned, or the one after it.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionOrder {
    /// Count the request first, then compare the new count against
    /// the limits. The request that reaches the hard limit is denied
    /// and bans its key.
    #[default]
    CountThenCheck,

    /// Compare the count of earlier requests against the limits, then
    /// count this one. Every threshold trips one request later than
    /// with `CountThenCheck`.
    CheckThenCount,
}

/// The throttle and ban thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Counts above this are throttled.
    pub soft: NonZeroU64,
    /// Counts reaching this get the key banned.
    pub hard: NonZeroU64,
    pub order: AdmissionOrder,
}

/// Configuration of an admission front-end and its driver.
///
/// All fields have defaults, so an empty document deserializes into
/// `Config::default()`:
///
/// ```
/// # use admission_meter::Config;
/// # use std::time::Duration;
/// let config: Config = serde_json::from_str(r#"{"soft_limit": 10, "hard_limit": 20}"#).unwrap();
/// assert_eq!(Duration::from_secs(60), config.window());
/// assert_eq!(10, config.limits().soft.get());
/// ```
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct Config {
    /// How long one admission keeps counting against its key.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_soft_limit")]
    pub soft_limit: NonZeroU64,
    #[serde(default = "default_hard_limit")]
    pub hard_limit: NonZeroU64,
    /// How long a banned key stays banned.
    #[serde(default = "default_ban_duration_secs")]
    pub ban_duration_secs: u64,
    #[serde(default)]
    pub order: AdmissionOrder,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            window_secs: default_window_secs(),
            soft_limit: default_soft_limit(),
            hard_limit: default_hard_limit(),
            ban_duration_secs: default_ban_duration_secs(),
            order: AdmissionOrder::default(),
        }
    }
}

fn default_window_secs() -> u64 {
    60
}

fn default_soft_limit() -> NonZeroU64 {
    nonzero!(120u64)
}

fn default_hard_limit() -> NonZeroU64 {
    nonzero!(300u64)
}

fn default_ban_duration_secs() -> u64 {
    30 * 60
}

impl Config {
    /// Returns a builder starting out with the default configuration.
    pub fn builder() -> Builder {
        Builder {
            window: Duration::from_secs(default_window_secs()),
            ban_duration: Duration::from_secs(default_ban_duration_secs()),
            limits: Limits {
                soft: default_soft_limit(),
                hard: default_hard_limit(),
                order: AdmissionOrder::default(),
            },
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn ban_duration(&self) -> Duration {
        Duration::from_secs(self.ban_duration_secs)
    }

    pub fn limits(&self) -> Limits {
        Limits {
            soft: self.soft_limit,
            hard: self.hard_limit,
            order: self.order,
        }
    }

    /// Checks the constraints between the fields.
    pub fn validate(&self) -> Result<()> {
        check(self.window(), self.ban_duration(), &self.limits())
    }

    /// The validated settings in the form the drivers consume.
    pub(crate) fn settings(&self) -> Result<Settings> {
        self.validate()?;
        Ok(Settings {
            window: self.window(),
            ban_duration: self.ban_duration(),
            limits: self.limits(),
        })
    }
}

/// Validated timings and limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub window: Duration,
    pub ban_duration: Duration,
    pub limits: Limits,
}

/// Rejects durations that are zero, or too long to be added to an
/// `Instant`.
pub(crate) fn check_duration(what: &str, duration: Duration) -> Result<()> {
    if duration == Duration::new(0, 0) {
        return Err(Error::InvalidConfig(format!("{} must be positive", what)));
    }
    if Instant::now().checked_add(duration).is_none() {
        return Err(Error::InvalidConfig(format!(
            "{} of {:?} is out of range",
            what, duration
        )));
    }
    Ok(())
}

fn check(window: Duration, ban_duration: Duration, limits: &Limits) -> Result<()> {
    check_duration("window", window)?;
    check_duration("ban duration", ban_duration)?;
    if limits.soft >= limits.hard {
        return Err(Error::InvalidConfig(format!(
            "soft limit {} must be below hard limit {}",
            limits.soft, limits.hard
        )));
    }
    Ok(())
}

/// An object that allows incrementally constructing settings with
/// sub-second precision, which the serialized form doesn't offer.
#[derive(Debug, Clone)]
pub struct Builder {
    window: Duration,
    ban_duration: Duration,
    limits: Limits,
}

impl Builder {
    /// Sets the span of time one admission counts against its key.
    pub fn window(&mut self, window: Duration) -> &mut Builder {
        self.window = window;
        self
    }

    /// Sets how long a banned key stays banned.
    pub fn ban_for(&mut self, ban_duration: Duration) -> &mut Builder {
        self.ban_duration = ban_duration;
        self
    }

    /// Sets the throttle (`soft`) and ban (`hard`) thresholds.
    pub fn limits(&mut self, soft: NonZeroU64, hard: NonZeroU64) -> &mut Builder {
        self.limits.soft = soft;
        self.limits.hard = hard;
        self
    }

    pub fn order(&mut self, order: AdmissionOrder) -> &mut Builder {
        self.limits.order = order;
        self
    }

    /// Checks the settings and returns them.
    pub fn build(&self) -> Result<Settings> {
        check(self.window, self.ban_duration, &self.limits)?;
        Ok(Settings {
            window: self.window,
            ban_duration: self.ban_duration,
            limits: self.limits,
        })
    }
}

impl TryFrom<&Config> for Settings {
    type Error = Error;

    fn try_from(config: &Config) -> Result<Settings> {
        config.settings()
    }
}

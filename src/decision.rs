//! The per-request admission state machine.
//!
//! Per key, a counter is either `Normal` (below the soft limit),
//! `Throttled` (between the soft and the hard limit) or `Banned`.
//! Requests for a banned key are denied without touching its
//! counter; every other request is counted, unless it is the one that
//! gets the key banned.

use crate::config::{AdmissionOrder, Limits};
use crate::store::CounterState;

/// The outcome of an admission check for a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Let the request through; it is the `count`th admission in the
    /// current window.
    Admit { count: u64 },

    /// The request was counted, but the key is over its soft limit:
    /// deny it.
    Throttle { count: u64 },

    /// This request pushed the key over its hard limit. The key is now
    /// banned, and the request is denied.
    Ban,

    /// The key was already banned; the request is denied and not
    /// counted.
    Banned,

    /// The key's rate could not be determined (e.g. the backing store
    /// is down). Requests are let through in this case.
    Unavailable,
}

impl Decision {
    /// Returns `true` if the request may proceed.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admit { .. } | Decision::Unavailable)
    }

    pub fn is_denied(&self) -> bool {
        !self.is_admitted()
    }

    /// Returns `true` if the request was added to its key's count, and
    /// so has to be decayed later.
    pub fn is_counted(&self) -> bool {
        matches!(self, Decision::Admit { .. } | Decision::Throttle { .. })
    }

    /// The key's count after this request, if it was counted.
    pub fn count(&self) -> Option<u64> {
        match *self {
            Decision::Admit { count } | Decision::Throttle { count } => Some(count),
            _ => None,
        }
    }
}

/// What the limits say about a request, before anything is mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Admit,
    Throttle,
    Ban,
}

/// Classifies a request for a (not banned) key that already has
/// `before` admissions counted in the current window.
pub fn verdict(limits: &Limits, before: u64) -> Verdict {
    let (soft, hard) = (limits.soft.get(), limits.hard.get());
    let measured = match limits.order {
        AdmissionOrder::CountThenCheck => before + 1,
        AdmissionOrder::CheckThenCount => before,
    };
    if measured >= hard {
        Verdict::Ban
    } else if measured > soft {
        Verdict::Throttle
    } else {
        Verdict::Admit
    }
}

/// Runs the admission state machine on a locked counter, mutating it
/// accordingly.
///
/// The caller is responsible for scheduling the decay of counted
/// requests (see [`Decision::is_counted`]) and the unbanning of keys
/// that got banned.
pub fn decide(state: &mut CounterState, limits: &Limits) -> Decision {
    if state.is_banned() {
        return Decision::Banned;
    }
    match verdict(limits, state.rate()) {
        Verdict::Ban => {
            state.ban();
            Decision::Ban
        }
        Verdict::Throttle => Decision::Throttle {
            count: state.increment(),
        },
        Verdict::Admit => Decision::Admit {
            count: state.increment(),
        },
    }
}

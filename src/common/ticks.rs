//! Deadline arithmetic over optional instants.
//!
//! A deadline of `None` means "eternity": the timer is not armed. All the
//! schedulers in this crate compute their next wake-up as the minimum of a
//! handful of such optional deadlines.

use tokio::time::{Duration, Instant};

/// Returns the earlier of two optional deadlines, treating `None` as never.
pub(crate) fn first(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, b) => b,
    }
}

/// Whether an optional deadline has fired at `now`.
pub(crate) fn expired(deadline: Option<Instant>, now: Instant) -> bool {
    match deadline {
        Some(d) => d <= now,
        None => false,
    }
}

/// Arms a deadline `timeout` from `now`; `None` timeout leaves it eternal.
pub(crate) fn arm(now: Instant, timeout: Option<Duration>) -> Option<Instant> {
    timeout.map(|t| now + t)
}

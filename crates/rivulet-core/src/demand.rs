//! Demand (request) accounting.
//!
//! Downstream demand is a saturating 64-bit counter: once it reaches
//! [`UNBOUNDED`] it never comes back down. The helpers here centralise the
//! saturation rules and the prefetch/low-tide arithmetic shared by the
//! operator and its sources.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::FlowError;

/// Demand value meaning "effectively infinite".
///
/// Doubles as the saturation cap for [`add_cap`].
pub const UNBOUNDED: u64 = u64::MAX;

/// Adds `n` to `requested`, saturating at [`UNBOUNDED`].
///
/// Returns the previous value.
pub fn add_cap(requested: &AtomicU64, n: u64) -> u64 {
    let mut current = requested.load(Ordering::Relaxed);
    loop {
        if current == UNBOUNDED {
            return UNBOUNDED;
        }
        let next = current.saturating_add(n);
        match requested.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(previous) => return previous,
            Err(actual) => current = actual,
        }
    }
}

/// Subtracts demand the drain has just satisfied.
///
/// Returns the new outstanding value. Must not be called with `emitted`
/// greater than the outstanding demand, and never while the counter is
/// saturated at [`UNBOUNDED`].
pub fn produced(requested: &AtomicU64, emitted: u64) -> u64 {
    requested.fetch_sub(emitted, Ordering::AcqRel) - emitted
}

/// The initial upstream request for a prefetch window.
///
/// A window of `usize::MAX` is treated as unbounded.
#[must_use]
pub fn unbounded_or_prefetch(prefetch: usize) -> u64 {
    if prefetch == usize::MAX {
        UNBOUNDED
    } else {
        u64::try_from(prefetch).unwrap_or(UNBOUNDED)
    }
}

/// The replenish threshold for a prefetch window.
///
/// A `low_tide` of zero (or one larger than the window) selects the default
/// of `prefetch - prefetch / 4`. An unbounded window never replenishes.
#[must_use]
pub fn unbounded_or_limit(prefetch: usize, low_tide: usize) -> u64 {
    if prefetch == usize::MAX {
        UNBOUNDED
    } else if low_tide == 0 || low_tide > prefetch {
        u64::try_from(prefetch - (prefetch >> 2)).unwrap_or(UNBOUNDED)
    } else {
        u64::try_from(low_tide).unwrap_or(UNBOUNDED)
    }
}

/// Validates a downstream request amount.
///
/// # Errors
///
/// Returns [`FlowError::InvalidRequest`] when `n` is zero.
pub fn validate(n: u64) -> Result<u64, FlowError> {
    if n == 0 {
        Err(FlowError::InvalidRequest)
    } else {
        Ok(n)
    }
}

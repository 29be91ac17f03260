//! Contains common, primitive types shared across the task engine.
//!
//! This module defines the ID types used to identify epochs and timers, and
//! the conversion between the fractional seconds used by configuration files
//! and the millisecond resolution used by the dispatcher.

use slotmap::new_key_type;
use std::time::Duration;

new_key_type! {
    /// Uniquely and safely identifies an epoch registered with a task.
    ///
    /// Epoch keys are handed out once at registration and stay valid for the
    /// lifetime of the task; epochs are reused across trials, never re-created.
    pub struct EpochId;

    /// Identifies a scheduled timer within a `Dispatcher`.
    ///
    /// Keys are versioned, so a cancelled timer's id can never alias a timer
    /// scheduled later.
    pub struct TimerId;
}

/// Converts fractional seconds to a dispatcher `Duration`.
///
/// Durations are kept at whole-millisecond resolution, rounded to the nearest
/// millisecond. Negative and non-finite inputs map to zero.
pub fn secs_to_duration(secs: f64) -> Duration {
    if !secs.is_finite() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::from_millis((secs * 1000.0).round() as u64)
}

/// Converts a `Duration` back to fractional seconds.
pub fn duration_to_secs(duration: Duration) -> f64 {
    duration.as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seconds_round_to_nearest_millisecond() {
        assert_eq!(secs_to_duration(0.15), Duration::from_millis(150));
        assert_eq!(secs_to_duration(0.0004), Duration::ZERO);
        assert_eq!(secs_to_duration(0.0005), Duration::from_millis(1));
        assert_eq!(secs_to_duration(1.0006), Duration::from_millis(1001));
    }

    #[test]
    fn invalid_seconds_clamp_to_zero() {
        assert_eq!(secs_to_duration(-2.0), Duration::ZERO);
        assert_eq!(secs_to_duration(f64::NAN), Duration::ZERO);
        assert_eq!(secs_to_duration(f64::INFINITY), Duration::ZERO);
    }
}

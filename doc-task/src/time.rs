//! Session time and frame bookkeeping.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A point in session time, paired with the display frame it falls in.
///
/// Every logged event, lick, reward and stimulus change is stamped with a
/// `Timepoint`, matching the `(time, frame)` pairs the trial log records.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Timepoint {
    /// Seconds since the session started.
    pub time: f64,
    /// Display frame index at that time.
    pub frame: u64,
}

/// Maps session time onto display frames for a fixed update rate.
#[derive(Debug, Clone, Copy)]
pub struct FrameClock {
    update_rate_hz: f64,
}

impl FrameClock {
    pub fn new(update_rate_hz: f64) -> Self {
        Self { update_rate_hz }
    }

    pub fn frame_at(&self, at: Duration) -> u64 {
        (at.as_secs_f64() * self.update_rate_hz).floor() as u64
    }

    pub fn timepoint(&self, at: Duration) -> Timepoint {
        Timepoint {
            time: at.as_secs_f64(),
            frame: self.frame_at(at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_follow_update_rate() {
        let clock = FrameClock::new(60.0);
        assert_eq!(clock.frame_at(Duration::ZERO), 0);
        assert_eq!(clock.frame_at(Duration::from_millis(1000)), 60);
        let tp = clock.timepoint(Duration::from_millis(500));
        assert_eq!(tp.frame, 30);
        assert!((tp.time - 0.5).abs() < 1e-9);
    }
}

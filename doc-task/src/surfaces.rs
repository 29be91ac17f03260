//! The collaborator surfaces a task consumes: the stimulus and the reward line.
//!
//! Real rendering and valve hardware live outside this crate. The simulated
//! implementations here keep the same contracts so sessions can run headless.

use crate::trial::ChangeEvent;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// The stimulus as seen by a task.
pub trait Stimulus: Send {
    /// Requests a change to a different stimulus group.
    ///
    /// With `next_flash_start` the change is held until the next flash
    /// boundary and `None` is returned; otherwise the change happens now and
    /// is reported back.
    fn change(&mut self, next_flash_start: bool) -> Option<ChangeEvent>;

    /// Called at every flash boundary. Returns the change applied there, if
    /// one was held.
    fn flash_started(&mut self) -> Option<ChangeEvent>;

    /// Whether the stimulus flashes periodically.
    fn is_flashing(&self) -> bool;

    /// The flash period, for stimuli whose flash clock the task should
    /// simulate. Stimuli that report flashes themselves return `None`.
    fn flash_period(&self) -> Option<Duration> {
        None
    }

    fn on(&mut self) {}
    fn off(&mut self) {}

    /// Drops any change held for the next flash.
    fn clear_changes(&mut self);
}

/// A reward valve.
pub trait RewardLine: Send {
    /// Dispenses `volume` mL, or the line's default volume when `None`.
    fn reward(&mut self, volume: Option<f64>);
}

/// A stimulus that cycles between named groups on a fixed flash clock.
#[derive(Debug, Clone)]
pub struct SimulatedStimulus {
    groups: Vec<String>,
    current: usize,
    flash_period: Option<Duration>,
    held_change: bool,
    visible: bool,
    changes: u64,
}

impl SimulatedStimulus {
    pub fn new(groups: Vec<String>, flash_period: Option<Duration>) -> Self {
        Self {
            groups,
            current: 0,
            flash_period,
            held_change: false,
            visible: true,
            changes: 0,
        }
    }

    /// Two groups, flashing with the given period.
    pub fn flashing(period: Duration) -> Self {
        Self::new(vec!["group0".into(), "group1".into()], Some(period))
    }

    /// Two groups, always on.
    pub fn steady() -> Self {
        Self::new(vec!["group0".into(), "group1".into()], None)
    }

    pub fn current_group(&self) -> &str {
        self.groups.get(self.current).map_or("", String::as_str)
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn change_count(&self) -> u64 {
        self.changes
    }

    pub fn has_held_change(&self) -> bool {
        self.held_change
    }

    fn apply_change(&mut self) -> ChangeEvent {
        let from = self.current_group().to_string();
        if self.groups.len() > 1 {
            self.current = (self.current + 1) % self.groups.len();
        }
        self.changes += 1;
        let to = self.current_group().to_string();
        debug!(%from, %to, "Stimulus group changed.");
        ChangeEvent { from, to }
    }
}

impl Stimulus for SimulatedStimulus {
    fn change(&mut self, next_flash_start: bool) -> Option<ChangeEvent> {
        if next_flash_start {
            self.held_change = true;
            return None;
        }
        Some(self.apply_change())
    }

    fn flash_started(&mut self) -> Option<ChangeEvent> {
        if std::mem::take(&mut self.held_change) {
            Some(self.apply_change())
        } else {
            None
        }
    }

    fn is_flashing(&self) -> bool {
        self.flash_period.is_some()
    }

    fn flash_period(&self) -> Option<Duration> {
        self.flash_period
    }

    fn on(&mut self) {
        self.visible = true;
    }

    fn off(&mut self) {
        self.visible = false;
    }

    fn clear_changes(&mut self) {
        self.held_change = false;
    }
}

/// A reward line that only counts what it was asked to dispense.
///
/// Clones share their counters, so a test can keep one handle while the task
/// owns another.
#[derive(Debug, Clone, Default)]
pub struct CountingReward {
    count: Arc<AtomicU64>,
    volumes: Arc<Mutex<Vec<Option<f64>>>>,
}

impl CountingReward {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn volumes(&self) -> Vec<Option<f64>> {
        self.volumes.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

impl RewardLine for CountingReward {
    fn reward(&mut self, volume: Option<f64>) {
        self.count.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut volumes) = self.volumes.lock() {
            volumes.push(volume);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn held_change_applies_on_next_flash_only() {
        let mut stim = SimulatedStimulus::flashing(Duration::from_millis(750));
        assert!(stim.change(true).is_none());
        assert!(stim.has_held_change());
        let event = stim.flash_started().unwrap();
        assert_eq!((event.from.as_str(), event.to.as_str()), ("group0", "group1"));
        assert!(stim.flash_started().is_none());
    }

    #[test]
    fn cleared_change_never_applies() {
        let mut stim = SimulatedStimulus::flashing(Duration::from_millis(750));
        stim.change(true);
        stim.clear_changes();
        assert!(stim.flash_started().is_none());
        assert_eq!(stim.change_count(), 0);
    }

    #[test]
    fn immediate_change_reports_back() {
        let mut stim = SimulatedStimulus::steady();
        assert!(!stim.is_flashing());
        let event = stim.change(false).unwrap();
        assert_eq!(event.to, "group1");
        assert_eq!(stim.change(false).unwrap().to, "group0");
    }

    #[test]
    fn counting_reward_shares_state_across_clones() {
        let reward = CountingReward::new();
        let mut line = reward.clone();
        line.reward(Some(0.005));
        line.reward(None);
        assert_eq!(reward.count(), 2);
        assert_eq!(reward.volumes(), vec![Some(0.005), None]);
    }
}

//! The standard Detection-of-Change phase behaviors.
//!
//! | phase | lick | entry | exit |
//! |---|---|---|---|
//! | `initial_blank` | early response | stimulus off | stimulus on |
//! | `pre_change` | early response | | |
//! | `stimulus_window` | early response until a change is seen | arm change timer | completion check |
//! | `response_window` | hit or false alarm | open | miss or rejection, completion check |
//! | `no_lick` | restart | shortened by time since last lick | completion check |
//! | `timeout` | restart | | completion check |

use super::epoch::{EntryPlan, EpochHost, PhaseBehavior};
use crate::common::secs_to_duration;
use crate::trial::{Outcome, TrialParams};
use std::any::Any;
use std::time::Duration;

pub const INITIAL_BLANK: &str = "initial_blank";
pub const PRE_CHANGE: &str = "pre_change";
pub const STIMULUS_WINDOW: &str = "stimulus_window";
pub const RESPONSE_WINDOW: &str = "response_window";
pub const NO_LICK: &str = "no_lick";
pub const TIMEOUT: &str = "timeout";

/// Blank screen at the start of a trial. Any lick is premature.
#[derive(Debug, Default)]
pub struct InitialBlank;

impl PhaseBehavior for InitialBlank {
    fn on_entry(&mut self, host: &mut dyn EpochHost) {
        host.stimulus_off();
    }

    fn on_lick(&mut self, host: &mut dyn EpochHost) {
        host.report_outcome(Outcome::EarlyResponse);
    }

    fn on_exit(&mut self, host: &mut dyn EpochHost) {
        host.stimulus_on();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Mandatory stimulus viewing before a change may happen.
#[derive(Debug, Default)]
pub struct PreChange;

impl PhaseBehavior for PreChange {
    fn on_lick(&mut self, host: &mut dyn EpochHost) {
        host.report_outcome(Outcome::EarlyResponse);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// The window in which the trial's change is scheduled.
///
/// Licks before the change (real or sham) are early responses; after it they
/// belong to the response window.
#[derive(Debug, Default)]
pub struct StimulusWindow {
    change_time: Option<Duration>,
}

impl StimulusWindow {
    /// Offset of the change from window entry, for the current trial.
    pub fn change_time(&self) -> Option<Duration> {
        self.change_time
    }
}

impl PhaseBehavior for StimulusWindow {
    /// A `change_time` of zero still schedules a change, at window entry.
    /// Only a missing `change_time` means no change.
    fn apply_trial(&mut self, params: &TrialParams) {
        self.change_time = params.change_time.map(secs_to_duration);
    }

    fn on_entry(&mut self, host: &mut dyn EpochHost) {
        if let Some(at) = self.change_time {
            host.start_timer(at);
        }
    }

    fn on_timer(&mut self, host: &mut dyn EpochHost) {
        host.request_change();
    }

    fn on_lick(&mut self, host: &mut dyn EpochHost) {
        if !host.change_observed() {
            host.report_outcome(Outcome::EarlyResponse);
        }
    }

    fn on_exit(&mut self, host: &mut dyn EpochHost) {
        host.check_for_completion();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Reward availability after a change.
///
/// On go trials the first lick while available is a hit; leaving without one
/// is a miss. On catch trials the first lick is a false alarm; leaving
/// without one is a correct rejection. A reward already given this trial
/// (auto reward) counts as rewarded, so no hit or miss follows it.
#[derive(Debug, Default)]
pub struct ResponseWindow {
    available: bool,
    false_alarm: bool,
    rewarded: bool,
}

impl ResponseWindow {
    pub fn is_available(&self) -> bool {
        self.available
    }

    pub fn is_rewarded(&self) -> bool {
        self.rewarded
    }

    pub fn had_false_alarm(&self) -> bool {
        self.false_alarm
    }
}

impl PhaseBehavior for ResponseWindow {
    fn on_entry(&mut self, host: &mut dyn EpochHost) {
        self.available = true;
        self.false_alarm = false;
        self.rewarded = host.rewards_this_trial() > 0;
    }

    fn on_lick(&mut self, host: &mut dyn EpochHost) {
        if host.is_catch_trial() {
            if !self.false_alarm {
                self.false_alarm = true;
                host.report_outcome(Outcome::FalseAlarm);
            }
        } else if !self.rewarded && self.available {
            self.available = false;
            self.rewarded = true;
            host.report_outcome(Outcome::Hit);
        }
    }

    fn on_exit(&mut self, host: &mut dyn EpochHost) {
        if host.is_catch_trial() {
            if !self.false_alarm {
                host.report_outcome(Outcome::Rejection);
            }
        } else if !self.rewarded {
            host.report_outcome(Outcome::Miss);
        }
        self.available = false;
        host.check_for_completion();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Holds the trial open until the subject has not licked for the epoch's
/// duration. Time already spent without licking counts.
#[derive(Debug, Default)]
pub struct NoLick;

impl PhaseBehavior for NoLick {
    fn entry_plan(&self, nominal: Duration, host: &dyn EpochHost) -> EntryPlan {
        let wait = nominal.saturating_sub(host.time_since_last_lick());
        if wait.is_zero() {
            EntryPlan::Skip
        } else {
            EntryPlan::Run(wait)
        }
    }

    fn on_lick(&mut self, host: &mut dyn EpochHost) {
        host.reset_timer();
    }

    fn on_exit(&mut self, host: &mut dyn EpochHost) {
        host.check_for_completion();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Punishment period after an abort. Licking restarts it.
#[derive(Debug, Default)]
pub struct Timeout;

impl PhaseBehavior for Timeout {
    fn on_lick(&mut self, host: &mut dyn EpochHost) {
        host.reset_timer();
    }

    fn on_exit(&mut self, host: &mut dyn EpochHost) {
        host.check_for_completion();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    enum Call {
        Outcome(Outcome),
        Reset,
        Timer(Duration),
        On,
        Off,
        Change,
        Check,
    }

    #[derive(Default)]
    struct FakeHost {
        catch: bool,
        since_lick: Duration,
        rewards: usize,
        changed: bool,
        calls: Vec<Call>,
    }

    impl EpochHost for FakeHost {
        fn now(&self) -> Duration {
            Duration::from_secs(10)
        }
        fn is_catch_trial(&self) -> bool {
            self.catch
        }
        fn time_since_last_lick(&self) -> Duration {
            self.since_lick
        }
        fn rewards_this_trial(&self) -> usize {
            self.rewards
        }
        fn change_observed(&self) -> bool {
            self.changed
        }
        fn report_outcome(&mut self, outcome: Outcome) {
            self.calls.push(Call::Outcome(outcome));
        }
        fn reset_timer(&mut self) {
            self.calls.push(Call::Reset);
        }
        fn start_timer(&mut self, delay: Duration) {
            self.calls.push(Call::Timer(delay));
        }
        fn stimulus_on(&mut self) {
            self.calls.push(Call::On);
        }
        fn stimulus_off(&mut self) {
            self.calls.push(Call::Off);
        }
        fn request_change(&mut self) {
            self.calls.push(Call::Change);
        }
        fn check_for_completion(&mut self) {
            self.calls.push(Call::Check);
        }
    }

    #[test]
    fn initial_blank_toggles_stimulus() {
        let mut host = FakeHost::default();
        let mut blank = InitialBlank;
        blank.on_entry(&mut host);
        blank.on_lick(&mut host);
        blank.on_exit(&mut host);
        assert_eq!(
            host.calls,
            vec![Call::Off, Call::Outcome(Outcome::EarlyResponse), Call::On]
        );
    }

    #[test]
    fn stimulus_window_ignores_licks_after_change() {
        let mut host = FakeHost::default();
        let mut window = StimulusWindow::default();
        window.apply_trial(&TrialParams::go(1.5));
        window.on_entry(&mut host);
        window.on_timer(&mut host);
        host.changed = true;
        window.on_lick(&mut host);
        assert_eq!(
            host.calls,
            vec![Call::Timer(Duration::from_millis(1500)), Call::Change]
        );
    }

    #[test]
    fn stimulus_window_without_change_time_arms_nothing() {
        let mut host = FakeHost::default();
        let mut window = StimulusWindow::default();
        window.apply_trial(&TrialParams::default());
        window.on_entry(&mut host);
        window.on_lick(&mut host);
        assert_eq!(host.calls, vec![Call::Outcome(Outcome::EarlyResponse)]);
    }

    #[test]
    fn zero_change_time_is_still_scheduled() {
        let mut host = FakeHost::default();
        let mut window = StimulusWindow::default();
        window.apply_trial(&TrialParams::go(0.0));
        window.on_entry(&mut host);
        assert_eq!(host.calls, vec![Call::Timer(Duration::ZERO)]);
    }

    #[test]
    fn go_response_window_hits_once() {
        let mut host = FakeHost::default();
        let mut window = ResponseWindow::default();
        window.on_entry(&mut host);
        window.on_lick(&mut host);
        window.on_lick(&mut host);
        window.on_exit(&mut host);
        assert!(window.is_rewarded());
        assert!(!window.is_available());
        assert_eq!(
            host.calls,
            vec![Call::Outcome(Outcome::Hit), Call::Check]
        );
    }

    #[test]
    fn go_response_window_without_lick_misses() {
        let mut host = FakeHost::default();
        let mut window = ResponseWindow::default();
        window.on_entry(&mut host);
        window.on_exit(&mut host);
        assert_eq!(host.calls, vec![Call::Outcome(Outcome::Miss), Call::Check]);
    }

    #[test]
    fn earlier_reward_suppresses_hit_and_miss() {
        let mut host = FakeHost {
            rewards: 1,
            ..FakeHost::default()
        };
        let mut window = ResponseWindow::default();
        window.on_entry(&mut host);
        assert!(window.is_rewarded());
        window.on_lick(&mut host);
        window.on_exit(&mut host);
        assert_eq!(host.calls, vec![Call::Check]);
    }

    #[test]
    fn catch_response_window_false_alarm_then_no_rejection() {
        let mut host = FakeHost {
            catch: true,
            ..FakeHost::default()
        };
        let mut window = ResponseWindow::default();
        window.on_entry(&mut host);
        window.on_lick(&mut host);
        window.on_lick(&mut host);
        window.on_exit(&mut host);
        assert!(window.had_false_alarm());
        assert_eq!(
            host.calls,
            vec![Call::Outcome(Outcome::FalseAlarm), Call::Check]
        );
    }

    #[test]
    fn catch_response_window_without_lick_is_rejection() {
        let mut host = FakeHost {
            catch: true,
            ..FakeHost::default()
        };
        let mut window = ResponseWindow::default();
        window.on_entry(&mut host);
        window.on_exit(&mut host);
        assert_eq!(
            host.calls,
            vec![Call::Outcome(Outcome::Rejection), Call::Check]
        );
    }

    #[test]
    fn no_lick_counts_quiet_time() {
        let nominal = Duration::from_secs(2);
        let mut host = FakeHost {
            since_lick: Duration::from_millis(500),
            ..FakeHost::default()
        };
        assert_eq!(
            NoLick.entry_plan(nominal, &host),
            EntryPlan::Run(Duration::from_millis(1500))
        );
        host.since_lick = Duration::from_secs(3);
        assert_eq!(NoLick.entry_plan(nominal, &host), EntryPlan::Skip);
        assert_eq!(NoLick.entry_plan(Duration::ZERO, &host), EntryPlan::Skip);
    }

    #[test]
    fn restart_phases_reset_on_lick() {
        let mut host = FakeHost::default();
        NoLick.on_lick(&mut host);
        Timeout.on_lick(&mut host);
        Timeout.on_exit(&mut host);
        assert_eq!(host.calls, vec![Call::Reset, Call::Reset, Call::Check]);
    }
}

//! Epochs: named, timed phases of a trial.
//!
//! An `Epoch` is one runtime type parameterized by a `PhaseBehavior`. The
//! behavior decides what entry, licks, private timers and exit mean for that
//! phase; the epoch itself only tracks state, timestamps and timers. Epochs
//! never hold a reference to the task. Behaviors reach the task through the
//! `EpochHost` capability handed to every hook.

use crate::common::{EpochId, TimerId};
use crate::scheduler::{Dispatcher, Lane};
use crate::trial::{Outcome, TrialParams};
use slotmap::{SecondaryMap, SlotMap};
use std::any::Any;
use std::time::Duration;

/// Timer payloads owned by the task's dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Signal {
    /// An epoch's duration elapsed.
    EpochExpired(EpochId),
    /// An epoch's entry delay elapsed.
    EpochDelayElapsed(EpochId),
    /// An epoch's private timer fired.
    EpochTimer(EpochId),
    /// The per-trial safety deadline passed.
    SafetyTimeout,
    /// The simulated stimulus reached a flash boundary.
    FlashBoundary,
    /// Start the next trial. Posted, so it runs before any timer.
    NextTrial,
}

/// Lifecycle state of an epoch.
///
/// `inactive → (pending) → active → inactive`. `Pending` covers both a
/// scheduled delayed entry and an epoch held for the next flash boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochState {
    Inactive,
    Pending,
    Active,
}

/// What an epoch should do when entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryPlan {
    /// Become active and exit after the given wait. Zero exits at once.
    Run(Duration),
    /// Exit immediately without ever becoming active.
    Skip,
}

/// The task-side capabilities available to phase behaviors.
pub trait EpochHost {
    /// Current session time.
    fn now(&self) -> Duration;
    fn is_catch_trial(&self) -> bool;
    /// Time since the most recent lick anywhere in the session.
    fn time_since_last_lick(&self) -> Duration;
    /// Rewards issued so far in the current trial.
    fn rewards_this_trial(&self) -> usize;
    /// A real or sham change has happened in the current trial.
    fn change_observed(&self) -> bool;

    /// Reports a terminal trial outcome.
    fn report_outcome(&mut self, outcome: Outcome);
    /// Restarts this epoch's exit timer for its full duration.
    fn reset_timer(&mut self);
    /// Arms this epoch's private timer. Re-arming replaces the previous one.
    fn start_timer(&mut self, delay: Duration);
    fn stimulus_on(&mut self);
    fn stimulus_off(&mut self);
    /// Asks the task to perform the trial's change at the next flash.
    fn request_change(&mut self);
    /// Ends the trial if nothing else is running.
    fn check_for_completion(&mut self);
}

/// Per-phase semantics of an epoch.
pub trait PhaseBehavior: Send {
    /// Called at trial setup with the new trial's parameters.
    fn apply_trial(&mut self, _params: &TrialParams) {}

    /// Decides how long the epoch stays active once entered.
    fn entry_plan(&self, nominal: Duration, _host: &dyn EpochHost) -> EntryPlan {
        EntryPlan::Run(nominal)
    }

    fn on_entry(&mut self, _host: &mut dyn EpochHost) {}

    /// Called for every lick while the epoch is active.
    fn on_lick(&mut self, _host: &mut dyn EpochHost) {}

    /// Called when the timer armed with `EpochHost::start_timer` fires.
    fn on_timer(&mut self, _host: &mut dyn EpochHost) {}

    fn on_exit(&mut self, _host: &mut dyn EpochHost) {}

    fn as_any(&self) -> &dyn Any;
}

/// A named phase of a trial.
pub struct Epoch {
    name: String,
    duration: Duration,
    delay: Duration,
    state: EpochState,
    entries: Vec<f64>,
    exits: Vec<f64>,
    exit_timer: Option<TimerId>,
    entry_timer: Option<TimerId>,
    private_timer: Option<TimerId>,
    behavior: Box<dyn PhaseBehavior>,
}

impl Epoch {
    pub fn new(
        name: impl Into<String>,
        duration: Duration,
        delay: Duration,
        behavior: Box<dyn PhaseBehavior>,
    ) -> Self {
        Self {
            name: name.into(),
            duration,
            delay,
            state: EpochState::Inactive,
            entries: Vec::new(),
            exits: Vec::new(),
            exit_timer: None,
            entry_timer: None,
            private_timer: None,
            behavior,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn state(&self) -> EpochState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == EpochState::Active
    }

    /// Entry times in session seconds.
    pub fn entries(&self) -> &[f64] {
        &self.entries
    }

    /// Exit times in session seconds.
    pub fn exits(&self) -> &[f64] {
        &self.exits
    }

    /// Downcasts the behavior, e.g. to inspect response-window flags.
    pub fn behavior<T: PhaseBehavior + 'static>(&self) -> Option<&T> {
        self.behavior.as_any().downcast_ref::<T>()
    }

    pub(crate) fn phase(&self) -> &dyn PhaseBehavior {
        self.behavior.as_ref()
    }

    pub(crate) fn behavior_mut(&mut self) -> &mut dyn PhaseBehavior {
        self.behavior.as_mut()
    }

    pub(crate) fn set_pending(&mut self) {
        self.state = EpochState::Pending;
    }

    pub(crate) fn schedule_entry(&mut self, id: EpochId, timers: &mut Dispatcher<Signal>) {
        if let Some(old) = self.entry_timer.take() {
            timers.cancel(old);
        }
        self.state = EpochState::Pending;
        self.entry_timer = Some(timers.schedule_once(self.delay, Lane::Task, Signal::EpochDelayElapsed(id)));
    }

    pub(crate) fn arm_exit(&mut self, id: EpochId, wait: Duration, timers: &mut Dispatcher<Signal>) {
        if let Some(old) = self.exit_timer.take() {
            timers.cancel(old);
        }
        self.exit_timer = Some(timers.schedule_once(wait, Lane::Task, Signal::EpochExpired(id)));
    }

    pub(crate) fn arm_private(&mut self, id: EpochId, delay: Duration, timers: &mut Dispatcher<Signal>) {
        if let Some(old) = self.private_timer.take() {
            timers.cancel(old);
        }
        self.private_timer = Some(timers.schedule_once(delay, Lane::Task, Signal::EpochTimer(id)));
    }

    /// Clears the bookkeeping of a timer that has just fired.
    pub(crate) fn timer_fired(&mut self, signal: Signal) {
        match signal {
            Signal::EpochExpired(_) => self.exit_timer = None,
            Signal::EpochDelayElapsed(_) => self.entry_timer = None,
            Signal::EpochTimer(_) => self.private_timer = None,
            _ => {}
        }
    }

    /// Cancels every timer and marks the epoch inactive.
    pub(crate) fn stop(&mut self, timers: &mut Dispatcher<Signal>) {
        for timer in [
            self.exit_timer.take(),
            self.entry_timer.take(),
            self.private_timer.take(),
        ]
        .into_iter()
        .flatten()
        {
            timers.cancel(timer);
        }
        self.state = EpochState::Inactive;
    }

    pub(crate) fn mark_active(&mut self, at: f64) {
        self.state = EpochState::Active;
        self.entries.push(at);
    }

    pub(crate) fn record_exit(&mut self, at: f64) {
        self.exits.push(at);
    }
}

/// The task's epoch registry and its set of currently active epochs.
///
/// Membership of the active set only changes through `activate` and
/// `deactivate`, which keep it in step with each epoch's own state.
#[derive(Default)]
pub struct EpochSet {
    epochs: SlotMap<EpochId, Epoch>,
    order: Vec<EpochId>,
    active: Vec<EpochId>,
    chains: SecondaryMap<EpochId, EpochId>,
}

impl EpochSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, epoch: Epoch) -> EpochId {
        let id = self.epochs.insert(epoch);
        self.order.push(id);
        id
    }

    pub fn get(&self, id: EpochId) -> Option<&Epoch> {
        self.epochs.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: EpochId) -> Option<&mut Epoch> {
        self.epochs.get_mut(id)
    }

    /// Looks an epoch up by name.
    pub fn find(&self, name: &str) -> Option<EpochId> {
        self.order
            .iter()
            .copied()
            .find(|id| self.epochs[*id].name() == name)
    }

    /// All epochs, in registration order.
    pub fn ids(&self) -> &[EpochId] {
        &self.order
    }

    /// Currently active epochs, in activation order.
    pub fn active(&self) -> &[EpochId] {
        &self.active
    }

    pub fn is_active(&self, id: EpochId) -> bool {
        self.active.contains(&id)
    }

    /// `true` if any epoch is active or waiting to become active.
    pub fn any_running(&self) -> bool {
        !self.active.is_empty()
            || self
                .epochs
                .values()
                .any(|e| e.state() == EpochState::Pending)
    }

    pub(crate) fn activate(&mut self, id: EpochId, at: f64) {
        if let Some(epoch) = self.epochs.get_mut(id) {
            epoch.mark_active(at);
            if !self.active.contains(&id) {
                self.active.push(id);
            }
        }
    }

    pub(crate) fn deactivate(&mut self, id: EpochId, timers: &mut Dispatcher<Signal>) {
        if let Some(epoch) = self.epochs.get_mut(id) {
            epoch.stop(timers);
        }
        self.active.retain(|a| *a != id);
    }

    /// When `from` ends, enter `to`.
    pub fn chain(&mut self, from: EpochId, to: EpochId) {
        self.chains.insert(from, to);
    }

    pub fn successor(&self, id: EpochId) -> Option<EpochId> {
        self.chains.get(id).copied()
    }

    /// Sum of all nominal durations.
    pub fn total_duration(&self) -> Duration {
        self.epochs.values().map(Epoch::duration).sum()
    }
}

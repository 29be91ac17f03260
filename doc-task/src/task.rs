//! The Detection-of-Change task controller.
//!
//! `DocTask` owns the epochs, the trial generator, the current trial and the
//! trial log. It is driven from outside: a driver feeds it `Input`s and
//! advances its clock with `advance_to`, and every state change happens
//! inside one of those calls, run to completion.
//!
//! A trial runs `initial_blank → pre_change → stimulus_window → no_lick`.
//! The stimulus window's change timer triggers `change`, which opens the
//! response window (immediately or at the next flash). Outcomes are
//! arbitrated here: the first outcome reported in a trial is final.

use crate::common::{duration_to_secs, secs_to_duration, EpochId, TimerId};
use crate::components::epoch::{
    EntryPlan, Epoch, EpochHost, EpochSet, EpochState, PhaseBehavior, Signal,
};
use crate::components::generator::TrialGenerator;
use crate::components::phases::{
    self, InitialBlank, NoLick, PreChange, ResponseWindow, StimulusWindow, Timeout,
};
use crate::config::TaskConfig;
use crate::error::ConfigError;
use crate::events::{CloseReason, Input, TaskEvent};
use crate::scheduler::{Dispatcher, Lane};
use crate::sink::TrialSink;
use crate::surfaces::{RewardLine, Stimulus};
use crate::time::{FrameClock, Timepoint};
use crate::trial::{
    ChangeEvent, ChangeRecord, Direction, EndReason, EventEntry, Outcome, TrialParams, TrialRecord,
};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Work deferred to the next flash boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashAction {
    EnterEpoch(EpochId),
    ShamChange,
    StartNextTrial,
}

#[derive(Debug, Clone, Copy)]
enum Hook {
    Entry,
    Lick,
    Timer,
    Exit,
}

/// A request made by a phase behavior, applied by the task after the hook
/// returns.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Directive {
    Report(Outcome),
    ResetTimer,
    StartTimer(Duration),
    StimulusOn,
    StimulusOff,
    RequestChange,
    CheckCompletion,
}

/// In-flight state of the current trial.
#[derive(Debug, Default)]
struct TrialState {
    index: u64,
    params: TrialParams,
    outcome: Option<Outcome>,
    aborted: bool,
    change_observed: bool,
    started_at: Duration,
    events: Vec<EventEntry>,
    licks: Vec<Timepoint>,
    rewards: Vec<Timepoint>,
    changes: Vec<ChangeRecord>,
}

/// The `EpochHost` handed to behavior hooks.
struct Host<'a> {
    now: Duration,
    trial: &'a TrialState,
    last_lick: Duration,
    directives: Vec<Directive>,
}

impl<'a> Host<'a> {
    fn new(now: Duration, trial: &'a TrialState, last_lick: Duration) -> Self {
        Self {
            now,
            trial,
            last_lick,
            directives: Vec::new(),
        }
    }
}

impl EpochHost for Host<'_> {
    fn now(&self) -> Duration {
        self.now
    }

    fn is_catch_trial(&self) -> bool {
        self.trial.params.catch
    }

    fn time_since_last_lick(&self) -> Duration {
        self.now.saturating_sub(self.last_lick)
    }

    fn rewards_this_trial(&self) -> usize {
        self.trial.rewards.len()
    }

    fn change_observed(&self) -> bool {
        self.trial.change_observed
    }

    fn report_outcome(&mut self, outcome: Outcome) {
        self.directives.push(Directive::Report(outcome));
    }

    fn reset_timer(&mut self) {
        self.directives.push(Directive::ResetTimer);
    }

    fn start_timer(&mut self, delay: Duration) {
        self.directives.push(Directive::StartTimer(delay));
    }

    fn stimulus_on(&mut self) {
        self.directives.push(Directive::StimulusOn);
    }

    fn stimulus_off(&mut self) {
        self.directives.push(Directive::StimulusOff);
    }

    fn request_change(&mut self) {
        self.directives.push(Directive::RequestChange);
    }

    fn check_for_completion(&mut self) {
        self.directives.push(Directive::CheckCompletion);
    }
}

/// The Detection-of-Change task.
pub struct DocTask {
    config: TaskConfig,
    timers: Dispatcher<Signal>,
    frames: FrameClock,
    epochs: EpochSet,
    starting_epoch: Option<EpochId>,
    response_window: EpochId,
    timeout: EpochId,
    stimulus: Box<dyn Stimulus>,
    reward_line: Option<Box<dyn RewardLine>>,
    generator: Box<dyn TrialGenerator>,
    sinks: Vec<Box<dyn TrialSink>>,
    trial: TrialState,
    trial_open: bool,
    trial_log: Vec<TrialRecord>,
    trial_count: u64,
    flash_queue: VecDeque<FlashAction>,
    flash_timer: Option<TimerId>,
    safety_timer: Option<TimerId>,
    last_lick: Duration,
    cumulative_volume: f64,
    cumulative_rewards: u64,
    events: Vec<TaskEvent>,
    started: bool,
    closed: Option<CloseReason>,
}

impl DocTask {
    /// Builds a task with the six standard epochs.
    ///
    /// Fails if `config` does not validate. A missing reward line is allowed;
    /// rewards are then only logged.
    pub fn new(
        config: &TaskConfig,
        stimulus: Box<dyn Stimulus>,
        reward_line: Option<Box<dyn RewardLine>>,
        generator: Box<dyn TrialGenerator>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut epochs = EpochSet::new();
        let secs = secs_to_duration;
        let blank = epochs.insert(Epoch::new(
            phases::INITIAL_BLANK,
            secs(config.initial_blank),
            Duration::ZERO,
            Box::new(InitialBlank),
        ));
        let pre_change = epochs.insert(Epoch::new(
            phases::PRE_CHANGE,
            secs(config.pre_change_time),
            Duration::ZERO,
            Box::new(PreChange),
        ));
        let stimulus_window = epochs.insert(Epoch::new(
            phases::STIMULUS_WINDOW,
            secs(config.stimulus_window),
            Duration::ZERO,
            Box::new(StimulusWindow::default()),
        ));
        let response_window = epochs.insert(Epoch::new(
            phases::RESPONSE_WINDOW,
            config.response_window_duration(),
            config.response_window_delay(),
            Box::new(ResponseWindow::default()),
        ));
        let no_lick = epochs.insert(Epoch::new(
            phases::NO_LICK,
            secs(config.min_no_lick_time),
            Duration::ZERO,
            Box::new(NoLick),
        ));
        let timeout = epochs.insert(Epoch::new(
            phases::TIMEOUT,
            secs(config.timeout_duration),
            Duration::ZERO,
            Box::new(Timeout),
        ));
        epochs.chain(blank, pre_change);
        epochs.chain(pre_change, stimulus_window);
        epochs.chain(stimulus_window, no_lick);

        Ok(Self {
            config: config.clone(),
            timers: Dispatcher::new(),
            frames: FrameClock::new(config.update_rate_hz),
            epochs,
            starting_epoch: Some(blank),
            response_window,
            timeout,
            stimulus,
            reward_line,
            generator,
            sinks: Vec::new(),
            trial: TrialState::default(),
            trial_open: false,
            trial_log: Vec::new(),
            trial_count: 0,
            flash_queue: VecDeque::new(),
            flash_timer: None,
            safety_timer: None,
            last_lick: Duration::ZERO,
            cumulative_volume: 0.0,
            cumulative_rewards: 0,
            events: Vec::new(),
            started: false,
            closed: None,
        })
    }
}

// Driver interface.
impl DocTask {
    /// Starts the session and the first trial. Calling it again is a no-op.
    pub fn start(&mut self) {
        if self.started || self.closed.is_some() {
            return;
        }
        self.started = true;
        info!(
            expected_trial_s = duration_to_secs(self.expected_trial_duration()),
            "Session started."
        );
        self.events.push(TaskEvent::SessionStarted);
        if let Some(period) = self.stimulus.flash_period() {
            self.flash_timer = Some(self.timers.schedule_every(
                period,
                Lane::Collaborator,
                Signal::FlashBoundary,
            ));
        }
        self.next_trial();
    }

    /// Delivers an external event at the current time.
    pub fn handle_input(&mut self, input: Input) {
        if self.closed.is_some() {
            trace!(?input, "Session closed, input dropped.");
            return;
        }
        match input {
            Input::Lick => self.on_lick(),
            Input::FlashStarted => self.on_flash(),
            Input::StimulusChanged(change) => self.on_stimulus_changed(change),
            Input::Abort => self.abort(),
        }
    }

    /// Runs every timer due up to `until`, then moves the clock there.
    pub fn advance_to(&mut self, until: Duration) {
        while let Some(signal) = self.timers.pop_due(until) {
            self.dispatch(signal);
        }
        self.timers.advance_to(until);
    }

    /// The session time of the next scheduled timer.
    pub fn next_deadline(&mut self) -> Option<Duration> {
        self.timers.next_deadline()
    }

    /// Current session time.
    pub fn now(&self) -> Duration {
        self.timers.now()
    }

    /// Takes the notifications emitted since the last call.
    pub fn drain_events(&mut self) -> Vec<TaskEvent> {
        std::mem::take(&mut self.events)
    }

    /// Stops the session. A running trial is finalized first.
    pub fn close(&mut self, reason: CloseReason) {
        if self.closed.is_some() {
            return;
        }
        info!(?reason, trials = self.trial_count, "Closing session.");
        self.closed = Some(reason.clone());
        if self.trial_open {
            self.end_trial(EndReason::Closed);
        }
        if let Some(timer) = self.flash_timer.take() {
            self.timers.cancel(timer);
        }
        self.kill_all_epochs();
        self.flash_queue.clear();
        for sink in &mut self.sinks {
            if let Err(err) = sink.flush() {
                error!(error = %err, "Failed to flush trial sink.");
            }
        }
        self.events.push(TaskEvent::SessionClosed { reason });
    }

    fn dispatch(&mut self, signal: Signal) {
        trace!(?signal, "Dispatching.");
        match signal {
            Signal::EpochExpired(id) => {
                if let Some(epoch) = self.epochs.get_mut(id) {
                    epoch.timer_fired(signal);
                }
                if self.epochs.is_active(id) {
                    self.exit_epoch(id);
                }
            }
            Signal::EpochDelayElapsed(id) => {
                let pending = match self.epochs.get_mut(id) {
                    Some(epoch) => {
                        epoch.timer_fired(signal);
                        epoch.state() == EpochState::Pending
                    }
                    None => false,
                };
                if pending {
                    self.enter_epoch(id, true);
                }
            }
            Signal::EpochTimer(id) => {
                if let Some(epoch) = self.epochs.get_mut(id) {
                    epoch.timer_fired(signal);
                }
                if self.epochs.is_active(id) {
                    self.run_hook(id, Hook::Timer);
                }
            }
            Signal::SafetyTimeout => {
                self.safety_timer = None;
                self.end_trial(EndReason::SafetyTimeout);
            }
            Signal::FlashBoundary => self.on_flash(),
            Signal::NextTrial => self.next_trial(),
        }
    }
}

// Setup and inspection.
impl DocTask {
    /// Replaces the trial generator. The new generator is reset first.
    pub fn set_trial_generator(&mut self, mut generator: Box<dyn TrialGenerator>) {
        generator.reset();
        self.generator = generator;
    }

    pub fn set_reward_line(&mut self, reward_line: Box<dyn RewardLine>) {
        self.reward_line = Some(reward_line);
    }

    pub fn add_sink(&mut self, sink: Box<dyn TrialSink>) {
        self.sinks.push(sink);
    }

    /// Registers a custom epoch. Times are in seconds.
    pub fn add_epoch(
        &mut self,
        name: impl Into<String>,
        duration: f64,
        delay: f64,
        behavior: Box<dyn PhaseBehavior>,
    ) -> EpochId {
        self.epochs.insert(Epoch::new(
            name,
            secs_to_duration(duration),
            secs_to_duration(delay),
            behavior,
        ))
    }

    /// When `from` exits, `to` is entered.
    pub fn chain(&mut self, from: EpochId, to: EpochId) {
        self.epochs.chain(from, to);
    }

    /// The epoch each trial starts with.
    pub fn set_starting_epoch(&mut self, id: EpochId) {
        self.starting_epoch = Some(id);
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    pub fn epochs(&self) -> &EpochSet {
        &self.epochs
    }

    /// Looks up an epoch by name.
    pub fn epoch(&self, name: &str) -> Option<&Epoch> {
        self.epochs.find(name).and_then(|id| self.epochs.get(id))
    }

    /// Finalized trials, oldest first.
    pub fn trial_log(&self) -> &[TrialRecord] {
        &self.trial_log
    }

    /// Number of finalized trials.
    pub fn trial_count(&self) -> u64 {
        self.trial_count
    }

    /// Index of the running trial, if one is running.
    pub fn current_trial(&self) -> Option<u64> {
        self.trial_open.then_some(self.trial.index)
    }

    /// Parameters of the running trial.
    pub fn current_params(&self) -> Option<&TrialParams> {
        self.trial_open.then_some(&self.trial.params)
    }

    /// Outcome recorded so far in the running trial.
    pub fn current_outcome(&self) -> Option<Outcome> {
        if self.trial_open {
            self.trial.outcome
        } else {
            None
        }
    }

    pub fn is_catch_trial(&self) -> bool {
        self.trial_open && self.trial.params.catch
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_some()
    }

    pub fn close_reason(&self) -> Option<&CloseReason> {
        self.closed.as_ref()
    }

    pub fn cumulative_volume(&self) -> f64 {
        self.cumulative_volume
    }

    pub fn cumulative_rewards(&self) -> u64 {
        self.cumulative_rewards
    }

    /// Sum of the nominal durations of every registered epoch.
    pub fn expected_trial_duration(&self) -> Duration {
        self.epochs.total_duration()
    }

    /// Actions waiting for the next flash boundary.
    pub fn flash_queue(&self) -> impl Iterator<Item = &FlashAction> {
        self.flash_queue.iter()
    }
}

// Epoch transitions.
impl DocTask {
    /// Enters an epoch.
    ///
    /// Unless `immediately`, an epoch with an entry delay becomes pending and
    /// is entered when the delay elapses. Entering an active epoch is ignored.
    pub fn enter_epoch(&mut self, id: EpochId, immediately: bool) {
        let now = self.timers.now();
        let Some(epoch) = self.epochs.get_mut(id) else {
            return;
        };
        if epoch.is_active() {
            debug!(epoch = epoch.name(), "Epoch already active.");
            return;
        }
        if !immediately && !epoch.delay().is_zero() {
            debug!(epoch = epoch.name(), delay = ?epoch.delay(), "Epoch pending.");
            epoch.schedule_entry(id, &mut self.timers);
            return;
        }

        let plan = {
            let host = Host::new(now, &self.trial, self.last_lick);
            epoch.phase().entry_plan(epoch.duration(), &host)
        };
        let wait = match plan {
            EntryPlan::Skip => {
                debug!(epoch = epoch.name(), "Epoch skipped.");
                self.finish_epoch(id);
                return;
            }
            EntryPlan::Run(wait) => wait,
        };

        self.epochs.activate(id, duration_to_secs(now));
        self.run_hook(id, Hook::Entry);
        let name = self.epoch_name(id);
        debug!(epoch = %name, "Entering epoch.");
        self.log_event(&name, Direction::Enter);
        self.events.push(TaskEvent::EpochEntered {
            name,
            at: duration_to_secs(now),
        });

        if !self.epochs.is_active(id) {
            return;
        }
        if wait.is_zero() {
            self.exit_epoch(id);
        } else if let Some(epoch) = self.epochs.get_mut(id) {
            epoch.arm_exit(id, wait, &mut self.timers);
        }
    }

    /// Ends an active or pending epoch: cancels its timers, logs the exit,
    /// enters its successor, then runs its exit hook. An inactive epoch is
    /// left alone.
    pub fn exit_epoch(&mut self, id: EpochId) {
        match self.epochs.get(id).map(Epoch::state) {
            Some(EpochState::Active | EpochState::Pending) => self.finish_epoch(id),
            Some(EpochState::Inactive) => {
                trace!(epoch = %self.epoch_name(id), "Epoch not running, exit ignored.");
            }
            None => {}
        }
    }

    /// The exit path, also taken by an epoch that skips its entry.
    fn finish_epoch(&mut self, id: EpochId) {
        let now = self.timers.now();
        if self.epochs.get(id).is_none() {
            return;
        }
        self.epochs.deactivate(id, &mut self.timers);
        if let Some(epoch) = self.epochs.get_mut(id) {
            epoch.record_exit(duration_to_secs(now));
        }
        let name = self.epoch_name(id);
        debug!(epoch = %name, "Exiting epoch.");
        self.log_event(&name, Direction::Exit);
        self.events.push(TaskEvent::EpochExited {
            name,
            at: duration_to_secs(now),
        });
        if let Some(next) = self.epochs.successor(id) {
            self.enter_epoch(next, false);
        }
        self.run_hook(id, Hook::Exit);
    }

    /// Restarts an active epoch's exit timer for its full duration.
    pub fn reset_epoch(&mut self, id: EpochId) {
        if !self.epochs.is_active(id) {
            return;
        }
        if let Some(epoch) = self.epochs.get_mut(id) {
            let duration = epoch.duration();
            epoch.arm_exit(id, duration, &mut self.timers);
        }
    }

    /// Stops an epoch without hooks or notifications.
    pub fn kill_epoch(&mut self, id: EpochId) {
        self.epochs.deactivate(id, &mut self.timers);
    }

    /// Marks an epoch pending with no timer. It stays pending until entered.
    pub fn hold_epoch(&mut self, id: EpochId) {
        if let Some(epoch) = self.epochs.get_mut(id) {
            if !epoch.is_active() {
                epoch.set_pending();
            }
        }
    }

    fn kill_all_epochs(&mut self) {
        for id in self.epochs.ids().to_vec() {
            self.epochs.deactivate(id, &mut self.timers);
        }
    }

    fn epoch_name(&self, id: EpochId) -> String {
        self.epochs
            .get(id)
            .map(|e| e.name().to_string())
            .unwrap_or_default()
    }

    fn run_hook(&mut self, id: EpochId, hook: Hook) {
        let directives = {
            let mut host = Host::new(self.timers.now(), &self.trial, self.last_lick);
            let Some(epoch) = self.epochs.get_mut(id) else {
                return;
            };
            let behavior = epoch.behavior_mut();
            match hook {
                Hook::Entry => behavior.on_entry(&mut host),
                Hook::Lick => behavior.on_lick(&mut host),
                Hook::Timer => behavior.on_timer(&mut host),
                Hook::Exit => behavior.on_exit(&mut host),
            }
            host.directives
        };
        for directive in directives {
            self.apply(id, directive);
        }
    }

    fn apply(&mut self, id: EpochId, directive: Directive) {
        match directive {
            Directive::Report(outcome) => self.report_outcome(outcome),
            Directive::ResetTimer => self.reset_epoch(id),
            Directive::StartTimer(delay) => {
                if self.epochs.is_active(id) {
                    if let Some(epoch) = self.epochs.get_mut(id) {
                        epoch.arm_private(id, delay, &mut self.timers);
                    }
                }
            }
            Directive::StimulusOn => self.stimulus.on(),
            Directive::StimulusOff => self.stimulus.off(),
            Directive::RequestChange => self.change(true),
            Directive::CheckCompletion => self.check_for_completion(),
        }
    }
}

// Trial flow.
impl DocTask {
    fn next_trial(&mut self) {
        if self.closed.is_some() {
            return;
        }
        let params = match self.generator.next_trial(&self.trial_log) {
            Ok(Some(params)) => params,
            Ok(None) => {
                info!("Trial sequence exhausted.");
                self.close(CloseReason::SequenceExhausted);
                return;
            }
            Err(err) => {
                error!(error = %err, "Trial generator failed.");
                self.close(CloseReason::GeneratorFailed(err.to_string()));
                return;
            }
        };
        if let Err(err) = params.validate() {
            error!(error = %err, "Trial generator produced invalid parameters.");
            self.close(CloseReason::GeneratorFailed(err.to_string()));
            return;
        }

        let now = self.timers.now();
        self.trial = TrialState {
            index: self.trial_count,
            params,
            started_at: now,
            ..TrialState::default()
        };
        self.trial_open = true;
        for id in self.epochs.ids().to_vec() {
            if let Some(epoch) = self.epochs.get_mut(id) {
                epoch.behavior_mut().apply_trial(&self.trial.params);
            }
        }
        info!(
            trial = self.trial.index,
            catch = self.trial.params.catch,
            change_time = ?self.trial.params.change_time,
            auto_reward = self.trial.params.auto_reward,
            "Starting trial."
        );
        self.events.push(TaskEvent::TrialStarted {
            index: self.trial.index,
            catch: self.trial.params.catch,
        });

        let safety = secs_to_duration(self.config.safety_timer_padding) + self.expected_trial_duration();
        self.safety_timer = Some(
            self.timers
                .schedule_once(safety, Lane::Task, Signal::SafetyTimeout),
        );

        match self.starting_epoch {
            Some(start) => self.enter_epoch(start, false),
            None => self.check_for_completion(),
        }
    }

    /// `true` when no epoch is active or pending and nothing waits for a
    /// flash.
    pub fn is_trial_finished(&self) -> bool {
        !self.epochs.any_running() && self.flash_queue.is_empty()
    }

    /// Ends the running trial if it is finished.
    pub fn check_for_completion(&mut self) {
        if self.trial_open && self.is_trial_finished() {
            self.end_trial(EndReason::Completed);
        }
    }

    fn end_trial(&mut self, reason: EndReason) {
        if !self.trial_open {
            return;
        }
        self.trial_open = false;
        if let Some(timer) = self.safety_timer.take() {
            self.timers.cancel(timer);
        }
        if reason == EndReason::SafetyTimeout {
            warn!(trial = self.trial.index, "Safety timer fired, forcing the trial to end.");
            self.log_event("safety_timer", Direction::None);
            self.events.push(TaskEvent::SafetyTimerFired {
                index: self.trial.index,
            });
        }
        self.kill_all_epochs();
        self.flash_queue.clear();
        self.stimulus.clear_changes();

        let record = self.finalize_trial(reason);
        info!(
            trial = record.index,
            outcome = ?record.outcome,
            licks = record.licks.len(),
            "Trial ended."
        );
        self.events.push(TaskEvent::TrialEnded {
            index: record.index,
            outcome: record.outcome,
        });
        for sink in &mut self.sinks {
            if let Err(err) = sink.publish(&record) {
                error!(trial = record.index, error = %err, "Failed to publish trial.");
            }
        }
        self.trial_log.push(record);
        self.trial_count += 1;

        if self.closed.is_some() {
            return;
        }
        if let Some(reason) = self.limit_reached() {
            self.close(reason);
            return;
        }
        if self.stimulus.is_flashing() {
            self.flash_queue.push_back(FlashAction::StartNextTrial);
        } else {
            self.timers.post(Signal::NextTrial);
        }
    }

    fn limit_reached(&self) -> Option<CloseReason> {
        if self.timers.now() > self.config.max_task_duration() {
            return Some(CloseReason::MaxDuration);
        }
        match self.config.volume_limit {
            Some(limit) if self.cumulative_volume >= limit => Some(CloseReason::VolumeLimit),
            _ => None,
        }
    }

    fn finalize_trial(&mut self, ended_by: EndReason) -> TrialRecord {
        let trial = std::mem::take(&mut self.trial);
        TrialRecord {
            index: trial.index,
            success: trial.outcome.map(Outcome::is_success),
            outcome: trial.outcome,
            params: trial.params,
            aborted: trial.aborted,
            ended_by,
            started_at: duration_to_secs(trial.started_at),
            ended_at: duration_to_secs(self.timers.now()),
            events: trial.events,
            licks: trial.licks,
            rewards: trial.rewards,
            stimulus_changes: trial.changes,
            cumulative_volume: self.cumulative_volume,
            cumulative_rewards: self.cumulative_rewards,
        }
    }

    fn log_event(&mut self, name: &str, direction: Direction) {
        let Timepoint { time, frame } = self.frames.timepoint(self.timers.now());
        self.trial.events.push(EventEntry {
            name: name.to_string(),
            direction,
            time,
            frame,
        });
    }
}

// Outcomes, changes and licks.
impl DocTask {
    /// Records the trial's outcome and runs its handler.
    ///
    /// Only the first outcome of a trial counts; later reports are logged
    /// and dropped.
    pub fn report_outcome(&mut self, outcome: Outcome) {
        if !self.trial_open {
            debug!(%outcome, "No trial running, outcome dropped.");
            return;
        }
        if let Some(first) = self.trial.outcome {
            warn!(
                trial = self.trial.index,
                %first,
                ignored = %outcome,
                "Trial already has an outcome."
            );
            return;
        }
        self.trial.outcome = Some(outcome);
        self.log_event(outcome.as_str(), Direction::None);
        info!(trial = self.trial.index, %outcome, "Outcome recorded.");
        self.events.push(TaskEvent::OutcomeRecorded {
            index: self.trial.index,
            outcome,
        });

        match outcome {
            Outcome::Abort | Outcome::EarlyResponse => self.abort_trial(),
            Outcome::Hit => self.issue_reward(self.config.reward_volume),
            Outcome::AutoReward => self.issue_reward(self.config.auto_reward_volume),
            Outcome::Miss | Outcome::Rejection | Outcome::FalseAlarm => {}
        }
    }

    /// Operator abort of the running trial.
    pub fn abort(&mut self) {
        self.report_outcome(Outcome::Abort);
    }

    fn abort_trial(&mut self) {
        self.kill_all_epochs();
        self.flash_queue.clear();
        self.stimulus.clear_changes();
        self.trial.aborted = true;
        self.log_event("abort", Direction::None);
        self.events.push(TaskEvent::Aborted {
            index: self.trial.index,
        });
        self.enter_epoch(self.timeout, false);
    }

    fn issue_reward(&mut self, volume: f64) {
        match self.reward_line.as_mut() {
            Some(line) => line.reward(Some(volume)),
            None => warn!("virtual reward line"),
        }
        let at = self.frames.timepoint(self.timers.now());
        self.trial.rewards.push(at);
        self.cumulative_volume += volume;
        self.cumulative_rewards += 1;
        info!(
            volume,
            total = self.cumulative_volume,
            count = self.cumulative_rewards,
            "Reward issued."
        );
        self.events.push(TaskEvent::RewardIssued { volume });
    }

    /// Performs the trial's change.
    ///
    /// With `next_flash_start` on a flashing stimulus, the response window
    /// is held and the change is deferred to the next flash boundary.
    /// Otherwise both happen now. Catch trials get a sham change instead of
    /// a real one.
    pub fn change(&mut self, next_flash_start: bool) {
        if !self.trial_open {
            debug!("No trial running, change ignored.");
            return;
        }
        let catch = self.trial.params.catch;
        let window = self.response_window;
        if next_flash_start && self.stimulus.is_flashing() {
            debug!(catch, "Change deferred to the next flash.");
            self.hold_epoch(window);
            self.flash_queue.push_back(FlashAction::EnterEpoch(window));
            if catch {
                self.flash_queue.push_back(FlashAction::ShamChange);
            } else if let Some(change) = self.stimulus.change(true) {
                self.on_stimulus_changed(change);
            }
        } else {
            self.enter_epoch(window, false);
            if catch {
                self.sham_change();
            } else if let Some(change) = self.stimulus.change(false) {
                self.on_stimulus_changed(change);
            }
        }
    }

    fn sham_change(&mut self) {
        if !self.trial_open {
            return;
        }
        debug!(trial = self.trial.index, "Sham change.");
        self.trial.change_observed = true;
        self.log_event("sham_change", Direction::None);
        self.events.push(TaskEvent::ShamChange {
            index: self.trial.index,
        });
    }

    fn on_stimulus_changed(&mut self, change: ChangeEvent) {
        if !self.trial_open {
            debug!(?change, "Stimulus changed between trials.");
            return;
        }
        info!(from = %change.from, to = %change.to, "Stimulus changed.");
        let at = self.frames.timepoint(self.timers.now());
        self.trial.changes.push(ChangeRecord {
            from: change.from,
            to: change.to,
            at,
        });
        self.trial.change_observed = true;
        self.log_event("stimulus_changed", Direction::None);
        self.events.push(TaskEvent::StimulusChanged {
            index: self.trial.index,
        });
        if self.trial.params.auto_reward {
            self.report_outcome(Outcome::AutoReward);
        }
    }

    fn on_lick(&mut self) {
        let now = self.timers.now();
        self.last_lick = now;
        if !self.trial_open {
            trace!("Lick between trials.");
            return;
        }
        self.trial.licks.push(self.frames.timepoint(now));
        let index = self.trial.index;
        for id in self.epochs.active().to_vec() {
            if !self.trial_open || self.trial.index != index || !self.epochs.is_active(id) {
                continue;
            }
            self.run_hook(id, Hook::Lick);
        }
    }

    fn on_flash(&mut self) {
        let actions: Vec<_> = self.flash_queue.drain(..).collect();
        for action in actions {
            trace!(?action, "Flash action.");
            match action {
                FlashAction::EnterEpoch(id) => self.enter_epoch(id, false),
                FlashAction::ShamChange => self.sham_change(),
                FlashAction::StartNextTrial => self.next_trial(),
            }
        }
        if let Some(change) = self.stimulus.flash_started() {
            self.on_stimulus_changed(change);
        }
    }
}

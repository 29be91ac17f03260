//! Headless sessions in virtual time.
//!
//! A `Simulation` drives a `DocTask` with a synthetic subject instead of a
//! lick sensor. The subject licks spontaneously at a Poisson rate and, with
//! some probability, responds to real and sham changes after a reaction time.
//! Time jumps straight from one event to the next, so an hour-long session
//! runs in milliseconds.

use crate::common::secs_to_duration;
use crate::config::SubjectConfig;
use crate::events::{CloseReason, Input, TaskEvent};
use crate::summary::SessionSummary;
use crate::task::DocTask;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Duration;
use tracing::{debug, info};

/// The simulated animal.
pub struct SyntheticSubject {
    config: SubjectConfig,
    rng: StdRng,
    licks: BinaryHeap<Reverse<Duration>>,
    next_spontaneous: Option<Duration>,
}

impl SyntheticSubject {
    pub fn new(config: SubjectConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            config,
            rng,
            licks: BinaryHeap::new(),
            next_spontaneous: None,
        }
    }

    /// Time of the subject's next lick, if it will ever lick again.
    pub fn next_lick(&self) -> Option<Duration> {
        let planned = self.licks.peek().map(|Reverse(t)| *t);
        match (planned, self.next_spontaneous) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Consumes the lick at `at`, scheduling the next spontaneous one if it
    /// was spontaneous.
    fn take_lick(&mut self, at: Duration) {
        if self.licks.peek().is_some_and(|Reverse(t)| *t == at) {
            self.licks.pop();
        } else if self.next_spontaneous == Some(at) {
            self.schedule_spontaneous(at);
        }
    }

    fn schedule_spontaneous(&mut self, from: Duration) {
        let rate = self.config.lick_rate_hz;
        self.next_spontaneous = (rate > 0.0).then(|| {
            let u: f64 = self.rng.random();
            from + secs_to_duration(-(1.0 - u).ln() / rate)
        });
    }

    /// Decides whether to respond to a change seen at `now`.
    fn observe_change(&mut self, now: Duration, sham: bool) {
        let p = if sham {
            self.config.false_alarm_probability
        } else {
            self.config.hit_probability
        };
        if self.rng.random::<f64>() >= p {
            return;
        }
        let [min, max] = self.config.reaction_time;
        let reaction = if max > min {
            self.rng.random_range(min..=max)
        } else {
            min
        };
        let at = now + secs_to_duration(reaction);
        debug!(sham, at = ?at, "Subject will respond.");
        self.licks.push(Reverse(at));
    }
}

/// A task plus a synthetic subject, run in virtual time.
pub struct Simulation {
    task: DocTask,
    subject: SyntheticSubject,
    events: Vec<TaskEvent>,
}

impl Simulation {
    pub fn new(task: DocTask, subject: SyntheticSubject) -> Self {
        Self {
            task,
            subject,
            events: Vec::new(),
        }
    }

    pub fn task(&self) -> &DocTask {
        &self.task
    }

    /// Every notification the task emitted, in order.
    pub fn events(&self) -> &[TaskEvent] {
        &self.events
    }

    /// Runs until the session closes or `limit` of session time has passed.
    pub fn run(&mut self, limit: Duration) -> SessionSummary {
        let started = Utc::now();
        self.subject.schedule_spontaneous(Duration::ZERO);
        self.task.start();
        self.collect_events();

        while !self.task.is_closed() {
            let timer = self.task.next_deadline();
            let lick = self.subject.next_lick();
            let next = match (timer, lick) {
                (Some(t), Some(l)) => t.min(l),
                (t, l) => match t.or(l) {
                    Some(next) => next,
                    None => break,
                },
            };
            if next > limit {
                self.task.advance_to(limit);
                self.collect_events();
                break;
            }

            self.task.advance_to(next);
            self.collect_events();
            if lick == Some(next) {
                self.subject.take_lick(next);
                self.task.handle_input(Input::Lick);
                self.collect_events();
            }
        }
        if !self.task.is_closed() {
            self.task.close(CloseReason::Requested);
            self.collect_events();
        }

        let summary = SessionSummary::from_log(
            started,
            self.task.now().as_secs_f64(),
            self.task.trial_log(),
            self.task.close_reason().cloned(),
        );
        info!(
            trials = summary.trials,
            rewards = summary.rewards,
            volume = summary.volume,
            "Simulation finished."
        );
        summary
    }

    fn collect_events(&mut self) {
        let now = self.task.now();
        for event in self.task.drain_events() {
            match &event {
                TaskEvent::StimulusChanged { .. } => self.subject.observe_change(now, false),
                TaskEvent::ShamChange { .. } => self.subject.observe_change(now, true),
                _ => {}
            }
            self.events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trial::TrialParams;

    fn subject(config: SubjectConfig) -> SyntheticSubject {
        SyntheticSubject::new(SubjectConfig {
            seed: Some(5),
            ..config
        })
    }

    #[test]
    fn spontaneous_licks_follow_rate() {
        let mut subject = subject(SubjectConfig {
            lick_rate_hz: 2.0,
            ..SubjectConfig::default()
        });
        subject.schedule_spontaneous(Duration::ZERO);
        let mut last = Duration::ZERO;
        let mut count = 0;
        while let Some(at) = subject.next_lick() {
            if at > Duration::from_secs(100) {
                break;
            }
            assert!(at >= last);
            last = at;
            subject.take_lick(at);
            count += 1;
        }
        assert!((120..=280).contains(&count), "{count} licks");
    }

    #[test]
    fn silent_subject_never_licks() {
        let mut subject = subject(SubjectConfig {
            lick_rate_hz: 0.0,
            hit_probability: 0.0,
            ..SubjectConfig::default()
        });
        subject.schedule_spontaneous(Duration::ZERO);
        subject.observe_change(Duration::from_secs(1), false);
        assert_eq!(subject.next_lick(), None);
    }

    #[test]
    fn certain_responder_licks_within_reaction_window() {
        let mut subject = subject(SubjectConfig {
            lick_rate_hz: 0.0,
            hit_probability: 1.0,
            reaction_time: [0.3, 0.3],
            ..SubjectConfig::default()
        });
        subject.observe_change(Duration::from_secs(2), false);
        assert_eq!(subject.next_lick(), Some(Duration::from_millis(2300)));
    }

    #[test]
    fn perfect_subject_hits_every_go_trial() {
        use crate::surfaces::SimulatedStimulus;
        use crate::config::TaskConfig;

        let config = TaskConfig {
            periodic_flash: None,
            warm_up_trials: 0,
            ..TaskConfig::default()
        };
        let mut remaining = 5;
        let generator = move |_: &[crate::trial::TrialRecord]| {
            remaining -= 1;
            Ok::<_, crate::error::GeneratorError>((remaining >= 0).then(|| TrialParams::go(1.0)))
        };
        let task = DocTask::new(
            &config,
            Box::new(SimulatedStimulus::steady()),
            None,
            Box::new(generator),
        )
        .unwrap();
        let subject = subject(SubjectConfig {
            lick_rate_hz: 0.0,
            hit_probability: 1.0,
            reaction_time: [0.3, 0.5],
            ..SubjectConfig::default()
        });
        let mut sim = Simulation::new(task, subject);
        let summary = sim.run(Duration::from_secs(3600));
        assert_eq!(summary.trials, 5);
        assert_eq!(summary.count(crate::trial::Outcome::Hit), 5);
        assert_eq!(summary.close_reason, Some(CloseReason::SequenceExhausted));
        assert!(sim
            .events()
            .iter()
            .any(|e| matches!(e, TaskEvent::RewardIssued { .. })));
    }
}

//! Per-session outcome tallies.

use crate::events::CloseReason;
use crate::trial::{EndReason, Outcome, TrialRecord};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// What happened in a session, counted from its trial log.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    /// Wall-clock time the session was started.
    pub started: DateTime<Utc>,
    /// Session time at which the summary was taken, in seconds.
    pub elapsed: f64,
    pub trials: u64,
    pub go_trials: u64,
    pub catch_trials: u64,
    pub outcomes: BTreeMap<Outcome, u64>,
    /// Trials that ended without an outcome.
    pub unresolved: u64,
    pub safety_timeouts: u64,
    pub rewards: u64,
    pub volume: f64,
    pub close_reason: Option<CloseReason>,
}

impl SessionSummary {
    pub fn from_log(
        started: DateTime<Utc>,
        elapsed: f64,
        log: &[TrialRecord],
        close_reason: Option<CloseReason>,
    ) -> Self {
        let mut outcomes: BTreeMap<Outcome, u64> = Outcome::ALL.iter().map(|o| (*o, 0)).collect();
        let mut unresolved = 0;
        let mut safety_timeouts = 0;
        let mut catch_trials = 0;
        for record in log {
            match record.outcome {
                Some(outcome) => *outcomes.entry(outcome).or_default() += 1,
                None => unresolved += 1,
            }
            if record.ended_by == EndReason::SafetyTimeout {
                safety_timeouts += 1;
            }
            if record.params.catch {
                catch_trials += 1;
            }
        }
        let last = log.last();
        Self {
            started,
            elapsed,
            trials: log.len() as u64,
            go_trials: log.len() as u64 - catch_trials,
            catch_trials,
            outcomes,
            unresolved,
            safety_timeouts,
            rewards: last.map_or(0, |r| r.cumulative_rewards),
            volume: last.map_or(0.0, |r| r.cumulative_volume),
            close_reason,
        }
    }

    pub fn count(&self, outcome: Outcome) -> u64 {
        self.outcomes.get(&outcome).copied().unwrap_or(0)
    }
}

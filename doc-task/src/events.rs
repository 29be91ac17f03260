//! Defines the inputs a task consumes and the notifications it emits.
//!
//! `Input` is what sensors and the stimulus surface deliver to a task.
//! `TaskEvent` is the task's public notification stream: drivers drain it
//! after every dispatch and forward it to whoever is listening.

use crate::trial::{ChangeEvent, Outcome};
use serde::Serialize;

/// External events delivered to a running task.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    /// The lick sensor fired.
    Lick,
    /// The stimulus began a new flash.
    FlashStarted,
    /// The stimulus changed on its own schedule.
    StimulusChanged(ChangeEvent),
    /// An operator requested that the current trial be aborted.
    Abort,
}

/// Why a session stopped.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The configured maximum session duration elapsed.
    MaxDuration,
    /// The cumulative reward volume reached its limit.
    VolumeLimit,
    /// A fixed trial sequence ran out.
    SequenceExhausted,
    /// The trial generator failed.
    GeneratorFailed(String),
    /// The driver asked the task to stop.
    Requested,
}

/// Notifications emitted by a task, in the order they happened.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    SessionStarted,
    TrialStarted { index: u64, catch: bool },
    EpochEntered { name: String, at: f64 },
    EpochExited { name: String, at: f64 },
    OutcomeRecorded { index: u64, outcome: Outcome },
    Aborted { index: u64 },
    StimulusChanged { index: u64 },
    ShamChange { index: u64 },
    RewardIssued { volume: f64 },
    SafetyTimerFired { index: u64 },
    TrialEnded { index: u64, outcome: Option<Outcome> },
    SessionClosed { reason: CloseReason },
}

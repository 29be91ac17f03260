//! Trial parameters, outcomes and finalized trial records.

use crate::error::GeneratorError;
use crate::time::Timepoint;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A loosely-typed trial parameter value, as produced by sequences and
/// random parameter sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    fn kind(&self) -> &'static str {
        match self {
            ParamValue::Bool(_) => "a bool",
            ParamValue::Int(_) => "an integer",
            ParamValue::Float(_) => "a float",
            ParamValue::Text(_) => "a string",
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(v) => Some(*v as f64),
            ParamValue::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

/// A raw parameter set keyed by name.
pub type ParamMap = BTreeMap<String, ParamValue>;

/// The typed parameter set of one trial.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrialParams {
    /// Catch trials have no real change; a sham change stands in for it.
    pub catch: bool,
    /// Offset of the change from the start of the stimulus window, in
    /// seconds. `None` schedules no change.
    pub change_time: Option<f64>,
    /// Reward automatically when the change happens.
    pub auto_reward: bool,
    /// Generator-specific fields carried through to the trial log.
    #[serde(flatten)]
    pub extra: ParamMap,
}

impl TrialParams {
    pub const CATCH: &'static str = "catch";
    pub const CHANGE_TIME: &'static str = "change_time";
    pub const AUTO_REWARD: &'static str = "auto_reward";

    pub fn go(change_time: f64) -> Self {
        Self {
            change_time: Some(change_time),
            ..Self::default()
        }
    }

    pub fn catch(change_time: f64) -> Self {
        Self {
            catch: true,
            change_time: Some(change_time),
            ..Self::default()
        }
    }

    /// Validates a raw parameter map into typed parameters.
    ///
    /// Known keys must have the right type; everything else is kept in
    /// `extra`.
    pub fn from_map(mut map: ParamMap) -> Result<Self, GeneratorError> {
        let catch = take_bool(&mut map, Self::CATCH)?.unwrap_or(false);
        let auto_reward = take_bool(&mut map, Self::AUTO_REWARD)?.unwrap_or(false);
        let change_time = match map.remove(Self::CHANGE_TIME) {
            None => None,
            Some(value) => match value.as_f64() {
                Some(t) => Some(t),
                None => return Err(invalid_change_time(&value)),
            },
        };
        let params = Self {
            catch,
            change_time,
            auto_reward,
            extra: map,
        };
        params.validate()?;
        Ok(params)
    }

    /// Checks that the change time, if any, is a finite non-negative offset.
    pub fn validate(&self) -> Result<(), GeneratorError> {
        match self.change_time {
            Some(t) if !t.is_finite() || t < 0.0 => {
                Err(invalid_change_time(&ParamValue::Float(t)))
            }
            _ => Ok(()),
        }
    }
}

fn invalid_change_time(value: &ParamValue) -> GeneratorError {
    GeneratorError::InvalidParam {
        name: TrialParams::CHANGE_TIME.to_string(),
        expected: "a non-negative number",
        found: format!("{value:?}"),
    }
}

fn take_bool(map: &mut ParamMap, name: &str) -> Result<Option<bool>, GeneratorError> {
    match map.remove(name) {
        None => Ok(None),
        Some(ParamValue::Bool(v)) => Ok(Some(v)),
        Some(other) => Err(GeneratorError::InvalidParam {
            name: name.to_string(),
            expected: "a bool",
            found: other.kind().to_string(),
        }),
    }
}

/// The seven mutually exclusive terminal trial outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Abort,
    Miss,
    Hit,
    AutoReward,
    Rejection,
    FalseAlarm,
    EarlyResponse,
}

impl Outcome {
    pub const ALL: [Outcome; 7] = [
        Outcome::Abort,
        Outcome::Miss,
        Outcome::Hit,
        Outcome::AutoReward,
        Outcome::Rejection,
        Outcome::FalseAlarm,
        Outcome::EarlyResponse,
    ];

    /// `hit`, `auto_reward` and `rejection` count as success.
    pub fn is_success(self) -> bool {
        matches!(self, Outcome::Hit | Outcome::AutoReward | Outcome::Rejection)
    }

    /// The name used in event logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Abort => "abort",
            Outcome::Miss => "miss",
            Outcome::Hit => "hit",
            Outcome::AutoReward => "auto_reward",
            Outcome::Rejection => "rejection",
            Outcome::FalseAlarm => "false_alarm",
            Outcome::EarlyResponse => "early_response",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a logged event marks an epoch entry, an epoch exit, or neither.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Enter,
    Exit,
    #[serde(rename = "")]
    None,
}

/// One entry of a trial's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEntry {
    pub name: String,
    pub direction: Direction,
    pub time: f64,
    pub frame: u64,
}

/// A stimulus change reported by the stimulus surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Stimulus group before the change.
    pub from: String,
    /// Stimulus group after the change.
    pub to: String,
}

/// A stimulus change as recorded in the trial log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub from: String,
    pub to: String,
    pub at: Timepoint,
}

/// How a trial came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// No epoch was left running and nothing was queued on the stimulus.
    Completed,
    /// The safety timer expired first.
    SafetyTimeout,
    /// The session was closed while the trial was running.
    Closed,
}

/// A finalized trial, as appended to the trial log and handed to sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub index: u64,
    pub params: TrialParams,
    pub outcome: Option<Outcome>,
    pub success: Option<bool>,
    /// The abort procedure ran during this trial.
    pub aborted: bool,
    pub ended_by: EndReason,
    pub started_at: f64,
    pub ended_at: f64,
    pub events: Vec<EventEntry>,
    pub licks: Vec<Timepoint>,
    pub rewards: Vec<Timepoint>,
    pub stimulus_changes: Vec<ChangeRecord>,
    pub cumulative_volume: f64,
    pub cumulative_rewards: u64,
}

impl TrialRecord {
    /// Names of the logged events, in order.
    pub fn event_names(&self) -> Vec<&str> {
        self.events.iter().map(|e| e.name.as_str()).collect()
    }

    /// `(name, direction)` pairs for epoch entries and exits only.
    pub fn epoch_transitions(&self) -> Vec<(&str, Direction)> {
        self.events
            .iter()
            .filter(|e| e.direction != Direction::None)
            .map(|e| (e.name.as_str(), e.direction))
            .collect()
    }
}

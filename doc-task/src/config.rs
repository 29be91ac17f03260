//! Defines all configuration structures for a Detection-of-Change session.
//!
//! These structs are deserialized with `serde` from a TOML file and
//! environment overrides using the `config` crate. Every field has a default,
//! so an empty file yields the standard task. `SessionConfig::validate` must
//! pass before a task can be constructed.

use crate::common::secs_to_duration;
use crate::error::ConfigError;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix for environment overrides, e.g. `DOC_TASK__PRE_CHANGE_TIME=2.5`.
pub const ENV_PREFIX: &str = "DOC";

/// The top-level configuration for a session.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionConfig {
    /// Epoch timing, reward volumes and session limits.
    #[serde(default)]
    pub task: TaskConfig,

    /// Trial parameter generation.
    #[serde(default)]
    pub generator: GeneratorConfig,

    /// The synthetic subject used by headless simulations.
    #[serde(default)]
    pub subject: SubjectConfig,

    /// Where finished trials are written.
    #[serde(default)]
    pub output: OutputConfig,
}

/// Task timing and limits. All times are in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Period without stimulus at the start of each trial.
    pub initial_blank: f64,
    /// Mandatory time before the stimulus window.
    pub pre_change_time: f64,
    /// Window during which a change can occur.
    pub stimulus_window: f64,
    /// `[start, stop]` of reward availability after a change.
    pub response_window: [f64; 2],
    /// The trial does not end until the subject has not licked for this long.
    pub min_no_lick_time: f64,
    /// Extra time punishment after an abort.
    pub timeout_duration: f64,
    /// Added to the expected trial duration to form the safety deadline.
    pub safety_timer_padding: f64,
    /// The session closes after the first trial ending past this limit.
    pub max_task_duration_min: f64,
    /// Volume dispensed on auto-reward trials.
    pub auto_reward_volume: f64,
    /// Volume dispensed on hits.
    pub reward_volume: f64,
    /// Optional cumulative volume limit in mL.
    pub volume_limit: Option<f64>,
    /// Number of leading auto-reward go trials.
    pub warm_up_trials: u32,
    /// `[on, off]` flash durations. `None` disables periodic flashing.
    pub periodic_flash: Option<[f64; 2]>,
    /// Display update rate used to stamp frame numbers.
    pub update_rate_hz: f64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            initial_blank: 0.0,
            pre_change_time: 2.0,
            stimulus_window: 6.0,
            response_window: [0.15, 1.0],
            min_no_lick_time: 0.0,
            timeout_duration: 0.0,
            safety_timer_padding: 5.0,
            max_task_duration_min: 60.0,
            auto_reward_volume: 0.005,
            reward_volume: 0.008,
            volume_limit: None,
            warm_up_trials: 3,
            periodic_flash: Some([0.25, 0.5]),
            update_rate_hz: 60.0,
        }
    }
}

impl TaskConfig {
    /// Checks every duration and volume. Called before a task is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("initial_blank", self.initial_blank),
            ("pre_change_time", self.pre_change_time),
            ("stimulus_window", self.stimulus_window),
            ("min_no_lick_time", self.min_no_lick_time),
            ("timeout_duration", self.timeout_duration),
            ("safety_timer_padding", self.safety_timer_padding),
            ("max_task_duration_min", self.max_task_duration_min),
            ("auto_reward_volume", self.auto_reward_volume),
            ("reward_volume", self.reward_volume),
        ];
        for (field, value) in durations {
            non_negative(field, value)?;
        }

        let [start, stop] = self.response_window;
        non_negative("response_window", start)?;
        non_negative("response_window", stop)?;
        if stop < start {
            return Err(ConfigError::invalid(
                "response_window",
                format!("stop ({stop}) is before start ({start})"),
            ));
        }

        if let Some(limit) = self.volume_limit {
            if !limit.is_finite() || limit <= 0.0 {
                return Err(ConfigError::invalid("volume_limit", "must be positive"));
            }
        }

        if let Some([on, off]) = self.periodic_flash {
            non_negative("periodic_flash", on)?;
            non_negative("periodic_flash", off)?;
            if on + off <= 0.0 {
                return Err(ConfigError::invalid("periodic_flash", "period must be positive"));
            }
        }

        if !self.update_rate_hz.is_finite() || self.update_rate_hz <= 0.0 {
            return Err(ConfigError::invalid("update_rate_hz", "must be positive"));
        }
        Ok(())
    }

    /// Delay between a change and the opening of the response window.
    pub fn response_window_delay(&self) -> Duration {
        secs_to_duration(self.response_window[0])
    }

    /// How long the response window stays open.
    pub fn response_window_duration(&self) -> Duration {
        secs_to_duration(self.response_window[1] - self.response_window[0])
    }

    /// The flash period (`on + off`), if the stimulus flashes.
    pub fn flash_period(&self) -> Option<Duration> {
        self.periodic_flash.map(|[on, off]| secs_to_duration(on + off))
    }

    /// The session length limit.
    pub fn max_task_duration(&self) -> Duration {
        secs_to_duration(self.max_task_duration_min * 60.0)
    }
}

/// Which trial generator a session uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeneratorKind {
    /// Uniform go/catch, change time drawn from a fixed set, warm-up trials.
    #[default]
    Default,
    /// History-dependent generation: failure repeats, free rewards after
    /// lick-free trials, configurable change-time distribution.
    Adaptive,
}

/// Distribution used by the adaptive generator to draw change times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeTimeDistribution {
    /// Exponential with `change_time_scale`, redrawn until it fits the
    /// stimulus window.
    #[default]
    Exponential,
    /// Uniform over the stimulus window.
    Uniform,
}

/// Configuration for trial generation.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub kind: GeneratorKind,
    /// Probability of a catch trial (adaptive generator).
    pub catch_freq: f64,
    pub change_time_dist: ChangeTimeDistribution,
    /// Mean of the exponential change-time distribution, in seconds.
    pub change_time_scale: f64,
    /// Give a free reward after this many consecutive lick-free trials.
    pub free_reward_trials: u32,
    /// Repeat a failed trial up to this many times.
    pub failure_repeats: u32,
    /// Seed for reproducible sessions. `None` seeds from the OS.
    pub seed: Option<u64>,
    /// Optional JSON file holding a fixed sequence of trial parameter maps.
    pub sequence_path: Option<PathBuf>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            kind: GeneratorKind::Default,
            catch_freq: 0.5,
            change_time_dist: ChangeTimeDistribution::Exponential,
            change_time_scale: 2.0,
            free_reward_trials: 10,
            failure_repeats: 10,
            seed: None,
            sequence_path: None,
        }
    }
}

impl GeneratorConfig {
    pub fn validate(&self, task: &TaskConfig) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.catch_freq) {
            return Err(ConfigError::invalid("catch_freq", "must be within [0, 1]"));
        }
        if !self.change_time_scale.is_finite() || self.change_time_scale <= 0.0 {
            return Err(ConfigError::invalid("change_time_scale", "must be positive"));
        }
        if self.kind == GeneratorKind::Adaptive && task.stimulus_window <= 0.0 {
            return Err(ConfigError::invalid(
                "stimulus_window",
                "the adaptive generator needs a positive stimulus window",
            ));
        }
        Ok(())
    }
}

/// Behavior of the simulated subject.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SubjectConfig {
    /// Rate of spontaneous licks, in licks per second.
    pub lick_rate_hz: f64,
    /// Chance of responding to a real change.
    pub hit_probability: f64,
    /// Chance of responding to a sham change.
    pub false_alarm_probability: f64,
    /// `[min, max]` reaction time in seconds.
    pub reaction_time: [f64; 2],
    pub seed: Option<u64>,
}

impl Default for SubjectConfig {
    fn default() -> Self {
        Self {
            lick_rate_hz: 0.05,
            hit_probability: 0.8,
            false_alarm_probability: 0.2,
            reaction_time: [0.25, 0.6],
            seed: None,
        }
    }
}

impl SubjectConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        non_negative("lick_rate_hz", self.lick_rate_hz)?;
        for (field, p) in [
            ("hit_probability", self.hit_probability),
            ("false_alarm_probability", self.false_alarm_probability),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(ConfigError::invalid(field, "must be within [0, 1]"));
            }
        }
        let [min, max] = self.reaction_time;
        non_negative("reaction_time", min)?;
        non_negative("reaction_time", max)?;
        if max < min {
            return Err(ConfigError::invalid("reaction_time", "max is below min"));
        }
        Ok(())
    }
}

/// Output locations.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// JSON-lines file receiving one record per finished trial.
    pub trial_log: Option<PathBuf>,
}

impl SessionConfig {
    /// Loads a session configuration from an optional TOML file plus
    /// `DOC_`-prefixed environment overrides, then validates it.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let config: SessionConfig = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a configuration from TOML text and validates it.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig = Config::builder()
            .add_source(File::from_str(text, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.task.validate()?;
        self.generator.validate(&self.task)?;
        self.subject.validate()
    }
}

fn non_negative(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::invalid(
            field,
            format!("must be a finite, non-negative number (got {value})"),
        ));
    }
    Ok(())
}

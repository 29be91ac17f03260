//! Trial parameter generation.
//!
//! A `TrialGenerator` is asked for the next trial's parameters each time a
//! trial starts. It sees the finalized trial log, never in-flight state.
//! `ParamGenerator` is the general building block: an optional fixed sequence
//! of parameter maps plus named random sources. The two DoC generators build
//! on it.

use crate::config::{ChangeTimeDistribution, GeneratorConfig, GeneratorKind, TaskConfig};
use crate::error::GeneratorError;
use crate::trial::{ParamMap, ParamValue, TrialParams, TrialRecord};
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// Produces the parameters of each trial.
pub trait TrialGenerator: Send {
    /// Returns the next trial's parameters, or `None` when there are no more
    /// trials to run.
    fn next_trial(&mut self, history: &[TrialRecord])
        -> Result<Option<TrialParams>, GeneratorError>;

    /// Rewinds the generator. Called when it is installed on a task.
    fn reset(&mut self) {}
}

impl<F> TrialGenerator for F
where
    F: FnMut(&[TrialRecord]) -> Result<Option<TrialParams>, GeneratorError> + Send,
{
    fn next_trial(
        &mut self,
        history: &[TrialRecord],
    ) -> Result<Option<TrialParams>, GeneratorError> {
        self(history)
    }
}

/// A sampling closure for a random parameter.
pub type DrawFn = Box<dyn FnMut(&mut StdRng, &[TrialRecord]) -> ParamValue + Send>;

/// Where a named parameter's value comes from.
pub enum ParamSource {
    /// Picked uniformly from a fixed set.
    Choice(Vec<ParamValue>),
    /// Returned by a closure.
    Draw(DrawFn),
}

fn seeded_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    }
}

/// A fixed sequence of parameter maps and/or named random sources.
///
/// Each trial starts from the sequence entry at the current index (if a
/// sequence is set), then every random source writes its value over it. A
/// sequence that runs out ends the session.
pub struct ParamGenerator {
    sequence: Option<Vec<ParamMap>>,
    sources: BTreeMap<String, ParamSource>,
    trial_index: usize,
    rng: StdRng,
}

impl ParamGenerator {
    pub fn new(seed: Option<u64>) -> Self {
        Self {
            sequence: None,
            sources: BTreeMap::new(),
            trial_index: 0,
            rng: seeded_rng(seed),
        }
    }

    /// A generator that replays `sequence` and then stops.
    pub fn with_sequence(sequence: Vec<ParamMap>, seed: Option<u64>) -> Self {
        let mut generator = Self::new(seed);
        generator.sequence = Some(sequence);
        generator
    }

    pub fn set_sequence(&mut self, sequence: Vec<ParamMap>) {
        self.sequence = Some(sequence);
    }

    /// Reads a JSON array of parameter maps.
    pub fn load_sequence(path: &Path) -> Result<Vec<ParamMap>, GeneratorError> {
        let text = std::fs::read_to_string(path).map_err(|source| GeneratorError::SequenceIo {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| GeneratorError::SequenceFormat {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Picks `name` uniformly from `values` on every trial.
    pub fn add_choice<V>(&mut self, name: impl Into<String>, values: impl IntoIterator<Item = V>)
    where
        V: Into<ParamValue>,
    {
        let values = values.into_iter().map(Into::into).collect();
        self.sources.insert(name.into(), ParamSource::Choice(values));
    }

    /// Computes `name` with `draw` on every trial.
    pub fn add_draw<F>(&mut self, name: impl Into<String>, draw: F)
    where
        F: FnMut(&mut StdRng, &[TrialRecord]) -> ParamValue + Send + 'static,
    {
        self.sources
            .insert(name.into(), ParamSource::Draw(Box::new(draw)));
    }

    /// Number of trials drawn since the last reset.
    pub fn trial_index(&self) -> usize {
        self.trial_index
    }

    /// Draws the next raw parameter map. `None` once the sequence is spent.
    pub fn next_map(&mut self, history: &[TrialRecord]) -> Option<ParamMap> {
        let mut map = match &self.sequence {
            Some(sequence) => sequence.get(self.trial_index)?.clone(),
            None => ParamMap::new(),
        };
        for (name, source) in self.sources.iter_mut() {
            let value = match source {
                ParamSource::Choice(values) => match values.choose(&mut self.rng) {
                    Some(value) => value.clone(),
                    None => continue,
                },
                ParamSource::Draw(draw) => draw(&mut self.rng, history),
            };
            map.insert(name.clone(), value);
        }
        self.trial_index += 1;
        Some(map)
    }
}

impl TrialGenerator for ParamGenerator {
    fn next_trial(
        &mut self,
        history: &[TrialRecord],
    ) -> Result<Option<TrialParams>, GeneratorError> {
        self.next_map(history).map(TrialParams::from_map).transpose()
    }

    fn reset(&mut self) {
        self.trial_index = 0;
    }
}

/// Uniform go/catch trials with a change time from `{1, 2, 3, 4}` seconds.
///
/// The first `warm_up_trials` trials are forced to auto-reward go trials.
pub struct DefaultTrialGenerator {
    base: ParamGenerator,
    warm_up_trials: u32,
    warm_up_remaining: u32,
}

impl DefaultTrialGenerator {
    pub fn new(warm_up_trials: u32, seed: Option<u64>) -> Self {
        let mut base = ParamGenerator::new(seed);
        base.add_choice(TrialParams::CATCH, [true, false]);
        base.add_choice(TrialParams::CHANGE_TIME, [1.0, 2.0, 3.0, 4.0]);
        base.add_choice(TrialParams::AUTO_REWARD, [false]);
        Self {
            base,
            warm_up_trials,
            warm_up_remaining: warm_up_trials,
        }
    }

    pub fn base_mut(&mut self) -> &mut ParamGenerator {
        &mut self.base
    }
}

impl TrialGenerator for DefaultTrialGenerator {
    fn next_trial(
        &mut self,
        history: &[TrialRecord],
    ) -> Result<Option<TrialParams>, GeneratorError> {
        let Some(mut params) = self.base.next_trial(history)? else {
            return Ok(None);
        };
        if self.warm_up_remaining > 0 {
            params.auto_reward = true;
            params.catch = false;
            self.warm_up_remaining -= 1;
        }
        Ok(Some(params))
    }

    fn reset(&mut self) {
        self.base.reset();
        self.warm_up_remaining = self.warm_up_trials;
    }
}

/// History-aware DoC trial generation.
///
/// - Catch trials occur with probability `catch_freq`.
/// - Change times are exponential (redrawn until they fit the stimulus
///   window) or uniform over the window.
/// - The first `warm_up_trials` new trials are auto-reward trials.
/// - After `free_reward_trials` consecutive trials without a lick, the next
///   new trial is an auto-reward trial.
/// - Auto-reward trials are always go trials.
/// - A failed trial is repeated verbatim, up to `failure_repeats` times in a
///   row.
pub struct AdaptiveTrialGenerator {
    base: ParamGenerator,
    warm_up_remaining: u32,
    warm_up_trials: u32,
    free_reward_trials: u32,
    failure_repeats: u32,
    last_trial: Option<TrialParams>,
    repeats: u32,
    trials_since_lick: u32,
}

impl AdaptiveTrialGenerator {
    pub fn new(config: &GeneratorConfig, task: &TaskConfig) -> Self {
        let mut base = ParamGenerator::new(config.seed);

        let catch_freq = config.catch_freq;
        base.add_draw(TrialParams::CATCH, move |rng, _| {
            ParamValue::Bool(rng.random::<f64>() < catch_freq)
        });

        let window = task.stimulus_window;
        let scale = config.change_time_scale;
        let dist = config.change_time_dist;
        base.add_draw(TrialParams::CHANGE_TIME, move |rng, _| {
            ParamValue::Float(draw_change_time(rng, dist, scale, window))
        });

        Self {
            base,
            warm_up_remaining: task.warm_up_trials,
            warm_up_trials: task.warm_up_trials,
            free_reward_trials: config.free_reward_trials,
            failure_repeats: config.failure_repeats,
            last_trial: None,
            repeats: 0,
            trials_since_lick: 0,
        }
    }

    pub fn base_mut(&mut self) -> &mut ParamGenerator {
        &mut self.base
    }

    fn new_trial(
        &mut self,
        history: &[TrialRecord],
    ) -> Result<Option<TrialParams>, GeneratorError> {
        let Some(mut params) = self.base.next_trial(history)? else {
            return Ok(None);
        };

        if self.warm_up_remaining > 0 {
            self.warm_up_remaining -= 1;
            params.auto_reward = true;
        }

        if let Some(previous) = history.last() {
            if previous.licks.is_empty() {
                self.trials_since_lick += 1;
            } else {
                self.trials_since_lick = 0;
            }
        }
        if self.trials_since_lick >= self.free_reward_trials {
            debug!(
                trials = self.trials_since_lick,
                "No licks for a while, giving a free reward."
            );
            params.auto_reward = true;
            self.trials_since_lick = 0;
        }

        if params.auto_reward {
            params.catch = false;
        }
        self.last_trial = Some(params.clone());
        Ok(Some(params))
    }
}

/// Exponential draws rejected before falling back to a uniform one.
const MAX_REDRAWS: usize = 1000;

/// Draws a change time in seconds within `[0, window)`. An empty window
/// always yields zero.
fn draw_change_time(
    rng: &mut StdRng,
    dist: ChangeTimeDistribution,
    scale: f64,
    window: f64,
) -> f64 {
    if window.is_nan() || window <= 0.0 {
        return 0.0;
    }
    if dist == ChangeTimeDistribution::Exponential && scale > 0.0 {
        for _ in 0..MAX_REDRAWS {
            let u: f64 = rng.random();
            let t = -scale * (1.0 - u).ln();
            if t < window {
                return t;
            }
        }
        warn!(scale, window, "Exponential change time never fit the window, drawing uniformly.");
    }
    rng.random::<f64>() * window
}

impl TrialGenerator for AdaptiveTrialGenerator {
    fn next_trial(
        &mut self,
        history: &[TrialRecord],
    ) -> Result<Option<TrialParams>, GeneratorError> {
        let previous_succeeded = history
            .last()
            .map_or(true, |record| record.success == Some(true));

        if !previous_succeeded && self.repeats < self.failure_repeats {
            if let Some(last) = &self.last_trial {
                self.repeats += 1;
                info!("Repeating previous trial.");
                return Ok(Some(last.clone()));
            }
        }
        self.repeats = 0;
        self.new_trial(history)
    }

    fn reset(&mut self) {
        self.base.reset();
        self.warm_up_remaining = self.warm_up_trials;
        self.last_trial = None;
        self.repeats = 0;
        self.trials_since_lick = 0;
    }
}

/// Builds the generator a session configuration asks for.
pub fn from_config(
    generator: &GeneratorConfig,
    task: &TaskConfig,
) -> Result<Box<dyn TrialGenerator>, GeneratorError> {
    generator.validate(task)?;
    let sequence = generator
        .sequence_path
        .as_deref()
        .map(ParamGenerator::load_sequence)
        .transpose()?;

    Ok(match generator.kind {
        GeneratorKind::Default => {
            let mut built = DefaultTrialGenerator::new(task.warm_up_trials, generator.seed);
            if let Some(sequence) = sequence {
                built.base_mut().set_sequence(sequence);
            }
            Box::new(built)
        }
        GeneratorKind::Adaptive => {
            let mut built = AdaptiveTrialGenerator::new(generator, task);
            if let Some(sequence) = sequence {
                built.base_mut().set_sequence(sequence);
            }
            Box::new(built)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::Timepoint;
    use crate::trial::{EndReason, Outcome};

    fn record(index: u64, params: TrialParams, outcome: Outcome, licked: bool) -> TrialRecord {
        TrialRecord {
            index,
            params,
            outcome: Some(outcome),
            success: Some(outcome.is_success()),
            aborted: false,
            ended_by: EndReason::Completed,
            started_at: 0.0,
            ended_at: 1.0,
            events: Vec::new(),
            licks: if licked {
                vec![Timepoint { time: 0.5, frame: 30 }]
            } else {
                Vec::new()
            },
            rewards: Vec::new(),
            stimulus_changes: Vec::new(),
            cumulative_volume: 0.0,
            cumulative_rewards: 0,
        }
    }

    #[test]
    fn sequence_replays_then_ends() {
        let mut first = ParamMap::new();
        first.insert("catch".into(), true.into());
        first.insert("change_time".into(), ParamValue::Float(1.5));
        let mut generator = ParamGenerator::with_sequence(vec![first, ParamMap::new()], Some(1));

        let params = generator.next_trial(&[]).unwrap().unwrap();
        assert!(params.catch);
        assert_eq!(params.change_time, Some(1.5));
        let params = generator.next_trial(&[]).unwrap().unwrap();
        assert!(!params.catch);
        assert!(generator.next_trial(&[]).unwrap().is_none());

        generator.reset();
        assert_eq!(generator.trial_index(), 0);
        assert!(generator.next_trial(&[]).unwrap().is_some());
    }

    #[test]
    fn invalid_sequence_values_surface_as_errors() {
        let mut bad = ParamMap::new();
        bad.insert("auto_reward".into(), "yes".into());
        let mut generator = ParamGenerator::with_sequence(vec![bad], None);
        assert!(generator.next_trial(&[]).is_err());
    }

    #[test]
    fn default_generator_warms_up_then_draws() {
        let mut generator = DefaultTrialGenerator::new(2, Some(7));
        for _ in 0..2 {
            let params = generator.next_trial(&[]).unwrap().unwrap();
            assert!(params.auto_reward);
            assert!(!params.catch);
        }
        for _ in 0..50 {
            let params = generator.next_trial(&[]).unwrap().unwrap();
            assert!(!params.auto_reward);
            let t = params.change_time.unwrap();
            assert!([1.0, 2.0, 3.0, 4.0].contains(&t));
        }
    }

    #[test]
    fn exponential_change_times_fit_the_window() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..500 {
            let t = draw_change_time(&mut rng, ChangeTimeDistribution::Exponential, 2.0, 6.0);
            assert!((0.0..6.0).contains(&t));
        }
        let t = draw_change_time(&mut rng, ChangeTimeDistribution::Uniform, 2.0, 6.0);
        assert!((0.0..6.0).contains(&t));
    }

    #[test]
    fn change_time_draws_always_terminate() {
        let mut rng = StdRng::seed_from_u64(4);
        for dist in [ChangeTimeDistribution::Exponential, ChangeTimeDistribution::Uniform] {
            assert_eq!(draw_change_time(&mut rng, dist, 2.0, 0.0), 0.0);
        }
        let t = draw_change_time(&mut rng, ChangeTimeDistribution::Exponential, 1e9, 1e-6);
        assert!((0.0..1e-6).contains(&t));
    }

    #[test]
    fn from_config_rejects_what_validation_rejects() {
        let generator = GeneratorConfig {
            kind: GeneratorKind::Adaptive,
            ..GeneratorConfig::default()
        };
        let task = TaskConfig {
            stimulus_window: 0.0,
            ..TaskConfig::default()
        };
        assert!(matches!(
            from_config(&generator, &task),
            Err(GeneratorError::Config(_))
        ));

        let generator = GeneratorConfig {
            catch_freq: 2.0,
            ..GeneratorConfig::default()
        };
        assert!(from_config(&generator, &TaskConfig::default()).is_err());
    }

    fn adaptive(
        warm_up: u32,
        catch_freq: f64,
        free_reward_trials: u32,
        failure_repeats: u32,
    ) -> AdaptiveTrialGenerator {
        let config = GeneratorConfig {
            kind: GeneratorKind::Adaptive,
            catch_freq,
            free_reward_trials,
            failure_repeats,
            seed: Some(11),
            ..GeneratorConfig::default()
        };
        let task = TaskConfig {
            warm_up_trials: warm_up,
            ..TaskConfig::default()
        };
        AdaptiveTrialGenerator::new(&config, &task)
    }

    #[test]
    fn adaptive_repeats_failed_trials_up_to_limit() {
        let mut generator = adaptive(0, 0.0, 100, 2);
        let first = generator.next_trial(&[]).unwrap().unwrap();
        let mut history = vec![record(0, first.clone(), Outcome::Miss, true)];

        let repeat = generator.next_trial(&history).unwrap().unwrap();
        assert_eq!(repeat, first);
        history.push(record(1, repeat, Outcome::EarlyResponse, true));
        let repeat = generator.next_trial(&history).unwrap().unwrap();
        assert_eq!(repeat, first);
        history.push(record(2, repeat, Outcome::Miss, true));

        let fresh = generator.next_trial(&history).unwrap().unwrap();
        assert_ne!(fresh.change_time, first.change_time);
    }

    #[test]
    fn adaptive_draws_fresh_after_success() {
        let mut generator = adaptive(0, 0.0, 100, 5);
        let first = generator.next_trial(&[]).unwrap().unwrap();
        let history = vec![record(0, first.clone(), Outcome::Hit, true)];
        let next = generator.next_trial(&history).unwrap().unwrap();
        assert_ne!(next.change_time, first.change_time);
    }

    #[test]
    fn adaptive_gives_free_reward_after_lick_free_trials() {
        let mut generator = adaptive(0, 1.0, 2, 0);
        let mut history = Vec::new();
        let mut auto = Vec::new();
        for index in 0..3 {
            let params = generator.next_trial(&history).unwrap().unwrap();
            auto.push(params.auto_reward);
            if !params.auto_reward {
                assert!(params.catch);
            }
            history.push(record(index, params, Outcome::Rejection, false));
        }
        assert_eq!(auto, vec![false, false, true]);
        let last = history.last().unwrap();
        assert!(!last.params.catch);
    }

    #[test]
    fn adaptive_warm_up_forces_go_auto_reward() {
        let mut generator = adaptive(2, 1.0, 100, 0);
        let a = generator.next_trial(&[]).unwrap().unwrap();
        let b = generator.next_trial(&[]).unwrap().unwrap();
        let c = generator.next_trial(&[]).unwrap().unwrap();
        assert!(a.auto_reward && !a.catch);
        assert!(b.auto_reward && !b.catch);
        assert!(!c.auto_reward && c.catch);
    }

    #[test]
    fn closures_are_generators() {
        let mut calls = 0;
        let mut generator = move |_: &[TrialRecord]| {
            calls += 1;
            Ok::<_, GeneratorError>((calls <= 1).then(|| TrialParams::go(2.0)))
        };
        assert!(generator.next_trial(&[]).unwrap().is_some());
        assert!(generator.next_trial(&[]).unwrap().is_none());
    }
}

//! Whole sessions run headless against the synthetic subject.

use doctask::config::GeneratorKind;
use doctask::prelude::*;
use doctask::trial::{EndReason, Outcome};
use std::time::Duration;

fn build_task(config: &TaskConfig, generator: &GeneratorConfig) -> DocTask {
    let generator = generator::from_config(generator, config).unwrap();
    let stimulus = SimulatedStimulus::new(vec!["A".into(), "B".into()], config.flash_period());
    DocTask::new(config, Box::new(stimulus), Some(Box::new(CountingReward::new())), generator)
        .unwrap()
}

fn outcome_events(record: &TrialRecord) -> usize {
    record
        .event_names()
        .iter()
        .filter(|name| Outcome::ALL.iter().any(|o| o.as_str() == **name))
        .count()
}

#[test]
fn every_completed_trial_gets_exactly_one_outcome_under_random_licking() {
    for seed in 0..12 {
        let config = TaskConfig::default();
        let generator = GeneratorConfig {
            kind: if seed % 2 == 0 {
                GeneratorKind::Default
            } else {
                GeneratorKind::Adaptive
            },
            seed: Some(seed),
            ..GeneratorConfig::default()
        };
        let subject = SyntheticSubject::new(SubjectConfig {
            lick_rate_hz: 0.5,
            hit_probability: 0.7,
            false_alarm_probability: 0.4,
            reaction_time: [0.1, 1.2],
            seed: Some(seed + 100),
        });
        let mut sim = Simulation::new(build_task(&config, &generator), subject);
        let summary = sim.run(Duration::from_secs(300));

        assert!(summary.trials > 5, "seed {seed}: only {} trials", summary.trials);
        for record in sim.task().trial_log() {
            let outcomes = outcome_events(record);
            assert!(outcomes <= 1, "seed {seed}, trial {}: {outcomes} outcomes", record.index);
            assert_eq!(outcomes, usize::from(record.outcome.is_some()));
            if record.ended_by == EndReason::Completed {
                assert!(
                    record.outcome.is_some(),
                    "seed {seed}, trial {} completed without an outcome",
                    record.index
                );
            }
            assert_eq!(record.success, record.outcome.map(Outcome::is_success));
            assert!(record.rewards.len() <= 1);
            assert_ne!(record.ended_by, EndReason::SafetyTimeout);
            let times: Vec<f64> = record.events.iter().map(|e| e.time).collect();
            assert!(times.windows(2).all(|w| w[0] <= w[1]));
        }
        let rewarded = sim
            .task()
            .trial_log()
            .iter()
            .filter(|r| matches!(r.outcome, Some(Outcome::Hit | Outcome::AutoReward)))
            .count() as u64;
        assert_eq!(summary.rewards, rewarded);
    }
}

#[test]
fn warm_up_trials_are_auto_rewarded_go_trials() {
    let config = TaskConfig {
        warm_up_trials: 3,
        ..TaskConfig::default()
    };
    let generator = GeneratorConfig {
        seed: Some(7),
        ..GeneratorConfig::default()
    };
    let silent = SyntheticSubject::new(SubjectConfig {
        lick_rate_hz: 0.0,
        hit_probability: 0.0,
        false_alarm_probability: 0.0,
        seed: Some(1),
        ..SubjectConfig::default()
    });
    let mut sim = Simulation::new(build_task(&config, &generator), silent);
    sim.run(Duration::from_secs(120));

    let log = sim.task().trial_log();
    assert!(log.len() > 3);
    for record in &log[..3] {
        assert!(record.params.auto_reward);
        assert!(!record.params.catch);
        assert_eq!(record.outcome, Some(Outcome::AutoReward));
        assert_eq!(record.rewards.len(), 1);
    }
    assert!(log[3..].iter().all(|r| !r.params.auto_reward));
}

#[test]
fn volume_limit_closes_the_session() {
    let config = TaskConfig {
        warm_up_trials: 100,
        auto_reward_volume: 0.25,
        volume_limit: Some(1.0),
        ..TaskConfig::default()
    };
    let generator = GeneratorConfig {
        seed: Some(3),
        ..GeneratorConfig::default()
    };
    let silent = SyntheticSubject::new(SubjectConfig {
        lick_rate_hz: 0.0,
        hit_probability: 0.0,
        seed: Some(3),
        ..SubjectConfig::default()
    });
    let mut sim = Simulation::new(build_task(&config, &generator), silent);
    let summary = sim.run(Duration::from_secs(3600));

    assert_eq!(summary.close_reason, Some(CloseReason::VolumeLimit));
    assert_eq!(summary.rewards, 4);
    assert_eq!(summary.trials, 4);
    assert!(sim
        .events()
        .iter()
        .any(|e| matches!(e, TaskEvent::SessionClosed { reason: CloseReason::VolumeLimit })));
}

#[test]
fn sinks_receive_every_finished_trial() {
    let config = TaskConfig {
        periodic_flash: None,
        ..TaskConfig::default()
    };
    let generator = GeneratorConfig {
        seed: Some(11),
        ..GeneratorConfig::default()
    };
    let mut task = build_task(&config, &generator);
    let sink = MemorySink::new();
    task.add_sink(Box::new(sink.clone()));

    let subject = SyntheticSubject::new(SubjectConfig {
        seed: Some(11),
        ..SubjectConfig::default()
    });
    let mut sim = Simulation::new(task, subject);
    sim.run(Duration::from_secs(90));

    let records = sink.records();
    assert_eq!(records.len(), sim.task().trial_log().len());
    assert_eq!(records.as_slice(), sim.task().trial_log());
}

//! Loading and validating session configuration.

use doctask::config::{ChangeTimeDistribution, GeneratorKind};
use doctask::prelude::*;
use doctask::trial::ParamValue;
use std::io::Write;

#[test]
fn toml_overrides_defaults() {
    let config = SessionConfig::from_toml_str(
        r#"
        [task]
        pre_change_time = 1.5
        response_window = [0.2, 0.8]
        periodic_flash = [0.3, 0.4]
        volume_limit = 1.0

        [generator]
        kind = "adaptive"
        change_time_dist = "uniform"
        seed = 9

        [subject]
        lick_rate_hz = 0.1
        "#,
    )
    .unwrap();

    assert_eq!(config.task.pre_change_time, 1.5);
    assert_eq!(config.task.response_window, [0.2, 0.8]);
    assert_eq!(config.task.volume_limit, Some(1.0));
    assert_eq!(config.task.stimulus_window, TaskConfig::default().stimulus_window);
    assert_eq!(config.generator.kind, GeneratorKind::Adaptive);
    assert_eq!(config.generator.change_time_dist, ChangeTimeDistribution::Uniform);
    assert_eq!(config.generator.seed, Some(9));
    assert_eq!(config.subject.lick_rate_hz, 0.1);
    assert!(config.output.trial_log.is_none());
}

#[test]
fn invalid_values_are_rejected() {
    let err = SessionConfig::from_toml_str("[task]\nresponse_window = [1.0, 0.5]\n").unwrap_err();
    assert!(matches!(err, ConfigError::Invalid { field: "response_window", .. }));

    let err = SessionConfig::from_toml_str("[generator]\ncatch_freq = 1.5\n").unwrap_err();
    assert!(matches!(err, ConfigError::Invalid { field: "catch_freq", .. }));
}

#[test]
fn sequence_file_drives_the_generator() {
    let dir = std::env::temp_dir().join(format!("doctask-seq-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("sequence.json");
    let mut file = std::fs::File::create(&path).unwrap();
    write!(
        file,
        r#"[{{"contrast": 0.5}}, {{"contrast": 1.0, "block": "B"}}]"#
    )
    .unwrap();

    let generator_config = GeneratorConfig {
        sequence_path: Some(path.clone()),
        seed: Some(1),
        ..GeneratorConfig::default()
    };
    let task = TaskConfig {
        warm_up_trials: 0,
        ..TaskConfig::default()
    };
    let mut generator = generator::from_config(&generator_config, &task).unwrap();
    let first = generator.next_trial(&[]).unwrap().unwrap();
    assert!(first.change_time.is_some());
    assert_eq!(first.extra.get("contrast"), Some(&ParamValue::Float(0.5)));
    let second = generator.next_trial(&[]).unwrap().unwrap();
    assert_eq!(second.extra.get("block"), Some(&ParamValue::Text("B".into())));
    assert!(generator.next_trial(&[]).unwrap().is_none());

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn environment_overrides_reach_nested_keys() {
    std::env::set_var("DOC_TASK__PRE_CHANGE_TIME", "2.5");
    std::env::set_var("DOC_GENERATOR__KIND", "adaptive");
    let loaded = SessionConfig::load(None);
    std::env::remove_var("DOC_TASK__PRE_CHANGE_TIME");
    std::env::remove_var("DOC_GENERATOR__KIND");

    let config = loaded.unwrap();
    assert_eq!(config.task.pre_change_time, 2.5);
    assert_eq!(config.generator.kind, GeneratorKind::Adaptive);
    assert_eq!(config.task.stimulus_window, TaskConfig::default().stimulus_window);
}

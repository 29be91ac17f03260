use anyhow::{Context, Result};
use colored::*;
use doctask::prelude::*;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    // 1. Initialize structured logging. `RUST_LOG` overrides the default.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    // 2. Load the session configuration: an optional TOML file plus `DOC_*`
    //    environment overrides.
    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = SessionConfig::load(path.as_deref()).context("loading session configuration")?;

    // 3. Assemble the task.
    let generator = generator::from_config(&config.generator, &config.task)?;
    let stimulus = SimulatedStimulus::new(vec!["A".into(), "B".into()], config.task.flash_period());
    let reward = CountingReward::new();
    let mut task = DocTask::new(
        &config.task,
        Box::new(stimulus),
        Some(Box::new(reward.clone())),
        generator,
    )?;
    if let Some(path) = &config.output.trial_log {
        let sink = JsonLinesSink::create(path)
            .with_context(|| format!("opening trial log {}", path.display()))?;
        task.add_sink(Box::new(sink));
        info!(path = %path.display(), "Writing trials.");
    }

    // 4. Run it against the synthetic subject, bounded by the session limit.
    let limit = config.task.max_task_duration() + Duration::from_secs(60);
    let mut sim = Simulation::new(task, SyntheticSubject::new(config.subject.clone()));
    let summary = sim.run(limit);

    print_summary(&summary, reward.count());
    Ok(())
}

fn print_summary(summary: &SessionSummary, valve_openings: u64) {
    println!();
    println!("{} v{}", doctask::ENGINE_NAME.bold().cyan(), doctask::VERSION);
    println!(
        "  started {}  ran {:.1} s",
        summary.started.format("%Y-%m-%d %H:%M:%S UTC"),
        summary.elapsed
    );
    println!(
        "  {} trials ({} go, {} catch)",
        summary.trials.to_string().bold(),
        summary.go_trials,
        summary.catch_trials
    );
    for (outcome, count) in &summary.outcomes {
        let label = format!("{:>15}", outcome.as_str());
        let label = if outcome.is_success() {
            label.green()
        } else {
            label.yellow()
        };
        println!("  {label}  {count}");
    }
    if summary.unresolved > 0 {
        println!("  {:>15}  {}", "no outcome".red(), summary.unresolved);
    }
    if summary.safety_timeouts > 0 {
        println!("  {:>15}  {}", "safety timer".red(), summary.safety_timeouts);
    }
    println!(
        "  rewards {} ({:.3} mL, {} valve openings)",
        summary.rewards, summary.volume, valve_openings
    );
    if let Some(reason) = &summary.close_reason {
        println!("  closed: {}", format!("{reason:?}").dimmed());
    }
}

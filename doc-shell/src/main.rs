use anyhow::{Context, Result};
use chrono::Utc;
use colored::Colorize;
use doctask::prelude::*;
use doctask::{ENGINE_NAME, VERSION as LIB_VERSION};
use rustyline::highlight::Highlighter;
use rustyline::Editor;
use rustyline_derive::{Completer, Helper, Hinter, Validator};
use std::borrow::Cow;
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

const SHELL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Highlights the command word of the current line.
#[derive(Completer, Helper, Hinter, Validator)]
struct CommandHighlighter;

impl Highlighter for CommandHighlighter {
    fn highlight<'l>(&self, line: &'l str, _pos: usize) -> Cow<'l, str> {
        match line.split_once(' ') {
            Some((command, rest)) => Cow::Owned(format!("{} {}", command.yellow().bold(), rest.yellow())),
            None => Cow::Owned(line.yellow().bold().to_string()),
        }
    }

    fn highlight_char(&self, _line: &str, _pos: usize, _forced: bool) -> bool {
        true
    }
}

fn print_banner() {
    if env::var("QUIET_MODE").is_ok() {
        return;
    }
    const LOGO_TEXT: &str = include_str!("../logo.log");
    let rule = "-".repeat(64);
    println!("{}", LOGO_TEXT.cyan());
    println!("{}", rule.dimmed());
    println!(
        "          Shell   v{:<8} Library   v{:<8}",
        SHELL_VERSION, LIB_VERSION
    );
    println!("{}", rule.dimmed());
}

/// Finished trials seen by the shell, oldest first.
type TrialHistory = Arc<Mutex<Vec<TrialRecord>>>;

/// Spawns the listeners that keep the trial history and echo task events.
fn spawn_listeners(engine: &SessionEngine, history: TrialHistory, watching: Arc<AtomicBool>) {
    let mut trial_rx = engine.subscribe_trials();
    tokio::spawn(async move {
        while let Ok(record) = trial_rx.recv().await {
            history.lock().await.push(record);
        }
    });

    let mut event_rx = engine.subscribe_task_events();
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            match &event {
                TaskEvent::OutcomeRecorded { index, outcome } => {
                    let text = format!("trial {index}: {}", outcome.as_str());
                    let text = if outcome.is_success() {
                        text.green()
                    } else {
                        text.yellow()
                    };
                    println!("\n<-- {text}");
                }
                TaskEvent::SessionClosed { reason } => {
                    println!("\n<-- {} {:?}", "session closed:".red(), reason);
                }
                _ if watching.load(Ordering::Relaxed) => {
                    println!("\n<-- [EVENT] {event:?}");
                }
                _ => {}
            }
        }
    });
}

fn print_trial(record: &TrialRecord) {
    let outcome = record.outcome.map_or("-", Outcome::as_str);
    let kind = if record.params.catch { "catch" } else { "go" };
    let change = record
        .params
        .change_time
        .map_or_else(|| "-".to_string(), |t| format!("{t:.2} s"));
    println!(
        "  #{:<4} {:<6} change {:>8}  {:<15} licks {:<3} {:>7.2}-{:<7.2}",
        record.index,
        kind,
        change,
        outcome,
        record.licks.len(),
        record.started_at,
        record.ended_at,
    );
}

fn print_status(status: &SessionStatus) {
    println!("  time        {:.2} s", status.now);
    println!("  running     {}", status.running);
    println!("  trials      {}", status.trials);
    if let Some(index) = status.current_trial {
        let kind = if status.catch { "catch" } else { "go" };
        println!("  current     #{index} ({kind})");
    }
    if let Some(outcome) = status.outcome {
        println!("  outcome     {}", outcome.as_str());
    }
    println!("  epochs      {}", status.active_epochs.join(", "));
    println!("  rewards     {} ({:.3} mL)", status.rewards, status.volume);
    if let Some(reason) = &status.closed {
        println!("  closed      {reason:?}");
    }
}

fn print_help() {
    println!("Available commands:");
    println!("  lick            - Reports a lick now.");
    println!("  abort           - Aborts the current trial.");
    println!("  status          - Shows the session snapshot.");
    println!("  trials [N]      - Lists the last N finished trials (default 10).");
    println!("  summary         - Tallies outcomes so far.");
    println!("  watch on|off    - Echoes every task event.");
    println!("  exit            - Closes the session and quits.");
}

#[tokio::main]
async fn main() -> Result<()> {
    print_banner();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_target(false)
        .init();

    let path = env::args().nth(1).map(PathBuf::from);
    let config = SessionConfig::load(path.as_deref()).context("loading session configuration")?;
    let generator = generator::from_config(&config.generator, &config.task)?;
    let stimulus = SimulatedStimulus::new(vec!["A".into(), "B".into()], config.task.flash_period());
    let mut task = DocTask::new(
        &config.task,
        Box::new(stimulus),
        Some(Box::new(CountingReward::new())),
        generator,
    )?;
    if let Some(path) = &config.output.trial_log {
        task.add_sink(Box::new(JsonLinesSink::create(path)?));
    }

    let engine = SessionEngine::new(task);
    let engine_handle = engine.clone();
    let history: TrialHistory = Arc::new(Mutex::new(Vec::new()));
    let watching = Arc::new(AtomicBool::new(false));
    spawn_listeners(&engine_handle, history.clone(), watching.clone());

    let started = Utc::now();
    info!("Spawning {} in the background...", ENGINE_NAME);
    let session = tokio::spawn(async move { engine.run().await });

    let ctrl_c_handle = engine_handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_handle.shutdown();
        }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut rl = Editor::new()?;
    rl.set_helper(Some(CommandHighlighter));

    println!("{} is running. Type 'help' for commands or 'exit' to quit.", ENGINE_NAME.cyan());

    loop {
        let prompt = format!("{}", ">> ".cyan().bold());
        let line = match rl.readline(&prompt) {
            Ok(line) => line,
            Err(_) => break,
        };
        rl.add_history_entry(line.as_str())?;
        let args = line.split_whitespace().collect::<Vec<_>>();
        let Some(command) = args.first() else {
            continue;
        };

        match *command {
            "lick" | "l" => {
                if let Err(e) = engine_handle.lick() {
                    println!("Error: {e}");
                }
            }
            "abort" => {
                if let Err(e) = engine_handle.abort() {
                    println!("Error: {e}");
                }
            }
            "status" => print_status(&engine_handle.status().await),
            "trials" => {
                let count = match args.get(1).map(|s| s.parse::<usize>()) {
                    None => 10,
                    Some(Ok(n)) => n,
                    Some(Err(_)) => {
                        println!("Usage: trials [N]");
                        continue;
                    }
                };
                let history = history.lock().await;
                if history.is_empty() {
                    println!("No trials have finished yet.");
                }
                let skip = history.len().saturating_sub(count);
                for record in history.iter().skip(skip) {
                    print_trial(record);
                }
            }
            "summary" => {
                let history = history.lock().await;
                let status = engine_handle.status().await;
                let summary = SessionSummary::from_log(
                    started,
                    status.now,
                    &history,
                    status.closed.clone(),
                );
                println!("  {} trials ({} go, {} catch)", summary.trials, summary.go_trials, summary.catch_trials);
                for (outcome, count) in &summary.outcomes {
                    println!("  {:>15}  {}", outcome.as_str(), count);
                }
                if summary.safety_timeouts > 0 {
                    println!("  {:>15}  {}", "safety timer".red(), summary.safety_timeouts);
                }
            }
            "watch" => match args.get(1) {
                Some(&"on") => {
                    watching.store(true, Ordering::Relaxed);
                    println!("--> Echoing task events.");
                }
                Some(&"off") => {
                    watching.store(false, Ordering::Relaxed);
                    println!("--> Stopped echoing task events.");
                }
                _ => println!("Usage: watch on|off"),
            },
            "help" => print_help(),
            "exit" | "quit" => break,
            _ => println!("Unknown command: '{}'. Type 'help'.", line.trim()),
        }
    }

    println!("Exiting docshell...");
    if engine_handle.status().await.running {
        engine_handle.shutdown();
    }
    match session.await? {
        Ok(summary) => println!(
            "Session ran {:.1} s: {} trials, {} rewards.",
            summary.elapsed, summary.trials, summary.rewards
        ),
        Err(e) => eprintln!("\nEngine stopped with an error: {e}"),
    }
    Ok(())
}

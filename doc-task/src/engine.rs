//! The realtime engine that runs a task against the wall clock.

use crate::error::SinkError;
use crate::events::{CloseReason, Input, TaskEvent};
use crate::sink::TrialSink;
use crate::summary::SessionSummary;
use crate::task::DocTask;
use crate::trial::{Outcome, TrialRecord};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, trace};

/// A snapshot of the running session.
#[derive(Debug, Clone, Default)]
pub struct SessionStatus {
    /// Session time in seconds.
    pub now: f64,
    pub running: bool,
    pub trials: u64,
    pub current_trial: Option<u64>,
    pub catch: bool,
    pub outcome: Option<Outcome>,
    pub active_epochs: Vec<String>,
    pub rewards: u64,
    pub volume: f64,
    pub closed: Option<CloseReason>,
}

/// Forwards finished trials to the engine's broadcast channel.
struct BroadcastSink(broadcast::Sender<TrialRecord>);

impl TrialSink for BroadcastSink {
    fn publish(&mut self, record: &TrialRecord) -> Result<(), SinkError> {
        self.0.send(record.clone()).ok();
        Ok(())
    }
}

#[doc(hidden)]
struct Runner {
    task: DocTask,
    inputs: mpsc::UnboundedReceiver<Input>,
    shutdown: broadcast::Receiver<()>,
}

/// Drives a `DocTask` in real time.
///
/// Session time is mapped onto a `tokio` clock started when `run` is called.
/// Inputs sent through the engine are applied between dispatches, never
/// concurrently with one. Task notifications and finished trials are
/// broadcast to subscribers. The engine is cheap to clone; every clone is a
/// handle to the same session.
#[derive(Clone)]
pub struct SessionEngine {
    input_sender: mpsc::UnboundedSender<Input>,
    event_sender: broadcast::Sender<TaskEvent>,
    trial_sender: broadcast::Sender<TrialRecord>,
    shutdown_sender: broadcast::Sender<()>,
    status: Arc<RwLock<SessionStatus>>,
    runner: Arc<Mutex<Option<Runner>>>,
}

// Core implementation block for internal logic.
impl SessionEngine {
    /// Wraps a task that has not been started yet.
    pub fn new(mut task: DocTask) -> Self {
        const CHANNEL_CAPACITY: usize = 256;
        let (event_sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (trial_sender, _) = broadcast::channel(64);
        let (shutdown_sender, shutdown) = broadcast::channel(1);
        let (input_sender, inputs) = mpsc::unbounded_channel();

        task.add_sink(Box::new(BroadcastSink(trial_sender.clone())));

        Self {
            input_sender,
            event_sender,
            trial_sender,
            shutdown_sender,
            status: Arc::new(RwLock::new(SessionStatus::default())),
            runner: Arc::new(Mutex::new(Some(Runner {
                task,
                inputs,
                shutdown,
            }))),
        }
    }

    /// Runs the session until it closes or `shutdown` is called.
    ///
    /// Returns the session summary. Fails if the session is already running
    /// or has already run.
    pub async fn run(&self) -> anyhow::Result<SessionSummary> {
        let Some(mut runner) = self.runner.lock().await.take() else {
            anyhow::bail!("session engine has already been started");
        };
        let started = Utc::now();
        let origin = Instant::now();
        info!("Session engine starting.");

        runner.task.start();
        self.publish(&mut runner.task).await;

        while !runner.task.is_closed() {
            let deadline = runner.task.next_deadline().map(|d| origin + d);
            tokio::select! {
                biased;
                _ = runner.shutdown.recv() => {
                    info!("Shutdown requested.");
                    runner.task.advance_to(origin.elapsed());
                    runner.task.close(CloseReason::Requested);
                }
                Some(input) = runner.inputs.recv() => {
                    runner.task.advance_to(origin.elapsed());
                    trace!(?input, "Input received.");
                    runner.task.handle_input(input);
                }
                _ = wait_until(deadline) => {
                    runner.task.advance_to(origin.elapsed());
                }
            }
            self.publish(&mut runner.task).await;
        }

        let summary = SessionSummary::from_log(
            started,
            runner.task.now().as_secs_f64(),
            runner.task.trial_log(),
            runner.task.close_reason().cloned(),
        );
        info!(trials = summary.trials, "Session engine stopped.");
        Ok(summary)
    }

    #[doc(hidden)]
    async fn publish(&self, task: &mut DocTask) {
        for event in task.drain_events() {
            debug!(?event, "Task event.");
            self.event_sender.send(event).ok();
        }
        let mut status = self.status.write().await;
        status.now = task.now().as_secs_f64();
        status.running = !task.is_closed();
        status.trials = task.trial_count();
        status.current_trial = task.current_trial();
        status.catch = task.is_catch_trial();
        status.outcome = task.current_outcome();
        status.active_epochs = task
            .epochs()
            .active()
            .iter()
            .filter_map(|id| task.epochs().get(*id))
            .map(|epoch| epoch.name().to_string())
            .collect();
        status.rewards = task.cumulative_rewards();
        status.volume = task.cumulative_volume();
        status.closed = task.close_reason().cloned();
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// Public API implementation block.
impl SessionEngine {
    /// Queues an input for the running task.
    pub fn send(&self, input: Input) -> anyhow::Result<()> {
        self.input_sender
            .send(input)
            .map_err(|_| anyhow::anyhow!("session engine is gone"))
    }

    /// Reports a lick now.
    pub fn lick(&self) -> anyhow::Result<()> {
        self.send(Input::Lick)
    }

    /// Aborts the running trial.
    pub fn abort(&self) -> anyhow::Result<()> {
        self.send(Input::Abort)
    }

    /// Asks `run` to close the session and return.
    ///
    /// A request made before `run` is called is kept, and the session closes
    /// as soon as it starts.
    pub fn shutdown(&self) {
        if self.shutdown_sender.send(()).is_err() {
            error!("Failed to send shutdown signal; the engine is not running.");
        }
    }

    /// The latest session snapshot.
    pub async fn status(&self) -> SessionStatus {
        self.status.read().await.clone()
    }

    /// Subscribes to the `TaskEvent` stream.
    pub fn subscribe_task_events(&self) -> broadcast::Receiver<TaskEvent> {
        self.event_sender.subscribe()
    }

    /// Subscribes to finished trial records.
    pub fn subscribe_trials(&self) -> broadcast::Receiver<TrialRecord> {
        self.trial_sender.subscribe()
    }
}

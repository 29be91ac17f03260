//! # doctask
//!
//! An event-driven engine for the Detection-of-Change (DoC) behavioral task.
//!
//! A subject watches a stimulus that changes at an unpredictable time and
//! reports the change by licking. `doctask` sequences each trial through
//! timed epochs, routes licks and stimulus changes to whatever epochs are
//! active, arbitrates exactly one outcome per trial and guarantees that every
//! trial ends, by a safety timer if nothing else.
//!
//! ## Core Concepts
//!
//! - **Dispatcher**: A single-threaded, run-to-completion timer queue with a
//!   virtual clock. Nothing happens between two dispatches.
//! - **Epochs**: Named, timed phases (`initial_blank`, `pre_change`,
//!   `stimulus_window`, `response_window`, `no_lick`, `timeout`) whose
//!   meaning comes from a `PhaseBehavior`.
//! - **Trial Generators**: Produce each trial's parameters, optionally from
//!   the finalized trial history.
//! - **Drivers**: `Simulation` runs a session in virtual time against a
//!   synthetic subject; `SessionEngine` runs it against the wall clock on
//!   `tokio` and broadcasts what happens.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use doctask::prelude::*;
//! use std::time::Duration;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = SessionConfig::load(None)?;
//!     let generator = generator::from_config(&config.generator, &config.task)?;
//!     let stimulus = SimulatedStimulus::new(
//!         vec!["A".into(), "B".into()],
//!         config.task.flash_period(),
//!     );
//!     let task = DocTask::new(&config.task, Box::new(stimulus), None, generator)?;
//!
//!     let mut sim = Simulation::new(task, SyntheticSubject::new(config.subject.clone()));
//!     let summary = sim.run(Duration::from_secs(3600));
//!     println!("{} trials", summary.trials);
//!     Ok(())
//! }
//! ```

pub const ENGINE_NAME: &str = "DoC Task Engine";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Declare all the modules in the crate.
pub mod common;
pub mod components;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod scheduler;
pub mod sim;
pub mod sink;
pub mod summary;
pub mod surfaces;
pub mod task;
pub mod time;
pub mod trial;

/// A prelude module for easy importing of the most common types.
pub mod prelude {
    pub use crate::common::{EpochId, TimerId};
    pub use crate::components::epoch::{EntryPlan, Epoch, EpochHost, EpochState, PhaseBehavior};
    pub use crate::components::generator::{
        self, AdaptiveTrialGenerator, DefaultTrialGenerator, ParamGenerator, TrialGenerator,
    };
    pub use crate::config::{GeneratorConfig, SessionConfig, SubjectConfig, TaskConfig};
    pub use crate::engine::{SessionEngine, SessionStatus};
    pub use crate::error::{ConfigError, GeneratorError, SinkError};
    pub use crate::events::{CloseReason, Input, TaskEvent};
    pub use crate::sim::{Simulation, SyntheticSubject};
    pub use crate::sink::{JsonLinesSink, MemorySink, TrialSink};
    pub use crate::summary::SessionSummary;
    pub use crate::surfaces::{CountingReward, RewardLine, SimulatedStimulus, Stimulus};
    pub use crate::task::DocTask;
    pub use crate::trial::{Outcome, TrialParams, TrialRecord};
}

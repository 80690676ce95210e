//! Concurrent coordinator, worker and observer loops over a shared task queue.
//!
//! A foreground [`Coordinator`] turns external messages into tasks, category
//! [`WorkerLoop`]s claim and work those tasks, and [`ObserverLoop`]s review
//! changing resources and file new issues. The [`Orchestrator`] owns them all
//! and shuts them down cooperatively.
//!
//! # Main types
//!
//! - [`Orchestrator`]: Owns the lifecycle, from lazy start to graceful stop.
//! - [`WorkerLoop`]: Claims tasks of one category and applies the executor's outcome.
//! - [`ObserverLoop`]: Reviews on fingerprint change, creating at most K issues.
//! - [`Executor`] / [`ExecutorSession`]: The opaque component that does the work.
//! - [`IssueTools`] / [`ClaimedTask`]: Queue operations exposed to an executor call.
//! - [`LoopMonitor`]: Per-actor status and metrics.

/// Subprocess executor driven by stdin/stdout.
pub mod command_executor;
/// TOML configuration for the coordinator and every loop.
pub mod config;
/// Foreground message handling with cooperative yielding.
pub mod coordinator;
/// Orchestrator lifecycle.
pub mod engine;
/// Executor delegate traits and session bookkeeping.
pub mod executor;
/// Change detection for observers.
pub mod fingerprint;
/// Loop health and metrics monitoring.
pub mod monitor;
/// Observer review loop.
pub mod observer;
/// Frozen per-actor profiles and default instructions.
pub mod profiles;
/// Cooperative shutdown signal.
pub mod shutdown;
/// Queue tool surface handed to executor calls.
pub mod tools;
/// Worker claim-and-work loop.
pub mod worker;

pub use command_executor::{parse_directive, CommandConfig, CommandExecutor, Directive};
pub use config::{CoordinatorConfig, ObserverConfig, OrchestratorConfig, WorkerConfig};
pub use coordinator::Coordinator;
pub use engine::Orchestrator;
pub use executor::{
    ExecutionContext, ExecutionMode, Executor, ExecutorSession, SessionRegistry, SessionRequest,
};
pub use fingerprint::{FileFingerprinter, Fingerprint, Fingerprinter};
pub use monitor::{LoopMetrics, LoopMonitor, LoopState, LoopStatus};
pub use observer::{ObserverLoop, ReviewOutcome, OBSERVER_KEY};
pub use profiles::{
    coordinator_profile, observer_profile, worker_profiles, CoordinatorProfile, ObserverProfile,
    WorkerProfile,
};
pub use shutdown::{ShutdownSignal, ShutdownTrigger};
pub use tools::{ClaimedTask, IssueTools, WorkOutcome};
pub use worker::{CycleOutcome, WorkerLoop};

//! Core types and error definitions for the Foreman orchestrator.
//!
//! This crate holds everything the other Foreman crates agree on: the shape
//! of a queued [`Task`], the identities of the actors that touch it, and the
//! state machine that decides which status changes are legal.
//!
//! # Main types
//!
//! - [`ForemanError`]: Unified error enum for every Foreman subsystem.
//! - [`ForemanResult`]: Convenience alias for `Result<T, ForemanError>`.
//! - [`Task`]: A unit of work in the shared queue.
//! - [`TaskStatus`]: The five states of the task lifecycle.
//! - [`Actor`]: A coordinator, worker, or observer identity.
//! - [`Transition`]: A state-machine event applied to a task.

/// Task, actor, and status types.
pub mod task;
/// The task state machine.
pub mod transition;

pub use task::{Actor, ActorId, ActorRole, Task, TaskKind, TaskStatus, CATEGORY_KEY};
pub use transition::{TaskEvent, Transition};

use uuid::Uuid;

// --- Error types ---

/// Top-level error type for the Foreman orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum ForemanError {
    /// A conditional update lost the race: the stored status was not the one
    /// the caller last saw.
    #[error("Conflict on task {id}: expected status '{expected}', found '{actual}'")]
    Conflict {
        /// The task that was being updated.
        id: Uuid,
        /// The status the caller expected.
        expected: TaskStatus,
        /// The status actually stored.
        actual: TaskStatus,
    },

    /// The referenced task does not exist.
    #[error("Task not found: {0}")]
    NotFound(Uuid),

    /// The executor delegate failed or returned an unusable result.
    #[error("Executor error: {0}")]
    Executor(String),

    /// The orchestrator has already been told to shut down.
    #[error("Shutdown in progress")]
    ShutdownInProgress,

    /// The transition table has no edge for this event from this status.
    #[error("Invalid transition: cannot {event} a task in status '{from}'")]
    InvalidTransition {
        /// Status the task was in.
        from: TaskStatus,
        /// The event that was attempted.
        event: TaskEvent,
    },

    /// The edge exists but its precondition does not hold.
    #[error("Guard violation: {0}")]
    Guard(String),

    /// An error from a queue store backend.
    #[error("Store error: {0}")]
    Store(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ForemanError {
    /// Whether the failed operation may simply be attempted again.
    ///
    /// Only optimistic-concurrency conflicts qualify; everything else is
    /// either a programming error or needs a caller decision.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ForemanError::Conflict { .. })
    }
}

/// A convenience `Result` alias using [`ForemanError`].
pub type ForemanResult<T> = Result<T, ForemanError>;

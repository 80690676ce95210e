//! Shared task queue for the Foreman orchestrator.
//!
//! Every actor reads and writes tasks through the [`QueueStore`] trait. The
//! only write that changes an existing task is [`QueueStore::update`], which
//! succeeds only when the stored status still equals the status the caller
//! last saw. That single rule is what keeps two workers from claiming the
//! same task.
//!
//! # Main types
//!
//! - [`QueueStore`]: Create / get / list / conditional-update interface.
//! - [`TaskFilter`]: Status and metadata-subset filter for `list`.
//! - [`InMemoryQueueStore`]: Process-local store, used by tests and demos.
//! - [`FileQueueStore`]: Durable store backed by an append-only JSONL event log.
//! - [`TaskSummary`]: Counts by status for display.

/// Append-only JSONL event-log store.
pub mod file;
mod lock;
/// In-memory store.
pub mod memory;
/// The store trait and list filter.
pub mod store;
/// Status counts.
pub mod summary;

pub use file::{FileQueueStore, QueueEvent};
pub use memory::InMemoryQueueStore;
pub use store::{sort_by_priority, QueueStore, TaskFilter};
pub use summary::TaskSummary;

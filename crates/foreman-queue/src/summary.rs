use crate::store::{QueueStore, TaskFilter};
use foreman_core::{ForemanResult, Task, TaskStatus};
use serde::{Deserialize, Serialize};

/// Task counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSummary {
    /// Every task, in any status.
    pub total: usize,
    /// Waiting for a worker.
    pub open: usize,
    /// Claimed by a worker.
    pub in_progress: usize,
    /// Waiting for the user.
    pub pending_user_input: usize,
    /// Waiting for the coordinator.
    pub blocked: usize,
    /// Done or closed.
    pub closed: usize,
}

impl TaskSummary {
    /// Count `tasks` by status.
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let mut summary = Self::default();
        for task in tasks {
            summary.total += 1;
            match task.status {
                TaskStatus::Open => summary.open += 1,
                TaskStatus::InProgress => summary.in_progress += 1,
                TaskStatus::PendingUserInput => summary.pending_user_input += 1,
                TaskStatus::Blocked => summary.blocked += 1,
                TaskStatus::Closed => summary.closed += 1,
            }
        }
        summary
    }

    /// Summarize everything currently in `store`.
    pub async fn of_store(store: &dyn QueueStore) -> ForemanResult<Self> {
        let tasks = store.list(&TaskFilter::new()).await?;
        Ok(Self::from_tasks(&tasks))
    }

    /// Tasks waiting on the coordinator.
    pub fn waiting(&self) -> usize {
        self.pending_user_input + self.blocked
    }

    /// Tasks currently in `status`.
    pub fn count(&self, status: TaskStatus) -> usize {
        match status {
            TaskStatus::Open => self.open,
            TaskStatus::InProgress => self.in_progress,
            TaskStatus::PendingUserInput => self.pending_user_input,
            TaskStatus::Blocked => self.blocked,
            TaskStatus::Closed => self.closed,
        }
    }
}

impl std::fmt::Display for TaskSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} tasks: {} open, {} in progress, {} pending user input, {} blocked, {} closed",
            self.total,
            self.open,
            self.in_progress,
            self.pending_user_input,
            self.blocked,
            self.closed
        )
    }
}

use async_trait::async_trait;
use foreman_core::{ActorId, ForemanError, ForemanResult, Task, TaskStatus, Transition, CATEGORY_KEY};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Storage backend for the shared task queue.
///
/// All operations must be safe to call concurrently from many loops.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert a new task. It must be `open` and unassigned.
    async fn create(&self, task: Task) -> ForemanResult<Uuid>;

    /// Fetch a task, or [`ForemanError::NotFound`].
    async fn get(&self, id: Uuid) -> ForemanResult<Task>;

    /// List tasks matching `filter`, ordered by `(priority, created_at)`.
    async fn list(&self, filter: &TaskFilter) -> ForemanResult<Vec<Task>>;

    /// Apply `transition` only if the stored status equals `expected`.
    ///
    /// Returns [`ForemanError::Conflict`] when another actor got there first,
    /// and the state machine's error when the transition itself is illegal.
    async fn update(
        &self,
        id: Uuid,
        expected: TaskStatus,
        transition: &Transition,
    ) -> ForemanResult<Task>;
}

/// Filter for [`QueueStore::list`]. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskFilter {
    /// Only tasks in this status.
    #[serde(default)]
    pub status: Option<TaskStatus>,
    /// Every entry must be present in the task's metadata with an equal value.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Only tasks assigned to this actor.
    #[serde(default)]
    pub assignee: Option<ActorId>,
}

impl TaskFilter {
    /// A filter that matches every task.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to `status`.
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Restrict to tasks routed to `category`.
    pub fn with_category(self, category: impl Into<String>) -> Self {
        self.with_metadata(CATEGORY_KEY, serde_json::Value::String(category.into()))
    }

    /// Require metadata `key` to equal `value`.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Restrict to tasks assigned to `actor`.
    pub fn assigned_to(mut self, actor: ActorId) -> Self {
        self.assignee = Some(actor);
        self
    }

    /// Whether `task` passes every set criterion.
    pub fn matches(&self, task: &Task) -> bool {
        self.status.map_or(true, |status| task.status == status)
            && self
                .assignee
                .as_ref()
                .map_or(true, |actor| task.assignee.as_ref() == Some(actor))
            && task.matches_metadata(&self.metadata)
    }
}

/// Sort most urgent first: lower priority, then earlier creation, then id.
pub fn sort_by_priority(tasks: &mut [Task]) {
    tasks.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Reject tasks that could not have come from a fresh `Task::new`.
pub(crate) fn validate_new(task: &Task) -> ForemanResult<()> {
    if task.status != TaskStatus::Open {
        return Err(ForemanError::Store(format!(
            "new task {} must be open, not '{}'",
            task.id, task.status
        )));
    }
    if task.assignee.is_some() {
        return Err(ForemanError::Store(format!(
            "new task {} must be unassigned",
            task.id
        )));
    }
    if task.title.trim().is_empty() {
        return Err(ForemanError::Store("task title must not be empty".into()));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_filter_matches_everything() {
        let task = Task::new("t", "d");
        assert!(TaskFilter::new().matches(&task));
    }

    #[test]
    fn test_filter_by_status_and_category() {
        let task = Task::new("t", "d").with_category("coding");
        let filter = TaskFilter::new()
            .with_status(TaskStatus::Open)
            .with_category("coding");
        assert!(filter.matches(&task));
        assert!(!TaskFilter::new().with_category("research").matches(&task));
        assert!(!TaskFilter::new()
            .with_status(TaskStatus::Closed)
            .matches(&task));
    }

    #[test]
    fn test_filter_by_assignee() {
        let mut task = Task::new("t", "d");
        task.assignee = Some("w-0".into());
        assert!(TaskFilter::new().assigned_to("w-0".into()).matches(&task));
        assert!(!TaskFilter::new().assigned_to("w-1".into()).matches(&task));
    }

    #[test]
    fn test_sort_by_priority_then_age() {
        let older_low = Task::new("older, p2", "");
        let mut newer_high = Task::new("newer, p1", "").with_priority(1);
        newer_high.created_at = older_low.created_at + chrono::Duration::seconds(5);
        let mut newer_low = Task::new("newer, p2", "");
        newer_low.created_at = older_low.created_at + chrono::Duration::seconds(10);

        let mut tasks = vec![newer_low.clone(), older_low.clone(), newer_high.clone()];
        sort_by_priority(&mut tasks);
        let titles: Vec<_> = tasks.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, ["newer, p1", "older, p2", "newer, p2"]);
    }

    #[test]
    fn test_validate_new_rejects_claimed_tasks() {
        let mut task = Task::new("t", "d");
        task.status = TaskStatus::InProgress;
        assert!(validate_new(&task).is_err());

        let mut task = Task::new("t", "d");
        task.assignee = Some("w".into());
        assert!(validate_new(&task).is_err());

        assert!(validate_new(&Task::new("  ", "d")).is_err());
        assert!(validate_new(&Task::new("t", "d")).is_ok());
    }
}

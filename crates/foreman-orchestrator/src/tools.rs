use foreman_core::{
    Actor, ForemanError, ForemanResult, Task, TaskStatus, Transition,
};
use foreman_queue::{QueueStore, TaskFilter};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// How many times a status-following operation re-reads the task after losing
/// an optimistic update before giving up with the conflict.
const CONFLICT_RETRIES: usize = 3;

// ---------------------------------------------------------------------------
// IssueTools
// ---------------------------------------------------------------------------

/// Queue operations available to an executor, attributed to one actor.
///
/// Every task created through a tool surface is stamped with the owning
/// actor, its stamp metadata, and its parent session, and is counted so the
/// caller knows exactly how many issues a review produced.
#[derive(Clone)]
pub struct IssueTools {
    store: Arc<dyn QueueStore>,
    actor: Actor,
    create_limit: Option<usize>,
    created: Arc<AtomicUsize>,
    stamp: HashMap<String, serde_json::Value>,
    parent_id: Option<Uuid>,
    default_priority: Option<u8>,
}

impl IssueTools {
    pub fn new(store: Arc<dyn QueueStore>, actor: Actor) -> Self {
        Self {
            store,
            actor,
            create_limit: None,
            created: Arc::new(AtomicUsize::new(0)),
            stamp: HashMap::new(),
            parent_id: None,
            default_priority: None,
        }
    }

    /// Refuse creates beyond `limit` for the lifetime of this surface.
    pub fn with_create_limit(mut self, limit: usize) -> Self {
        self.create_limit = Some(limit);
        self
    }

    /// Metadata written onto every created task, overriding caller values.
    pub fn with_stamp(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.stamp.insert(key.into(), value);
        self
    }

    pub fn with_parent(mut self, parent_id: Option<Uuid>) -> Self {
        self.parent_id = parent_id;
        self
    }

    /// Priority given to tasks built with [`IssueTools::new_task`].
    pub fn with_default_priority(mut self, priority: u8) -> Self {
        self.default_priority = Some(priority);
        self
    }

    pub fn actor(&self) -> &Actor {
        &self.actor
    }

    /// Number of tasks successfully created through this surface.
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn create_limit(&self) -> Option<usize> {
        self.create_limit
    }

    /// A fresh task carrying this surface's default priority.
    pub fn new_task(&self, title: impl Into<String>, description: impl Into<String>) -> Task {
        let task = Task::new(title, description);
        match self.default_priority {
            Some(priority) => task.with_priority(priority),
            None => task,
        }
    }

    /// Create `task` in the queue on behalf of this actor.
    pub async fn create(&self, mut task: Task) -> ForemanResult<Uuid> {
        let limit = self.create_limit;
        // Reserve a slot first so concurrent creates cannot overshoot.
        self.created
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                limit.map_or(true, |k| n < k).then_some(n + 1)
            })
            .map_err(|n| {
                ForemanError::Guard(format!(
                    "{} may create at most {n} tasks per cycle",
                    self.actor
                ))
            })?;

        for (key, value) in &self.stamp {
            task.metadata.insert(key.clone(), value.clone());
        }
        task.created_by = Some(self.actor.id.clone());
        if task.parent_id.is_none() {
            task.parent_id = self.parent_id;
        }

        match self.store.create(task.clone()).await {
            Ok(id) => {
                info!(
                    actor = %self.actor.id,
                    task_id = %id,
                    title = %task.title,
                    category = task.category().unwrap_or("-"),
                    "Task created"
                );
                Ok(id)
            }
            Err(e) => {
                self.created.fetch_sub(1, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    pub async fn get(&self, id: Uuid) -> ForemanResult<Task> {
        self.store.get(id).await
    }

    pub async fn list(&self, filter: &TaskFilter) -> ForemanResult<Vec<Task>> {
        self.store.list(filter).await
    }

    /// Claim an open task for this actor.
    pub async fn claim(&self, id: Uuid) -> ForemanResult<Task> {
        self.store
            .update(
                id,
                TaskStatus::Open,
                &Transition::Claim {
                    actor: self.actor.clone(),
                },
            )
            .await
    }

    /// Resolve a waiting task and return it to `open`.
    pub async fn unblock(&self, id: Uuid, info: impl Into<String>) -> ForemanResult<Task> {
        let transition = Transition::Unblock {
            actor: self.actor.clone(),
            info: info.into(),
        };
        self.apply_current(id, &transition).await
    }

    /// Administrative close from any non-closed status.
    pub async fn close(&self, id: Uuid, reason: impl Into<String>) -> ForemanResult<Task> {
        let transition = Transition::Close {
            actor: self.actor.clone(),
            reason: reason.into(),
        };
        self.apply_current(id, &transition).await
    }

    /// Set classification metadata on a non-closed task.
    pub async fn annotate(
        &self,
        id: Uuid,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> ForemanResult<Task> {
        let transition = Transition::Annotate {
            actor: self.actor.clone(),
            key: key.into(),
            value,
        };
        self.apply_current(id, &transition).await
    }

    /// Apply `transition` against whatever status the task currently has.
    async fn apply_current(&self, id: Uuid, transition: &Transition) -> ForemanResult<Task> {
        let mut attempt = 0;
        loop {
            let current = self.store.get(id).await?;
            match self.store.update(id, current.status, transition).await {
                Err(e) if e.is_retryable() && attempt < CONFLICT_RETRIES => {
                    attempt += 1;
                    debug!(task_id = %id, attempt, event = %transition.event(), "Retrying after conflict");
                }
                other => return other,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ClaimedTask
// ---------------------------------------------------------------------------

/// How a worker's executor decided to leave its claimed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum WorkOutcome {
    Complete(String),
    Block(String),
    RequestUserInput(String),
    Release,
}

impl WorkOutcome {
    /// The state-machine transition that carries out this outcome.
    pub fn transition(&self, actor: Actor) -> Transition {
        match self {
            WorkOutcome::Complete(reason) => Transition::Complete {
                actor,
                reason: reason.clone(),
            },
            WorkOutcome::Block(reason) => Transition::Block {
                actor,
                reason: reason.clone(),
            },
            WorkOutcome::RequestUserInput(reason) => Transition::RequestUserInput {
                actor,
                reason: reason.clone(),
            },
            WorkOutcome::Release => Transition::Release { actor },
        }
    }
}

/// The task a worker holds during one cycle, and the only operations the
/// executor may perform on it. Exactly one outcome can be recorded.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    task: Task,
    outcome: Arc<Mutex<Option<WorkOutcome>>>,
}

impl ClaimedTask {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            outcome: Arc::new(Mutex::new(None)),
        }
    }

    /// Snapshot of the task as it was when claimed.
    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn id(&self) -> Uuid {
        self.task.id
    }

    pub fn request_user_input(&self, reason: impl Into<String>) -> ForemanResult<()> {
        self.decide(WorkOutcome::RequestUserInput(reason.into()))
    }

    pub fn block(&self, reason: impl Into<String>) -> ForemanResult<()> {
        self.decide(WorkOutcome::Block(reason.into()))
    }

    pub fn complete(&self, reason: impl Into<String>) -> ForemanResult<()> {
        self.decide(WorkOutcome::Complete(reason.into()))
    }

    pub fn release(&self) -> ForemanResult<()> {
        self.decide(WorkOutcome::Release)
    }

    /// The recorded outcome, if the executor made a decision.
    pub fn outcome(&self) -> Option<WorkOutcome> {
        self.outcome.lock().clone()
    }

    fn decide(&self, outcome: WorkOutcome) -> ForemanResult<()> {
        let mut slot = self.outcome.lock();
        if let Some(existing) = slot.as_ref() {
            return Err(ForemanError::Guard(format!(
                "task {} already has outcome {existing:?}",
                self.task.id
            )));
        }
        *slot = Some(outcome);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use foreman_queue::InMemoryQueueStore;

    fn store() -> Arc<dyn QueueStore> {
        Arc::new(InMemoryQueueStore::new())
    }

    #[tokio::test]
    async fn test_create_stamps_and_counts() {
        let store = store();
        let parent = Uuid::new_v4();
        let tools = IssueTools::new(store.clone(), Actor::observer("skeptic"))
            .with_stamp("observer", serde_json::json!("Skeptic"))
            .with_parent(Some(parent))
            .with_default_priority(1);

        let id = tools
            .create(tools.new_task("Unsupported claim", "Section 2").with_metadata(
                "observer",
                serde_json::json!("someone else"),
            ))
            .await
            .unwrap();

        let task = store.get(id).await.unwrap();
        assert_eq!(task.metadata["observer"], "Skeptic");
        assert_eq!(task.created_by.as_ref().map(|a| a.as_str()), Some("skeptic"));
        assert_eq!(task.parent_id, Some(parent));
        assert_eq!(task.priority, 1);
        assert_eq!(tools.created_count(), 1);
    }

    #[tokio::test]
    async fn test_create_limit_is_enforced() {
        let tools = IssueTools::new(store(), Actor::observer("skeptic")).with_create_limit(2);
        tools.create(Task::new("a", "")).await.unwrap();
        tools.create(Task::new("b", "")).await.unwrap();
        let err = tools.create(Task::new("c", "")).await.unwrap_err();
        assert!(matches!(err, ForemanError::Guard(_)));
        assert_eq!(tools.created_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_create_does_not_count() {
        let tools = IssueTools::new(store(), Actor::coordinator("foreman"));
        assert!(tools.create(Task::new("", "")).await.is_err());
        assert_eq!(tools.created_count(), 0);
    }

    #[tokio::test]
    async fn test_clones_share_the_counter() {
        let tools = IssueTools::new(store(), Actor::observer("o")).with_create_limit(1);
        let clone = tools.clone();
        clone.create(Task::new("a", "")).await.unwrap();
        assert_eq!(tools.created_count(), 1);
        assert!(tools.create(Task::new("b", "")).await.is_err());
    }

    #[tokio::test]
    async fn test_unblock_follows_current_status() {
        let store = store();
        let id = store.create(Task::new("t", "")).await.unwrap();
        let worker = IssueTools::new(store.clone(), Actor::worker("w-0"));
        worker.claim(id).await.unwrap();
        store
            .update(
                id,
                TaskStatus::InProgress,
                &Transition::Block {
                    actor: Actor::worker("w-0"),
                    reason: "needs key".into(),
                },
            )
            .await
            .unwrap();

        let coordinator = IssueTools::new(store.clone(), Actor::coordinator("foreman"));
        let task = coordinator.unblock(id, "key is in vault").await.unwrap();
        assert_eq!(task.status, TaskStatus::Open);

        // Unblocking an open task is an error, not a silent success.
        let err = coordinator.unblock(id, "again").await.unwrap_err();
        assert!(matches!(err, ForemanError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_worker_cannot_close() {
        let store = store();
        let id = store.create(Task::new("t", "")).await.unwrap();
        let worker = IssueTools::new(store, Actor::worker("w-0"));
        assert!(matches!(
            worker.close(id, "nope").await,
            Err(ForemanError::Guard(_))
        ));
    }

    #[test]
    fn test_claimed_task_accepts_one_outcome() {
        let claim = ClaimedTask::new(Task::new("t", ""));
        assert!(claim.outcome().is_none());
        claim.complete("done").unwrap();
        assert!(matches!(claim.block("late"), Err(ForemanError::Guard(_))));
        assert_eq!(claim.outcome(), Some(WorkOutcome::Complete("done".into())));
    }

    #[test]
    fn test_outcome_maps_to_transition() {
        let actor = Actor::worker("w-0");
        let t = WorkOutcome::RequestUserInput("need schema".into()).transition(actor.clone());
        assert_eq!(
            t,
            Transition::RequestUserInput {
                actor: actor.clone(),
                reason: "need schema".into()
            }
        );
        assert_eq!(WorkOutcome::Release.transition(actor.clone()), Transition::Release { actor });
    }
}

use crate::executor::{
    execute_isolated, ExecutionContext, ExecutionMode, Executor, ExecutorSession, SessionRegistry,
    SessionRequest,
};
use crate::monitor::{LoopMonitor, LoopStatus};
use crate::profiles::{task_prompt, WorkerProfile};
use crate::shutdown::ShutdownSignal;
use crate::tools::{ClaimedTask, IssueTools, WorkOutcome};
use foreman_core::{ForemanResult, Task, TaskStatus, Transition};
use foreman_queue::{QueueStore, TaskFilter};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

/// What one worker cycle ended with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// No open task in this worker's category.
    Idle,
    /// Another worker claimed the candidate first.
    Conflict,
    Completed(Uuid),
    AwaitingInput(Uuid),
    Blocked(Uuid),
    /// Released back to `open`, by the executor or because it decided nothing.
    Released(Uuid),
    /// The task changed under the worker (e.g. closed by the coordinator)
    /// before its outcome could be applied.
    Superseded(Uuid),
    /// Something failed; the loop backs off before the next cycle.
    Failed,
}

/// A continuous loop that claims and works tasks of one category.
pub struct WorkerLoop {
    profile: WorkerProfile,
    store: Arc<dyn QueueStore>,
    executor: Arc<dyn Executor>,
    monitor: Arc<LoopMonitor>,
    sessions: SessionRegistry,
    parent_id: Option<Uuid>,
    session: Option<Arc<dyn ExecutorSession>>,
    span: Span,
}

impl WorkerLoop {
    pub fn new(
        profile: WorkerProfile,
        store: Arc<dyn QueueStore>,
        executor: Arc<dyn Executor>,
        monitor: Arc<LoopMonitor>,
        sessions: SessionRegistry,
    ) -> Self {
        let span = info_span!("worker", actor = %profile.actor.id, category = %profile.category);
        Self {
            profile,
            store,
            executor,
            monitor,
            sessions,
            parent_id: None,
            session: None,
            span,
        }
    }

    /// Trace sessions opened by this worker back to a coordinator session.
    pub fn with_parent(mut self, parent_id: Option<Uuid>) -> Self {
        self.parent_id = parent_id;
        self
    }

    pub fn profile(&self) -> &WorkerProfile {
        &self.profile
    }

    /// Run cycles until `shutdown` is signaled. An in-flight cycle always
    /// finishes before the loop exits.
    pub async fn run(mut self, mut shutdown: ShutdownSignal) {
        let span = self.span.clone();
        async move {
            let actor = self.profile.actor.clone();
            self.monitor.register(&actor).await;
            info!("Worker started");

            while !shutdown.is_triggered() {
                let pause = match self.run_cycle().await {
                    CycleOutcome::Conflict => {
                        tokio::task::yield_now().await;
                        continue;
                    }
                    CycleOutcome::Failed => {
                        self.monitor.set_status(&actor.id, LoopStatus::Backoff).await;
                        self.profile.error_backoff
                    }
                    _ => self.profile.poll_interval,
                };
                if !shutdown.sleep(pause).await {
                    break;
                }
                self.monitor.set_status(&actor.id, LoopStatus::Idle).await;
            }

            self.close_session().await;
            self.monitor.stopped(&actor.id).await;
            info!("Worker stopped");
        }
        .instrument(span)
        .await;
    }

    /// One poll-claim-execute cycle.
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        let actor = self.profile.actor.clone();
        self.monitor.record_cycle(&actor.id).await;

        let filter = TaskFilter::new()
            .with_status(TaskStatus::Open)
            .with_category(self.profile.category.clone());
        let candidate = match self.store.list(&filter).await {
            Ok(tasks) => match tasks.into_iter().next() {
                Some(task) => task,
                None => {
                    debug!("No open tasks");
                    return CycleOutcome::Idle;
                }
            },
            Err(e) => {
                error!(error = %e, "Failed to list tasks");
                self.monitor.record_error(&actor.id).await;
                return CycleOutcome::Failed;
            }
        };

        // Open the session before claiming so a failure here leaves the task untouched.
        let session = match self.session().await {
            Ok(session) => session,
            Err(e) => {
                error!(error = %e, "Failed to open executor session");
                self.monitor.record_error(&actor.id).await;
                return CycleOutcome::Failed;
            }
        };

        let claim = Transition::Claim {
            actor: actor.clone(),
        };
        let task = match self.store.update(candidate.id, TaskStatus::Open, &claim).await {
            Ok(task) => task,
            Err(e) if e.is_retryable() => {
                debug!(task_id = %candidate.id, "Lost claim race");
                return CycleOutcome::Conflict;
            }
            Err(e) => {
                error!(task_id = %candidate.id, error = %e, "Claim failed");
                self.monitor.record_error(&actor.id).await;
                return CycleOutcome::Failed;
            }
        };

        info!(task_id = %task.id, title = %task.title, "Claimed task");
        self.monitor.start_task(&actor.id, task.id).await;
        let started = Instant::now();
        let outcome = self.work(session, task).await;
        self.monitor
            .record_duration(&actor.id, started.elapsed().as_millis() as u64)
            .await;
        self.monitor.finish_task(&actor.id).await;
        outcome
    }

    async fn work(&self, session: Arc<dyn ExecutorSession>, task: Task) -> CycleOutcome {
        let actor = &self.profile.actor;
        let claimed = ClaimedTask::new(task.clone());
        let ctx = ExecutionContext {
            actor: actor.clone(),
            mode: ExecutionMode::Work,
            issues: IssueTools::new(self.store.clone(), actor.clone()).with_parent(self.parent_id),
            claim: Some(claimed.clone()),
            open_tasks: Vec::new(),
        };

        let decided = match execute_isolated(session, task_prompt(&task), ctx).await {
            Ok(output) => {
                debug!(task_id = %task.id, output_len = output.len(), "Executor finished");
                claimed.outcome()
            }
            Err(e) => {
                error!(task_id = %task.id, error = %e, "Executor failed, releasing task");
                self.monitor.record_error(&actor.id).await;
                self.release(task.id).await;
                return CycleOutcome::Failed;
            }
        };

        let Some(outcome) = decided else {
            warn!(
                task_id = %task.id,
                "Executor neither completed nor blocked the task, releasing it"
            );
            self.monitor.record_error(&actor.id).await;
            return if self.release(task.id).await {
                CycleOutcome::Released(task.id)
            } else {
                CycleOutcome::Superseded(task.id)
            };
        };

        self.apply(task.id, outcome).await
    }

    async fn apply(&self, id: Uuid, outcome: WorkOutcome) -> CycleOutcome {
        let actor = &self.profile.actor;
        let transition = outcome.transition(actor.clone());
        match self.store.update(id, TaskStatus::InProgress, &transition).await {
            Ok(task) => match outcome {
                WorkOutcome::Complete(_) => {
                    info!(task_id = %id, "Task completed");
                    self.monitor.record_completed(&actor.id).await;
                    CycleOutcome::Completed(id)
                }
                WorkOutcome::RequestUserInput(_) => {
                    info!(task_id = %id, notes = task.blocking_notes.as_deref().unwrap_or(""), "Task needs user input");
                    self.monitor.record_awaiting_input(&actor.id).await;
                    CycleOutcome::AwaitingInput(id)
                }
                WorkOutcome::Block(_) => {
                    info!(task_id = %id, notes = task.blocking_notes.as_deref().unwrap_or(""), "Task blocked");
                    self.monitor.record_blocked(&actor.id).await;
                    CycleOutcome::Blocked(id)
                }
                WorkOutcome::Release => {
                    info!(task_id = %id, "Task released by executor");
                    self.monitor.record_released(&actor.id).await;
                    CycleOutcome::Released(id)
                }
            },
            Err(e) if e.is_retryable() => {
                warn!(task_id = %id, error = %e, "Task changed while in progress, outcome dropped");
                CycleOutcome::Superseded(id)
            }
            Err(e) => {
                error!(task_id = %id, error = %e, "Failed to apply outcome, releasing task");
                self.monitor.record_error(&actor.id).await;
                self.release(id).await;
                CycleOutcome::Failed
            }
        }
    }

    /// Put a claimed task back to `open`. Returns whether it was released.
    async fn release(&self, id: Uuid) -> bool {
        let actor = &self.profile.actor;
        let release = Transition::Release {
            actor: actor.clone(),
        };
        match self.store.update(id, TaskStatus::InProgress, &release).await {
            Ok(_) => {
                self.monitor.record_released(&actor.id).await;
                true
            }
            Err(e) => {
                warn!(task_id = %id, error = %e, "Could not release task");
                false
            }
        }
    }

    async fn session(&mut self) -> ForemanResult<Arc<dyn ExecutorSession>> {
        if let Some(session) = &self.session {
            return Ok(session.clone());
        }
        let session = self
            .executor
            .open_session(SessionRequest {
                actor: self.profile.actor.clone(),
                parent_id: self.parent_id,
                system_instructions: self.profile.instructions.clone(),
            })
            .await?;
        self.sessions
            .record(&self.profile.actor.id, session.session_id());
        info!(session_id = %session.session_id(), "Worker session opened");
        self.session = Some(session.clone());
        Ok(session)
    }

    async fn close_session(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(e) = session.close().await {
                warn!(error = %e, "Failed to close worker session");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use crate::executor::testing::ScriptedExecutor;
    use crate::profiles::worker_profiles;
    use foreman_core::{ForemanError, Task};
    use foreman_queue::InMemoryQueueStore;
    use std::time::Duration;

    fn profile(category: &str) -> WorkerProfile {
        let mut config = WorkerConfig::new(format!("{category}-worker"), category);
        config.poll_interval_ms = 50;
        config.error_backoff_ms = 100;
        worker_profiles(&[config]).remove(0)
    }

    fn worker(
        category: &str,
        store: &Arc<InMemoryQueueStore>,
        executor: Arc<ScriptedExecutor>,
    ) -> WorkerLoop {
        WorkerLoop::new(
            profile(category),
            store.clone(),
            executor,
            Arc::new(LoopMonitor::new()),
            SessionRegistry::new(),
        )
    }

    fn completing() -> Arc<ScriptedExecutor> {
        ScriptedExecutor::new(|_instructions, ctx| {
            async move {
                ctx.claim.as_ref().unwrap().complete("Work completed")?;
                Ok("done".to_string())
            }
        })
    }

    #[tokio::test]
    async fn test_idle_when_queue_empty() {
        let store = Arc::new(InMemoryQueueStore::new());
        let executor = completing();
        let mut worker = worker("coding", &store, executor.clone());
        assert_eq!(worker.run_cycle().await, CycleOutcome::Idle);
        assert_eq!(executor.opened(), 0);
    }

    #[tokio::test]
    async fn test_claims_and_completes() {
        let store = Arc::new(InMemoryQueueStore::new());
        let id = store
            .create(Task::new("Fix login", "").with_category("coding"))
            .await
            .unwrap();
        let mut worker = worker("coding", &store, completing());

        assert_eq!(worker.run_cycle().await, CycleOutcome::Completed(id));
        let task = store.get(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Closed);
        assert_eq!(task.resolution.as_deref(), Some("Work completed"));
        assert!(task.assignee.is_none());
    }

    #[tokio::test]
    async fn test_ignores_other_categories() {
        let store = Arc::new(InMemoryQueueStore::new());
        let id = store
            .create(Task::new("Fix login", "").with_category("coding"))
            .await
            .unwrap();
        let mut worker = worker("research", &store, completing());

        assert_eq!(worker.run_cycle().await, CycleOutcome::Idle);
        assert_eq!(store.get(id).await.unwrap().status, TaskStatus::Open);
    }

    #[tokio::test]
    async fn test_executor_sees_claimed_task_in_progress() {
        let store = Arc::new(InMemoryQueueStore::new());
        let id = store
            .create(Task::new("t", "").with_category("coding"))
            .await
            .unwrap();
        let probe = store.clone();
        let executor = ScriptedExecutor::new(move |_i, ctx| {
            let probe = probe.clone();
            async move {
                let claim = ctx.claim.clone().unwrap();
                let seen = probe.get(claim.id()).await?;
                assert_eq!(seen.status, TaskStatus::InProgress);
                assert_eq!(seen.assignee.as_ref(), Some(&ctx.actor.id));
                claim.complete("ok")?;
                Ok(String::new())
            }
        });
        let mut worker = worker("coding", &store, executor);
        assert_eq!(worker.run_cycle().await, CycleOutcome::Completed(id));
    }

    #[tokio::test]
    async fn test_no_decision_releases_task() {
        let store = Arc::new(InMemoryQueueStore::new());
        let id = store
            .create(Task::new("t", "").with_category("coding"))
            .await
            .unwrap();
        let executor = ScriptedExecutor::new(|_i, _ctx| async move { Ok("thinking".into()) });
        let mut worker = worker("coding", &store, executor);

        assert_eq!(worker.run_cycle().await, CycleOutcome::Released(id));
        let task = store.get(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Open);
        assert!(task.assignee.is_none());
    }

    #[tokio::test]
    async fn test_executor_error_releases_and_fails() {
        let store = Arc::new(InMemoryQueueStore::new());
        let id = store
            .create(Task::new("t", "").with_category("coding"))
            .await
            .unwrap();
        let executor = ScriptedExecutor::new(|_i, _ctx| {
            async move { Err(ForemanError::Executor("model unavailable".into())) }
        });
        let monitor = Arc::new(LoopMonitor::new());
        let profile = profile("coding");
        monitor.register(&profile.actor).await;
        let actor_id = profile.actor.id.clone();
        let mut worker = WorkerLoop::new(
            profile,
            store.clone(),
            executor,
            monitor.clone(),
            SessionRegistry::new(),
        );

        assert_eq!(worker.run_cycle().await, CycleOutcome::Failed);
        assert_eq!(store.get(id).await.unwrap().status, TaskStatus::Open);
        let state = monitor.get_state(&actor_id).await.unwrap();
        assert_eq!(state.metrics.errors, 1);
        assert_eq!(state.metrics.released, 1);
    }

    #[tokio::test]
    async fn test_request_user_input() {
        let store = Arc::new(InMemoryQueueStore::new());
        let id = store
            .create(Task::new("Add table", "").with_category("coding"))
            .await
            .unwrap();
        let executor = ScriptedExecutor::new(|_i, ctx| {
            async move {
                ctx.claim.as_ref().unwrap().request_user_input("need schema")?;
                Ok(String::new())
            }
        });
        let mut worker = worker("coding", &store, executor);

        assert_eq!(worker.run_cycle().await, CycleOutcome::AwaitingInput(id));
        let task = store.get(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::PendingUserInput);
        assert_eq!(task.blocking_notes.as_deref(), Some("need schema"));
        assert!(task.assignee.is_some());
    }

    #[tokio::test]
    async fn test_closed_by_coordinator_mid_cycle_is_superseded() {
        let store = Arc::new(InMemoryQueueStore::new());
        let id = store
            .create(Task::new("t", "").with_category("coding"))
            .await
            .unwrap();
        let admin = store.clone();
        let executor = ScriptedExecutor::new(move |_i, ctx| {
            let admin = admin.clone();
            async move {
                let claim = ctx.claim.clone().unwrap();
                IssueTools::new(admin, foreman_core::Actor::coordinator("foreman"))
                    .close(claim.id(), "no longer needed")
                    .await?;
                claim.complete("done anyway")?;
                Ok(String::new())
            }
        });
        let mut worker = worker("coding", &store, executor);

        assert_eq!(worker.run_cycle().await, CycleOutcome::Superseded(id));
        let task = store.get(id).await.unwrap();
        assert_eq!(task.resolution.as_deref(), Some("no longer needed"));
    }

    #[tokio::test]
    async fn test_session_is_reused_and_closed_on_stop() {
        let store = Arc::new(InMemoryQueueStore::new());
        for n in 0..2 {
            store
                .create(Task::new(format!("t{n}"), "").with_category("coding"))
                .await
                .unwrap();
        }
        let executor = completing();
        let (trigger, signal) = crate::shutdown::channel();
        let sessions = SessionRegistry::new();
        let worker = WorkerLoop::new(
            profile("coding"),
            store.clone(),
            executor.clone(),
            Arc::new(LoopMonitor::new()),
            sessions.clone(),
        );
        let handle = tokio::spawn(worker.run(signal));

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let closed = store
                    .list(&TaskFilter::new().with_status(TaskStatus::Closed))
                    .await
                    .unwrap();
                if closed.len() == 2 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        trigger.trigger();
        handle.await.unwrap();
        assert_eq!(executor.opened(), 1);
        assert_eq!(executor.closed.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(sessions.snapshot().len(), 1);
    }
}

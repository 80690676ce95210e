use crate::tools::{ClaimedTask, IssueTools};
use async_trait::async_trait;
use foreman_core::{Actor, ActorId, ForemanError, ForemanResult, Task};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Which loop is calling the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Handling an external message for the coordinator.
    Coordinate,
    /// Working a claimed task.
    Work,
    /// Reviewing a changed resource set.
    Review,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Coordinate => write!(f, "coordinate"),
            ExecutionMode::Work => write!(f, "work"),
            ExecutionMode::Review => write!(f, "review"),
        }
    }
}

/// Everything an executor call may act on.
#[derive(Clone)]
pub struct ExecutionContext {
    pub actor: Actor,
    pub mode: ExecutionMode,
    /// Queue operations attributed to `actor`.
    pub issues: IssueTools,
    /// Present only in [`ExecutionMode::Work`].
    pub claim: Option<ClaimedTask>,
    /// Tasks the actor should know about before creating new ones.
    pub open_tasks: Vec<Task>,
}

/// Parameters for opening an executor session.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub actor: Actor,
    /// Coordinator session this one traces back to.
    pub parent_id: Option<Uuid>,
    pub system_instructions: String,
}

/// The component that actually performs work. Opaque to the loops.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn open_session(&self, request: SessionRequest)
        -> ForemanResult<Arc<dyn ExecutorSession>>;
}

/// One actor's conversation with the executor.
#[async_trait]
pub trait ExecutorSession: Send + Sync {
    fn session_id(&self) -> Uuid;

    /// Perform one unit of work and return its free-form output.
    ///
    /// Side effects on the queue go through `ctx.issues` and `ctx.claim`.
    async fn execute(&self, instructions: &str, ctx: ExecutionContext) -> ForemanResult<String>;

    /// Release any resources held by the session.
    async fn close(&self) -> ForemanResult<()> {
        Ok(())
    }
}

/// Run one executor call as its own task so a panic inside the executor
/// becomes an error for the calling loop instead of killing it.
pub(crate) async fn execute_isolated(
    session: Arc<dyn ExecutorSession>,
    instructions: String,
    ctx: ExecutionContext,
) -> ForemanResult<String> {
    let handle = tokio::spawn(async move { session.execute(&instructions, ctx).await });
    join_execution(handle).await
}

pub(crate) async fn join_execution(
    handle: tokio::task::JoinHandle<ForemanResult<String>>,
) -> ForemanResult<String> {
    match handle.await {
        Ok(result) => result,
        Err(e) => Err(ForemanError::Executor(format!("executor task failed: {e}"))),
    }
}

/// Latest session id per actor, for traceability.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<ActorId, Uuid>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, actor: &ActorId, session_id: Uuid) {
        self.sessions.lock().insert(actor.clone(), session_id);
    }

    pub fn get(&self, actor: &ActorId) -> Option<Uuid> {
        self.sessions.lock().get(actor).copied()
    }

    pub fn snapshot(&self) -> HashMap<ActorId, Uuid> {
        self.sessions.lock().clone()
    }
}

use crate::executor::{
    join_execution, ExecutionContext, ExecutionMode, Executor, ExecutorSession, SessionRegistry,
    SessionRequest,
};
use crate::monitor::{LoopMonitor, LoopStatus};
use crate::profiles::CoordinatorProfile;
use crate::tools::IssueTools;
use foreman_core::{ForemanError, ForemanResult, TaskStatus};
use foreman_queue::{QueueStore, TaskFilter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{info, info_span, warn, Instrument, Span};
use uuid::Uuid;

/// The foreground actor. Handles one external message at a time and keeps
/// yielding while its executor call is in flight.
pub struct Coordinator {
    profile: CoordinatorProfile,
    store: Arc<dyn QueueStore>,
    executor: Arc<dyn Executor>,
    monitor: Arc<LoopMonitor>,
    sessions: SessionRegistry,
    session: Mutex<Option<Arc<dyn ExecutorSession>>>,
    in_flight: Mutex<()>,
    released: AtomicBool,
    span: Span,
}

impl Coordinator {
    pub fn new(
        profile: CoordinatorProfile,
        store: Arc<dyn QueueStore>,
        executor: Arc<dyn Executor>,
        monitor: Arc<LoopMonitor>,
        sessions: SessionRegistry,
    ) -> Self {
        let span = info_span!("coordinator", actor = %profile.actor.id);
        Self {
            profile,
            store,
            executor,
            monitor,
            sessions,
            session: Mutex::new(None),
            in_flight: Mutex::new(()),
            released: AtomicBool::new(false),
            span,
        }
    }

    pub fn profile(&self) -> &CoordinatorProfile {
        &self.profile
    }

    /// The coordinator session, opened on first use. Fails once released.
    pub async fn session(&self) -> ForemanResult<Arc<dyn ExecutorSession>> {
        let mut slot = self.session.lock().await;
        if self.released.load(Ordering::SeqCst) {
            return Err(ForemanError::ShutdownInProgress);
        }
        if let Some(session) = slot.as_ref() {
            return Ok(session.clone());
        }
        let session = self
            .executor
            .open_session(SessionRequest {
                actor: self.profile.actor.clone(),
                parent_id: None,
                system_instructions: self.profile.instructions.clone(),
            })
            .await?;
        self.monitor.register(&self.profile.actor).await;
        self.sessions
            .record(&self.profile.actor.id, session.session_id());
        info!(parent: &self.span, session_id = %session.session_id(), "Coordinator session opened");
        *slot = Some(session.clone());
        Ok(session)
    }

    /// Id of the open coordinator session, if any.
    pub async fn session_id(&self) -> Option<Uuid> {
        self.session.lock().await.as_ref().map(|s| s.session_id())
    }

    /// Delegate `message` to the executor and return its output unchanged.
    ///
    /// The executor call runs as its own task; this future only checks on it
    /// every `yield_interval`, so each check is a scheduling point for the
    /// background loops.
    pub async fn handle(&self, message: &str) -> ForemanResult<String> {
        let _serial = self.in_flight.lock().await;
        let session = self.session().await?;
        let actor = self.profile.actor.clone();

        async {
            let open_tasks = self
                .store
                .list(&TaskFilter::new())
                .await?
                .into_iter()
                .filter(|t| t.status != TaskStatus::Closed)
                .collect();
            let issues = IssueTools::new(self.store.clone(), actor.clone())
                .with_parent(Some(session.session_id()));
            let ctx = ExecutionContext {
                actor: actor.clone(),
                mode: ExecutionMode::Coordinate,
                issues: issues.clone(),
                claim: None,
                open_tasks,
            };

            self.monitor.set_status(&actor.id, LoopStatus::Working).await;
            let started = Instant::now();
            let message = message.to_string();
            let call = session.clone();
            let handle = tokio::spawn(async move { call.execute(&message, ctx).await });

            let mut polls = 0u64;
            while !handle.is_finished() {
                tokio::time::sleep(self.profile.yield_interval).await;
                polls += 1;
            }
            let result = join_execution(handle).await;

            let elapsed = started.elapsed().as_millis() as u64;
            self.monitor.record_duration(&actor.id, elapsed).await;
            self.monitor.record_created(&actor.id, issues.created_count()).await;
            match &result {
                Ok(output) => {
                    self.monitor.set_status(&actor.id, LoopStatus::Idle).await;
                    info!(elapsed_ms = elapsed, polls, output_len = output.len(), "Message handled");
                }
                Err(e) => {
                    self.monitor.record_error(&actor.id).await;
                    warn!(elapsed_ms = elapsed, error = %e, "Message failed");
                }
            }
            result
        }
        .instrument(self.span.clone())
        .await
    }

    /// Close the coordinator session for good. Safe to call repeatedly or
    /// before any session was opened.
    pub async fn release(&self) {
        let _serial = self.in_flight.lock().await;
        let session = {
            let mut slot = self.session.lock().await;
            self.released.store(true, Ordering::SeqCst);
            slot.take()
        };
        if let Some(session) = session {
            if let Err(e) = session.close().await {
                warn!(parent: &self.span, error = %e, "Failed to close coordinator session");
            }
            self.monitor.stopped(&self.profile.actor.id).await;
            info!(parent: &self.span, "Coordinator session released");
        }
    }
}

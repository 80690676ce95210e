use crate::executor::{
    execute_isolated, ExecutionContext, ExecutionMode, Executor, SessionRegistry, SessionRequest,
};
use crate::fingerprint::{Fingerprint, Fingerprinter};
use crate::monitor::{LoopMonitor, LoopStatus};
use crate::profiles::{review_prompt, ObserverProfile};
use crate::shutdown::ShutdownSignal;
use crate::tools::IssueTools;
use foreman_core::{ForemanResult, TaskStatus, CATEGORY_KEY};
use foreman_queue::{QueueStore, TaskFilter};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

/// Metadata key identifying the observer that created a task.
pub const OBSERVER_KEY: &str = "observer";

/// What one observer cycle ended with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewOutcome {
    /// The watch targets do not exist or are empty.
    NothingToReview,
    /// Same fingerprint as the last successful review.
    Unchanged,
    /// Fingerprinting or the review failed before filing anything; the
    /// baseline was kept.
    Skipped,
    /// A review ran and created this many tasks. The baseline now matches.
    Reviewed { created: usize },
}

/// A continuous loop that reviews a watched resource set whenever it changes.
pub struct ObserverLoop {
    profile: ObserverProfile,
    store: Arc<dyn QueueStore>,
    executor: Arc<dyn Executor>,
    fingerprinter: Arc<dyn Fingerprinter>,
    monitor: Arc<LoopMonitor>,
    sessions: SessionRegistry,
    parent_id: Option<Uuid>,
    baseline: Option<Fingerprint>,
    span: Span,
}

impl ObserverLoop {
    pub fn new(
        profile: ObserverProfile,
        store: Arc<dyn QueueStore>,
        executor: Arc<dyn Executor>,
        fingerprinter: Arc<dyn Fingerprinter>,
        monitor: Arc<LoopMonitor>,
        sessions: SessionRegistry,
    ) -> Self {
        let span = info_span!("observer", actor = %profile.actor.id);
        Self {
            profile,
            store,
            executor,
            fingerprinter,
            monitor,
            sessions,
            parent_id: None,
            baseline: None,
            span,
        }
    }

    pub fn with_parent(mut self, parent_id: Option<Uuid>) -> Self {
        self.parent_id = parent_id;
        self
    }

    pub fn profile(&self) -> &ObserverProfile {
        &self.profile
    }

    /// Fingerprint of the last successful review.
    pub fn baseline(&self) -> Option<&Fingerprint> {
        self.baseline.as_ref()
    }

    pub async fn run(mut self, mut shutdown: ShutdownSignal) {
        let span = self.span.clone();
        async move {
            let actor = self.profile.actor.clone();
            self.monitor.register(&actor).await;
            info!(interval_ms = self.profile.review_interval.as_millis() as u64, "Observer started");

            while !shutdown.is_triggered() {
                self.run_cycle().await;
                if !shutdown.sleep(self.profile.review_interval).await {
                    break;
                }
            }

            self.monitor.stopped(&actor.id).await;
            info!("Observer stopped");
        }
        .instrument(span)
        .await;
    }

    /// Fingerprint the watch targets and review them if they changed.
    pub async fn run_cycle(&mut self) -> ReviewOutcome {
        let actor_id = self.profile.actor.id.clone();
        self.monitor.record_cycle(&actor_id).await;

        let current = match self.fingerprinter.fingerprint().await {
            Ok(Some(fingerprint)) => fingerprint,
            Ok(None) => {
                debug!("Nothing to review yet");
                return ReviewOutcome::NothingToReview;
            }
            Err(e) => {
                warn!(error = %e, "Fingerprinting failed, retrying next interval");
                self.monitor.record_error(&actor_id).await;
                return ReviewOutcome::Skipped;
            }
        };

        if self.baseline.as_ref() == Some(&current) {
            debug!("No changes since last review");
            return ReviewOutcome::Unchanged;
        }

        info!(fingerprint = %current, "Changes detected, reviewing");
        self.monitor.set_status(&actor_id, LoopStatus::Reviewing).await;
        let started = Instant::now();
        let issues = self.issue_tools();
        let result = self.review(&issues).await;
        let created = issues.created_count();
        self.monitor
            .record_duration(&actor_id, started.elapsed().as_millis() as u64)
            .await;

        match result {
            Ok(()) => {
                info!(created, "Review complete");
                self.baseline = Some(current);
                self.monitor.record_review(&actor_id, created).await;
                self.monitor.set_status(&actor_id, LoopStatus::Idle).await;
                ReviewOutcome::Reviewed { created }
            }
            // Issues already filed count against this change.
            Err(e) if created > 0 => {
                warn!(error = %e, created, "Review failed after filing issues, baseline advanced");
                self.baseline = Some(current);
                self.monitor.record_error(&actor_id).await;
                self.monitor.record_review(&actor_id, created).await;
                self.monitor.set_status(&actor_id, LoopStatus::Idle).await;
                ReviewOutcome::Reviewed { created }
            }
            Err(e) => {
                error!(error = %e, "Review failed, baseline kept");
                self.monitor.record_error(&actor_id).await;
                ReviewOutcome::Skipped
            }
        }
    }

    /// Issue tools for one review, capped at the profile's issue limit.
    fn issue_tools(&self) -> IssueTools {
        let mut issues = IssueTools::new(self.store.clone(), self.profile.actor.clone())
            .with_create_limit(self.profile.max_issues)
            .with_stamp(OBSERVER_KEY, serde_json::Value::String(self.profile.name.clone()))
            .with_parent(self.parent_id)
            .with_default_priority(self.profile.priority);
        if let Some(category) = &self.profile.category {
            issues = issues.with_stamp(CATEGORY_KEY, serde_json::Value::String(category.clone()));
        }
        issues
    }

    /// Run one review in a fresh session, creating tasks through `issues`.
    async fn review(&self, issues: &IssueTools) -> ForemanResult<()> {
        let actor = &self.profile.actor;
        let open_tasks = self
            .store
            .list(&TaskFilter::new().with_status(TaskStatus::Open))
            .await?;

        let session = self
            .executor
            .open_session(SessionRequest {
                actor: actor.clone(),
                parent_id: self.parent_id,
                system_instructions: self.profile.instructions.clone(),
            })
            .await?;
        self.sessions.record(&actor.id, session.session_id());
        debug!(session_id = %session.session_id(), "Review session opened");

        let prompt = review_prompt(&self.profile, &open_tasks);
        let ctx = ExecutionContext {
            actor: actor.clone(),
            mode: ExecutionMode::Review,
            issues: issues.clone(),
            claim: None,
            open_tasks,
        };
        let result = execute_isolated(session.clone(), prompt, ctx).await;
        if let Err(e) = session.close().await {
            warn!(error = %e, "Failed to close review session");
        }
        result.map(|_| ())
    }
}

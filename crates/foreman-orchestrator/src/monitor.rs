use foreman_core::{Actor, ActorId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// What a loop is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopStatus {
    Idle,
    Working,
    Reviewing,
    Backoff,
    Stopped,
}

/// Counters accumulated by one loop (or summed over all of them).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopMetrics {
    pub cycles: u64,
    pub claims: u64,
    pub completed: u64,
    pub released: u64,
    pub awaiting_input: u64,
    pub blocked: u64,
    pub errors: u64,
    pub reviews: u64,
    /// Tasks actually created through the actor's tool surface.
    pub issues_created: u64,
    pub duration_ms: u64,
}

impl LoopMetrics {
    fn add(&mut self, other: &LoopMetrics) {
        self.cycles += other.cycles;
        self.claims += other.claims;
        self.completed += other.completed;
        self.released += other.released;
        self.awaiting_input += other.awaiting_input;
        self.blocked += other.blocked;
        self.errors += other.errors;
        self.reviews += other.reviews;
        self.issues_created += other.issues_created;
        self.duration_ms += other.duration_ms;
    }
}

/// Real-time snapshot of one actor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopState {
    pub actor: Actor,
    pub current_task: Option<Uuid>,
    pub status: LoopStatus,
    pub metrics: LoopMetrics,
}

/// Tracks state and metrics for every coordinator, worker, and observer.
///
/// One monitor is shared by all components of an orchestrator; events for an
/// actor that never registered are ignored.
pub struct LoopMonitor {
    states: Arc<RwLock<HashMap<ActorId, LoopState>>>,
}

impl LoopMonitor {
    pub fn new() -> Self {
        Self {
            states: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start tracking `actor`, resetting it to idle. Metrics are kept.
    pub async fn register(&self, actor: &Actor) {
        let mut states = self.states.write().await;
        let state = states.entry(actor.id.clone()).or_insert_with(|| LoopState {
            actor: actor.clone(),
            current_task: None,
            status: LoopStatus::Idle,
            metrics: LoopMetrics::default(),
        });
        state.status = LoopStatus::Idle;
        state.current_task = None;
    }

    async fn with_state(&self, actor: &ActorId, f: impl FnOnce(&mut LoopState)) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(actor) {
            f(state);
        }
    }

    pub async fn set_status(&self, actor: &ActorId, status: LoopStatus) {
        self.with_state(actor, |s| s.status = status).await;
    }

    /// A new poll or review cycle began.
    pub async fn record_cycle(&self, actor: &ActorId) {
        self.with_state(actor, |s| s.metrics.cycles += 1).await;
    }

    /// Mark an actor as working on a claimed task.
    pub async fn start_task(&self, actor: &ActorId, task_id: Uuid) {
        self.with_state(actor, |s| {
            s.current_task = Some(task_id);
            s.status = LoopStatus::Working;
            s.metrics.claims += 1;
        })
        .await;
    }

    /// The claimed task left the actor's hands.
    pub async fn finish_task(&self, actor: &ActorId) {
        self.with_state(actor, |s| {
            s.current_task = None;
            s.status = LoopStatus::Idle;
        })
        .await;
    }

    pub async fn record_completed(&self, actor: &ActorId) {
        self.with_state(actor, |s| s.metrics.completed += 1).await;
    }

    pub async fn record_released(&self, actor: &ActorId) {
        self.with_state(actor, |s| s.metrics.released += 1).await;
    }

    pub async fn record_awaiting_input(&self, actor: &ActorId) {
        self.with_state(actor, |s| s.metrics.awaiting_input += 1).await;
    }

    pub async fn record_blocked(&self, actor: &ActorId) {
        self.with_state(actor, |s| s.metrics.blocked += 1).await;
    }

    /// Record an error and put the actor into backoff.
    pub async fn record_error(&self, actor: &ActorId) {
        self.with_state(actor, |s| {
            s.metrics.errors += 1;
            s.status = LoopStatus::Backoff;
        })
        .await;
    }

    /// Record a finished review and the tasks it created.
    pub async fn record_review(&self, actor: &ActorId, issues_created: usize) {
        self.with_state(actor, |s| {
            s.metrics.reviews += 1;
            s.metrics.issues_created += issues_created as u64;
        })
        .await;
    }

    /// Tasks created outside a review (e.g. by the coordinator).
    pub async fn record_created(&self, actor: &ActorId, count: usize) {
        self.with_state(actor, |s| s.metrics.issues_created += count as u64)
            .await;
    }

    pub async fn record_duration(&self, actor: &ActorId, duration_ms: u64) {
        self.with_state(actor, |s| s.metrics.duration_ms += duration_ms)
            .await;
    }

    pub async fn stopped(&self, actor: &ActorId) {
        self.with_state(actor, |s| {
            s.current_task = None;
            s.status = LoopStatus::Stopped;
        })
        .await;
    }

    /// Snapshot of every registered actor, ordered by actor id.
    pub async fn snapshot(&self) -> Vec<LoopState> {
        let states = self.states.read().await;
        let mut all: Vec<LoopState> = states.values().cloned().collect();
        all.sort_by(|a, b| a.actor.id.cmp(&b.actor.id));
        all
    }

    pub async fn get_state(&self, actor: &ActorId) -> Option<LoopState> {
        let states = self.states.read().await;
        states.get(actor).cloned()
    }

    /// Metrics summed across all actors.
    pub async fn aggregate_metrics(&self) -> LoopMetrics {
        let states = self.states.read().await;
        let mut total = LoopMetrics::default();
        for state in states.values() {
            total.add(&state.metrics);
        }
        total
    }

    /// Serialize the current state as JSON.
    pub async fn to_json(&self) -> serde_json::Value {
        let states = self.snapshot().await;
        let aggregate = self.aggregate_metrics().await;
        serde_json::json!({
            "actors": states,
            "aggregate": aggregate,
        })
    }
}

impl Default for LoopMonitor {
    fn default() -> Self {
        Self::new()
    }
}

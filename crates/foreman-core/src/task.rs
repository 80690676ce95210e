use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;

use crate::ForemanError;

/// Metadata key that routes a task to the worker loops of one category.
pub const CATEGORY_KEY: &str = "category";

/// Default priority for new tasks (lower is more urgent).
pub const DEFAULT_PRIORITY: u8 = 2;

/// Identifier of an actor that creates or mutates tasks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(String);

impl ActorId {
    /// Wrap a raw identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ActorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ActorId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ActorId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// What kind of actor is acting. Used for attribution and for the
/// coordinator-only transitions, never for authorization beyond that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorRole {
    /// Foreground actor handling external messages.
    Coordinator,
    /// Background loop that claims and executes tasks of one category.
    Worker,
    /// Background loop that reviews a watched resource set.
    Observer,
}

impl std::fmt::Display for ActorRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorRole::Coordinator => write!(f, "coordinator"),
            ActorRole::Worker => write!(f, "worker"),
            ActorRole::Observer => write!(f, "observer"),
        }
    }
}

/// An actor identity: who it is and what it is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    /// Unique identifier, e.g. `coding-worker-0`.
    pub id: ActorId,
    /// The actor's role.
    pub role: ActorRole,
}

impl Actor {
    /// Build a coordinator identity.
    pub fn coordinator(id: impl Into<ActorId>) -> Self {
        Self {
            id: id.into(),
            role: ActorRole::Coordinator,
        }
    }

    /// Build a worker identity.
    pub fn worker(id: impl Into<ActorId>) -> Self {
        Self {
            id: id.into(),
            role: ActorRole::Worker,
        }
    }

    /// Build an observer identity.
    pub fn observer(id: impl Into<ActorId>) -> Self {
        Self {
            id: id.into(),
            role: ActorRole::Observer,
        }
    }

    /// Whether this actor may perform coordinator-level transitions.
    pub fn is_coordinator(&self) -> bool {
        self.role == ActorRole::Coordinator
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.id, self.role)
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Unassigned work waiting for a worker.
    Open,
    /// Claimed by a worker and being worked on.
    InProgress,
    /// The worker needs information only the user can provide.
    PendingUserInput,
    /// The worker cannot proceed until something else happens.
    Blocked,
    /// Terminal. Retained for audit.
    Closed,
}

impl TaskStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Open,
        TaskStatus::InProgress,
        TaskStatus::PendingUserInput,
        TaskStatus::Blocked,
        TaskStatus::Closed,
    ];

    /// The snake_case wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Open => "open",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::PendingUserInput => "pending_user_input",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Closed => "closed",
        }
    }

    /// Whether no further transition is defined.
    pub fn is_terminal(&self) -> bool {
        *self == TaskStatus::Closed
    }

    /// Whether the task waits on the coordinator to `unblock` it.
    pub fn is_waiting(&self) -> bool {
        matches!(self, TaskStatus::PendingUserInput | TaskStatus::Blocked)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ForemanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s.to_lowercase())
            .ok_or_else(|| ForemanError::Config(format!("unknown task status '{s}'")))
    }
}

/// Human classification of a task. Never used for control flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Bug,
    Feature,
    #[default]
    Task,
    Epic,
    Chore,
    Research,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::Bug => write!(f, "bug"),
            TaskKind::Feature => write!(f, "feature"),
            TaskKind::Task => write!(f, "task"),
            TaskKind::Epic => write!(f, "epic"),
            TaskKind::Chore => write!(f, "chore"),
            TaskKind::Research => write!(f, "research"),
        }
    }
}

impl FromStr for TaskKind {
    type Err = ForemanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bug" => Ok(TaskKind::Bug),
            "feature" => Ok(TaskKind::Feature),
            "task" => Ok(TaskKind::Task),
            "epic" => Ok(TaskKind::Epic),
            "chore" => Ok(TaskKind::Chore),
            "research" => Ok(TaskKind::Research),
            other => Err(ForemanError::Config(format!("unknown task kind '{other}'"))),
        }
    }
}

/// A task in the shared queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub kind: TaskKind,
    pub status: TaskStatus,
    /// Lower is more urgent. Display ordering only.
    pub priority: u8,
    #[serde(default)]
    pub assignee: Option<ActorId>,
    /// Open key/value metadata. `category` routes the task to workers.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Why the task is waiting, while it is `pending_user_input` or `blocked`.
    #[serde(default)]
    pub blocking_notes: Option<String>,
    /// Note left by whoever closed the task.
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub created_by: Option<ActorId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Session of the coordinator run this task traces back to.
    #[serde(default)]
    pub parent_id: Option<Uuid>,
}

impl Task {
    /// An open, unassigned task with default kind and priority.
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            description: description.into(),
            kind: TaskKind::default(),
            status: TaskStatus::Open,
            priority: DEFAULT_PRIORITY,
            assignee: None,
            metadata: HashMap::new(),
            blocking_notes: None,
            resolution: None,
            created_by: None,
            created_at: now,
            updated_at: now,
            parent_id: None,
        }
    }

    /// Set the kind.
    pub fn with_kind(mut self, kind: TaskKind) -> Self {
        self.kind = kind;
        self
    }

    /// Set the priority; lower is more urgent.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Route the task to workers of `category`.
    pub fn with_category(self, category: impl Into<String>) -> Self {
        self.with_metadata(CATEGORY_KEY, serde_json::Value::String(category.into()))
    }

    /// Set one metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Link the task to the coordinator session it came from.
    pub fn with_parent(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    /// The worker-affinity category, if set.
    pub fn category(&self) -> Option<&str> {
        self.metadata.get(CATEGORY_KEY).and_then(|v| v.as_str())
    }

    /// Whether every entry of `subset` is present with an equal value.
    pub fn matches_metadata(&self, subset: &HashMap<String, serde_json::Value>) -> bool {
        subset
            .iter()
            .all(|(key, value)| self.metadata.get(key) == Some(value))
    }

    /// Advance `updated_at`, never moving it backwards.
    pub fn touch(&mut self) {
        let now = Utc::now();
        if now > self.updated_at {
            self.updated_at = now;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_task_creation() {
        let task = Task::new("Fix login", "Token validation rejects valid tokens")
            .with_kind(TaskKind::Bug)
            .with_category("coding");
        assert_eq!(task.status, TaskStatus::Open);
        assert_eq!(task.priority, DEFAULT_PRIORITY);
        assert_eq!(task.category(), Some("coding"));
        assert!(task.assignee.is_none());
        assert_eq!(task.created_at, task.updated_at);
    }

    #[test]
    fn test_matches_metadata_subset() {
        let task = Task::new("t", "d")
            .with_category("research")
            .with_metadata("observer", serde_json::json!("skeptic"));

        let mut filter = HashMap::new();
        assert!(task.matches_metadata(&filter));

        filter.insert(CATEGORY_KEY.to_string(), serde_json::json!("research"));
        assert!(task.matches_metadata(&filter));

        filter.insert(CATEGORY_KEY.to_string(), serde_json::json!("coding"));
        assert!(!task.matches_metadata(&filter));
    }

    #[test]
    fn test_touch_is_monotonic() {
        let mut task = Task::new("t", "d");
        let future = Utc::now() + chrono::Duration::hours(1);
        task.updated_at = future;
        task.touch();
        assert_eq!(task.updated_at, future);
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("done".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&TaskStatus::PendingUserInput).unwrap();
        assert_eq!(json, "\"pending_user_input\"");
    }

    #[test]
    fn test_kind_parse() {
        assert_eq!("Feature".parse::<TaskKind>().unwrap(), TaskKind::Feature);
        assert!("story".parse::<TaskKind>().is_err());
    }

    #[test]
    fn test_actor_display() {
        let actor = Actor::worker("coding-worker-0");
        assert_eq!(actor.to_string(), "coding-worker-0 (worker)");
        assert!(!actor.is_coordinator());
        assert!(Actor::coordinator("foreman").is_coordinator());
    }
}

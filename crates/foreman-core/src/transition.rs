use serde::{Deserialize, Serialize};

use crate::task::{Actor, Task, TaskStatus};
use crate::{ForemanError, ForemanResult};

/// Metadata key under which `unblock` appends the information it was given.
pub const UNBLOCK_INFO_KEY: &str = "unblock_info";

/// The name of a state-machine event, without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEvent {
    /// A worker takes an open task.
    Claim,
    /// The assignee hands the task back to the queue.
    Release,
    /// The assignee waits on an answer from the user.
    RequestUserInput,
    /// The assignee cannot proceed.
    Block,
    /// The assignee finished the task.
    Complete,
    /// The coordinator answers a waiting task.
    Unblock,
    /// The coordinator closes a task from any live state.
    Close,
    /// The coordinator writes one metadata entry.
    Annotate,
}

impl std::fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskEvent::Claim => "claim",
            TaskEvent::Release => "release",
            TaskEvent::RequestUserInput => "request_user_input",
            TaskEvent::Block => "block",
            TaskEvent::Complete => "complete",
            TaskEvent::Unblock => "unblock",
            TaskEvent::Close => "close",
            TaskEvent::Annotate => "annotate",
        };
        f.write_str(name)
    }
}

/// A state-machine event together with the data it carries.
///
/// | From | Event | To | Guard |
/// |---|---|---|---|
/// | open | claim | in_progress | task unassigned |
/// | in_progress | release | open | actor is assignee |
/// | in_progress | request_user_input | pending_user_input | actor is assignee |
/// | in_progress | block | blocked | actor is assignee |
/// | in_progress | complete | closed | actor is assignee |
/// | pending_user_input, blocked | unblock | open | coordinator |
/// | any but closed | close | closed | coordinator |
/// | any but closed | annotate | unchanged | coordinator |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
#[allow(missing_docs)] // variant fields are described on each variant
pub enum Transition {
    /// Assign an open task to `actor`. Every variant's `actor` fires the event.
    Claim { actor: Actor },
    /// Return the task to open and clear the assignee.
    Release { actor: Actor },
    /// Park the task until the user answers `reason`.
    RequestUserInput { actor: Actor, reason: String },
    /// Park the task on an obstacle described by `reason`.
    Block { actor: Actor, reason: String },
    /// Close the task with `reason` as its resolution.
    Complete { actor: Actor, reason: String },
    /// Reopen a waiting task, recording `info` under [`UNBLOCK_INFO_KEY`].
    Unblock { actor: Actor, info: String },
    /// Close the task with `reason` as its resolution.
    Close { actor: Actor, reason: String },
    /// Set metadata `key` to `value` without changing status.
    Annotate {
        actor: Actor,
        key: String,
        value: serde_json::Value,
    },
}

impl Transition {
    /// The event this transition fires.
    pub fn event(&self) -> TaskEvent {
        match self {
            Transition::Claim { .. } => TaskEvent::Claim,
            Transition::Release { .. } => TaskEvent::Release,
            Transition::RequestUserInput { .. } => TaskEvent::RequestUserInput,
            Transition::Block { .. } => TaskEvent::Block,
            Transition::Complete { .. } => TaskEvent::Complete,
            Transition::Unblock { .. } => TaskEvent::Unblock,
            Transition::Close { .. } => TaskEvent::Close,
            Transition::Annotate { .. } => TaskEvent::Annotate,
        }
    }

    /// The actor performing the transition.
    pub fn actor(&self) -> &Actor {
        match self {
            Transition::Claim { actor }
            | Transition::Release { actor }
            | Transition::RequestUserInput { actor, .. }
            | Transition::Block { actor, .. }
            | Transition::Complete { actor, .. }
            | Transition::Unblock { actor, .. }
            | Transition::Close { actor, .. }
            | Transition::Annotate { actor, .. } => actor,
        }
    }

    /// Look up the destination status for this event, ignoring guards.
    pub fn target(&self, from: TaskStatus) -> ForemanResult<TaskStatus> {
        use TaskStatus::*;

        let to = match (self.event(), from) {
            (_, Closed) => None,
            (TaskEvent::Claim, Open) => Some(InProgress),
            (TaskEvent::Release, InProgress) => Some(Open),
            (TaskEvent::RequestUserInput, InProgress) => Some(PendingUserInput),
            (TaskEvent::Block, InProgress) => Some(Blocked),
            (TaskEvent::Complete, InProgress) => Some(Closed),
            (TaskEvent::Unblock, PendingUserInput | Blocked) => Some(Open),
            (TaskEvent::Close, _) => Some(Closed),
            (TaskEvent::Annotate, status) => Some(status),
            _ => None,
        };

        to.ok_or(ForemanError::InvalidTransition {
            from,
            event: self.event(),
        })
    }

    /// Check the transition against `task` and, if legal, mutate it.
    ///
    /// On error the task is left untouched.
    pub fn apply(&self, task: &mut Task) -> ForemanResult<()> {
        let to = self.target(task.status)?;
        self.check_guard(task)?;

        match self {
            Transition::Claim { actor } => {
                task.assignee = Some(actor.id.clone());
            }
            Transition::Release { .. } => {
                task.assignee = None;
            }
            Transition::RequestUserInput { reason, .. } | Transition::Block { reason, .. } => {
                task.blocking_notes = Some(reason.clone());
            }
            Transition::Complete { reason, .. } | Transition::Close { reason, .. } => {
                task.assignee = None;
                task.blocking_notes = None;
                task.resolution = Some(reason.clone());
            }
            Transition::Unblock { info, .. } => {
                task.assignee = None;
                task.blocking_notes = None;
                let entry = task
                    .metadata
                    .entry(UNBLOCK_INFO_KEY.to_string())
                    .or_insert_with(|| serde_json::Value::Array(Vec::new()));
                match entry {
                    serde_json::Value::Array(items) => {
                        items.push(serde_json::Value::String(info.clone()));
                    }
                    other => {
                        let previous = other.take();
                        *other = serde_json::json!([previous, info]);
                    }
                }
            }
            Transition::Annotate { key, value, .. } => {
                task.metadata.insert(key.clone(), value.clone());
            }
        }

        task.status = to;
        task.touch();
        Ok(())
    }

    fn check_guard(&self, task: &Task) -> ForemanResult<()> {
        let actor = self.actor();
        match self {
            Transition::Claim { .. } => match &task.assignee {
                Some(holder) => Err(ForemanError::Guard(format!(
                    "task {} is already assigned to {holder}",
                    task.id
                ))),
                None => Ok(()),
            },
            Transition::Release { .. }
            | Transition::RequestUserInput { .. }
            | Transition::Block { .. }
            | Transition::Complete { .. } => {
                if task.assignee.as_ref() == Some(&actor.id) {
                    Ok(())
                } else {
                    Err(ForemanError::Guard(format!(
                        "{} cannot {} task {}: it is held by {}",
                        actor.id,
                        self.event(),
                        task.id,
                        task.assignee
                            .as_ref()
                            .map_or_else(|| "nobody".to_string(), ToString::to_string)
                    )))
                }
            }
            Transition::Unblock { .. } | Transition::Close { .. } | Transition::Annotate { .. } => {
                if actor.is_coordinator() {
                    Ok(())
                } else {
                    Err(ForemanError::Guard(format!(
                        "{} requires a coordinator, not {actor}",
                        self.event()
                    )))
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn worker() -> Actor {
        Actor::worker("coding-worker-0")
    }

    fn coordinator() -> Actor {
        Actor::coordinator("foreman")
    }

    fn claimed() -> Task {
        let mut task = Task::new("Implement login", "…").with_category("coding");
        Transition::Claim { actor: worker() }.apply(&mut task).unwrap();
        task
    }

    #[test]
    fn test_claim_sets_assignee() {
        let task = claimed();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.assignee, Some(worker().id));
    }

    #[test]
    fn test_claim_requires_unassigned() {
        let mut task = Task::new("t", "d");
        task.assignee = Some("someone".into());
        let err = Transition::Claim { actor: worker() }
            .apply(&mut task)
            .unwrap_err();
        assert!(matches!(err, ForemanError::Guard(_)));
        assert_eq!(task.status, TaskStatus::Open);
    }

    #[test]
    fn test_release_clears_assignee() {
        let mut task = claimed();
        Transition::Release { actor: worker() }
            .apply(&mut task)
            .unwrap();
        assert_eq!(task.status, TaskStatus::Open);
        assert!(task.assignee.is_none());
    }

    #[test]
    fn test_request_user_input_sets_notes() {
        let mut task = claimed();
        Transition::RequestUserInput {
            actor: worker(),
            reason: "need schema".into(),
        }
        .apply(&mut task)
        .unwrap();
        assert_eq!(task.status, TaskStatus::PendingUserInput);
        assert_eq!(task.blocking_notes.as_deref(), Some("need schema"));
    }

    #[test]
    fn test_block_sets_notes() {
        let mut task = claimed();
        Transition::Block {
            actor: worker(),
            reason: "waiting on migration".into(),
        }
        .apply(&mut task)
        .unwrap();
        assert_eq!(task.status, TaskStatus::Blocked);
        assert_eq!(task.blocking_notes.as_deref(), Some("waiting on migration"));
    }

    #[test]
    fn test_complete_closes_with_resolution() {
        let mut task = claimed();
        Transition::Complete {
            actor: worker(),
            reason: "Done".into(),
        }
        .apply(&mut task)
        .unwrap();
        assert_eq!(task.status, TaskStatus::Closed);
        assert_eq!(task.resolution.as_deref(), Some("Done"));
        assert!(task.assignee.is_none());
    }

    #[test]
    fn test_only_assignee_may_complete() {
        let mut task = claimed();
        let err = Transition::Complete {
            actor: Actor::worker("coding-worker-1"),
            reason: "Done".into(),
        }
        .apply(&mut task)
        .unwrap_err();
        assert!(matches!(err, ForemanError::Guard(_)));
        assert_eq!(task.status, TaskStatus::InProgress);
    }

    #[test]
    fn test_unblock_reopens_and_appends_info() {
        let mut task = claimed();
        Transition::RequestUserInput {
            actor: worker(),
            reason: "need schema".into(),
        }
        .apply(&mut task)
        .unwrap();
        Transition::Unblock {
            actor: coordinator(),
            info: "schema: users(id, email)".into(),
        }
        .apply(&mut task)
        .unwrap();

        assert_eq!(task.status, TaskStatus::Open);
        assert!(task.blocking_notes.is_none());
        assert!(task.assignee.is_none());
        assert_eq!(
            task.metadata[UNBLOCK_INFO_KEY],
            serde_json::json!(["schema: users(id, email)"])
        );
    }

    #[test]
    fn test_unblock_on_open_task_is_an_error() {
        let mut task = Task::new("t", "d");
        let err = Transition::Unblock {
            actor: coordinator(),
            info: "x".into(),
        }
        .apply(&mut task)
        .unwrap_err();
        assert!(matches!(
            err,
            ForemanError::InvalidTransition {
                from: TaskStatus::Open,
                event: TaskEvent::Unblock
            }
        ));
    }

    #[test]
    fn test_unblock_requires_coordinator() {
        let mut task = claimed();
        Transition::Block {
            actor: worker(),
            reason: "r".into(),
        }
        .apply(&mut task)
        .unwrap();
        let err = Transition::Unblock {
            actor: worker(),
            info: "x".into(),
        }
        .apply(&mut task)
        .unwrap_err();
        assert!(matches!(err, ForemanError::Guard(_)));
        assert_eq!(task.status, TaskStatus::Blocked);
    }

    #[test]
    fn test_close_override_from_any_open_state() {
        for setup in [TaskStatus::Open, TaskStatus::InProgress] {
            let mut task = if setup == TaskStatus::Open {
                Task::new("t", "d")
            } else {
                claimed()
            };
            Transition::Close {
                actor: coordinator(),
                reason: "obsolete".into(),
            }
            .apply(&mut task)
            .unwrap();
            assert_eq!(task.status, TaskStatus::Closed);
            assert!(task.assignee.is_none());
        }
    }

    #[test]
    fn test_nothing_leaves_closed() {
        let mut task = claimed();
        Transition::Complete {
            actor: worker(),
            reason: "Done".into(),
        }
        .apply(&mut task)
        .unwrap();

        let attempts = [
            Transition::Claim { actor: worker() },
            Transition::Release { actor: worker() },
            Transition::Unblock {
                actor: coordinator(),
                info: "x".into(),
            },
            Transition::Close {
                actor: coordinator(),
                reason: "again".into(),
            },
            Transition::Annotate {
                actor: coordinator(),
                key: "k".into(),
                value: serde_json::json!(1),
            },
        ];
        for transition in attempts {
            let err = transition.apply(&mut task).unwrap_err();
            assert!(matches!(
                err,
                ForemanError::InvalidTransition {
                    from: TaskStatus::Closed,
                    ..
                }
            ));
        }
    }

    #[test]
    fn test_worker_events_need_in_progress() {
        let mut task = Task::new("t", "d");
        let err = Transition::Complete {
            actor: worker(),
            reason: "Done".into(),
        }
        .apply(&mut task)
        .unwrap_err();
        assert!(matches!(err, ForemanError::InvalidTransition { .. }));
    }

    #[test]
    fn test_annotate_keeps_status() {
        let mut task = claimed();
        Transition::Annotate {
            actor: coordinator(),
            key: "category".into(),
            value: serde_json::json!("research"),
        }
        .apply(&mut task)
        .unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.category(), Some("research"));

        let err = Transition::Annotate {
            actor: worker(),
            key: "category".into(),
            value: serde_json::json!("coding"),
        }
        .apply(&mut task)
        .unwrap_err();
        assert!(matches!(err, ForemanError::Guard(_)));
    }

    #[test]
    fn test_transition_serialization() {
        let transition = Transition::Block {
            actor: worker(),
            reason: "r".into(),
        };
        let json = serde_json::to_value(&transition).unwrap();
        assert_eq!(json["event"], "block");
        let parsed: Transition = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, transition);
    }
}

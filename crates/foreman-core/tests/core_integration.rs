#![allow(clippy::unwrap_used, clippy::expect_used)]

use foreman_core::*;
use std::collections::HashSet;

fn all_transitions() -> Vec<Transition> {
    let owner = Actor::worker("coding-worker-0");
    let other = Actor::worker("coding-worker-1");
    let foreman = Actor::coordinator("foreman");
    let observer = Actor::observer("skeptic");

    let mut transitions = Vec::new();
    for actor in [&owner, &other, &foreman, &observer] {
        transitions.push(Transition::Claim {
            actor: actor.clone(),
        });
        transitions.push(Transition::Release {
            actor: actor.clone(),
        });
        transitions.push(Transition::RequestUserInput {
            actor: actor.clone(),
            reason: "need input".into(),
        });
        transitions.push(Transition::Block {
            actor: actor.clone(),
            reason: "blocked".into(),
        });
        transitions.push(Transition::Complete {
            actor: actor.clone(),
            reason: "done".into(),
        });
        transitions.push(Transition::Unblock {
            actor: actor.clone(),
            info: "info".into(),
        });
        transitions.push(Transition::Close {
            actor: actor.clone(),
            reason: "override".into(),
        });
    }
    transitions
}

// ---------------------------------------------------------------------------
// Explore every (status, assignee) state reachable from a fresh task.
// ---------------------------------------------------------------------------

#[test]
fn reachable_states_respect_the_assignee_invariant() {
    let transitions = all_transitions();
    let start = Task::new("Explore", "state space");

    let mut seen: HashSet<(TaskStatus, Option<ActorId>)> = HashSet::new();
    let mut frontier = vec![start];

    while let Some(task) = frontier.pop() {
        if !seen.insert((task.status, task.assignee.clone())) {
            continue;
        }
        for transition in &transitions {
            let mut next = task.clone();
            match transition.apply(&mut next) {
                Ok(()) => frontier.push(next),
                Err(_) => assert_eq!(next, task, "failed transition must not mutate"),
            }
        }
    }

    let statuses: HashSet<TaskStatus> = seen.iter().map(|(s, _)| *s).collect();
    assert_eq!(statuses.len(), TaskStatus::ALL.len());

    for (status, assignee) in &seen {
        match status {
            TaskStatus::Open | TaskStatus::Closed => assert!(assignee.is_none()),
            TaskStatus::InProgress | TaskStatus::PendingUserInput | TaskStatus::Blocked => {
                assert!(assignee.is_some());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Full worker lifecycle: claim -> request input -> unblock -> claim -> complete
// ---------------------------------------------------------------------------

#[test]
fn user_input_round_trip() {
    let worker = Actor::worker("coding-worker-0");
    let foreman = Actor::coordinator("foreman");
    let mut task = Task::new("Add users table", "Create the migration").with_category("coding");

    Transition::Claim {
        actor: worker.clone(),
    }
    .apply(&mut task)
    .unwrap();
    Transition::RequestUserInput {
        actor: worker.clone(),
        reason: "need schema".into(),
    }
    .apply(&mut task)
    .unwrap();
    assert_eq!(task.status, TaskStatus::PendingUserInput);

    Transition::Unblock {
        actor: foreman,
        info: "schema: users(id, email)".into(),
    }
    .apply(&mut task)
    .unwrap();
    assert_eq!(task.status, TaskStatus::Open);
    assert!(task.blocking_notes.is_none());

    Transition::Claim {
        actor: worker.clone(),
    }
    .apply(&mut task)
    .unwrap();
    Transition::Complete {
        actor: worker,
        reason: "migration written".into(),
    }
    .apply(&mut task)
    .unwrap();
    assert_eq!(task.status, TaskStatus::Closed);
    assert_eq!(task.category(), Some("coding"));
}

#[test]
fn task_serialization_roundtrip() {
    let task = Task::new("Review README", "Check claims")
        .with_kind(TaskKind::Research)
        .with_priority(1)
        .with_metadata("observer", serde_json::json!("skeptic"));

    let json = serde_json::to_string(&task).unwrap();
    let parsed: Task = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, task);
}

use crate::config::{ObserverConfig, OrchestratorConfig, WorkerConfig};
use foreman_core::transition::UNBLOCK_INFO_KEY;
use foreman_core::{Actor, Task};
use std::path::PathBuf;
use std::time::Duration;

/// Actor id of the coordinator.
pub const COORDINATOR_ID: &str = "foreman";

/// Frozen configuration of the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorProfile {
    pub actor: Actor,
    pub yield_interval: Duration,
    pub instructions: String,
}

/// Frozen configuration of one worker loop.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerProfile {
    pub actor: Actor,
    /// Worker pool name this loop belongs to.
    pub name: String,
    pub category: String,
    pub poll_interval: Duration,
    pub error_backoff: Duration,
    pub instructions: String,
}

/// Frozen configuration of one observer loop.
#[derive(Debug, Clone, PartialEq)]
pub struct ObserverProfile {
    pub actor: Actor,
    /// Display name, also the `observer` tag on created tasks.
    pub name: String,
    pub role: String,
    pub focus: String,
    pub watch_paths: Vec<PathBuf>,
    pub review_interval: Duration,
    pub max_issues: usize,
    pub category: Option<String>,
    pub priority: u8,
    pub instructions: String,
}

/// Build the coordinator profile, defaulting its instructions.
pub fn coordinator_profile(config: &OrchestratorConfig) -> CoordinatorProfile {
    let instructions = config
        .coordinator
        .instructions
        .clone()
        .unwrap_or_else(|| coordinator_instructions(&config.categories(), &config.observers));
    CoordinatorProfile {
        actor: Actor::coordinator(COORDINATOR_ID),
        yield_interval: Duration::from_millis(config.coordinator.yield_interval_ms),
        instructions,
    }
}

/// One profile per worker loop. Ids are `<name>-<n>` with `n` counting
/// across every pool.
pub fn worker_profiles(configs: &[WorkerConfig]) -> Vec<WorkerProfile> {
    let mut profiles = Vec::new();
    let mut counter = 0usize;
    for config in configs {
        for _ in 0..config.count {
            let id = format!("{}-{counter}", config.name);
            counter += 1;
            let instructions = config
                .instructions
                .clone()
                .unwrap_or_else(|| worker_instructions(&id, &config.category));
            profiles.push(WorkerProfile {
                actor: Actor::worker(id),
                name: config.name.clone(),
                category: config.category.clone(),
                poll_interval: Duration::from_millis(config.poll_interval_ms),
                error_backoff: Duration::from_millis(config.error_backoff_ms),
                instructions,
            });
        }
    }
    profiles
}

pub fn observer_profile(config: &ObserverConfig) -> ObserverProfile {
    let instructions = config
        .instructions
        .clone()
        .unwrap_or_else(|| observer_instructions(config));
    ObserverProfile {
        actor: Actor::observer(observer_actor_id(&config.name)),
        name: config.name.clone(),
        role: config.role.clone(),
        focus: config.focus.clone(),
        watch_paths: config.watch_paths.clone(),
        review_interval: Duration::from_millis(config.review_interval_ms),
        max_issues: config.max_issues_per_cycle,
        category: config.category.clone(),
        priority: config.priority,
        instructions,
    }
}

/// `"Fact Checker"` becomes `"fact-checker"`.
pub fn observer_actor_id(name: &str) -> String {
    name.trim().to_lowercase().replace(' ', "-")
}

fn coordinator_instructions(categories: &[String], observers: &[ObserverConfig]) -> String {
    let mut text = String::from(COORDINATOR_PROMPT);
    if !categories.is_empty() {
        text.push_str("\nWorker categories (set metadata.category to one of these):\n");
        for category in categories {
            text.push_str(&format!("- {category}\n"));
        }
    }
    if !observers.is_empty() {
        text.push_str("\nObservers watching the work:\n");
        for observer in observers {
            text.push_str(&format!("- {}: {}\n", observer.name, observer.role));
        }
    }
    text
}

fn worker_instructions(actor_id: &str, category: &str) -> String {
    format!("You are {actor_id}, a {category} worker.\n\n{WORKER_PROMPT}")
}

fn observer_instructions(config: &ObserverConfig) -> String {
    format!(
        "You are {name}, an observer reviewing work in continuous background mode.\n\n\
         Role: {role}\n\
         Focus: {focus}\n\n\
         {OBSERVER_PROMPT}\
         Create at most {max} issues per review, priority {priority}. \
         They are tagged with observer = \"{name}\" automatically.\n",
        name = config.name,
        role = config.role,
        focus = config.focus,
        max = config.max_issues_per_cycle,
        priority = config.priority,
    )
}

/// Per-cycle instructions for a claimed task.
pub fn task_prompt(task: &Task) -> String {
    let mut prompt = format!(
        "Task {id} [{kind}, priority {priority}]: {title}\n\n{description}\n",
        id = task.id,
        kind = task.kind,
        priority = task.priority,
        title = task.title,
        description = task.description,
    );
    if let Some(infos) = task.metadata.get(UNBLOCK_INFO_KEY).and_then(|v| v.as_array()) {
        prompt.push_str("\nInformation provided since the task was last blocked:\n");
        for info in infos.iter().filter_map(|v| v.as_str()) {
            prompt.push_str(&format!("- {info}\n"));
        }
    }
    prompt
}

/// Per-cycle instructions for an observer review.
pub fn review_prompt(profile: &ObserverProfile, open_tasks: &[Task]) -> String {
    let paths: Vec<String> = profile
        .watch_paths
        .iter()
        .map(|p| p.display().to_string())
        .collect();
    let mut prompt = format!(
        "Review the current work in: {}\n\n\
         1. Check the open tasks below so you do not report known issues again.\n\
         2. Read the work to understand its current state.\n\
         3. Analyze it from your perspective: {}\n\
         4. Focus on: {}\n\
         5. Create at most {} new issues for the most important problems.\n\n\
         If everything looks good, say \"No new issues found.\"\n",
        paths.join(", "),
        profile.role,
        profile.focus,
        profile.max_issues,
    );
    if open_tasks.is_empty() {
        prompt.push_str("\nThere are no open tasks.\n");
    } else {
        prompt.push_str("\nOpen tasks:\n");
        for task in open_tasks {
            prompt.push_str(&format!("- {} {}\n", task.id, task.title));
        }
    }
    prompt
}

const COORDINATOR_PROMPT: &str = "\
You are the Foreman. Handle user requests by delegating work to background \
workers through the shared task queue.

Task status values:
- open: unassigned work waiting for a worker
- in_progress: claimed by a worker
- pending_user_input: a worker needs information from the user
- blocked: waiting on something outside the worker's control
- closed: finished (completed or closed by you)

User input workflow:
1. When checking status, always look for pending_user_input and blocked tasks.
2. Their blocking notes say what is needed. Ask the user for it.
3. When the user answers, unblock the task with their information. \
   It returns to open and a worker picks it up again.

When creating tasks:
1. Give every task a clear title and a description a worker can act on.
2. Set metadata.category so the right workers find it.
3. Use kind bug or feature for code changes, task or research otherwise.

You may close any task that is no longer needed and annotate tasks with \
classification metadata. Workers never change a task's category.
";

const WORKER_PROMPT: &str = "\
You have claimed one task from the queue. Do the work it describes now, \
in this turn, then report exactly one outcome:

- complete(reason): every requirement is satisfied.
- request_user_input(reason): you need information only the user has. \
  Never invent it. The Foreman will ask and the task comes back to you.
- block(reason): something outside your control prevents progress.
- release(): you cannot work on it right now. It returns to the queue.

Rules:
1. Put files you produce under work/.
2. Do not stop after reading the task. Finish it or report why you cannot.
3. If you create follow-up tasks, set their category; do not change this task's category.
";

const OBSERVER_PROMPT: &str = "\
Review guidelines:
1. Analyze strictly from your own perspective.
2. Create issues only for problems in your domain.
3. Each issue needs a specific title and a description that says how to improve the work.
4. Never duplicate an issue that is already open.
5. If the work looks good from your perspective, create nothing.
";

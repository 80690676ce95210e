use crate::executor::{ExecutionContext, Executor, ExecutorSession, SessionRequest};
use crate::tools::WorkOutcome;
use async_trait::async_trait;
use foreman_core::{Actor, ForemanError, ForemanResult, TaskKind};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How to launch the external agent program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

fn default_timeout_secs() -> u64 {
    600
}

impl CommandConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout_secs: default_timeout_secs(),
            working_dir: None,
        }
    }
}

/// Executor that runs one external program per call.
///
/// The prompt is written to the program's stdin and its stdout is the call's
/// output. If the last non-empty stdout line is a JSON object carrying any of
/// `outcome`, `create`, `unblock` or `close`, it is read as a [`Directive`]
/// and applied through the call's tool surface; that line is then dropped
/// from the returned output.
pub struct CommandExecutor {
    config: CommandConfig,
}

impl CommandExecutor {
    pub fn new(config: CommandConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn open_session(
        &self,
        request: SessionRequest,
    ) -> ForemanResult<Arc<dyn ExecutorSession>> {
        if self.config.program.trim().is_empty() {
            return Err(ForemanError::Config("executor program is empty".into()));
        }
        let session = CommandSession {
            id: Uuid::new_v4(),
            config: self.config.clone(),
            actor: request.actor,
            parent_id: request.parent_id,
            system_instructions: request.system_instructions,
        };
        debug!(actor = %session.actor.id, session_id = %session.id, "Command session opened");
        Ok(Arc::new(session))
    }
}

struct CommandSession {
    id: Uuid,
    config: CommandConfig,
    actor: Actor,
    parent_id: Option<Uuid>,
    system_instructions: String,
}

impl CommandSession {
    fn render_prompt(&self, instructions: &str, ctx: &ExecutionContext) -> String {
        let mut prompt = String::new();
        if !self.system_instructions.is_empty() {
            prompt.push_str(&self.system_instructions);
            prompt.push_str("\n\n");
        }

        let _ = writeln!(prompt, "## Context");
        let _ = writeln!(prompt, "actor: {} ({})", ctx.actor.id, ctx.actor.role);
        let _ = writeln!(prompt, "mode: {}", ctx.mode);
        if let Some(claim) = &ctx.claim {
            let task = claim.task();
            let _ = writeln!(prompt, "claimed task: {} [{}] {}", task.id, task.status, task.title);
        }
        if !ctx.open_tasks.is_empty() {
            let _ = writeln!(prompt, "known tasks:");
            for task in &ctx.open_tasks {
                let _ = writeln!(
                    prompt,
                    "- {} [{}] p{} {}",
                    task.id, task.status, task.priority, task.title
                );
            }
        }
        prompt.push('\n');
        prompt.push_str(instructions);
        prompt.push('\n');
        prompt
    }

    async fn run(&self, prompt: String, ctx: &ExecutionContext) -> ForemanResult<String> {
        let mut cmd = tokio::process::Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .env("FOREMAN_SESSION_ID", self.id.to_string())
            .env("FOREMAN_ACTOR", ctx.actor.id.as_str())
            .env("FOREMAN_MODE", ctx.mode.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(parent) = self.parent_id {
            cmd.env("FOREMAN_PARENT_ID", parent.to_string());
        }
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            ForemanError::Executor(format!("failed to run '{}': {e}", self.config.program))
        })?;

        // Output is drained while the prompt is still being written, so a
        // prompt larger than the pipe buffer cannot stall either side.
        let stdin = child.stdin.take();
        let write_prompt = async move {
            if let Some(mut stdin) = stdin {
                // A program that never reads its prompt is allowed.
                if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                    debug!(error = %e, "Prompt not fully written");
                }
            }
        };
        let ((), output) = tokio::join!(write_prompt, child.wait_with_output());
        let output = output
            .map_err(|e| ForemanError::Executor(format!("'{}' failed: {e}", self.config.program)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ForemanError::Executor(format!(
                "'{}' exited with {}: {}",
                self.config.program,
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }
        Ok(stdout)
    }
}

#[async_trait]
impl ExecutorSession for CommandSession {
    fn session_id(&self) -> Uuid {
        self.id
    }

    async fn execute(&self, instructions: &str, ctx: ExecutionContext) -> ForemanResult<String> {
        let prompt = self.render_prompt(instructions, &ctx);
        info!(
            actor = %ctx.actor.id,
            mode = %ctx.mode,
            prompt_len = prompt.len(),
            "Running executor command"
        );

        let timeout = Duration::from_secs(self.config.timeout_secs);
        let stdout = tokio::time::timeout(timeout, self.run(prompt, &ctx))
            .await
            .map_err(|_| {
                ForemanError::Executor(format!(
                    "'{}' timed out after {}s",
                    self.config.program, self.config.timeout_secs
                ))
            })??;

        let (output, directive) = parse_directive(&stdout)?;
        if let Some(directive) = directive {
            directive.apply(&ctx).await?;
        }
        Ok(output)
    }
}

/// A task the program asks to create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueDirective {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub kind: Option<TaskKind>,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnblockDirective {
    pub id: Uuid,
    pub info: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseDirective {
    pub id: Uuid,
    #[serde(default)]
    pub reason: String,
}

/// Queue actions requested on the last line of a program's output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Directive {
    #[serde(default)]
    pub outcome: Option<WorkOutcome>,
    #[serde(default)]
    pub create: Vec<IssueDirective>,
    #[serde(default)]
    pub unblock: Vec<UnblockDirective>,
    #[serde(default)]
    pub close: Vec<CloseDirective>,
}

const DIRECTIVE_KEYS: [&str; 4] = ["outcome", "create", "unblock", "close"];

impl Directive {
    /// Carry out the directive with the call's own permissions.
    pub async fn apply(self, ctx: &ExecutionContext) -> ForemanResult<()> {
        for issue in self.create {
            let mut task = ctx.issues.new_task(issue.title, issue.description);
            if let Some(kind) = issue.kind {
                task = task.with_kind(kind);
            }
            if let Some(priority) = issue.priority {
                task = task.with_priority(priority);
            }
            if let Some(category) = issue.category {
                task = task.with_category(category);
            }
            ctx.issues.create(task).await?;
        }
        for unblock in self.unblock {
            ctx.issues.unblock(unblock.id, unblock.info).await?;
        }
        for close in self.close {
            ctx.issues.close(close.id, close.reason).await?;
        }
        if let Some(outcome) = self.outcome {
            let claim = ctx.claim.as_ref().ok_or_else(|| {
                ForemanError::Guard(format!("{} holds no claimed task", ctx.actor.id))
            })?;
            match outcome {
                WorkOutcome::Complete(reason) => claim.complete(reason)?,
                WorkOutcome::Block(reason) => claim.block(reason)?,
                WorkOutcome::RequestUserInput(reason) => claim.request_user_input(reason)?,
                WorkOutcome::Release => claim.release()?,
            }
        }
        Ok(())
    }
}

/// Split program output into its text and an optional trailing directive.
///
/// Only a JSON object naming at least one directive key counts; any other
/// last line is ordinary output. A directive line that fails to decode is an
/// error rather than silently ignored.
pub fn parse_directive(stdout: &str) -> ForemanResult<(String, Option<Directive>)> {
    let trimmed = stdout.trim_end();
    let (head, last) = match trimmed.rfind('\n') {
        Some(pos) => (&trimmed[..pos], &trimmed[pos + 1..]),
        None => ("", trimmed),
    };

    let value: serde_json::Value = match serde_json::from_str(last.trim()) {
        Ok(value) => value,
        Err(_) => return Ok((trimmed.to_string(), None)),
    };
    let is_directive = value
        .as_object()
        .map_or(false, |obj| DIRECTIVE_KEYS.iter().any(|k| obj.contains_key(*k)));
    if !is_directive {
        return Ok((trimmed.to_string(), None));
    }

    let directive: Directive = serde_json::from_value(value).map_err(|e| {
        warn!(error = %e, "Malformed directive line");
        ForemanError::Executor(format!("malformed directive: {e}"))
    })?;
    Ok((head.trim_end().to_string(), Some(directive)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::executor::ExecutionMode;
    use crate::tools::{ClaimedTask, IssueTools};
    use foreman_core::{Task, TaskStatus};
    use foreman_queue::{InMemoryQueueStore, QueueStore, TaskFilter};

    #[test]
    fn test_plain_output_has_no_directive() {
        let (text, directive) = parse_directive("hello\nworld\n\n").unwrap();
        assert_eq!(text, "hello\nworld");
        assert!(directive.is_none());
    }

    #[test]
    fn test_unrelated_json_is_output() {
        let (text, directive) = parse_directive("result:\n{\"score\": 3}").unwrap();
        assert_eq!(text, "result:\n{\"score\": 3}");
        assert!(directive.is_none());
    }

    #[test]
    fn test_trailing_directive_is_split_off() {
        let stdout = "Fixed the parser.\n{\"outcome\": {\"status\": \"complete\", \"reason\": \"tests pass\"}}\n";
        let (text, directive) = parse_directive(stdout).unwrap();
        assert_eq!(text, "Fixed the parser.");
        assert_eq!(
            directive.unwrap().outcome,
            Some(WorkOutcome::Complete("tests pass".into()))
        );
    }

    #[test]
    fn test_directive_only_output() {
        let (text, directive) =
            parse_directive("{\"create\": [{\"title\": \"Add tests\", \"kind\": \"chore\"}]}")
                .unwrap();
        assert!(text.is_empty());
        let directive = directive.unwrap();
        assert_eq!(directive.create[0].title, "Add tests");
        assert_eq!(directive.create[0].kind, Some(TaskKind::Chore));
    }

    #[test]
    fn test_malformed_directive_is_an_error() {
        let err = parse_directive("{\"create\": \"not a list\"}").unwrap_err();
        assert!(matches!(err, ForemanError::Executor(_)));
    }

    fn work_context(store: Arc<InMemoryQueueStore>, task: Task) -> ExecutionContext {
        let actor = Actor::worker("coding-worker-1");
        ExecutionContext {
            issues: IssueTools::new(store, actor.clone()),
            actor,
            mode: ExecutionMode::Work,
            claim: Some(ClaimedTask::new(task)),
            open_tasks: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_apply_records_outcome_and_creates() {
        let store = Arc::new(InMemoryQueueStore::new());
        let task = Task::new("T1", "").with_category("coding");
        let ctx = work_context(store.clone(), task);

        let directive = Directive {
            outcome: Some(WorkOutcome::Block("waiting on schema".into())),
            create: vec![IssueDirective {
                title: "Design schema".into(),
                description: String::new(),
                kind: None,
                priority: Some(1),
                category: Some("research".into()),
            }],
            ..Directive::default()
        };
        directive.apply(&ctx).await.unwrap();

        let claim = ctx.claim.as_ref().unwrap();
        assert_eq!(claim.outcome(), Some(WorkOutcome::Block("waiting on schema".into())));
        let created = store
            .list(&TaskFilter::new().with_category("research"))
            .await
            .unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].priority, 1);
        assert_eq!(created[0].status, TaskStatus::Open);
    }

    #[tokio::test]
    async fn test_outcome_without_claim_is_rejected() {
        let actor = Actor::coordinator("foreman");
        let ctx = ExecutionContext {
            issues: IssueTools::new(Arc::new(InMemoryQueueStore::new()), actor.clone()),
            actor,
            mode: ExecutionMode::Coordinate,
            claim: None,
            open_tasks: Vec::new(),
        };
        let directive = Directive {
            outcome: Some(WorkOutcome::Release),
            ..Directive::default()
        };
        assert!(matches!(
            directive.apply(&ctx).await,
            Err(ForemanError::Guard(_))
        ));
    }

    #[cfg(unix)]
    fn sh(script: &str, timeout_secs: u64) -> CommandExecutor {
        CommandExecutor::new(CommandConfig {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            timeout_secs,
            working_dir: None,
        })
    }

    #[cfg(unix)]
    async fn open(executor: &CommandExecutor) -> Arc<dyn ExecutorSession> {
        executor
            .open_session(SessionRequest {
                actor: Actor::worker("coding-worker-1"),
                parent_id: None,
                system_instructions: "You are a worker.".into(),
            })
            .await
            .unwrap()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_program_and_applies_directive() {
        let executor = sh(
            r#"cat > /dev/null; echo "mode=$FOREMAN_MODE"; echo '{"outcome": {"status": "complete", "reason": "done"}}'"#,
            30,
        );
        let session = open(&executor).await;
        let store = Arc::new(InMemoryQueueStore::new());
        let ctx = work_context(store, Task::new("T1", ""));
        let claim = ctx.claim.clone().unwrap();

        let output = session.execute("do the work", ctx).await.unwrap();
        assert_eq!(output, "mode=work");
        assert_eq!(claim.outcome(), Some(WorkOutcome::Complete("done".into())));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_prompt_reaches_stdin() {
        let executor = sh("cat", 30);
        let session = open(&executor).await;
        let ctx = work_context(Arc::new(InMemoryQueueStore::new()), Task::new("Parse CSV", ""));
        let output = session.execute("do the work", ctx).await.unwrap();
        assert!(output.starts_with("You are a worker."));
        assert!(output.contains("Parse CSV"));
        assert!(output.ends_with("do the work"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_prompt_larger_than_pipe_buffer_is_echoed() {
        let executor = sh("cat", 10);
        let session = open(&executor).await;
        let ctx = work_context(Arc::new(InMemoryQueueStore::new()), Task::new("T1", ""));
        let instructions = "x".repeat(512 * 1024);

        let output = session.execute(&instructions, ctx).await.unwrap();
        assert!(output.ends_with(&instructions));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_executor_error() {
        let executor = sh("echo 'quota exceeded' >&2; exit 3", 30);
        let session = open(&executor).await;
        let ctx = work_context(Arc::new(InMemoryQueueStore::new()), Task::new("T1", ""));
        match session.execute("x", ctx).await {
            Err(ForemanError::Executor(msg)) => assert!(msg.contains("quota exceeded")),
            other => panic!("expected executor error, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_is_executor_error() {
        let executor = sh("sleep 5", 1);
        let session = open(&executor).await;
        let ctx = work_context(Arc::new(InMemoryQueueStore::new()), Task::new("T1", ""));
        match session.execute("x", ctx).await {
            Err(ForemanError::Executor(msg)) => assert!(msg.contains("timed out")),
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}

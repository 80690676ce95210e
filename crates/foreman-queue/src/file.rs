use crate::lock::StoreLock;
use crate::store::{sort_by_priority, validate_new, QueueStore, TaskFilter};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use foreman_core::{ForemanError, ForemanResult, Task, TaskStatus, Transition};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

const LOG_FILE: &str = "tasks.jsonl";
const LOCK_FILE: &str = "tasks.lock";

// ---------------------------------------------------------------------------
// QueueEvent
// ---------------------------------------------------------------------------

/// One line of the event log. Both variants carry the full task snapshot so
/// replay never has to re-run the state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    /// A task entered the queue.
    Created {
        /// The task as created.
        task: Task,
    },
    /// A transition was applied to a task.
    Updated {
        /// The applied transition.
        transition: Transition,
        /// The task after the transition.
        task: Task,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LogRecord {
    timestamp: DateTime<Utc>,
    event: QueueEvent,
}

// ---------------------------------------------------------------------------
// FileQueueStore
// ---------------------------------------------------------------------------

/// Durable queue store: an append-only JSONL event log replayed into memory
/// on open. Entities are never removed from the log.
///
/// One store owns its directory at a time: a second `open` of the same
/// directory fails with [`ForemanError::Store`] until the first is dropped.
pub struct FileQueueStore {
    path: PathBuf,
    tasks: Mutex<HashMap<Uuid, Task>>,
    _lock: StoreLock,
}

impl FileQueueStore {
    /// Open (or create) the store under `dir`, replaying any existing log.
    pub async fn open(dir: impl AsRef<Path>) -> ForemanResult<Self> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;
        let lock = StoreLock::acquire(&dir.join(LOCK_FILE))?;
        let path = dir.join(LOG_FILE);
        let tasks = replay(&path).await?;
        info!(path = %path.display(), tasks = tasks.len(), "Queue store opened");
        Ok(Self {
            path,
            tasks: Mutex::new(tasks),
            _lock: lock,
        })
    }

    /// Location of the event log.
    pub fn log_path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, event: QueueEvent) -> ForemanResult<()> {
        let record = LogRecord {
            timestamp: Utc::now(),
            event,
        };
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Rebuild the task map from the log. A torn final record is cut off so the
/// next append starts on a fresh line.
async fn replay(path: &Path) -> ForemanResult<HashMap<Uuid, Task>> {
    let mut tasks = HashMap::new();
    if !path.exists() {
        return Ok(tasks);
    }

    let data = tokio::fs::read(path).await?;
    // End of the last intact record.
    let mut intact = 0usize;
    let mut lines = data.split_inclusive(|b| *b == b'\n');
    let mut line_no = 0usize;

    while let Some(line) = lines.next() {
        line_no += 1;
        if line.iter().all(u8::is_ascii_whitespace) {
            intact += line.len();
            continue;
        }
        let record: LogRecord = match serde_json::from_slice(line) {
            Ok(record) => record,
            // A torn final line is what an interrupted append leaves behind.
            Err(e) if lines.clone().all(|l| l.iter().all(u8::is_ascii_whitespace)) => {
                warn!(path = %path.display(), error = %e, "Dropping truncated final log line");
                break;
            }
            Err(e) => {
                return Err(ForemanError::Store(format!(
                    "corrupt event log {} at line {line_no}: {e}",
                    path.display()
                )))
            }
        };
        intact += line.len();
        match record.event {
            QueueEvent::Created { task } | QueueEvent::Updated { task, .. } => {
                tasks.insert(task.id, task);
            }
        }
    }

    if intact < data.len() {
        let file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
        file.set_len(intact as u64).await?;
        file.sync_all().await?;
    } else if data.last().is_some_and(|b| *b != b'\n') {
        let mut file = tokio::fs::OpenOptions::new().append(true).open(path).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
    }
    Ok(tasks)
}

#[async_trait]
impl QueueStore for FileQueueStore {
    async fn create(&self, task: Task) -> ForemanResult<Uuid> {
        validate_new(&task)?;
        let mut tasks = self.tasks.lock().await;
        if tasks.contains_key(&task.id) {
            return Err(ForemanError::Store(format!(
                "task {} already exists",
                task.id
            )));
        }
        self.append(QueueEvent::Created { task: task.clone() })
            .await?;
        let id = task.id;
        tasks.insert(id, task);
        Ok(id)
    }

    async fn get(&self, id: Uuid) -> ForemanResult<Task> {
        self.tasks
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or(ForemanError::NotFound(id))
    }

    async fn list(&self, filter: &TaskFilter) -> ForemanResult<Vec<Task>> {
        let mut matching: Vec<Task> = self
            .tasks
            .lock()
            .await
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        sort_by_priority(&mut matching);
        Ok(matching)
    }

    async fn update(
        &self,
        id: Uuid,
        expected: TaskStatus,
        transition: &Transition,
    ) -> ForemanResult<Task> {
        let mut tasks = self.tasks.lock().await;
        let current = tasks.get(&id).ok_or(ForemanError::NotFound(id))?;
        if current.status != expected {
            return Err(ForemanError::Conflict {
                id,
                expected,
                actual: current.status,
            });
        }

        let mut next = current.clone();
        transition.apply(&mut next)?;

        // Log first so memory never runs ahead of what a restart would see.
        self.append(QueueEvent::Updated {
            transition: transition.clone(),
            task: next.clone(),
        })
        .await?;
        tasks.insert(id, next.clone());
        Ok(next)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

use crate::store::{sort_by_priority, validate_new, QueueStore, TaskFilter};
use async_trait::async_trait;
use foreman_core::{ForemanError, ForemanResult, Task, TaskStatus, Transition};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Process-local queue store. Conditional updates are serialized by the
/// write lock.
pub struct InMemoryQueueStore {
    tasks: RwLock<HashMap<Uuid, Task>>,
}

impl InMemoryQueueStore {
    /// An empty store.
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
        }
    }

    /// Total number of tasks, closed ones included.
    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }
}

impl Default for InMemoryQueueStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn create(&self, task: Task) -> ForemanResult<Uuid> {
        validate_new(&task)?;
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(ForemanError::Store(format!(
                "task {} already exists",
                task.id
            )));
        }
        let id = task.id;
        tasks.insert(id, task);
        Ok(id)
    }

    async fn get(&self, id: Uuid) -> ForemanResult<Task> {
        self.tasks
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(ForemanError::NotFound(id))
    }

    async fn list(&self, filter: &TaskFilter) -> ForemanResult<Vec<Task>> {
        let mut matching: Vec<Task> = self
            .tasks
            .read()
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
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&id).ok_or(ForemanError::NotFound(id))?;
        if task.status != expected {
            return Err(ForemanError::Conflict {
                id,
                expected,
                actual: task.status,
            });
        }
        transition.apply(task)?;
        Ok(task.clone())
    }
}

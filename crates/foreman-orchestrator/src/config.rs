use crate::profiles::observer_actor_id;
use foreman_core::task::DEFAULT_PRIORITY;
use foreman_core::{ForemanError, ForemanResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Everything needed to run one orchestrator session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Root that relative observer watch paths are resolved against.
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub workers: Vec<WorkerConfig>,
    #[serde(default)]
    pub observers: Vec<ObserverConfig>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workspace: default_workspace(),
            coordinator: CoordinatorConfig::default(),
            workers: Vec::new(),
            observers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// How often `handle` checks on its in-flight executor call.
    #[serde(default = "default_yield_interval_ms")]
    pub yield_interval_ms: u64,
    /// Replaces the default coordinator instructions.
    #[serde(default)]
    pub instructions: Option<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            yield_interval_ms: default_yield_interval_ms(),
            instructions: None,
        }
    }
}

/// A pool of identical worker loops bound to one category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub name: String,
    pub category: String,
    #[serde(default = "default_count")]
    pub count: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,
    #[serde(default)]
    pub instructions: Option<String>,
}

impl WorkerConfig {
    pub fn new(name: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
            count: default_count(),
            poll_interval_ms: default_poll_interval_ms(),
            error_backoff_ms: default_error_backoff_ms(),
            instructions: None,
        }
    }
}

/// One observer loop watching a set of paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObserverConfig {
    pub name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub focus: String,
    #[serde(default = "default_watch_paths")]
    pub watch_paths: Vec<PathBuf>,
    #[serde(default = "default_review_interval_ms")]
    pub review_interval_ms: u64,
    #[serde(default = "default_max_issues")]
    pub max_issues_per_cycle: usize,
    /// Route created issues to the workers of this category.
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub instructions: Option<String>,
}

impl ObserverConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: String::new(),
            focus: String::new(),
            watch_paths: default_watch_paths(),
            review_interval_ms: default_review_interval_ms(),
            max_issues_per_cycle: default_max_issues(),
            category: None,
            priority: default_priority(),
            instructions: None,
        }
    }
}

fn default_workspace() -> PathBuf {
    PathBuf::from(".")
}
fn default_yield_interval_ms() -> u64 {
    100
}
fn default_count() -> usize {
    1
}
fn default_poll_interval_ms() -> u64 {
    5_000
}
fn default_error_backoff_ms() -> u64 {
    10_000
}
fn default_watch_paths() -> Vec<PathBuf> {
    vec![PathBuf::from("work/")]
}
fn default_review_interval_ms() -> u64 {
    15_000
}
fn default_max_issues() -> usize {
    2
}
fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

impl OrchestratorConfig {
    pub fn from_toml_str(s: &str) -> ForemanResult<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| ForemanError::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> ForemanResult<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| {
            ForemanError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&data)
    }

    /// Reject configurations that would produce nameless actors or spin loops.
    pub fn validate(&self) -> ForemanResult<()> {
        if self.coordinator.yield_interval_ms == 0 {
            return Err(ForemanError::Config(
                "coordinator.yield_interval_ms must be greater than zero".into(),
            ));
        }

        for worker in &self.workers {
            if worker.name.trim().is_empty() {
                return Err(ForemanError::Config("worker name must not be empty".into()));
            }
            if worker.category.trim().is_empty() {
                return Err(ForemanError::Config(format!(
                    "worker '{}' needs a category",
                    worker.name
                )));
            }
            if worker.poll_interval_ms == 0 {
                return Err(ForemanError::Config(format!(
                    "worker '{}' poll_interval_ms must be greater than zero",
                    worker.name
                )));
            }
            if worker.error_backoff_ms < worker.poll_interval_ms {
                return Err(ForemanError::Config(format!(
                    "worker '{}' error_backoff_ms ({}) is shorter than poll_interval_ms ({})",
                    worker.name, worker.error_backoff_ms, worker.poll_interval_ms
                )));
            }
        }

        let mut names = HashSet::new();
        for observer in &self.observers {
            if observer.name.trim().is_empty() {
                return Err(ForemanError::Config("observer name must not be empty".into()));
            }
            // Names that map to one actor id would share a session slot.
            if !names.insert(observer_actor_id(&observer.name)) {
                return Err(ForemanError::Config(format!(
                    "duplicate observer name '{}'",
                    observer.name
                )));
            }
            if observer.review_interval_ms == 0 {
                return Err(ForemanError::Config(format!(
                    "observer '{}' review_interval_ms must be greater than zero",
                    observer.name
                )));
            }
            if observer.watch_paths.is_empty() {
                return Err(ForemanError::Config(format!(
                    "observer '{}' has no watch_paths",
                    observer.name
                )));
            }
            if matches!(&observer.category, Some(c) if c.trim().is_empty()) {
                return Err(ForemanError::Config(format!(
                    "observer '{}' category must not be empty",
                    observer.name
                )));
            }
        }
        Ok(())
    }

    /// Distinct worker categories, in configuration order.
    pub fn categories(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.workers
            .iter()
            .filter(|w| seen.insert(w.category.as_str()))
            .map(|w| w.category.clone())
            .collect()
    }
}

use crate::config::OrchestratorConfig;
use crate::coordinator::Coordinator;
use crate::executor::{Executor, SessionRegistry};
use crate::fingerprint::{FileFingerprinter, Fingerprinter};
use crate::monitor::LoopMonitor;
use crate::observer::ObserverLoop;
use crate::profiles::{coordinator_profile, observer_profile, worker_profiles};
use crate::shutdown::{self, ShutdownTrigger};
use crate::worker::WorkerLoop;
use foreman_core::{ActorId, ForemanError, ForemanResult};
use foreman_queue::{QueueStore, TaskSummary};
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

enum Lifecycle {
    NotStarted,
    Running(Vec<JoinHandle<()>>),
    Stopped,
}

/// Owns the coordinator and every background loop of one session.
///
/// Loops are spawned on [`Orchestrator::start`] or on the first
/// [`Orchestrator::handle`], whichever comes first. [`Orchestrator::stop`]
/// signals shutdown, waits for every loop to finish its current cycle, then
/// releases the coordinator session.
pub struct Orchestrator {
    config: OrchestratorConfig,
    store: Arc<dyn QueueStore>,
    executor: Arc<dyn Executor>,
    monitor: Arc<LoopMonitor>,
    sessions: SessionRegistry,
    coordinator: Coordinator,
    fingerprinters: HashMap<String, Arc<dyn Fingerprinter>>,
    shutdown: ShutdownTrigger,
    stopping: AtomicBool,
    lifecycle: Mutex<Lifecycle>,
}

impl Orchestrator {
    /// Validate `config` and build an orchestrator. Nothing runs yet.
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn QueueStore>,
        executor: Arc<dyn Executor>,
    ) -> ForemanResult<Self> {
        config.validate()?;
        let monitor = Arc::new(LoopMonitor::new());
        let sessions = SessionRegistry::new();
        let coordinator = Coordinator::new(
            coordinator_profile(&config),
            store.clone(),
            executor.clone(),
            monitor.clone(),
            sessions.clone(),
        );
        let (shutdown, _signal) = shutdown::channel();

        Ok(Self {
            config,
            store,
            executor,
            monitor,
            sessions,
            coordinator,
            fingerprinters: HashMap::new(),
            shutdown,
            stopping: AtomicBool::new(false),
            lifecycle: Mutex::new(Lifecycle::NotStarted),
        })
    }

    /// Use `fingerprinter` for the observer named `name` instead of watching
    /// its configured paths on disk.
    pub fn with_fingerprinter(
        mut self,
        name: impl Into<String>,
        fingerprinter: Arc<dyn Fingerprinter>,
    ) -> Self {
        self.fingerprinters.insert(name.into(), fingerprinter);
        self
    }

    pub fn monitor(&self) -> &Arc<LoopMonitor> {
        &self.monitor
    }

    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Latest executor session id per actor.
    pub fn session_ids(&self) -> HashMap<ActorId, Uuid> {
        self.sessions.snapshot()
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.lifecycle.lock().await, Lifecycle::Running(_))
    }

    pub async fn summary(&self) -> ForemanResult<TaskSummary> {
        TaskSummary::of_store(self.store.as_ref()).await
    }

    /// Open the coordinator session and spawn every configured loop.
    /// Calling it again while running is a no-op.
    pub async fn start(&self) -> ForemanResult<()> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(ForemanError::ShutdownInProgress);
        }
        let mut lifecycle = self.lifecycle.lock().await;
        match *lifecycle {
            Lifecycle::Running(_) => return Ok(()),
            Lifecycle::Stopped => return Err(ForemanError::ShutdownInProgress),
            Lifecycle::NotStarted => {}
        }

        let parent_id = Some(self.coordinator.session().await?.session_id());
        let mut handles = Vec::new();

        for profile in worker_profiles(&self.config.workers) {
            let worker = WorkerLoop::new(
                profile,
                self.store.clone(),
                self.executor.clone(),
                self.monitor.clone(),
                self.sessions.clone(),
            )
            .with_parent(parent_id);
            handles.push(tokio::spawn(worker.run(self.shutdown.subscribe())));
        }
        let workers = handles.len();

        for config in &self.config.observers {
            let fingerprinter: Arc<dyn Fingerprinter> = match self.fingerprinters.get(&config.name) {
                Some(custom) => custom.clone(),
                None => Arc::new(FileFingerprinter::new(
                    self.config.workspace.clone(),
                    config.watch_paths.clone(),
                )),
            };
            let observer = ObserverLoop::new(
                observer_profile(config),
                self.store.clone(),
                self.executor.clone(),
                fingerprinter,
                self.monitor.clone(),
                self.sessions.clone(),
            )
            .with_parent(parent_id);
            handles.push(tokio::spawn(observer.run(self.shutdown.subscribe())));
        }

        info!(
            workers,
            observers = handles.len() - workers,
            "Orchestrator started"
        );
        *lifecycle = Lifecycle::Running(handles);
        Ok(())
    }

    /// Handle one external message through the coordinator, starting the
    /// orchestrator first if needed.
    pub async fn handle(&self, message: &str) -> ForemanResult<String> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(ForemanError::ShutdownInProgress);
        }
        self.start().await?;
        self.coordinator.handle(message).await
    }

    /// Signal shutdown, wait for every loop to exit, and release the
    /// coordinator. Idempotent, and a no-op if never started.
    pub async fn stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            info!("Orchestrator already stopping");
        }
        self.shutdown.trigger();

        let previous = {
            let mut lifecycle = self.lifecycle.lock().await;
            std::mem::replace(&mut *lifecycle, Lifecycle::Stopped)
        };
        if let Lifecycle::Running(handles) = previous {
            info!(loops = handles.len(), "Waiting for loops to finish");
            for result in join_all(handles).await {
                if let Err(e) = result {
                    error!(error = %e, "Loop ended abnormally");
                }
            }
        }

        self.coordinator.release().await;
        info!("Orchestrator stopped");
    }
}

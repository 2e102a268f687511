use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::agent::bundle::BundleStore;
use crate::agent::controller::{TaskContext, TaskController};
use crate::agent::localizer::JobLocalizationCache;
use crate::agent::protocol::MasterProtocol;
use crate::agent::registry::{TaskEntry, TaskRegistry};
use crate::agent::runner::{MessageQueues, TaskRunner};
use crate::agent::types::{
    AgentState, Directive, Task, TaskId, TaskState, TaskStatus, WorkerAction, WorkerStatus,
};
use crate::config::AgentConfig;
use crate::error::{BspError, MasterError, Result};

const WORKER_SUBDIR: &str = "worker";
const JOBS_SUBDIR: &str = "jobs";
const PROBE_FILE: &str = ".probe";

/// What a single `dispatch` call did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Tasks for which a controller was started
    pub launched: Vec<TaskId>,
    /// Launch actions for tasks this worker already owns
    pub duplicates: Vec<TaskId>,
    /// Actions handed to the cleanup loop
    pub queued: usize,
}

/// Per-node worker agent.
///
/// Owns the registration handshake, the service loop, inbound dispatch and
/// the cleanup loop. `dispatch` may be called from any task concurrently
/// with the service loop; shared state lives behind per-index locks (tasks,
/// jobs, peers), never one agent-wide lock.
///
/// Shutdown drains: running tasks finish and their completions are reported
/// before the master connection is closed. With a `drain_timeout`, whatever
/// is still running once it passes is killed.
pub struct WorkerAgent {
    config: AgentConfig,
    master: Arc<dyn MasterProtocol>,
    runner: Arc<dyn TaskRunner>,
    store: Arc<dyn BundleStore>,
    queues: Arc<dyn MessageQueues>,
    localizer: Arc<JobLocalizationCache>,
    tasks: TaskRegistry,
    state: watch::Sender<AgentState>,
    peers: RwLock<Vec<String>>,
    local_root: RwLock<Option<PathBuf>>,
    system_dir: watch::Sender<Option<PathBuf>>,
    failures: AtomicU32,
    cleanup_tx: mpsc::UnboundedSender<WorkerAction>,
    cleanup_rx: Mutex<Option<mpsc::UnboundedReceiver<WorkerAction>>>,
    backlog: AtomicUsize,
    purged: AtomicBool,
    controllers: TaskTracker,
    shutdown: CancellationToken,
    /// Drain deadline passed; pending completion reports are given up
    abandon: CancellationToken,
    /// Close finished; stops the cleanup loop
    stopped: CancellationToken,
    closed: AtomicBool,
}

impl WorkerAgent {
    pub fn new(
        config: AgentConfig,
        master: Arc<dyn MasterProtocol>,
        runner: Arc<dyn TaskRunner>,
        store: Arc<dyn BundleStore>,
        queues: Arc<dyn MessageQueues>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(AgentState::Initializing);
        let (cleanup_tx, cleanup_rx) = mpsc::unbounded_channel();
        let (system_dir, _) = watch::channel(None);
        Arc::new(Self {
            config,
            master,
            runner,
            store,
            queues,
            localizer: Arc::new(JobLocalizationCache::new()),
            tasks: TaskRegistry::new(),
            state,
            peers: RwLock::new(Vec::new()),
            local_root: RwLock::new(None),
            system_dir,
            failures: AtomicU32::new(0),
            cleanup_tx,
            cleanup_rx: Mutex::new(Some(cleanup_rx)),
            backlog: AtomicUsize::new(0),
            purged: AtomicBool::new(false),
            controllers: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            abandon: CancellationToken::new(),
            stopped: CancellationToken::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn state(&self) -> AgentState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<AgentState> {
        self.state.subscribe()
    }

    pub fn tasks(&self) -> &TaskRegistry {
        &self.tasks
    }

    pub fn localizer(&self) -> &JobLocalizationCache {
        &self.localizer
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    /// Number of cleanup actions queued but not yet processed.
    pub fn cleanup_backlog(&self) -> usize {
        self.backlog.load(Ordering::SeqCst)
    }

    /// Peer names from the most recent directive that carried any.
    pub async fn all_peer_names(&self) -> Vec<String> {
        self.peers.read().await.clone()
    }

    pub async fn system_dir(&self) -> Option<PathBuf> {
        self.system_dir.borrow().clone()
    }

    /// Task controllers spawned and not yet finished, report included.
    pub fn active_controllers(&self) -> usize {
        self.controllers.len()
    }

    /// Record the superstep phase reported by the BSP runtime.
    ///
    /// Only moves between operational states; the service loop owns every
    /// other transition.
    pub fn set_superstep_phase(&self, phase: AgentState) -> Result<()> {
        if !phase.is_operational() {
            return Err(BspError::Internal(format!(
                "{} is not a superstep phase",
                phase
            )));
        }
        let mut current = AgentState::Initializing;
        let changed = self.state.send_if_modified(|state| {
            current = *state;
            if state.is_operational() && *state != phase {
                *state = phase;
                return true;
            }
            false
        });
        if !changed && current != phase {
            return Err(BspError::Internal(format!(
                "cannot enter {} while {}",
                phase, current
            )));
        }
        Ok(())
    }

    /// Snapshot of this worker with every running task's status.
    pub async fn worker_status(&self) -> WorkerStatus {
        let statuses = self.tasks.running_statuses().await;
        self.status_with(statuses)
    }

    fn status_with(&self, task_statuses: Vec<TaskStatus>) -> WorkerStatus {
        WorkerStatus {
            worker_name: self.config.worker_name.clone(),
            peer_name: self.config.peer_name.clone(),
            task_statuses,
            failures: self.failures(),
            max_tasks: self.config.max_tasks,
            rpc_address: self.config.rpc_address.clone(),
        }
    }

    /// Send identity and current status to the master.
    pub async fn register(&self) -> Result<bool> {
        let status = self.worker_status().await;
        tracing::info!(worker = %self.config.worker_name, "Registering with master");
        Ok(self.master.register(status).await?)
    }

    /// Inbound entry point for master directives.
    ///
    /// Launches start a controller in the background; every other action is
    /// queued for the cleanup loop. Never waits on either.
    pub async fn dispatch(self: &Arc<Self>, directive: Directive) -> DispatchSummary {
        let Directive { actions, peers } = directive;
        let mut summary = DispatchSummary::default();

        if self.shutdown.is_cancelled() {
            tracing::warn!(actions = actions.len(), "Agent shutting down, directive ignored");
            return summary;
        }
        if !peers.is_empty() {
            *self.peers.write().await = peers;
        }

        for action in actions {
            match action {
                WorkerAction::LaunchTask(task) => {
                    let task_id = task.id.clone();
                    if self.launch(task).await {
                        summary.launched.push(task_id);
                    } else {
                        tracing::debug!(task_id = %task_id, "Duplicate launch ignored");
                        summary.duplicates.push(task_id);
                    }
                }
                other => {
                    self.backlog.fetch_add(1, Ordering::SeqCst);
                    if self.cleanup_tx.send(other).is_err() {
                        self.backlog.fetch_sub(1, Ordering::SeqCst);
                        tracing::warn!("Cleanup queue closed, action dropped");
                        continue;
                    }
                    summary.queued += 1;
                }
            }
        }
        summary
    }

    async fn launch(self: &Arc<Self>, task: Task) -> bool {
        let controller = TaskController::new(task.clone(), self.task_context().await);
        let entry = TaskEntry {
            task: task.clone(),
            status: controller.subscribe(),
            kill: controller.kill_handle(),
        };
        if !self.tasks.insert_running(entry).await {
            return false;
        }
        self.localizer.add_task(&task.job_id, &task.id).await;
        tracing::info!(task_id = %task.id, job_id = %task.job_id, "Task launched");

        let agent = Arc::clone(self);
        self.controllers.spawn(async move {
            let status = controller.launch().await;
            agent.task_finished(status).await;
        });
        true
    }

    async fn task_context(&self) -> TaskContext {
        let local_root = match self.local_root.read().await.clone() {
            Some(root) => root,
            None => self.default_root(),
        };
        TaskContext {
            worker: self.config.worker_name.clone(),
            localizer: Arc::clone(&self.localizer),
            store: Arc::clone(&self.store),
            runner: Arc::clone(&self.runner),
            queues: Arc::clone(&self.queues),
            local_root,
            system_dir: self.system_dir.subscribe(),
            poll_interval: self.config.poll_interval(),
        }
    }

    fn default_root(&self) -> PathBuf {
        self.config
            .local_dirs
            .first()
            .cloned()
            .unwrap_or_else(std::env::temp_dir)
            .join(WORKER_SUBDIR)
    }

    /// Move a finished task into the finished index and report it.
    async fn task_finished(&self, status: TaskStatus) {
        if !self.tasks.finish(status.clone()).await {
            tracing::warn!(task_id = %status.task_id, "Finished task was not running");
            return;
        }
        if status.state == TaskState::Failed {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }

        let task_id = status.task_id.clone();
        let report = self.status_with(vec![status]);
        loop {
            match self.master.report(report.clone()).await {
                Ok(true) => return,
                Ok(false) => {
                    tracing::warn!("Master did not accept completion report");
                    return;
                }
                Err(MasterError::Rejected(reason)) => {
                    tracing::warn!(error = %reason, "Completion report rejected");
                    return;
                }
                Err(e) => {
                    tracing::warn!(task_id = %task_id, error = %e, "Completion report failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.retry_delay()) => {}
                        _ = self.abandon.cancelled() => {
                            tracing::warn!(task_id = %task_id, "Drain deadline passed, completion report dropped");
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Drive the service loop until shutdown or a fatal state.
    ///
    /// Returns `Ok(())` after a requested shutdown and the fatal error when
    /// the agent ends `Stale` or `Denied`. Running tasks are drained and
    /// owned resources closed on every exit path.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        self.spawn_cleanup_loop();
        let result = self.service_loop().await;
        self.close().await;
        result
    }

    async fn service_loop(&self) -> Result<()> {
        loop {
            if self.shutdown.is_cancelled() {
                self.set_state(AgentState::Shutdown);
            }

            let state = self.state();
            let outcome = match state {
                AgentState::Shutdown => return Ok(()),
                AgentState::Stale => return Err(BspError::Stale("agent is stale".to_string())),
                AgentState::Denied => return Err(BspError::Denied("agent was denied".to_string())),
                AgentState::Initializing => self.initialize().await,
                _ => self.offer_service().await,
            };

            match outcome {
                Ok(()) => {}
                Err(BspError::Stale(reason)) => {
                    tracing::error!(error = %reason, "Local storage unusable, agent is stale");
                    self.set_state(AgentState::Stale);
                    return Err(BspError::Stale(reason));
                }
                Err(BspError::Denied(reason)) => {
                    tracing::error!(error = %reason, "Master denied this worker");
                    self.set_state(AgentState::Denied);
                    return Err(BspError::Denied(reason));
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        retry_ms = self.config.retry_delay_ms,
                        "Lost connection to master, retrying"
                    );
                    if state.is_operational() {
                        self.set_state(AgentState::Initializing);
                    }
                    self.pause(self.config.retry_delay()).await;
                }
            }
        }
    }

    async fn initialize(&self) -> Result<()> {
        let root = self.check_local_dirs().await?;
        if !self.purged.swap(true, Ordering::SeqCst) {
            purge_jobs(&root).await;
        }
        *self.local_root.write().await = Some(root);

        if !self.register().await? {
            return Err(BspError::Denied(format!(
                "registration of {} declined",
                self.config.worker_name
            )));
        }
        tracing::info!(worker = %self.config.worker_name, "Worker registered");
        self.set_state(AgentState::Normal);
        Ok(())
    }

    /// One round of the operational loop.
    async fn offer_service(&self) -> Result<()> {
        if self.system_dir.borrow().is_none() {
            match self.master.system_dir().await? {
                Some(dir) => {
                    tracing::info!(system_dir = %dir.display(), "System directory discovered");
                    self.system_dir.send_replace(Some(dir));
                }
                None => {
                    return Err(BspError::MasterUnavailable(
                        "system directory not available yet".to_string(),
                    ))
                }
            }
        }

        let root = self.local_root.read().await.clone();
        if let Some(root) = root {
            probe_dir(&root).await.map_err(|e| {
                BspError::Stale(format!("{} is not writable: {}", root.display(), e))
            })?;
        }

        let status = self.worker_status().await;
        let running = status.task_statuses.len();
        if !self.master.report(status).await? {
            return Err(BspError::MasterUnavailable(
                "status report not accepted".to_string(),
            ));
        }
        tracing::debug!(running, "Status reported");

        self.pause(self.config.report_interval()).await;
        Ok(())
    }

    async fn check_local_dirs(&self) -> Result<PathBuf> {
        for dir in &self.config.local_dirs {
            let root = dir.join(WORKER_SUBDIR);
            match probe_dir(&root).await {
                Ok(()) => return Ok(root),
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "Local directory unusable")
                }
            }
        }
        Err(BspError::Stale(format!(
            "no writable local directory among {:?}",
            self.config.local_dirs
        )))
    }

    fn spawn_cleanup_loop(self: &Arc<Self>) {
        let rx = self
            .cleanup_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(rx) = rx else {
            return;
        };
        let agent = Arc::clone(self);
        tokio::spawn(async move { agent.cleanup_loop(rx).await });
    }

    async fn cleanup_loop(&self, mut rx: mpsc::UnboundedReceiver<WorkerAction>) {
        loop {
            let action = tokio::select! {
                _ = self.stopped.cancelled() => break,
                action = rx.recv() => match action {
                    Some(action) => action,
                    None => break,
                },
            };
            self.handle_cleanup(action).await;
            self.backlog.fetch_sub(1, Ordering::SeqCst);
        }
        tracing::debug!("Cleanup loop stopped");
    }

    async fn handle_cleanup(&self, action: WorkerAction) {
        match action {
            WorkerAction::KillTask { task_id } => match self.tasks.kill_handle(&task_id).await {
                Some(kill) => {
                    tracing::info!(task_id = %task_id, "Killing task");
                    kill.cancel();
                }
                None => tracing::debug!(task_id = %task_id, "Kill for unknown or finished task"),
            },
            WorkerAction::KillJob { job_id } => {
                let running = self.tasks.running_for_job(&job_id).await;
                tracing::info!(job_id = %job_id, tasks = running.len(), "Killing job");
                for task_id in running {
                    if let Some(kill) = self.tasks.kill_handle(&task_id).await {
                        kill.cancel();
                    }
                }
            }
            WorkerAction::LaunchTask(task) => {
                tracing::warn!(task_id = %task.id, "Launch action reached cleanup queue");
            }
        }
    }

    /// Ask the service loop to stop at its next boundary. Safe to call repeatedly.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::info!(worker = %self.config.worker_name, "Shutdown requested");
            self.shutdown.cancel();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stop the agent, drain running tasks and release the master
    /// connection. Only the first call has any effect.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown();
        self.drain().await;
        self.master.close().await;
        self.stopped.cancel();
        tracing::info!(worker = %self.config.worker_name, "Agent closed");
    }

    /// Wait for every task controller, completion report included.
    ///
    /// Past `drain_timeout` the remaining tasks are killed, pending report
    /// retries are abandoned and the wait repeats once more.
    async fn drain(&self) {
        self.controllers.close();
        if self.controllers.is_empty() {
            return;
        }
        tracing::info!(
            tasks = self.controllers.len(),
            timeout_ms = ?self.config.drain_timeout_ms,
            "Draining running tasks"
        );
        let Some(timeout) = self.config.drain_timeout() else {
            self.controllers.wait().await;
            tracing::info!("All tasks drained");
            return;
        };
        if tokio::time::timeout(timeout, self.controllers.wait())
            .await
            .is_ok()
        {
            tracing::info!("All tasks drained");
            return;
        }

        let running = self.tasks.running_statuses().await;
        tracing::warn!(tasks = running.len(), "Drain timed out, killing remaining tasks");
        for status in running {
            if let Some(kill) = self.tasks.kill_handle(&status.task_id).await {
                kill.cancel();
            }
        }
        self.abandon.cancel();
        if tokio::time::timeout(timeout, self.controllers.wait())
            .await
            .is_err()
        {
            tracing::error!(
                tasks = self.controllers.len(),
                "Tasks still running after kill, closing anyway"
            );
        }
    }

    fn set_state(&self, next: AgentState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::info!(from = %previous, to = %next, "Agent state changed");
        }
    }

    /// Sleep unless shutdown arrives first.
    async fn pause(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.shutdown.cancelled() => {}
        }
    }
}

async fn probe_dir(dir: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let probe = dir.join(PROBE_FILE);
    tokio::fs::write(&probe, b"ok").await?;
    tokio::fs::remove_file(&probe).await
}

/// Remove job directories left over from a previous run.
async fn purge_jobs(root: &Path) {
    let jobs = root.join(JOBS_SUBDIR);
    match tokio::fs::remove_dir_all(&jobs).await {
        Ok(()) => tracing::info!(dir = %jobs.display(), "Purged stale job directories"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(dir = %jobs.display(), error = %e, "Failed to purge job directories"),
    }
}

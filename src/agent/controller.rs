use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::agent::bundle::{fetch_bundle, job_dir, resolve_bundle, BundleStore};
use crate::agent::localizer::JobLocalizationCache;
use crate::agent::runner::{ExecutionUnit, MessageQueues, TaskRunner, UnitExit};
use crate::agent::types::{Task, TaskPhase, TaskState, TaskStatus};
use crate::error::{BspError, Result};

/// Collaborators a controller needs to take a task from launch to completion.
#[derive(Clone)]
pub struct TaskContext {
    pub worker: String,
    pub localizer: Arc<JobLocalizationCache>,
    pub store: Arc<dyn BundleStore>,
    pub runner: Arc<dyn TaskRunner>,
    pub queues: Arc<dyn MessageQueues>,
    /// Root of this worker's local job directories
    pub local_root: PathBuf,
    /// Master's shared staging directory; `None` until the agent discovers it
    pub system_dir: watch::Receiver<Option<PathBuf>>,
    pub poll_interval: Duration,
}

/// Drives one task through `Unassigned -> Running -> {Succeeded | Failed}`.
///
/// The task enters `Running` before its job is localized, so every failure
/// path still passes through `Running`. Errors end the task as `Failed`;
/// nothing is retried here.
pub struct TaskController {
    task: Task,
    ctx: TaskContext,
    status: watch::Sender<TaskStatus>,
    history: Mutex<Vec<TaskState>>,
    kill: CancellationToken,
}

impl TaskController {
    pub fn new(task: Task, ctx: TaskContext) -> Self {
        let status = TaskStatus::new(&task, ctx.worker.clone());
        let (status, _) = watch::channel(status);
        Self {
            task,
            ctx,
            status,
            history: Mutex::new(vec![TaskState::Unassigned]),
            kill: CancellationToken::new(),
        }
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn status(&self) -> TaskStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TaskStatus> {
        self.status.subscribe()
    }

    /// Every state this task has been in, in order.
    pub fn history(&self) -> Vec<TaskState> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Token that, once cancelled, kills the task's execution unit.
    pub fn kill_handle(&self) -> CancellationToken {
        self.kill.clone()
    }

    /// Localize, start and supervise the task. Returns its final status.
    pub async fn launch(&self) -> TaskStatus {
        if let Err(e) = self.transition(TaskState::Running, None) {
            tracing::warn!(task_id = %self.task.id, error = %e, "Task already launched");
            return self.status();
        }

        let work_dir = match self.localize().await {
            Ok(dir) => dir,
            Err(e) => return self.finish(TaskState::Failed, Some(e.to_string())),
        };

        if self.kill.is_cancelled() {
            return self.finish(TaskState::Failed, Some("killed before launch".to_string()));
        }

        let mut unit = match self.ctx.runner.launch(&self.task, &work_dir).await {
            Ok(unit) => unit,
            Err(e) => return self.finish(TaskState::Failed, Some(e.to_string())),
        };
        self.status.send_modify(|s| s.phase = TaskPhase::Compute);
        tracing::info!(task_id = %self.task.id, job_id = %self.task.job_id, "Task running");

        match self.supervise(unit.as_mut()).await {
            Ok(exit) if exit.success => self.finish(TaskState::Succeeded, None),
            Ok(exit) => self.finish(TaskState::Failed, exit.diagnostic),
            Err(e) => self.finish(TaskState::Failed, Some(e.to_string())),
        }
    }

    async fn localize(&self) -> Result<PathBuf> {
        let localizer = &self.ctx.localizer;
        localizer.add_task(&self.task.job_id, &self.task.id).await;

        let job_dir = job_dir(&self.ctx.local_root, &self.task)?;
        let remote = self.remote_bundle().await?;
        let store = Arc::clone(&self.ctx.store);
        localizer
            .localize(&self.task.job_id, move || async move {
                fetch_bundle(store.as_ref(), &remote, &job_dir).await
            })
            .await
    }

    /// Where the job's bundle lives in shared storage.
    ///
    /// Relative bundles wait until the system directory is known.
    async fn remote_bundle(&self) -> Result<PathBuf> {
        if self.task.bundle.is_absolute() {
            return Ok(self.task.bundle.clone());
        }
        let mut system_dir = self.ctx.system_dir.clone();
        let discovered = async {
            match system_dir.wait_for(|dir| dir.is_some()).await {
                Ok(dir) => (*dir).clone(),
                Err(_) => None,
            }
        };
        let dir = tokio::select! {
            dir = discovered => dir,
            _ = self.kill.cancelled() => {
                return Err(BspError::Localization {
                    job_id: self.task.job_id.clone(),
                    reason: "killed while waiting for the system directory".to_string(),
                })
            }
        };
        match dir {
            Some(dir) => Ok(resolve_bundle(&self.task, Some(dir.as_path()))),
            None => Err(BspError::Localization {
                job_id: self.task.job_id.clone(),
                reason: "system directory unknown".to_string(),
            }),
        }
    }

    /// Poll the unit until it has exited and no BSP messages are pending.
    async fn supervise(&self, unit: &mut dyn ExecutionUnit) -> Result<UnitExit> {
        let mut ticker = tokio::time::interval(self.ctx.poll_interval);
        ticker.tick().await;
        let mut killed = false;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.kill.cancelled(), if !killed => {
                    killed = true;
                    if let Err(e) = unit.kill() {
                        tracing::warn!(task_id = %self.task.id, error = %e, "Failed to kill task");
                    }
                }
            }

            let Some(exit) = unit.try_wait().await? else {
                continue;
            };
            if killed {
                return Ok(UnitExit::failure(exit.exit_code, "killed"));
            }
            if self.ctx.queues.is_drained() {
                return Ok(exit);
            }
            tracing::debug!(
                task_id = %self.task.id,
                local = self.ctx.queues.local_queue_size(),
                outgoing = self.ctx.queues.outgoing_queue_size(),
                "Task exited, waiting for message queues to drain"
            );
        }
    }

    fn finish(&self, state: TaskState, diagnostic: Option<String>) -> TaskStatus {
        if let Err(e) = self.transition(state, diagnostic) {
            tracing::error!(task_id = %self.task.id, error = %e, "Invalid final transition");
        }
        let status = self.status();
        match status.state {
            TaskState::Failed => tracing::warn!(
                task_id = %self.task.id,
                diagnostic = ?status.diagnostic,
                "Task failed"
            ),
            _ => tracing::info!(task_id = %self.task.id, state = %status.state, "Task finished"),
        }
        status
    }

    fn transition(&self, next: TaskState, diagnostic: Option<String>) -> Result<()> {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let mut outcome = Ok(());
        self.status.send_modify(|s| {
            outcome = s.transition(next);
            if outcome.is_ok() && diagnostic.is_some() {
                s.diagnostic = diagnostic;
            }
        });
        if outcome.is_ok() {
            history.push(next);
        }
        outcome
    }
}

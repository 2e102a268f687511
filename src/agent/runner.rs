use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::process::{Child, Command};

use crate::agent::types::{Task, TaskId};
use crate::error::{BspError, Result};

/// How an execution unit terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitExit {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub diagnostic: Option<String>,
}

impl UnitExit {
    pub fn success() -> Self {
        Self {
            success: true,
            exit_code: Some(0),
            diagnostic: None,
        }
    }

    pub fn failure(exit_code: Option<i32>, diagnostic: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code,
            diagnostic: Some(diagnostic.into()),
        }
    }
}

/// A started task, polled by its controller until it terminates.
#[async_trait]
pub trait ExecutionUnit: Send {
    /// Check without waiting for exit. `Ok(None)` while the unit is still alive.
    async fn try_wait(&mut self) -> Result<Option<UnitExit>>;

    /// Ask the unit to stop. Termination is still observed through `try_wait`.
    fn kill(&mut self) -> Result<()>;
}

/// Starts execution units for tasks.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn launch(&self, task: &Task, work_dir: &Path) -> Result<Box<dyn ExecutionUnit>>;
}

/// Pending BSP message counts on this node.
///
/// A task is only complete once both queues are empty; otherwise messages
/// it produced could still be in flight when the master hears it finished.
pub trait MessageQueues: Send + Sync {
    fn local_queue_size(&self) -> usize;
    fn outgoing_queue_size(&self) -> usize;

    fn is_drained(&self) -> bool {
        self.local_queue_size() == 0 && self.outgoing_queue_size() == 0
    }
}

/// Message counters maintained by the BSP peer runtime.
#[derive(Debug, Default)]
pub struct PeerQueues {
    local: AtomicUsize,
    outgoing: AtomicUsize,
}

impl PeerQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message_received(&self) {
        self.local.fetch_add(1, Ordering::SeqCst);
    }

    pub fn message_consumed(&self) {
        let _ = self
            .local
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub fn message_queued(&self) {
        self.outgoing.fetch_add(1, Ordering::SeqCst);
    }

    pub fn message_sent(&self) {
        let _ = self
            .outgoing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}

impl MessageQueues for PeerQueues {
    fn local_queue_size(&self) -> usize {
        self.local.load(Ordering::SeqCst)
    }

    fn outgoing_queue_size(&self) -> usize {
        self.outgoing.load(Ordering::SeqCst)
    }
}

/// Runs each task as a shell command in its job's work directory.
///
/// The child gets `BSP_JOB_ID` and `BSP_TASK_ID` in its environment. Its
/// stdout and stderr go to `<task_id>.out` / `<task_id>.err` in the log
/// directory (by default `logs/` next to the work directory).
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    shell: Option<String>,
    log_dir: Option<PathBuf>,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = Some(shell.into());
        self
    }

    fn log_dir_for(&self, work_dir: &Path) -> PathBuf {
        match &self.log_dir {
            Some(dir) => dir.clone(),
            None => work_dir
                .parent()
                .map(|p| p.join("logs"))
                .unwrap_or_else(|| work_dir.join("logs")),
        }
    }
}

#[async_trait]
impl TaskRunner for ProcessRunner {
    async fn launch(&self, task: &Task, work_dir: &Path) -> Result<Box<dyn ExecutionUnit>> {
        let log_dir = self.log_dir_for(work_dir);
        tokio::fs::create_dir_all(&log_dir).await?;
        let stdout = tokio::fs::File::create(log_dir.join(format!("{}.out", task.id)))
            .await?
            .into_std()
            .await;
        let stderr_path = log_dir.join(format!("{}.err", task.id));
        let stderr = tokio::fs::File::create(&stderr_path)
            .await?
            .into_std()
            .await;

        let shell = self.shell.as_deref().unwrap_or("sh");
        tracing::info!(task_id = %task.id, job_id = %task.job_id, command = %task.command, "Starting task process");

        let child = Command::new(shell)
            .arg("-c")
            .arg(&task.command)
            .current_dir(work_dir)
            .env("BSP_JOB_ID", task.job_id.as_str())
            .env("BSP_TASK_ID", task.id.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BspError::Launch {
                task_id: task.id.clone(),
                reason: e.to_string(),
            })?;

        Ok(Box::new(ProcessUnit {
            task_id: task.id.clone(),
            child,
            stderr_path,
        }))
    }
}

struct ProcessUnit {
    task_id: TaskId,
    child: Child,
    stderr_path: PathBuf,
}

impl ProcessUnit {
    async fn stderr_tail(&self) -> Option<String> {
        let text = tokio::fs::read_to_string(&self.stderr_path).await.ok()?;
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        let start = text
            .char_indices()
            .rev()
            .nth(1023)
            .map(|(i, _)| i)
            .unwrap_or(0);
        Some(text[start..].to_string())
    }
}

#[async_trait]
impl ExecutionUnit for ProcessUnit {
    async fn try_wait(&mut self) -> Result<Option<UnitExit>> {
        let Some(status) = self.child.try_wait()? else {
            return Ok(None);
        };
        let exit_code = status.code();
        tracing::info!(task_id = %self.task_id, exit_code = ?exit_code, "Task process exited");

        if status.success() {
            return Ok(Some(UnitExit::success()));
        }
        let diagnostic = self
            .stderr_tail()
            .await
            .unwrap_or_else(|| format!("Exit code: {:?}", exit_code));
        Ok(Some(UnitExit::failure(exit_code, diagnostic)))
    }

    fn kill(&mut self) -> Result<()> {
        tracing::info!(task_id = %self.task_id, "Killing task process");
        self.child.start_kill()?;
        Ok(())
    }
}

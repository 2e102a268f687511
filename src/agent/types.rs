use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BspError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A unit of work the master assigned to this worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub job_id: JobId,
    /// Location of the job's bundle in shared storage. Relative paths are
    /// resolved against the master's system directory.
    pub bundle: PathBuf,
    /// Command run inside the localized bundle's work directory
    pub command: String,
}

impl Task {
    pub fn new(
        id: impl Into<String>,
        job_id: impl Into<String>,
        bundle: impl Into<PathBuf>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            id: TaskId::new(id),
            job_id: JobId::new(job_id),
            bundle: bundle.into(),
            command: command.into(),
        }
    }
}

/// Run state of a task. Transitions only move forward:
/// `Unassigned -> Running -> {Succeeded | Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Unassigned,
    Running,
    Succeeded,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }

    pub fn can_transition_to(self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (TaskState::Unassigned, TaskState::Running)
                | (TaskState::Running, TaskState::Succeeded)
                | (TaskState::Running, TaskState::Failed)
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Unassigned => write!(f, "unassigned"),
            TaskState::Running => write!(f, "running"),
            TaskState::Succeeded => write!(f, "succeeded"),
            TaskState::Failed => write!(f, "failed"),
        }
    }
}

/// Coarse progress marker within a running task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskPhase {
    Starting,
    Compute,
    BarrierSync,
    Cleanup,
}

impl std::fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskPhase::Starting => write!(f, "starting"),
            TaskPhase::Compute => write!(f, "compute"),
            TaskPhase::BarrierSync => write!(f, "barrier_sync"),
            TaskPhase::Cleanup => write!(f, "cleanup"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: TaskId,
    pub job_id: JobId,
    pub state: TaskState,
    pub phase: TaskPhase,
    pub progress: f32,
    pub worker: String,
    pub start_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
    pub diagnostic: Option<String>,
}

impl TaskStatus {
    pub fn new(task: &Task, worker: impl Into<String>) -> Self {
        Self {
            task_id: task.id.clone(),
            job_id: task.job_id.clone(),
            state: TaskState::Unassigned,
            phase: TaskPhase::Starting,
            progress: 0.0,
            worker: worker.into(),
            start_time: None,
            finish_time: None,
            diagnostic: None,
        }
    }

    /// Move to `next`, stamping start/finish times. Rejects anything but a
    /// single forward step.
    pub fn transition(&mut self, next: TaskState) -> Result<(), BspError> {
        if !self.state.can_transition_to(next) {
            return Err(BspError::InvalidTransition {
                task_id: self.task_id.clone(),
                from: self.state,
                to: next,
            });
        }
        match next {
            TaskState::Running => self.start_time = Some(Utc::now()),
            TaskState::Succeeded | TaskState::Failed => {
                self.finish_time = Some(Utc::now());
                self.progress = 1.0;
                self.phase = TaskPhase::Cleanup;
            }
            TaskState::Unassigned => {}
        }
        self.state = next;
        Ok(())
    }
}

/// Snapshot of this worker sent to the master on registration and reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub worker_name: String,
    pub peer_name: String,
    pub task_statuses: Vec<TaskStatus>,
    pub failures: u32,
    pub max_tasks: u32,
    pub rpc_address: String,
}

/// One instruction inside a directive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerAction {
    LaunchTask(Task),
    KillTask { task_id: TaskId },
    KillJob { job_id: JobId },
}

/// Master-to-worker message. Delivered at least once, possibly out of order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directive {
    pub actions: Vec<WorkerAction>,
    /// Current BSP peer names in the cluster
    pub peers: Vec<String>,
}

impl Directive {
    pub fn new(actions: Vec<WorkerAction>) -> Self {
        Self {
            actions,
            peers: Vec::new(),
        }
    }

    pub fn with_peers(mut self, peers: Vec<String>) -> Self {
        self.peers = peers;
        self
    }
}

/// State of the agent's service loop.
///
/// `Compute`, `Sync` and `Barrier` are superstep phases set by the BSP
/// runtime and behave like `Normal` for the service loop. `Stale` and
/// `Denied` are terminal failures, `Shutdown` the terminal success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentState {
    Initializing,
    Normal,
    Compute,
    Sync,
    Barrier,
    Stale,
    Denied,
    Shutdown,
}

impl AgentState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AgentState::Stale | AgentState::Denied | AgentState::Shutdown
        )
    }

    pub fn is_operational(self) -> bool {
        matches!(
            self,
            AgentState::Normal | AgentState::Compute | AgentState::Sync | AgentState::Barrier
        )
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentState::Initializing => write!(f, "initializing"),
            AgentState::Normal => write!(f, "normal"),
            AgentState::Compute => write!(f, "compute"),
            AgentState::Sync => write!(f, "sync"),
            AgentState::Barrier => write!(f, "barrier"),
            AgentState::Stale => write!(f, "stale"),
            AgentState::Denied => write!(f, "denied"),
            AgentState::Shutdown => write!(f, "shutdown"),
        }
    }
}

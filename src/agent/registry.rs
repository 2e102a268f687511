use std::collections::BTreeMap;

use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;

use crate::agent::types::{JobId, Task, TaskId, TaskStatus};

/// Bookkeeping for one task owned by this worker.
#[derive(Debug, Clone)]
pub struct TaskEntry {
    pub task: Task,
    pub status: watch::Receiver<TaskStatus>,
    pub kill: CancellationToken,
}

impl TaskEntry {
    pub fn current_status(&self) -> TaskStatus {
        self.status.borrow().clone()
    }
}

/// Running and finished task indices.
///
/// Every method that touches both indices locks `running` before
/// `finished`; keep that order so concurrent dispatch and completion cannot
/// deadlock.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    running: RwLock<BTreeMap<TaskId, TaskEntry>>,
    finished: RwLock<BTreeMap<TaskId, TaskStatus>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a task into the running index unless this worker already owns
    /// it (running or finished). Returns whether it was inserted.
    pub async fn insert_running(&self, entry: TaskEntry) -> bool {
        let mut running = self.running.write().await;
        let finished = self.finished.read().await;
        let id = entry.task.id.clone();
        if running.contains_key(&id) || finished.contains_key(&id) {
            return false;
        }
        running.insert(id, entry);
        true
    }

    /// Move a task from running to finished with its final status.
    ///
    /// Returns `false` if the task was not running, which leaves both
    /// indices untouched.
    pub async fn finish(&self, status: TaskStatus) -> bool {
        let mut running = self.running.write().await;
        let mut finished = self.finished.write().await;
        if running.remove(&status.task_id).is_none() {
            return false;
        }
        finished.insert(status.task_id.clone(), status);
        true
    }

    pub async fn contains(&self, task_id: &TaskId) -> bool {
        let running = self.running.read().await;
        let finished = self.finished.read().await;
        running.contains_key(task_id) || finished.contains_key(task_id)
    }

    pub async fn is_running(&self, task_id: &TaskId) -> bool {
        self.running.read().await.contains_key(task_id)
    }

    pub async fn kill_handle(&self, task_id: &TaskId) -> Option<CancellationToken> {
        self.running
            .read()
            .await
            .get(task_id)
            .map(|entry| entry.kill.clone())
    }

    pub async fn running_for_job(&self, job_id: &JobId) -> Vec<TaskId> {
        self.running
            .read()
            .await
            .values()
            .filter(|entry| &entry.task.job_id == job_id)
            .map(|entry| entry.task.id.clone())
            .collect()
    }

    /// Status snapshots of all running tasks, ordered by task id.
    pub async fn running_statuses(&self) -> Vec<TaskStatus> {
        self.running
            .read()
            .await
            .values()
            .map(TaskEntry::current_status)
            .collect()
    }

    pub async fn finished_statuses(&self) -> Vec<TaskStatus> {
        self.finished.read().await.values().cloned().collect()
    }

    pub async fn finished_status(&self, task_id: &TaskId) -> Option<TaskStatus> {
        self.finished.read().await.get(task_id).cloned()
    }

    pub async fn running_count(&self) -> usize {
        self.running.read().await.len()
    }

    pub async fn finished_count(&self) -> usize {
        self.finished.read().await.len()
    }
}

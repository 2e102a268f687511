use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{watch, Mutex, RwLock};

use crate::agent::types::{JobId, TaskId};
use crate::error::{BspError, Result};

type FetchOutcome = Option<std::result::Result<PathBuf, String>>;

/// Per-job localization record shared by every task of the job.
#[derive(Debug)]
pub struct RunningJob {
    pub job_id: JobId,
    pub localized: Option<PathBuf>,
    pub tasks: HashSet<TaskId>,
    in_flight: Option<watch::Receiver<FetchOutcome>>,
}

impl RunningJob {
    fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            localized: None,
            tasks: HashSet::new(),
            in_flight: None,
        }
    }
}

enum Role {
    Fetch(watch::Sender<FetchOutcome>),
    Wait(watch::Receiver<FetchOutcome>),
}

/// Fetches each job's resource bundle at most once.
///
/// Each job has its own record and lock, so unrelated jobs localize in
/// parallel. The first caller for a job runs the fetch; callers arriving
/// while it is in flight wait for it and share its outcome, success or
/// failure. After a failure the next caller fetches again; the cache itself
/// never retries.
#[derive(Debug, Default)]
pub struct JobLocalizationCache {
    jobs: RwLock<HashMap<JobId, Arc<Mutex<RunningJob>>>>,
}

impl JobLocalizationCache {
    pub fn new() -> Self {
        Self::default()
    }

    async fn entry(&self, job_id: &JobId) -> Arc<Mutex<RunningJob>> {
        if let Some(job) = self.jobs.read().await.get(job_id) {
            return job.clone();
        }
        self.jobs
            .write()
            .await
            .entry(job_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(RunningJob::new(job_id.clone()))))
            .clone()
    }

    /// Record that `task_id` belongs to `job_id`, creating the job record on first sight.
    pub async fn add_task(&self, job_id: &JobId, task_id: &TaskId) {
        let job = self.entry(job_id).await;
        job.lock().await.tasks.insert(task_id.clone());
    }

    /// Return the local bundle path of `job_id`, running `fetch` if the job
    /// has not been localized yet.
    pub async fn localize<F, Fut>(&self, job_id: &JobId, fetch: F) -> Result<PathBuf>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<PathBuf>>,
    {
        let job = self.entry(job_id).await;

        let role = {
            let mut rjob = job.lock().await;
            if let Some(path) = &rjob.localized {
                return Ok(path.clone());
            }
            // A closed channel means the fetching caller went away.
            let pending = rjob
                .in_flight
                .as_ref()
                .filter(|rx| rx.has_changed().is_ok())
                .cloned();
            match pending {
                Some(rx) => Role::Wait(rx),
                None => {
                    let (tx, rx) = watch::channel(None);
                    rjob.in_flight = Some(rx);
                    Role::Fetch(tx)
                }
            }
        };

        match role {
            Role::Fetch(tx) => {
                tracing::info!(job_id = %job_id, "Localizing job bundle");
                let outcome = fetch().await.map_err(|e| e.to_string());
                {
                    let mut rjob = job.lock().await;
                    rjob.in_flight = None;
                    if let Ok(path) = &outcome {
                        rjob.localized = Some(path.clone());
                    }
                }
                let _ = tx.send(Some(outcome.clone()));

                match outcome {
                    Ok(path) => {
                        tracing::info!(job_id = %job_id, path = %path.display(), "Job localized");
                        Ok(path)
                    }
                    Err(reason) => {
                        tracing::warn!(job_id = %job_id, error = %reason, "Job localization failed");
                        Err(BspError::Localization {
                            job_id: job_id.clone(),
                            reason,
                        })
                    }
                }
            }
            Role::Wait(mut rx) => {
                tracing::debug!(job_id = %job_id, "Waiting for in-flight localization");
                let shared = rx.wait_for(Option::is_some).await.map(|v| (*v).clone());
                match shared {
                    Ok(Some(Ok(path))) => Ok(path),
                    Ok(Some(Err(reason))) => Err(BspError::Localization {
                        job_id: job_id.clone(),
                        reason,
                    }),
                    _ => Err(BspError::Localization {
                        job_id: job_id.clone(),
                        reason: "localization abandoned".to_string(),
                    }),
                }
            }
        }
    }

    pub async fn is_localized(&self, job_id: &JobId) -> bool {
        match self.jobs.read().await.get(job_id) {
            Some(job) => job.lock().await.localized.is_some(),
            None => false,
        }
    }

    pub async fn localized_path(&self, job_id: &JobId) -> Option<PathBuf> {
        let job = self.jobs.read().await.get(job_id).cloned()?;
        let path = job.lock().await.localized.clone();
        path
    }

    /// Tasks registered under `job_id`, sorted.
    pub async fn tasks_for_job(&self, job_id: &JobId) -> Vec<TaskId> {
        let Some(job) = self.jobs.read().await.get(job_id).cloned() else {
            return Vec::new();
        };
        let mut tasks: Vec<TaskId> = job.lock().await.tasks.iter().cloned().collect();
        tasks.sort();
        tasks
    }

    pub async fn job_count(&self) -> usize {
        self.jobs.read().await.len()
    }
}

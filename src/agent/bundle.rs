use std::fs::File;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use flate2::read::GzDecoder;

use crate::agent::types::Task;
use crate::error::{BspError, Result};

/// File name a job's archive is stored under once copied locally.
pub const BUNDLE_FILE: &str = "bundle.tar.gz";
/// Directory the archive is unpacked into; becomes the task's working directory.
pub const WORK_DIR: &str = "work";

/// Shared storage holding job bundles.
#[async_trait]
pub trait BundleStore: Send + Sync {
    /// Copy `remote` from shared storage to the local path `local`.
    async fn copy_to_local(&self, remote: &Path, local: &Path) -> std::io::Result<()>;
}

/// Shared storage mounted into the local file system (NFS and similar).
#[derive(Debug, Clone, Default)]
pub struct LocalBundleStore;

#[async_trait]
impl BundleStore for LocalBundleStore {
    async fn copy_to_local(&self, remote: &Path, local: &Path) -> std::io::Result<()> {
        tokio::fs::copy(remote, local).await.map(|_| ())
    }
}

/// Resolve a task's bundle location against the master's system directory.
pub fn resolve_bundle(task: &Task, system_dir: Option<&Path>) -> PathBuf {
    match system_dir {
        Some(dir) if task.bundle.is_relative() => dir.join(&task.bundle),
        _ => task.bundle.clone(),
    }
}

/// Local directory owned by one job under the worker's root.
///
/// The job id must be a single plain path component so the directory stays
/// under `<local_root>/jobs`.
pub fn job_dir(local_root: &Path, task: &Task) -> Result<PathBuf> {
    let mut components = Path::new(task.job_id.as_str()).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None) => Ok(local_root.join("jobs").join(name)),
        _ => Err(BspError::Localization {
            job_id: task.job_id.clone(),
            reason: "job id is not a plain directory name".to_string(),
        }),
    }
}

/// Copy a job's bundle out of shared storage and unpack it.
///
/// Returns the unpacked work directory.
pub async fn fetch_bundle(
    store: &dyn BundleStore,
    remote: &Path,
    job_dir: &Path,
) -> Result<PathBuf> {
    tokio::fs::create_dir_all(job_dir).await?;
    let archive = job_dir.join(BUNDLE_FILE);
    store.copy_to_local(remote, &archive).await?;

    let work_dir = job_dir.join(WORK_DIR);
    tokio::fs::create_dir_all(&work_dir).await?;
    unpack_bundle(&archive, &work_dir).await?;

    tracing::debug!(archive = %archive.display(), work_dir = %work_dir.display(), "Bundle unpacked");
    Ok(work_dir)
}

/// Unpack a gzip-compressed tar archive into `dest`.
pub async fn unpack_bundle(archive: &Path, dest: &Path) -> Result<()> {
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let file = File::open(&archive)?;
        tar::Archive::new(GzDecoder::new(file)).unpack(&dest)
    })
    .await
    .map_err(|e| BspError::Internal(format!("bundle unpack task failed: {}", e)))??;
    Ok(())
}

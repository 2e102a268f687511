use std::path::PathBuf;

use async_trait::async_trait;

use crate::agent::types::WorkerStatus;
use crate::error::MasterError;

/// Calls the worker agent makes to the master.
///
/// Transport and marshaling are up to the implementation. Implementations
/// return [`MasterError::Unavailable`] for anything the agent should retry
/// and [`MasterError::Rejected`] when the master answered with a refusal.
#[async_trait]
pub trait MasterProtocol: Send + Sync {
    /// Join the cluster. `Ok(false)` means the master declined the worker.
    async fn register(&self, status: WorkerStatus) -> Result<bool, MasterError>;

    /// Push a status snapshot. `Ok(false)` means the master did not accept it.
    async fn report(&self, status: WorkerStatus) -> Result<bool, MasterError>;

    /// Shared staging directory holding job bundles.
    async fn system_dir(&self) -> Result<Option<PathBuf>, MasterError>;

    /// Release the connection. Called once when the agent closes.
    async fn close(&self) {}
}

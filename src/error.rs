use thiserror::Error;

use crate::agent::types::{JobId, TaskId, TaskState};

/// Failures of a control-plane call to the master.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MasterError {
    /// Master unreachable, timed out or otherwise transiently failing.
    #[error("master unavailable: {0}")]
    Unavailable(String),

    /// Master answered and refused the request.
    #[error("rejected by master: {0}")]
    Rejected(String),
}

#[derive(Error, Debug)]
pub enum BspError {
    #[error("Invalid address: {0:?}")]
    InvalidAddress(String),

    #[error("Local storage unusable: {0}")]
    Stale(String),

    #[error("Denied by master: {0}")]
    Denied(String),

    #[error("Master unavailable: {0}")]
    MasterUnavailable(String),

    #[error("Localization of job {job_id} failed: {reason}")]
    Localization { job_id: JobId, reason: String },

    #[error("Launch of task {task_id} failed: {reason}")]
    Launch { task_id: TaskId, reason: String },

    #[error("Invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskState,
        to: TaskState,
    },

    #[error("Failure detector has been shut down")]
    DetectorStopped,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<MasterError> for BspError {
    fn from(err: MasterError) -> Self {
        match err {
            MasterError::Unavailable(msg) => BspError::MasterUnavailable(msg),
            MasterError::Rejected(msg) => BspError::Denied(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, BspError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_master_call_maps_to_denied() {
        let err: BspError = MasterError::Rejected("unknown worker".to_string()).into();
        assert!(matches!(err, BspError::Denied(ref m) if m == "unknown worker"));
    }

    #[test]
    fn unavailable_master_call_maps_to_transient() {
        let err: BspError = MasterError::Unavailable("connection refused".to_string()).into();
        assert!(matches!(err, BspError::MasterUnavailable(_)));
    }
}

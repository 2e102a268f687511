//! Per-node worker agent for BSP jobs.
//!
//! The agent registers with the master, accepts directives, localizes each
//! job's bundle once and runs every task through its own
//! [`TaskController`]. Completions and periodic status reports flow back to
//! the master through [`MasterProtocol`].
//!
//! Transient master failures are retried forever with a fixed delay. A
//! refused registration ends the agent as `Denied`, unusable local storage
//! as `Stale`. Task failures stay contained in the task's final status.

pub mod bundle;
pub mod controller;
pub mod localizer;
pub mod protocol;
pub mod registry;
pub mod runner;
pub mod service;
pub mod types;

pub use bundle::{BundleStore, LocalBundleStore};
pub use controller::{TaskContext, TaskController};
pub use localizer::JobLocalizationCache;
pub use protocol::MasterProtocol;
pub use registry::{TaskEntry, TaskRegistry};
pub use runner::{ExecutionUnit, MessageQueues, PeerQueues, ProcessRunner, TaskRunner, UnitExit};
pub use service::{DispatchSummary, WorkerAgent};
pub use types::{
    AgentState, Directive, JobId, Task, TaskId, TaskPhase, TaskState, TaskStatus, WorkerAction,
    WorkerStatus,
};

//! Accrual failure detection for cluster members.
//!
//! Members send small UDP heartbeats carrying a sequence number. The
//! detector keeps a bounded window of inter-arrival times per member and
//! turns "time since the last heartbeat" into a continuous suspicion level,
//! phi, instead of an alive/dead verdict. Callers pick their own threshold
//! (8 is a common choice).
//!
//! # Components
//!
//! - [`HeartbeatNode`]: one member's sliding window and phi computation
//! - [`NodeRegistry`]: copy-on-write address to record map and ingestion rules
//! - [`FailureDetector`]: socket, receive loop, ingestion pool and queries
//! - [`HeartbeatSensor`]: the sending side, used by members
//!
//! # Ingestion rules
//!
//! | sequence | known address | effect |
//! |---|---|---|
//! | 1 | no | record created |
//! | 1 | yes | record reset in place |
//! | > 1 | no | warning, sample dropped |
//! | > 1 | yes | interval appended, oldest evicted at capacity |

pub mod registry;
pub mod sensor;
pub mod supervisor;
pub mod window;

pub use registry::{Ingested, NodeRegistry};
pub use sensor::HeartbeatSensor;
pub use supervisor::{FailureDetector, MemberSnapshot, UNKNOWN_MEMBER};
pub use window::{HeartbeatNode, PhiParams};

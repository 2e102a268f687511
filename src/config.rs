use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Default UDP port the failure detector listens on.
pub const DEFAULT_DETECTOR_PORT: u16 = 16384;

/// Configuration for the accrual failure detector.
///
/// Every field is fixed once the detector is constructed; two detectors
/// built from different configs never observe each other's settings.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Address the heartbeat socket binds to
    pub listen_addr: SocketAddr,
    /// Number of inter-arrival samples kept per member
    pub window_size: usize,
    /// Maximum number of heartbeats ingested concurrently
    pub worker_threads: usize,
    /// Lower bound on the standard deviation used for phi, in milliseconds
    pub min_std_deviation_ms: u64,
    /// Assumed mean interval while a member has no samples yet, in milliseconds
    pub first_heartbeat_estimate_ms: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_DETECTOR_PORT)),
            window_size: 100,
            worker_threads: 20,
            min_std_deviation_ms: 100,
            first_heartbeat_estimate_ms: 1000,
        }
    }
}

impl DetectorConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_window_size(mut self, window_size: usize) -> Self {
        self.window_size = window_size;
        self
    }

    pub fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads;
        self
    }
}

/// Configuration for a member-side heartbeat sender.
#[derive(Debug, Clone)]
pub struct SensorConfig {
    /// Failure detector address heartbeats are sent to
    pub target: SocketAddr,
    /// Interval between heartbeats in milliseconds
    pub interval_ms: u64,
}

impl SensorConfig {
    pub fn new(target: SocketAddr) -> Self {
        Self {
            target,
            interval_ms: 1000,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Configuration for the per-node worker agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Name this worker registers under
    pub worker_name: String,
    /// BSP peer name ("host:port") other peers use to reach this node
    pub peer_name: String,
    /// Address of the agent's own control endpoint, reported to the master
    pub rpc_address: String,
    /// Local directories used for job bundles; at least one must be writable
    pub local_dirs: Vec<PathBuf>,
    /// Number of task slots advertised to the master
    pub max_tasks: u32,
    /// Delay between attempts while the master is unreachable
    pub retry_delay_ms: u64,
    /// Interval at which a running task's completion is checked
    pub poll_interval_ms: u64,
    /// Interval between periodic status reports
    pub report_interval_ms: u64,
    /// How long shutdown waits for running tasks and their completion
    /// reports before killing what is left; `None` waits for all of them
    pub drain_timeout_ms: Option<u64>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            worker_name: "worker".to_string(),
            peer_name: "127.0.0.1:61000".to_string(),
            rpc_address: "127.0.0.1:50000".to_string(),
            local_dirs: vec![std::env::temp_dir().join("bsp-node")],
            max_tasks: 1,
            retry_delay_ms: 5000,
            poll_interval_ms: 1000,
            report_interval_ms: 60_000,
            drain_timeout_ms: None,
        }
    }
}

impl AgentConfig {
    pub fn new(worker_name: impl Into<String>, peer_name: impl Into<String>) -> Self {
        Self {
            worker_name: worker_name.into(),
            peer_name: peer_name.into(),
            ..Default::default()
        }
    }

    pub fn with_local_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.local_dirs = vec![dir.into()];
        self
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }

    pub fn drain_timeout(&self) -> Option<Duration> {
        self.drain_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detector_config_default() {
        let cfg = DetectorConfig::default();
        assert_eq!(cfg.listen_addr.port(), 16384);
        assert_eq!(cfg.window_size, 100);
        assert_eq!(cfg.worker_threads, 20);
        assert_eq!(cfg.min_std_deviation_ms, 100);
        assert_eq!(cfg.first_heartbeat_estimate_ms, 1000);
    }

    #[test]
    fn detector_config_builders() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let cfg = DetectorConfig::new(addr)
            .with_window_size(3)
            .with_worker_threads(2);
        assert_eq!(cfg.listen_addr, addr);
        assert_eq!(cfg.window_size, 3);
        assert_eq!(cfg.worker_threads, 2);
    }

    #[test]
    fn sensor_config_default_interval() {
        let cfg = SensorConfig::new("127.0.0.1:16384".parse().unwrap());
        assert_eq!(cfg.interval(), Duration::from_secs(1));
    }

    #[test]
    fn agent_config_default() {
        let cfg = AgentConfig::default();
        assert_eq!(cfg.max_tasks, 1);
        assert_eq!(cfg.retry_delay(), Duration::from_secs(5));
        assert_eq!(cfg.poll_interval(), Duration::from_secs(1));
        assert_eq!(cfg.report_interval(), Duration::from_secs(60));
        assert_eq!(cfg.drain_timeout(), None);
        assert_eq!(cfg.local_dirs.len(), 1);
    }

    #[test]
    fn agent_config_new() {
        let cfg = AgentConfig::new("groomd_host_61000", "host:61000").with_local_dir("/data/bsp");
        assert_eq!(cfg.worker_name, "groomd_host_61000");
        assert_eq!(cfg.peer_name, "host:61000");
        assert_eq!(cfg.local_dirs, vec![PathBuf::from("/data/bsp")]);
    }
}

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::DetectorConfig;
use crate::detector::registry::{lock, Ingested, NodeRegistry};
use crate::detector::sensor::decode_heartbeat;
use crate::detector::window::PhiParams;
use crate::error::{BspError, Result};

/// Suspicion level reported for an address that has never sent a heartbeat.
pub const UNKNOWN_MEMBER: f64 = -1.0;

const RECV_BACKOFF_BASE_MS: u64 = 10;
const RECV_BACKOFF_MAX_MS: u64 = 1000;

/// Point-in-time view of one monitored member.
#[derive(Debug, Clone, Serialize)]
pub struct MemberSnapshot {
    pub address: String,
    pub phi: f64,
    pub window_len: usize,
    pub last_sequence: u64,
    pub mean_interval_ms: f64,
    pub restarts: u64,
}

enum Lifecycle {
    Idle,
    Running {
        local_addr: SocketAddr,
        cancel: CancellationToken,
        receiver: JoinHandle<()>,
    },
    Stopped,
}

/// Accrual failure detector.
///
/// Owns the heartbeat socket, the member registry and the ingestion pool.
/// A single receive task reads datagrams and hands each one to the pool
/// without waiting for it to be processed; pool tasks apply the ingestion
/// rules to the registry. Suspicion levels are computed from the registry
/// at query time.
pub struct FailureDetector {
    config: DetectorConfig,
    registry: NodeRegistry,
    pool: Arc<Semaphore>,
    lifecycle: Mutex<Lifecycle>,
}

impl FailureDetector {
    pub fn new(config: DetectorConfig) -> Self {
        let params = PhiParams {
            min_std_deviation_ms: config.min_std_deviation_ms as f64,
            first_heartbeat_estimate_ms: config.first_heartbeat_estimate_ms as f64,
        };
        Self {
            registry: NodeRegistry::new(config.window_size, params),
            pool: Arc::new(Semaphore::new(config.worker_threads.max(1))),
            lifecycle: Mutex::new(Lifecycle::Idle),
            config,
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// Bind the heartbeat socket and spawn the receive loop.
    ///
    /// Returns the bound address. Calling `start` on a running detector
    /// returns the existing address; a detector that was shut down cannot be
    /// started again.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr> {
        let mut lifecycle = self.lifecycle.lock().await;
        match &*lifecycle {
            Lifecycle::Running { local_addr, .. } => return Ok(*local_addr),
            Lifecycle::Stopped => return Err(BspError::DetectorStopped),
            Lifecycle::Idle => {}
        }

        let socket = UdpSocket::bind(self.config.listen_addr).await?;
        let local_addr = socket.local_addr()?;
        let cancel = CancellationToken::new();

        let detector = Arc::clone(self);
        let token = cancel.clone();
        let receiver = tokio::spawn(async move {
            detector.receive_loop(socket, token).await;
        });

        tracing::info!(
            addr = %local_addr,
            window_size = self.config.window_size,
            workers = self.config.worker_threads,
            "Failure detector listening"
        );

        *lifecycle = Lifecycle::Running {
            local_addr,
            cancel,
            receiver,
        };
        Ok(local_addr)
    }

    /// Stop receiving heartbeats and close the socket. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let previous = std::mem::replace(&mut *lifecycle, Lifecycle::Stopped);
        if let Lifecycle::Running {
            cancel, receiver, ..
        } = previous
        {
            cancel.cancel();
            if let Err(e) = receiver.await {
                tracing::warn!(error = %e, "Receive loop ended abnormally");
            }
            tracing::info!("Failure detector stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.lifecycle.lock().await, Lifecycle::Running { .. })
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.lifecycle.lock().await {
            Lifecycle::Running { local_addr, .. } => Some(*local_addr),
            _ => None,
        }
    }

    async fn receive_loop(self: Arc<Self>, socket: UdpSocket, cancel: CancellationToken) {
        // One byte larger than a heartbeat so oversized datagrams are detectable.
        let mut buf = [0u8; 9];
        let mut failures = 0u32;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, src)) => {
                        failures = 0;
                        let at = Instant::now();
                        match decode_heartbeat(&buf[..len]) {
                            Some(sequence) => {
                                tracing::trace!(sequence, src = %src, "Heartbeat received");
                                self.schedule(src.ip().to_string(), sequence, at);
                            }
                            None => {
                                tracing::warn!(src = %src, len, "Malformed heartbeat datagram dropped");
                            }
                        }
                    }
                    Err(e) => {
                        failures = failures.saturating_add(1);
                        let delay = recv_backoff(failures);
                        tracing::warn!(
                            error = %e,
                            failures,
                            delay_ms = delay.as_millis() as u64,
                            "Failed to receive heartbeat"
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }

        drop(socket);
        tracing::debug!("Heartbeat receive loop exited");
    }

    /// Hand a heartbeat to the ingestion pool; never waits for a free worker.
    fn schedule(self: &Arc<Self>, address: String, sequence: u64, at: Instant) {
        let detector = Arc::clone(self);
        let pool = Arc::clone(&self.pool);
        tokio::spawn(async move {
            let Ok(_permit) = pool.acquire_owned().await else {
                return;
            };
            detector.ingest(&address, sequence, at);
        });
    }

    /// Apply one heartbeat to the registry.
    pub fn ingest(&self, address: &str, sequence: u64, at: Instant) -> Ingested {
        let outcome = self.registry.record(address, sequence, at);
        match outcome {
            Ingested::Joined => tracing::info!(address, "Member joined"),
            Ingested::Restarted => tracing::info!(address, "Member restarted, window reset"),
            Ingested::Sampled => tracing::trace!(address, sequence, "Heartbeat sampled"),
            Ingested::Dropped => tracing::warn!(
                address,
                sequence,
                "Heartbeat from unknown member without restart sequence dropped"
            ),
        }
        outcome
    }

    /// Suspicion level of `address` right now.
    pub fn suspicion_level(&self, address: &str) -> Result<f64> {
        self.suspicion_level_at(address, Instant::now())
    }

    /// Suspicion level of `address` as of `now`.
    ///
    /// Fails for an empty address and returns [`UNKNOWN_MEMBER`] for an
    /// address with no record.
    pub fn suspicion_level_at(&self, address: &str, now: Instant) -> Result<f64> {
        if address.trim().is_empty() {
            return Err(BspError::InvalidAddress(address.to_string()));
        }
        Ok(match self.registry.get(address) {
            Some(node) => lock(&node).phi(now),
            None => UNKNOWN_MEMBER,
        })
    }

    /// Addresses of all known members, sorted.
    pub fn members(&self) -> Vec<String> {
        let mut members: Vec<String> = self.registry.snapshot().keys().cloned().collect();
        members.sort();
        members
    }

    /// Live view of every member as of `now`, sorted by address.
    pub fn snapshot_at(&self, now: Instant) -> Vec<MemberSnapshot> {
        let mut members: Vec<MemberSnapshot> = self
            .registry
            .snapshot()
            .values()
            .map(|node| {
                let node = lock(node);
                MemberSnapshot {
                    address: node.address().to_string(),
                    phi: node.phi(now),
                    window_len: node.window_len(),
                    last_sequence: node.last_sequence(),
                    mean_interval_ms: node.mean_ms(),
                    restarts: node.restarts(),
                }
            })
            .collect();
        members.sort_by(|a, b| a.address.cmp(&b.address));
        members
    }

    pub fn snapshot(&self) -> Vec<MemberSnapshot> {
        self.snapshot_at(Instant::now())
    }
}

/// Pause after the `failures`-th consecutive receive error: doubles from
/// 10ms, capped at one second.
fn recv_backoff(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    let ms = RECV_BACKOFF_BASE_MS.saturating_mul(1 << exponent);
    Duration::from_millis(ms.min(RECV_BACKOFF_MAX_MS))
}

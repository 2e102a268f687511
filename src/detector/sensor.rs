use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::config::SensorConfig;

/// Size of a heartbeat datagram: one big-endian `u64` sequence number.
pub const HEARTBEAT_LEN: usize = 8;

pub fn encode_heartbeat(sequence: u64) -> [u8; HEARTBEAT_LEN] {
    sequence.to_be_bytes()
}

/// Decode a heartbeat datagram. Anything that is not exactly eight bytes is malformed.
pub fn decode_heartbeat(payload: &[u8]) -> Option<u64> {
    let bytes: [u8; HEARTBEAT_LEN] = payload.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

/// Member-side heartbeat sender.
///
/// Sends a datagram with an increasing sequence number every interval. The
/// first datagram of a sensor carries sequence 1, which the detector reads
/// as "joined or restarted".
pub struct HeartbeatSensor {
    config: SensorConfig,
    sequence: AtomicU64,
}

impl HeartbeatSensor {
    pub fn new(config: SensorConfig) -> Self {
        Self {
            config,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn target(&self) -> SocketAddr {
        self.config.target
    }

    /// Last sequence number sent, 0 before the first heartbeat.
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Send a single heartbeat on `socket` and return its sequence number.
    pub async fn beat(&self, socket: &UdpSocket) -> std::io::Result<u64> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        socket
            .send_to(&encode_heartbeat(sequence), self.config.target)
            .await?;
        Ok(sequence)
    }

    /// Run the sensor until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) -> std::io::Result<()> {
        let bind: SocketAddr = if self.config.target.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(bind).await?;
        let mut interval = tokio::time::interval(self.config.interval());

        tracing::info!(target_addr = %self.config.target, interval_ms = self.config.interval_ms, "Heartbeat sensor started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    match self.beat(&socket).await {
                        Ok(sequence) => tracing::trace!(sequence, "Heartbeat sent"),
                        Err(e) => tracing::warn!(error = %e, "Failed to send heartbeat"),
                    }
                }
            }
        }

        tracing::info!(sent = self.sequence(), "Heartbeat sensor stopped");
        Ok(())
    }
}

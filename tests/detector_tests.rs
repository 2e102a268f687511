
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use bsp_node::config::{DetectorConfig, SensorConfig};
use bsp_node::detector::sensor::encode_heartbeat;
use bsp_node::detector::{
    FailureDetector, HeartbeatNode, HeartbeatSensor, Ingested, PhiParams, UNKNOWN_MEMBER,
};
use bsp_node::error::BspError;
use test_harness::{assert_eventually, wait_for};

const MEMBER: &str = "10.0.0.7";

fn local_config() -> DetectorConfig {
    DetectorConfig::new("127.0.0.1:0".parse().unwrap())
}

fn secs(base: Instant, s: u64) -> Instant {
    base + Duration::from_secs(s)
}

// =============================================================================
// Window and phi
// =============================================================================

#[test]
fn test_window_keeps_last_w_samples() {
    for w in [1usize, 3, 10] {
        let base = Instant::now();
        let mut node = HeartbeatNode::new(MEMBER, w, PhiParams::default());
        // Intervals of 1, 2, 3, ... ms so every sample is distinct.
        let mut at = base;
        node.add(1, at);
        let n = w + 7;
        for i in 1..=n {
            at += Duration::from_millis(i as u64);
            node.add(i as u64 + 1, at);
        }

        let kept: Vec<f64> = node.intervals().collect();
        let expected: Vec<f64> = ((n - w + 1)..=n).map(|i| i as f64).collect();
        assert_eq!(kept.len(), w);
        for (k, e) in kept.iter().zip(&expected) {
            assert!((k - e).abs() < 1e-6, "window {:?} != {:?}", kept, expected);
        }
    }
}

#[test]
fn test_phi_grows_with_elapsed_time() {
    let base = Instant::now();
    let mut node = HeartbeatNode::new(MEMBER, 100, PhiParams::default());
    for i in 0..10u64 {
        node.add(i + 1, base + Duration::from_millis(i * 1000));
    }
    let last = base + Duration::from_millis(9000);

    let mut previous = node.phi(last + Duration::from_millis(1000));
    for step in 1..50u64 {
        let phi = node.phi(last + Duration::from_millis(1000 + step * 100));
        assert!(phi > previous, "phi must increase: {} <= {}", phi, previous);
        assert!(phi.is_finite());
        previous = phi;
    }
}

#[test]
fn test_window_of_three_scenario() {
    let detector = FailureDetector::new(local_config().with_window_size(3));
    let base = Instant::now();

    for (seq, t) in [(1, 0), (2, 1), (3, 2), (4, 3)] {
        detector.ingest(MEMBER, seq, secs(base, t));
    }

    let early = detector.suspicion_level_at(MEMBER, secs(base, 3)).unwrap();
    let late = detector.suspicion_level_at(MEMBER, secs(base, 10)).unwrap();

    assert!(early < 1.0, "phi right after a heartbeat should be low, got {}", early);
    assert!(late > 8.0, "phi after 7 silent intervals should exceed 8, got {}", late);
    assert!(late > early);
}

#[test]
fn test_restart_matches_fresh_join() {
    let detector = FailureDetector::new(local_config());
    let base = Instant::now();

    for seq in 1..=20u64 {
        detector.ingest(MEMBER, seq, base + Duration::from_millis(seq * 250));
    }
    let restart_at = base + Duration::from_secs(30);
    assert_eq!(detector.ingest(MEMBER, 1, restart_at), Ingested::Restarted);
    assert_eq!(detector.ingest("10.0.0.8", 1, restart_at), Ingested::Joined);

    for elapsed in [0u64, 500, 1500, 4000] {
        let now = restart_at + Duration::from_millis(elapsed);
        let restarted = detector.suspicion_level_at(MEMBER, now).unwrap();
        let fresh = detector.suspicion_level_at("10.0.0.8", now).unwrap();
        assert!(
            (restarted - fresh).abs() < 1e-12,
            "restarted {} != fresh {} at +{}ms",
            restarted,
            fresh,
            elapsed
        );
    }

    let snapshot = detector.snapshot_at(restart_at);
    let member = snapshot.iter().find(|m| m.address == MEMBER).unwrap();
    assert_eq!(member.restarts, 1);
    assert_eq!(member.window_len, 0);
    assert_eq!(member.last_sequence, 1);
}

// =============================================================================
// Queries
// =============================================================================

#[test]
fn test_unknown_member_is_sentinel() {
    let detector = FailureDetector::new(local_config());
    assert_eq!(detector.suspicion_level("10.9.9.9").unwrap(), UNKNOWN_MEMBER);
}

#[test]
fn test_empty_address_is_rejected() {
    let detector = FailureDetector::new(local_config());
    assert!(matches!(
        detector.suspicion_level(""),
        Err(BspError::InvalidAddress(_))
    ));
    assert!(matches!(
        detector.suspicion_level("   "),
        Err(BspError::InvalidAddress(_))
    ));
}

#[test]
fn test_non_restart_from_unknown_member_is_dropped() {
    let detector = FailureDetector::new(local_config());
    assert_eq!(
        detector.ingest(MEMBER, 42, Instant::now()),
        Ingested::Dropped
    );
    assert!(detector.members().is_empty());
    assert_eq!(detector.suspicion_level(MEMBER).unwrap(), UNKNOWN_MEMBER);
}

#[test]
fn test_detectors_do_not_share_window_size() {
    let small = FailureDetector::new(local_config().with_window_size(2));
    let large = FailureDetector::new(local_config().with_window_size(50));
    let base = Instant::now();
    for seq in 1..=10u64 {
        small.ingest(MEMBER, seq, base + Duration::from_millis(seq * 10));
        large.ingest(MEMBER, seq, base + Duration::from_millis(seq * 10));
    }
    assert_eq!(small.snapshot_at(base)[0].window_len, 2);
    assert_eq!(large.snapshot_at(base)[0].window_len, 9);
}

#[test]
fn test_members_are_sorted() {
    let detector = FailureDetector::new(local_config());
    let now = Instant::now();
    for address in ["10.0.0.3", "10.0.0.1", "10.0.0.2"] {
        detector.ingest(address, 1, now);
    }
    assert_eq!(detector.members(), vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
}

// =============================================================================
// Network
// =============================================================================

async fn send(socket: &UdpSocket, target: SocketAddr, payload: &[u8]) {
    socket.send_to(payload, target).await.unwrap();
}

#[tokio::test]
async fn test_heartbeats_over_udp() {
    let detector = Arc::new(FailureDetector::new(local_config()));
    let addr = detector.start().await.unwrap();

    let sensor = HeartbeatSensor::new(SensorConfig::new(addr));
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    for _ in 0..3 {
        sensor.beat(&socket).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(sensor.sequence(), 3);

    let d = detector.clone();
    assert_eventually(
        || {
            let d = d.clone();
            async move {
                d.snapshot()
                    .iter()
                    .any(|m| m.address == "127.0.0.1" && m.last_sequence == 3)
            }
        },
        Duration::from_secs(2),
        "detector should ingest all three heartbeats",
    )
    .await;

    let phi = detector.suspicion_level("127.0.0.1").unwrap();
    assert!(phi >= 0.0 && phi < 8.0, "fresh member should be healthy, got {}", phi);

    detector.shutdown().await;
}

#[tokio::test]
async fn test_malformed_and_unknown_datagrams_create_no_member() {
    let detector = Arc::new(FailureDetector::new(local_config()));
    let addr = detector.start().await.unwrap();
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    send(&socket, addr, &[1, 2, 3]).await;
    send(&socket, addr, &[0; 12]).await;
    send(&socket, addr, &encode_heartbeat(9)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(detector.members().is_empty());

    // The receive loop survives bad input.
    send(&socket, addr, &encode_heartbeat(1)).await;
    let d = detector.clone();
    let joined = wait_for(
        || {
            let d = d.clone();
            async move { !d.members().is_empty() }
        },
        Duration::from_secs(2),
        Duration::from_millis(10),
    )
    .await;
    assert!(joined, "restart sequence should create a member");

    detector.shutdown().await;
}

#[tokio::test]
async fn test_sensor_run_stops_on_cancel() {
    let detector = Arc::new(FailureDetector::new(local_config()));
    let addr = detector.start().await.unwrap();

    let sensor = Arc::new(HeartbeatSensor::new(SensorConfig {
        target: addr,
        interval_ms: 10,
    }));
    let token = CancellationToken::new();
    let handle = {
        let sensor = sensor.clone();
        let token = token.clone();
        tokio::spawn(async move { sensor.run(token).await })
    };

    let s = sensor.clone();
    assert_eventually(
        || {
            let s = s.clone();
            async move { s.sequence() >= 5 }
        },
        Duration::from_secs(2),
        "sensor should keep sending",
    )
    .await;

    token.cancel();
    handle.await.unwrap().unwrap();
    detector.shutdown().await;
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_start_and_shutdown_are_idempotent() {
    let detector = Arc::new(FailureDetector::new(local_config()));
    assert!(!detector.is_running().await);

    let first = detector.start().await.unwrap();
    let second = detector.start().await.unwrap();
    assert_eq!(first, second);
    assert!(detector.is_running().await);
    assert_eq!(detector.local_addr().await, Some(first));

    detector.shutdown().await;
    detector.shutdown().await;
    assert!(!detector.is_running().await);
    assert_eq!(detector.local_addr().await, None);

    assert!(matches!(
        detector.start().await,
        Err(BspError::DetectorStopped)
    ));
}

#[tokio::test]
async fn test_shutdown_before_start() {
    let detector = Arc::new(FailureDetector::new(local_config()));
    detector.shutdown().await;
    assert!(!detector.is_running().await);
}

#[tokio::test]
async fn test_queries_still_work_after_shutdown() {
    let detector = Arc::new(FailureDetector::new(local_config()));
    detector.start().await.unwrap();
    detector.ingest(MEMBER, 1, Instant::now());
    detector.shutdown().await;

    assert!(detector.suspicion_level(MEMBER).unwrap() >= 0.0);
}

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use bsp_node::config::DetectorConfig;
use bsp_node::dashboard::{router, DashboardState};
use bsp_node::detector::FailureDetector;

/// Helper to create a detector and the dashboard routes over it
fn create_test_app() -> (Arc<FailureDetector>, Router) {
    let detector = Arc::new(FailureDetector::new(DetectorConfig::new(
        "127.0.0.1:0".parse().unwrap(),
    )));
    let app = router(DashboardState::new(detector.clone(), 8.0));
    (detector, app)
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_list_members_empty() {
    let (_detector, app) = create_test_app();

    let (status, json) = get_json(app, "/api/members").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["threshold"], 8.0);
    assert!(json["members"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_list_members_flags_suspected() {
    let (detector, app) = create_test_app();
    let now = Instant::now();
    // A member silent for two seconds after 10ms heartbeats.
    let old = now - Duration::from_secs(2);
    for seq in 1..=10u64 {
        detector.ingest("10.0.0.1", seq, old + Duration::from_millis(seq * 10));
    }
    detector.ingest("10.0.0.2", 1, now);

    let (status, json) = get_json(app, "/api/members").await;

    assert_eq!(status, StatusCode::OK);
    let members = json["members"].as_array().unwrap();
    assert_eq!(members.len(), 2);
    assert_eq!(members[0]["address"], "10.0.0.1");
    assert_eq!(members[0]["suspected"], true);
    assert_eq!(members[0]["window_len"], 9);
    assert_eq!(members[0]["last_sequence"], 10);
    assert_eq!(members[1]["address"], "10.0.0.2");
    assert_eq!(members[1]["suspected"], false);
}

#[tokio::test]
async fn test_member_lookup() {
    let (detector, app) = create_test_app();
    detector.ingest("10.0.0.1", 1, Instant::now());

    let (status, json) = get_json(app, "/api/members/10.0.0.1").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["address"], "10.0.0.1");
    assert_eq!(json["known"], true);
    assert!(json["phi"].as_f64().unwrap() >= 0.0);
}

#[tokio::test]
async fn test_unknown_member_is_not_found() {
    let (_detector, app) = create_test_app();

    let (status, json) = get_json(app, "/api/members/10.9.9.9").await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["phi"], -1.0);
    assert_eq!(json["known"], false);
}

#[tokio::test]
async fn test_blank_address_is_bad_request() {
    let (_detector, app) = create_test_app();

    let (status, json) = get_json(app, "/api/members/%20").await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("Invalid address"));
}

#[tokio::test]
async fn test_unknown_route() {
    let (_detector, app) = create_test_app();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/nonexistent")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::detector::{FailureDetector, UNKNOWN_MEMBER};
use crate::error::BspError;

#[derive(Clone)]
pub struct DashboardState {
    pub detector: Arc<FailureDetector>,
    /// phi above which a member is reported as suspected
    pub threshold: f64,
}

impl DashboardState {
    pub fn new(detector: Arc<FailureDetector>, threshold: f64) -> Self {
        Self {
            detector,
            threshold,
        }
    }
}

#[derive(Serialize)]
struct MemberResponse {
    address: String,
    phi: f64,
    suspected: bool,
    window_len: usize,
    last_sequence: u64,
    mean_interval_ms: f64,
    restarts: u64,
}

#[derive(Serialize)]
struct MembersResponse {
    threshold: f64,
    members: Vec<MemberResponse>,
}

#[derive(Serialize)]
struct SuspicionResponse {
    address: String,
    phi: f64,
    known: bool,
    suspected: bool,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Routes served by the dashboard.
pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/members", get(list_members_handler))
        .route("/api/members/:address", get(member_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState, shutdown: CancellationToken) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn list_members_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let members = state
        .detector
        .snapshot()
        .into_iter()
        .map(|m| MemberResponse {
            suspected: m.phi > state.threshold,
            address: m.address,
            phi: m.phi,
            window_len: m.window_len,
            last_sequence: m.last_sequence,
            mean_interval_ms: m.mean_interval_ms,
            restarts: m.restarts,
        })
        .collect();

    Json(MembersResponse {
        threshold: state.threshold,
        members,
    })
}

async fn member_handler(
    State(state): State<DashboardState>,
    Path(address): Path<String>,
) -> axum::response::Response {
    match state.detector.suspicion_level(&address) {
        Ok(phi) if phi == UNKNOWN_MEMBER => (
            StatusCode::NOT_FOUND,
            Json(SuspicionResponse {
                address,
                phi,
                known: false,
                suspected: false,
            }),
        )
            .into_response(),
        Ok(phi) => Json(SuspicionResponse {
            address,
            phi,
            known: true,
            suspected: phi > state.threshold,
        })
        .into_response(),
        Err(e @ BspError::InvalidAddress(_)) => (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

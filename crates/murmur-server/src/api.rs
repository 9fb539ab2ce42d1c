use std::net::SocketAddr;

use axum::{
    extract::State,
    http::Method,
    routing::{get, post},
    Json, Router,
};
use murmur_shared::{HeartbeatRequest, HeartbeatResponse};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::admission::AdmissionTable;
use crate::error::ServerError;

#[derive(Clone)]
pub struct AppState {
    pub admission: AdmissionTable,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/heartbeat", post(heartbeat))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    leases: usize,
    max_active: usize,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        leases: state.admission.lease_count().await,
        max_active: state.admission.max_active(),
    })
}

async fn heartbeat(
    State(state): State<AppState>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>, ServerError> {
    if req.user_id.trim().is_empty() {
        return Err(ServerError::BadRequest("userId must not be empty".into()));
    }
    let resp = state
        .admission
        .heartbeat_at(&req, murmur_shared::now_millis())
        .await;
    Ok(Json(resp))
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve_on(listener, state).await
}

/// Serve on an already bound listener (port 0 in tests).
pub async fn serve_on(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    let app = build_router(state);
    info!(addr = %listener.local_addr()?, "Starting admission API server");
    axum::serve(listener, app).await?;
    Ok(())
}

//! Management HTTP surface: read-only JSON views plus one write
//! operation, the immediate route re-advertisement.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};

use trellis_core::agent::{HealthView, PeerView, RouteView};
use trellis_core::Agent;

pub async fn serve(agent: Arc<Agent>, addr: SocketAddr) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/healthz", get(health))
        .route("/v1/peers", get(peers))
        .route("/v1/routes", get(routes))
        .route("/v1/advertise", post(advertise))
        .with_state(agent);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "management surface listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health(State(agent): State<Arc<Agent>>) -> Json<HealthView> {
    Json(agent.health_view())
}

async fn peers(State(agent): State<Arc<Agent>>) -> Json<Vec<PeerView>> {
    Json(agent.peers_view())
}

async fn routes(State(agent): State<Arc<Agent>>) -> Json<Vec<RouteView>> {
    Json(agent.routes_view())
}

async fn advertise(State(agent): State<Arc<Agent>>) -> StatusCode {
    agent.trigger_advertise().await;
    StatusCode::ACCEPTED
}

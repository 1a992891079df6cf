//! /status, /peers, /topics, /daemon/shutdown handlers.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use capsule_services::{ConnectionState, NodeStatus, TopicInfo};

use super::ApiState;

// ── /status ──────────────────────────────────────────────────────────────────

pub async fn handle_status(State(state): State<ApiState>) -> Json<NodeStatus> {
    Json(state.node.status().await)
}

// ── /peers ────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct PeersResponse {
    pub peers: Vec<PeerInfo>,
}

#[derive(Serialize)]
pub struct PeerInfo {
    pub peer_id: String,
    pub addrs: Vec<String>,
    pub state: ConnectionState,
    pub last_seen_secs: u64,
}

pub async fn handle_peers(State(state): State<ApiState>) -> Json<PeersResponse> {
    let mut peers: Vec<PeerInfo> = state
        .node
        .directory()
        .snapshot()
        .into_iter()
        .map(|p| PeerInfo {
            peer_id: p.id.to_hex(),
            addrs: p.addrs.iter().map(|a| a.to_string()).collect(),
            state: p.state,
            last_seen_secs: p.last_seen.elapsed().as_secs(),
        })
        .collect();
    peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
    Json(PeersResponse { peers })
}

// ── /topics ───────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct TopicsResponse {
    pub topics: Vec<TopicInfo>,
}

pub async fn handle_topics(
    State(state): State<ApiState>,
) -> Result<Json<TopicsResponse>, (StatusCode, String)> {
    let mut topics = state
        .node
        .bus()
        .topics()
        .await
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;
    topics.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(Json(TopicsResponse { topics }))
}

// ── /daemon/shutdown ──────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ShutdownResponse {
    pub status: String,
}

pub async fn handle_shutdown(State(state): State<ApiState>) -> Json<ShutdownResponse> {
    tracing::info!("shutdown requested via API");
    let _ = state.shutdown_tx.send(());
    Json(ShutdownResponse {
        status: "shutting_down".to_string(),
    })
}

//! /capsules handlers: publish and fetch content.

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use capsule_core::ContentAnnouncement;
use capsule_services::{NodeError, PublishedCapsule, StorageError};

use super::{parse_digest, ApiState};

#[derive(Deserialize)]
pub struct PublishParams {
    pub token: Option<String>,
}

// ── POST /capsules ────────────────────────────────────────────────────────────

pub async fn handle_publish(
    State(state): State<ApiState>,
    Query(params): Query<PublishParams>,
    body: Bytes,
) -> Result<Json<ContentAnnouncement>, (StatusCode, String)> {
    let token = params.token.unwrap_or_else(|| "anonymous".to_string());
    let announcement = state
        .node
        .share(body, &token)
        .await
        .map_err(|e| match e {
            NodeError::Storage(StorageError::Capsule(_)) => (StatusCode::BAD_REQUEST, e.to_string()),
            _ => (StatusCode::BAD_GATEWAY, e.to_string()),
        })?;
    tracing::info!(
        digest = %announcement.digest.short(),
        token = %announcement.token_id,
        bytes = announcement.size,
        deduplicated = announcement.deduplicated,
        "capsule published via API"
    );
    Ok(Json(announcement))
}

// ── GET /capsules ─────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct CapsuleListResponse {
    pub capsules: Vec<PublishedCapsule>,
}

pub async fn handle_capsule_list(State(state): State<ApiState>) -> Json<CapsuleListResponse> {
    let mut capsules = state.node.store().published();
    capsules.sort_by(|a, b| a.token_id.cmp(&b.token_id));
    Json(CapsuleListResponse { capsules })
}

// ── GET /capsules/{digest} ────────────────────────────────────────────────────

pub async fn handle_fetch(
    State(state): State<ApiState>,
    Path(digest): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let digest = parse_digest(&digest)?;
    match state.node.fetch(&digest).await {
        Ok(payload) => Ok((
            [(header::CONTENT_TYPE, "application/octet-stream")],
            payload,
        )),
        Err(NodeError::Storage(StorageError::NotFound(_))) => {
            Err((StatusCode::NOT_FOUND, format!("no content under {digest}")))
        }
        Err(e) => Err((StatusCode::BAD_GATEWAY, e.to_string())),
    }
}

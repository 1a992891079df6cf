//! HTTP API handlers: exposes node state as JSON.

pub mod capsules;
pub mod status;

use axum::http::StatusCode;

use capsule_core::Digest;
use capsule_services::Node;

#[derive(Clone)]
pub struct ApiState {
    pub node: Node,
    /// Signals graceful daemon shutdown.
    pub shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

/// Parse a hex-encoded content digest.
fn parse_digest(hex_str: &str) -> Result<Digest, (StatusCode, String)> {
    hex_str.parse::<Digest>().map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            "digest must be 64 hex characters".to_string(),
        )
    })
}

pub use capsules::{handle_capsule_list, handle_fetch, handle_publish};
pub use status::{handle_peers, handle_shutdown, handle_status, handle_topics};

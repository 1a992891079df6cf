//! Capsule wire formats.
//!
//! Three kinds of bytes leave a node:
//!   - `LocalAnnouncement`: fixed-size multicast datagram for local-segment discovery
//!   - `SignalMessage`: JSON envelope exchanged over a signaling relay
//!   - length-prefixed frames on secured streams (see `FRAME_HEADER_LEN`)
//!
//! The announcement is #[repr(C, packed)] with zerocopy derives, so it is
//! serialized without allocation and parsed without unsafe code.

use serde::{Deserialize, Serialize};
use static_assertions::assert_eq_size;
use thiserror::Error;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::crypto::{Digest, PeerId};

// ── Local-segment announcement ───────────────────────────────────────────────

/// Link-local all-nodes multicast group.
pub const MULTICAST_ADDR: &str = "ff02::1";

/// Datagram magic. Anything else on the announce port is ignored.
pub const ANNOUNCE_MAGIC: [u8; 4] = *b"CAPS";

/// Current wire version for announcements.
pub const WIRE_VERSION: u16 = 1;

/// Sent to `MULTICAST_ADDR` so nodes on the same link find each other.
///
/// Wire size: 40 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct LocalAnnouncement {
    /// Always `ANNOUNCE_MAGIC`.
    pub magic: [u8; 4],
    /// Static public key of the announcing node (its PeerId).
    pub public_key: [u8; 32],
    /// TCP port accepting secured streams.
    pub listen_port: u16,
    pub version: u16,
}

assert_eq_size!(LocalAnnouncement, [u8; 40]);

impl LocalAnnouncement {
    pub fn new(peer: PeerId, listen_port: u16) -> Self {
        Self {
            magic: ANNOUNCE_MAGIC,
            public_key: peer.0,
            listen_port,
            version: WIRE_VERSION,
        }
    }

    /// Parse a received datagram. Rejects foreign magic and unknown versions.
    pub fn parse(datagram: &[u8]) -> Result<Self, WireError> {
        let ann = Self::read_from_prefix(datagram).ok_or(WireError::Truncated(datagram.len()))?;
        if ann.magic != ANNOUNCE_MAGIC {
            return Err(WireError::BadMagic);
        }
        let version = ann.version;
        if version != WIRE_VERSION {
            return Err(WireError::UnknownVersion(version));
        }
        Ok(ann)
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId(self.public_key)
    }
}

// ── Signaling relay envelope ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

/// `{type: offer|answer|candidate, sessionId, payload}` as exchanged over the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub payload: String,
}

impl SignalMessage {
    pub fn new(kind: SignalKind, session_id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            kind,
            session_id: session_id.into(),
            payload: payload.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        serde_json::to_vec(self).map_err(WireError::Json)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        serde_json::from_slice(bytes).map_err(WireError::Json)
    }
}

// ── Content announcement ─────────────────────────────────────────────────────

/// Gossiped after a capsule is published so subscribers learn about new
/// content without a direct connection to the origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentAnnouncement {
    pub digest: Digest,
    pub token_id: String,
    pub size: u64,
    pub origin: PeerId,
    /// True when the payload was already present in the lookup capability.
    pub deduplicated: bool,
}

impl ContentAnnouncement {
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        serde_json::to_vec(self).map_err(WireError::Json)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        serde_json::from_slice(bytes).map_err(WireError::Json)
    }
}

// ── Stream framing ───────────────────────────────────────────────────────────

/// Every frame on a stream is preceded by a u16 big-endian length.
pub const FRAME_HEADER_LEN: usize = 2;

/// Largest frame body.
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// Protocol id for capsule fetches between peers.
pub const FILESHARING_PROTOCOL: &str = "/capsule/filesharing/1.0.0";

/// Prefix `body` with its u16 big-endian length.
pub fn encode_frame(body: &[u8]) -> Result<Vec<u8>, WireError> {
    let len = u16::try_from(body.len()).map_err(|_| WireError::FrameTooLong(body.len()))?;
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(body);
    Ok(out)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum WireError {
    #[error("datagram too short ({0} bytes)")]
    Truncated(usize),
    #[error("not a capsule announcement")]
    BadMagic,
    #[error("unknown wire version {0}")]
    UnknownVersion(u16),
    #[error("frame of {0} bytes exceeds the u16 length prefix")]
    FrameTooLong(usize),
    #[error("malformed JSON: {0}")]
    Json(serde_json::Error),
}

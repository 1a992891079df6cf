//! Data capsules: a payload bundled with its token id, digest, and an
//! optional ordered segment breakdown.
//!
//! Segmentation is pluggable. Every `Segmenter` must satisfy one rule:
//! concatenating its segments in order reproduces the payload exactly.

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use crate::crypto::Digest;

/// Chunk size used by `capsulize` when splitting.
pub const DEFAULT_CHUNK_SIZE: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataCapsule {
    pub token_id: String,
    pub payload: Bytes,
    pub hash: Digest,
    /// Ordered segments. `None` when built without splitting.
    pub segments: Option<Vec<Bytes>>,
}

impl DataCapsule {
    /// Concatenate the segments back into one buffer.
    pub fn reassemble(&self) -> Option<Bytes> {
        let segments = self.segments.as_ref()?;
        let mut buf = BytesMut::with_capacity(self.payload.len());
        for seg in segments {
            buf.extend_from_slice(seg);
        }
        Some(buf.freeze())
    }

    /// Hash matches the payload and segments (if any) reassemble to it.
    pub fn verify(&self) -> bool {
        if Digest::of(&self.payload) != self.hash {
            return false;
        }
        match self.reassemble() {
            Some(joined) => joined == self.payload,
            None => true,
        }
    }
}

/// Split `payload` into `chunk_size`-byte chunks; the last holds the remainder.
///
/// An empty payload yields no chunks.
pub fn split(payload: &Bytes, chunk_size: usize) -> Result<Vec<Bytes>, CapsuleError> {
    if chunk_size == 0 {
        return Err(CapsuleError::ChunkSizeZero);
    }
    let mut chunks = Vec::with_capacity(payload.len().div_ceil(chunk_size));
    let mut offset = 0;
    while offset < payload.len() {
        let end = (offset + chunk_size).min(payload.len());
        chunks.push(payload.slice(offset..end));
        offset = end;
    }
    Ok(chunks)
}

/// Build a capsule, splitting into `DEFAULT_CHUNK_SIZE` segments when `with_split`.
pub fn capsulize(
    payload: impl Into<Bytes>,
    token_id: impl Into<String>,
    with_split: bool,
) -> DataCapsule {
    let payload = payload.into();
    let segments = if with_split {
        // DEFAULT_CHUNK_SIZE is non-zero, split cannot fail
        split(&payload, DEFAULT_CHUNK_SIZE).ok()
    } else {
        None
    };
    DataCapsule {
        token_id: token_id.into(),
        hash: Digest::of(&payload),
        payload,
        segments,
    }
}

/// Build a capsule whose segments come from `segmenter`.
pub fn capsulize_with(
    payload: impl Into<Bytes>,
    token_id: impl Into<String>,
    segmenter: &dyn Segmenter,
) -> Result<DataCapsule, CapsuleError> {
    let payload = payload.into();
    let segments = segmenter.segment(&payload)?;
    Ok(DataCapsule {
        token_id: token_id.into(),
        hash: Digest::of(&payload),
        payload,
        segments: Some(segments),
    })
}

// ── Segmenters ────────────────────────────────────────────────────────────────

/// A content segmentation strategy.
pub trait Segmenter: Send + Sync {
    fn segment(&self, payload: &Bytes) -> Result<Vec<Bytes>, CapsuleError>;
}

/// Fixed-size chunks.
#[derive(Debug, Clone, Copy)]
pub struct FixedSize(pub usize);

impl Segmenter for FixedSize {
    fn segment(&self, payload: &Bytes) -> Result<Vec<Bytes>, CapsuleError> {
        split(payload, self.0)
    }
}

/// Word segments for text. Each segment keeps its trailing space so that
/// plain concatenation restores the original.
#[derive(Debug, Clone, Copy, Default)]
pub struct Whitespace;

impl Segmenter for Whitespace {
    fn segment(&self, payload: &Bytes) -> Result<Vec<Bytes>, CapsuleError> {
        let mut segments = Vec::new();
        let mut start = 0;
        for (i, b) in payload.iter().enumerate() {
            if *b == b' ' {
                segments.push(payload.slice(start..=i));
                start = i + 1;
            }
        }
        if start < payload.len() {
            segments.push(payload.slice(start..));
        }
        Ok(segments)
    }
}

/// Coarse content classification by payload prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Text,
    Image,
    Audio,
    Unknown,
}

impl ContentKind {
    pub fn detect(payload: &[u8]) -> Self {
        if payload.starts_with(b"text:") {
            Self::Text
        } else if payload.starts_with(b"image:") {
            Self::Image
        } else if payload.starts_with(b"audio:") {
            Self::Audio
        } else {
            Self::Unknown
        }
    }

    /// Segmenter for this kind. Media kinds fall back to fixed-size chunks;
    /// recognition-based splitting is a pluggable concern.
    pub fn segmenter(self, chunk_size: usize) -> Box<dyn Segmenter> {
        match self {
            Self::Text => Box::new(Whitespace),
            _ => Box::new(FixedSize(chunk_size)),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CapsuleError {
    #[error("chunk size must be at least 1")]
    ChunkSizeZero,
}

//! Content capsule store: hash, check existence, store-if-absent.
//!
//! The lookup capability holds the durable copy, keyed by the payload's hex
//! digest. Because the key is derived from the value, two nodes publishing
//! the same payload concurrently cannot disagree: whichever put lands first
//! wins and the stored value is identical either way.
//!
//! The store never retries. Lookup failures surface as `StorageError` and the
//! caller decides what to do.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;

use capsule_core::capsule::{self, CapsuleError, FixedSize};
use capsule_core::{ContentKind, DataCapsule, Digest};
use tokio::sync::broadcast;

use crate::lookup::{LookupCapability, LookupError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishOutcome {
    Stored,
    AlreadyPresent,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("capsule hash {recorded} does not match payload digest {actual}")]
    DigestMismatch { recorded: Digest, actual: Digest },
    #[error("no content stored under {0}")]
    NotFound(Digest),
    #[error("value stored under {0} does not hash to its key")]
    Corrupt(Digest),
    #[error("lookup capability failed: {0}")]
    Lookup(#[from] LookupError),
    #[error(transparent)]
    Capsule(#[from] CapsuleError),
}

/// Local index entry for a capsule this node published.
#[derive(Debug, Clone, Serialize)]
pub struct PublishedCapsule {
    pub digest: Digest,
    pub token_id: String,
    pub size: u64,
    pub outcome: PublishOutcome,
    #[serde(skip)]
    pub published_at: Instant,
}

#[derive(Clone)]
pub struct ContentCapsuleStore {
    lookup: Arc<dyn LookupCapability>,
    chunk_size: usize,
    published: Arc<DashMap<Digest, PublishedCapsule>>,
}

impl ContentCapsuleStore {
    pub fn new(lookup: Arc<dyn LookupCapability>, chunk_size: usize) -> Self {
        Self {
            lookup,
            chunk_size,
            published: Arc::new(DashMap::new()),
        }
    }

    /// Content digest of a payload.
    pub fn hash(payload: &[u8]) -> Digest {
        Digest::of(payload)
    }

    /// Build a capsule using this store's chunk size.
    pub fn capsulize(
        &self,
        payload: impl Into<Bytes>,
        token_id: impl Into<String>,
        with_split: bool,
    ) -> Result<DataCapsule, StorageError> {
        let payload = payload.into();
        if with_split {
            Ok(capsule::capsulize_with(
                payload,
                token_id,
                &FixedSize(self.chunk_size),
            )?)
        } else {
            Ok(capsule::capsulize(payload, token_id, false))
        }
    }

    /// Build a segmented capsule, picking the segmenter from the payload's
    /// content kind.
    pub fn capsulize_detected(
        &self,
        payload: impl Into<Bytes>,
        token_id: impl Into<String>,
    ) -> Result<DataCapsule, StorageError> {
        let payload = payload.into();
        let segmenter = ContentKind::detect(&payload).segmenter(self.chunk_size);
        Ok(capsule::capsulize_with(payload, token_id, segmenter.as_ref())?)
    }

    /// Store the capsule's payload unless an entry already exists under its digest.
    pub async fn publish(&self, capsule: &DataCapsule) -> Result<PublishOutcome, StorageError> {
        let actual = Digest::of(&capsule.payload);
        if actual != capsule.hash {
            return Err(StorageError::DigestMismatch {
                recorded: capsule.hash,
                actual,
            });
        }
        let key = actual.to_hex();

        let outcome = match self.lookup.get(&key).await? {
            Some(_) => PublishOutcome::AlreadyPresent,
            None => {
                self.lookup.put(&key, capsule.payload.clone()).await?;
                PublishOutcome::Stored
            }
        };

        tracing::debug!(
            digest = %actual.short(),
            token = %capsule.token_id,
            bytes = capsule.payload.len(),
            ?outcome,
            "capsule published"
        );

        self.published.insert(
            actual,
            PublishedCapsule {
                digest: actual,
                token_id: capsule.token_id.clone(),
                size: capsule.payload.len() as u64,
                outcome,
                published_at: Instant::now(),
            },
        );
        Ok(outcome)
    }

    /// Fetch a payload by digest, verifying it against the digest.
    pub async fn fetch(&self, digest: &Digest) -> Result<Bytes, StorageError> {
        let value = self
            .lookup
            .get(&digest.to_hex())
            .await?
            .ok_or(StorageError::NotFound(*digest))?;
        if Digest::of(&value) != *digest {
            tracing::warn!(digest = %digest.short(), "lookup returned a value that does not match its key");
            return Err(StorageError::Corrupt(*digest));
        }
        Ok(value)
    }

    pub fn published(&self) -> Vec<PublishedCapsule> {
        self.published.iter().map(|e| e.value().clone()).collect()
    }

    pub fn is_published(&self, digest: &Digest) -> bool {
        self.published.contains_key(digest)
    }

    /// Drop a capsule from the local index. The durable copy is untouched.
    pub fn evict(&self, digest: &Digest) -> bool {
        self.published.remove(digest).is_some()
    }

    /// Drop local index entries older than `retention`. Returns how many.
    pub fn expire(&self, retention: Duration) -> usize {
        let before = self.published.len();
        self.published
            .retain(|_, c| c.published_at.elapsed() < retention);
        before.saturating_sub(self.published.len())
    }
}

/// Expire local index entries past `retention` until shutdown.
pub async fn retention_loop(
    store: ContentCapsuleStore,
    retention: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let period = retention.clamp(Duration::from_millis(100), Duration::from_secs(60));
    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = interval.tick() => {
                let removed = store.expire(retention);
                if removed > 0 {
                    tracing::debug!(removed, "expired local capsule index entries");
                }
            }
        }
    }
}

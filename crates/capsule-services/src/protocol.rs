//! Stream protocols multiplexed over secured channels.
//!
//! The first message on a fresh channel names the protocol. The router hands
//! the rest of the channel to the handler registered for that id.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use capsule_core::wire::FILESHARING_PROTOCOL;
use capsule_core::{Digest, PeerId};

use crate::secure::{SecuredChannel, SecurityError};
use crate::store::{ContentCapsuleStore, StorageError};

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("no handler for protocol {0:?}")]
    UnknownProtocol(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("stream closed before a reply")]
    Closed,
    #[error("reply does not match requested digest {0}")]
    Corrupt(Digest),
    #[error(transparent)]
    Security(#[from] SecurityError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Serves one protocol on inbound channels.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    fn protocol(&self) -> &str;

    async fn handle(&self, channel: SecuredChannel) -> Result<(), ProtocolError>;
}

/// Maps protocol ids to handlers.
#[derive(Default)]
pub struct ProtocolRouter {
    handlers: HashMap<String, Arc<dyn StreamHandler>>,
}

impl ProtocolRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its own protocol id. Replaces any previous one.
    pub fn register(&mut self, handler: Arc<dyn StreamHandler>) {
        self.handlers.insert(handler.protocol().to_string(), handler);
    }

    pub fn protocols(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.handlers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Read the protocol id and run its handler to completion.
    pub async fn serve(&self, mut channel: SecuredChannel) -> Result<(), ProtocolError> {
        let Some(first) = channel.recv().await? else {
            return Ok(());
        };
        let id = String::from_utf8_lossy(&first).into_owned();
        let Some(handler) = self.handlers.get(&id) else {
            tracing::warn!(peer = %channel.remote(), protocol = %id, "unknown protocol, dropping stream");
            return Err(ProtocolError::UnknownProtocol(id));
        };
        tracing::debug!(peer = %channel.remote(), protocol = %id, "stream opened");
        handler.handle(channel).await
    }
}

/// Name the protocol on an outbound channel.
pub async fn open_stream(channel: &mut SecuredChannel, protocol: &str) -> Result<(), ProtocolError> {
    channel.send(protocol.as_bytes()).await?;
    Ok(())
}

/// Serves capsule payloads by digest.
///
/// Request: the hex digest. Reply: the payload, or an empty message when the
/// content is not available.
pub struct FileSharingHandler {
    store: ContentCapsuleStore,
}

impl FileSharingHandler {
    pub fn new(store: ContentCapsuleStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StreamHandler for FileSharingHandler {
    fn protocol(&self) -> &str {
        FILESHARING_PROTOCOL
    }

    async fn handle(&self, mut channel: SecuredChannel) -> Result<(), ProtocolError> {
        let remote: PeerId = channel.remote();
        while let Some(request) = channel.recv().await? {
            let digest = std::str::from_utf8(&request)
                .ok()
                .and_then(|s| s.trim().parse::<Digest>().ok());
            let Some(digest) = digest else {
                tracing::debug!(peer = %remote, "malformed fetch request");
                channel.send(&[]).await?;
                continue;
            };

            let reply = match self.store.fetch(&digest).await {
                Ok(payload) => payload,
                Err(StorageError::NotFound(_)) => Bytes::new(),
                Err(e) => {
                    tracing::warn!(peer = %remote, digest = %digest.short(), error = %e, "fetch for peer failed");
                    Bytes::new()
                }
            };
            tracing::trace!(peer = %remote, digest = %digest.short(), bytes = reply.len(), "served fetch");
            channel.send(&reply).await?;
        }
        Ok(())
    }
}

/// Ask a peer for `digest` over a channel already opened on the filesharing
/// protocol. `Ok(None)` means the peer does not have it.
pub async fn request_capsule(
    channel: &mut SecuredChannel,
    digest: &Digest,
) -> Result<Option<Bytes>, ProtocolError> {
    channel.send(digest.to_hex().as_bytes()).await?;
    let reply = channel.recv().await?.ok_or(ProtocolError::Closed)?;
    if reply.is_empty() && *digest != Digest::of(&[]) {
        return Ok(None);
    }
    if Digest::of(&reply) != *digest {
        return Err(ProtocolError::Corrupt(*digest));
    }
    Ok(Some(reply))
}

//! One overlay node: the components wired together.
//!
//! Sharing data always goes through the content store first and is then
//! announced on the content topic, so subscribers learn about new content
//! without a direct connection to whoever published it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use serde::Serialize;
use thiserror::Error;

use capsule_core::wire::WireError;
use capsule_core::{ContentAnnouncement, Digest, PeerId};

use crate::discovery::DiscoveryEngine;
use crate::gossip::{GossipBus, GossipError};
use crate::peer::{ConnectionState, PeerDirectory};
use crate::signaling::{
    PeerChannelFactory, SessionDriver, SessionState, SessionTable, SignalingError,
    SignalingRelay, SignalingSession,
};
use crate::store::{ContentCapsuleStore, PublishOutcome, StorageError};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Gossip(#[from] GossipError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error("signaling is not configured on this node")]
    NoSignaling,
}

/// Everything a node needs to negotiate direct channels.
pub struct SignalingSetup {
    pub relay: Arc<dyn SignalingRelay>,
    pub channels: Arc<dyn PeerChannelFactory>,
    pub answer_timeout: Duration,
    pub sessions: SessionTable,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub peer_id: PeerId,
    pub peers: BTreeMap<String, usize>,
    pub topics: usize,
    pub capsules: usize,
}

struct NodeInner {
    local: PeerId,
    store: ContentCapsuleStore,
    bus: GossipBus,
    discovery: DiscoveryEngine,
    content_topic: String,
    signaling: Option<SignalingSetup>,
}

#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    pub fn new(
        store: ContentCapsuleStore,
        bus: GossipBus,
        discovery: DiscoveryEngine,
        content_topic: impl Into<String>,
    ) -> Self {
        Self::build(store, bus, discovery, content_topic.into(), None)
    }

    pub fn with_signaling(
        store: ContentCapsuleStore,
        bus: GossipBus,
        discovery: DiscoveryEngine,
        content_topic: impl Into<String>,
        signaling: SignalingSetup,
    ) -> Self {
        Self::build(store, bus, discovery, content_topic.into(), Some(signaling))
    }

    fn build(
        store: ContentCapsuleStore,
        bus: GossipBus,
        discovery: DiscoveryEngine,
        content_topic: String,
        signaling: Option<SignalingSetup>,
    ) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                local: discovery.local_id(),
                store,
                bus,
                discovery,
                content_topic,
                signaling,
            }),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.inner.local
    }

    pub fn directory(&self) -> &PeerDirectory {
        self.inner.discovery.directory()
    }

    pub fn store(&self) -> &ContentCapsuleStore {
        &self.inner.store
    }

    pub fn bus(&self) -> &GossipBus {
        &self.inner.bus
    }

    pub fn discovery(&self) -> &DiscoveryEngine {
        &self.inner.discovery
    }

    pub fn content_topic(&self) -> &str {
        &self.inner.content_topic
    }

    /// Capsulize, publish, and announce `payload`.
    ///
    /// A failed announcement is logged; the content is stored either way.
    pub async fn share(
        &self,
        payload: impl Into<Bytes>,
        token_id: &str,
    ) -> Result<ContentAnnouncement, NodeError> {
        let capsule = self.inner.store.capsulize_detected(payload, token_id)?;
        let outcome = self.inner.store.publish(&capsule).await?;

        let announcement = ContentAnnouncement {
            digest: capsule.hash,
            token_id: capsule.token_id.clone(),
            size: capsule.payload.len() as u64,
            origin: self.inner.local,
            deduplicated: outcome == PublishOutcome::AlreadyPresent,
        };
        let encoded = announcement.encode()?;
        if let Err(e) = self
            .inner
            .bus
            .publish(&self.inner.content_topic, encoded)
            .await
        {
            tracing::warn!(digest = %capsule.hash.short(), error = %e, "content announcement not published");
        }
        Ok(announcement)
    }

    pub async fn fetch(&self, digest: &Digest) -> Result<Bytes, NodeError> {
        Ok(self.inner.store.fetch(digest).await?)
    }

    /// Announcements published on the content topic from now on.
    /// Undecodable messages are skipped.
    pub async fn announcements(&self) -> Result<BoxStream<'static, ContentAnnouncement>, NodeError> {
        let subscription = self.inner.bus.subscribe(&self.inner.content_topic).await?;
        Ok(subscription
            .filter_map(|raw| async move {
                match ContentAnnouncement::decode(&raw) {
                    Ok(a) => Some(a),
                    Err(e) => {
                        tracing::debug!(error = %e, "ignoring malformed content announcement");
                        None
                    }
                }
            })
            .boxed())
    }

    /// Start negotiating a direct channel with `remote`. Returns the session id.
    pub async fn negotiate(&self, remote: PeerId) -> Result<String, NodeError> {
        let setup = self.inner.signaling.as_ref().ok_or(NodeError::NoSignaling)?;
        let session = SignalingSession::offerer(
            self.inner.local,
            remote,
            setup.channels.open(remote),
            setup.relay.clone(),
        );
        let handle = SessionDriver::start(session, setup.answer_timeout).await?;
        let id = handle.id().to_string();
        setup.sessions.retain(|_, h| !h.is_finished());
        setup.sessions.insert(id.clone(), handle);
        Ok(id)
    }

    pub fn session_state(&self, session_id: &str) -> Option<SessionState> {
        let setup = self.inner.signaling.as_ref()?;
        setup.sessions.get(session_id).map(|h| h.state())
    }

    pub async fn status(&self) -> NodeStatus {
        let directory = self.directory();
        let mut peers = BTreeMap::new();
        for state in [
            ConnectionState::Unknown,
            ConnectionState::Discovered,
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Failed,
        ] {
            let name = serde_json::to_value(state)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| format!("{state:?}"));
            peers.insert(name, directory.count_in(state));
        }
        let topics = self.inner.bus.topics().await.map(|t| t.len()).unwrap_or(0);
        NodeStatus {
            peer_id: self.inner.local,
            peers,
            topics,
            capsules: self.inner.store.published().len(),
        }
    }

    /// Cancel every session and connection task, and stop the bus.
    pub async fn shutdown(&self) {
        if let Some(setup) = &self.inner.signaling {
            for mut entry in setup.sessions.iter_mut() {
                entry.value_mut().cancel();
            }
        }
        self.directory().shutdown();
        self.inner.bus.shutdown().await;
    }
}

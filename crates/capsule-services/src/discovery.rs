//! Discovery engine: finds candidate peers and feeds the peer directory.
//!
//! Two sources of candidates:
//!   - Rendezvous: this node advertises itself as a provider under a shared
//!     key and periodically looks up other providers under the same key.
//!   - Local segment: the daemon's multicast listener calls `on_peer_found`.
//!
//! Every candidate passes the same admission filter before a connect is
//! attempted: never the local node, never a peer without addresses, never a
//! peer the directory already holds as Connecting or Connected. A failed
//! connect is logged and the pass moves on; the peer is not retried until it
//! shows up again in a later pass.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::timeout;

use capsule_core::PeerId;

use crate::lookup::{LookupError, ProviderRecord, Rendezvous};
use crate::peer::{ConnectionState, DirectoryError, PeerDirectory, PeerRecord};
use crate::secure::SecurityError;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("refusing to connect to the local node")]
    LocalPeer,
    #[error("peer {0} has no reachable address")]
    NoAddress(PeerId),
    #[error("connect to {addr} timed out after {after:?}")]
    Timeout { addr: SocketAddr, after: Duration },
    #[error("peer unreachable at {addr}: {reason}")]
    Unreachable { addr: SocketAddr, reason: String },
    #[error("secure upgrade failed: {0}")]
    Security(#[from] SecurityError),
    #[error("no rendezvous capability configured")]
    NoRendezvous,
    #[error("lookup failed: {0}")]
    Lookup(#[from] LookupError),
}

/// Establishes a connection to one address of a peer.
///
/// On success the connection is owned by whatever task the connector spawned;
/// discovery only learns that it worked.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, peer: &PeerRecord, addr: SocketAddr) -> Result<(), DiscoveryError>;
}

/// Told about every peer discovery admits for a connect attempt.
pub trait PeerFoundHandler: Send + Sync {
    fn peer_found(&self, peer: &PeerRecord);
}

/// Outcome of one discovery pass.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub seen: usize,
    pub skipped: usize,
    pub attempted: usize,
    pub connected: usize,
    pub failed: usize,
}

struct EngineInner {
    directory: PeerDirectory,
    connector: Arc<dyn Connector>,
    rendezvous: Option<Arc<dyn Rendezvous>>,
    handlers: RwLock<Vec<Arc<dyn PeerFoundHandler>>>,
    listen_addrs: RwLock<Vec<SocketAddr>>,
    connect_timeout: Duration,
}

#[derive(Clone)]
pub struct DiscoveryEngine {
    inner: Arc<EngineInner>,
}

impl DiscoveryEngine {
    pub fn new(
        directory: PeerDirectory,
        connector: Arc<dyn Connector>,
        rendezvous: Option<Arc<dyn Rendezvous>>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                directory,
                connector,
                rendezvous,
                handlers: RwLock::new(Vec::new()),
                listen_addrs: RwLock::new(Vec::new()),
                connect_timeout,
            }),
        }
    }

    pub fn directory(&self) -> &PeerDirectory {
        &self.inner.directory
    }

    pub fn local_id(&self) -> PeerId {
        self.inner.directory.local_id()
    }

    /// Addresses advertised for this node.
    pub fn set_listen_addrs(&self, addrs: Vec<SocketAddr>) {
        if let Ok(mut current) = self.inner.listen_addrs.write() {
            *current = addrs;
        }
    }

    pub fn register_handler(&self, handler: Arc<dyn PeerFoundHandler>) {
        if let Ok(mut handlers) = self.inner.handlers.write() {
            handlers.push(handler);
        }
    }

    fn rendezvous(&self) -> Result<&Arc<dyn Rendezvous>, DiscoveryError> {
        self.inner
            .rendezvous
            .as_ref()
            .ok_or(DiscoveryError::NoRendezvous)
    }

    /// Announce this node once under `key`.
    pub async fn advertise_once(&self, key: &str) -> Result<(), DiscoveryError> {
        let addrs = self
            .inner
            .listen_addrs
            .read()
            .map(|a| a.clone())
            .unwrap_or_default();
        let record = ProviderRecord {
            peer: self.local_id(),
            addrs,
        };
        self.rendezvous()?.provide(key, record).await?;
        tracing::trace!(key, "advertised under rendezvous key");
        Ok(())
    }

    /// Re-announce every `interval` until shutdown.
    pub async fn advertise(
        &self,
        key: &str,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        tracing::info!(key, ?interval, "advertising");
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.advertise_once(key).await {
                        tracing::warn!(key, error = %e, "advertise failed");
                    }
                }
            }
        }
    }

    /// True if a connect attempt against `record` is allowed right now.
    fn admits(&self, record: &PeerRecord) -> bool {
        if record.id == self.local_id() || !record.is_reachable() {
            return false;
        }
        !matches!(
            self.inner.directory.state(&record.id),
            Some(ConnectionState::Connecting | ConnectionState::Connected)
        )
    }

    async fn providers(&self, key: &str) -> Result<BoxStream<'static, PeerRecord>, DiscoveryError> {
        let stream = self.rendezvous()?.find_providers(key).await?;
        Ok(stream
            .map(|p| PeerRecord::discovered(p.peer, p.addrs))
            .boxed())
    }

    /// Candidate peers under `key`: lazy, unordered, possibly unbounded.
    pub async fn find_peers(&self, key: &str) -> Result<BoxStream<'static, PeerRecord>, DiscoveryError> {
        let engine = self.clone();
        Ok(self
            .providers(key)
            .await?
            .filter(move |record| futures::future::ready(engine.admits(record)))
            .boxed())
    }

    /// Try the peer's addresses in order; the first that connects wins.
    pub async fn connect(&self, peer: &PeerRecord) -> Result<SocketAddr, DiscoveryError> {
        if peer.id == self.local_id() {
            return Err(DiscoveryError::LocalPeer);
        }
        let mut last_err = DiscoveryError::NoAddress(peer.id);
        for &addr in &peer.addrs {
            let attempt = timeout(
                self.inner.connect_timeout,
                self.inner.connector.connect(peer, addr),
            )
            .await;
            match attempt {
                Ok(Ok(())) => return Ok(addr),
                Ok(Err(e)) => {
                    tracing::debug!(peer = %peer.id, %addr, error = %e, "address failed");
                    last_err = e;
                }
                Err(_) => {
                    tracing::debug!(peer = %peer.id, %addr, "connect timed out");
                    last_err = DiscoveryError::Timeout {
                        addr,
                        after: self.inner.connect_timeout,
                    };
                }
            }
        }
        Err(last_err)
    }

    /// Connect with directory bookkeeping. The caller holds the claim from
    /// `try_begin_connect`.
    async fn dial(&self, peer: PeerRecord) -> bool {
        match self.connect(&peer).await {
            Ok(addr) => {
                self.inner.directory.mark_connected(&peer.id);
                tracing::info!(peer = %peer.id, %addr, "connected");
                true
            }
            Err(e) => {
                self.inner.directory.mark_failed(&peer.id);
                tracing::warn!(peer = %peer.id, error = %e, "connect failed, skipping");
                false
            }
        }
    }

    /// Record a candidate and claim it for connecting. Returns the record to
    /// dial, or `None` if the candidate is a no-op.
    fn admit(&self, record: PeerRecord) -> Option<PeerRecord> {
        if !self.admits(&record) {
            return None;
        }
        match self.inner.directory.upsert_discovered(record.clone()) {
            Ok(_) => {}
            Err(DirectoryError::LocalPeer) => return None,
        }
        if !self.inner.directory.try_begin_connect(&record.id) {
            return None;
        }
        let current = self.inner.directory.get(&record.id).unwrap_or(record);
        if let Ok(handlers) = self.inner.handlers.read() {
            for handler in handlers.iter() {
                handler.peer_found(&current);
            }
        }
        Some(current)
    }

    /// One lookup pass under `key`. Candidates are connected concurrently.
    ///
    /// `window` bounds how long the provider stream is consumed; connect
    /// attempts already started are allowed to finish.
    pub async fn discover_once(&self, key: &str, window: Duration) -> Result<PassReport, DiscoveryError> {
        let mut candidates = self
            .providers(key)
            .await?
            .take_until(Box::pin(tokio::time::sleep(window)));
        let mut report = PassReport::default();
        let mut attempts = JoinSet::new();

        while let Some(record) = candidates.next().await {
            report.seen += 1;
            if record.id != self.local_id() {
                // Refresh addresses and last-seen even for peers we skip.
                let _ = self.inner.directory.upsert_discovered(record.clone());
            }
            match self.admit(record) {
                Some(peer) => {
                    report.attempted += 1;
                    let engine = self.clone();
                    attempts.spawn(async move { engine.dial(peer).await });
                }
                None => report.skipped += 1,
            }
        }

        while let Some(result) = attempts.join_next().await {
            match result {
                Ok(true) => report.connected += 1,
                _ => report.failed += 1,
            }
        }

        tracing::debug!(
            key,
            seen = report.seen,
            attempted = report.attempted,
            connected = report.connected,
            "discovery pass complete"
        );
        Ok(report)
    }

    /// Discovery loop: a pass every `interval` until shutdown.
    pub async fn run(&self, key: &str, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(interval);
        tracing::info!(key, ?interval, "discovery loop started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    let pass = self.discover_once(key, interval);
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        result = pass => if let Err(e) = result {
                            tracing::warn!(key, error = %e, "discovery pass failed");
                        },
                    }
                }
            }
        }
        tracing::info!(key, "discovery loop stopped");
    }

    /// A peer was found outside a lookup pass, e.g. on the local segment.
    ///
    /// Idempotent: a peer already Connecting or Connected is only refreshed.
    /// Returns true if a connect attempt was started.
    pub fn on_peer_found(&self, record: PeerRecord) -> bool {
        if record.id == self.local_id() {
            return false;
        }
        let _ = self.inner.directory.upsert_discovered(record.clone());
        match self.admit(record) {
            Some(peer) => {
                let engine = self.clone();
                tokio::spawn(async move { engine.dial(peer).await });
                true
            }
            None => false,
        }
    }
}

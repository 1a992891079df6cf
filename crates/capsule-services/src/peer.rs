//! Peer directory: bookkeeping of known and connected peers.
//!
//! The directory is a concurrent map from PeerId to an entry holding the
//! peer's record and, once a connection task exists, that task's abort
//! handle. Every method is synchronous and touches one shard at a time, so
//! no caller ever holds the map across network I/O.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::AbortHandle;

use capsule_core::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Unknown,
    Discovered,
    Connecting,
    Connected,
    Failed,
}

/// A peer as this node knows it.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub id: PeerId,
    /// Reachable addresses, most preferred first.
    pub addrs: Vec<SocketAddr>,
    pub state: ConnectionState,
    pub last_seen: Instant,
}

impl PeerRecord {
    /// A freshly discovered peer. Without addresses it stays `Unknown`.
    pub fn discovered(id: PeerId, addrs: Vec<SocketAddr>) -> Self {
        let state = if addrs.is_empty() {
            ConnectionState::Unknown
        } else {
            ConnectionState::Discovered
        };
        Self {
            id,
            addrs,
            state,
            last_seen: Instant::now(),
        }
    }

    pub fn is_reachable(&self) -> bool {
        !self.addrs.is_empty()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("refusing to record the local node as a peer")]
    LocalPeer,
}

struct DirectoryEntry {
    record: PeerRecord,
    task: Option<AbortHandle>,
}

impl DirectoryEntry {
    fn abort_task(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Shared between discovery, connection handlers, and the API.
#[derive(Clone)]
pub struct PeerDirectory {
    local_id: PeerId,
    entries: Arc<DashMap<PeerId, DirectoryEntry>>,
}

impl PeerDirectory {
    pub fn new(local_id: PeerId) -> Self {
        Self {
            local_id,
            entries: Arc::new(DashMap::new()),
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    /// Insert or refresh a discovered peer. Returns true for a new entry.
    ///
    /// An existing entry keeps its Connecting/Connected state; a Failed or
    /// Unknown entry becomes Discovered again once it has addresses.
    pub fn upsert_discovered(&self, record: PeerRecord) -> Result<bool, DirectoryError> {
        if record.id == self.local_id {
            return Err(DirectoryError::LocalPeer);
        }

        let mut is_new = false;
        self.entries
            .entry(record.id)
            .and_modify(|entry| {
                let current = &mut entry.record;
                if record.is_reachable() {
                    current.addrs = record.addrs.clone();
                }
                current.last_seen = Instant::now();
                if matches!(
                    current.state,
                    ConnectionState::Unknown | ConnectionState::Failed
                ) && current.is_reachable()
                {
                    current.state = ConnectionState::Discovered;
                }
            })
            .or_insert_with(|| {
                is_new = true;
                DirectoryEntry {
                    record: PeerRecord::discovered(record.id, record.addrs.clone()),
                    task: None,
                }
            });
        Ok(is_new)
    }

    pub fn get(&self, id: &PeerId) -> Option<PeerRecord> {
        self.entries.get(id).map(|e| e.record.clone())
    }

    pub fn state(&self, id: &PeerId) -> Option<ConnectionState> {
        self.entries.get(id).map(|e| e.record.state)
    }

    /// Claim the peer for a connect attempt.
    ///
    /// Returns false when the peer is unknown, has no addresses, or is
    /// already Connecting/Connected. The caller must not dial it then.
    pub fn try_begin_connect(&self, id: &PeerId) -> bool {
        let Some(mut entry) = self.entries.get_mut(id) else {
            return false;
        };
        let record = &mut entry.record;
        if !record.is_reachable() {
            return false;
        }
        match record.state {
            ConnectionState::Connecting | ConnectionState::Connected => false,
            _ => {
                record.state = ConnectionState::Connecting;
                true
            }
        }
    }

    pub fn mark_connected(&self, id: &PeerId) {
        if let Some(mut entry) = self.entries.get_mut(id) {
            entry.record.state = ConnectionState::Connected;
            entry.record.last_seen = Instant::now();
        }
    }

    pub fn mark_failed(&self, id: &PeerId) {
        if let Some(mut entry) = self.entries.get_mut(id) {
            entry.record.state = ConnectionState::Failed;
            entry.task = None;
        }
    }

    /// The connection ended. The peer stays known and may be dialled again.
    pub fn mark_disconnected(&self, id: &PeerId) {
        if let Some(mut entry) = self.entries.get_mut(id) {
            entry.abort_task();
            entry.record.state = ConnectionState::Discovered;
        }
    }

    /// Retain the cancellation handle of the task serving this peer.
    /// A previous handle, if any, is aborted.
    pub fn attach_task(&self, id: &PeerId, task: AbortHandle) {
        match self.entries.get_mut(id) {
            Some(mut entry) => {
                entry.abort_task();
                entry.task = Some(task);
            }
            None => task.abort(),
        }
    }

    pub fn touch(&self, id: &PeerId) {
        if let Some(mut entry) = self.entries.get_mut(id) {
            entry.record.last_seen = Instant::now();
        }
    }

    pub fn remove(&self, id: &PeerId) -> Option<PeerRecord> {
        self.entries.remove(id).map(|(_, mut entry)| {
            entry.abort_task();
            entry.record
        })
    }

    /// Evict peers not seen within `ttl`. Returns how many were removed.
    pub fn expire(&self, ttl: Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            let keep = entry.record.last_seen.elapsed() < ttl;
            if !keep {
                entry.abort_task();
            }
            keep
        });
        before.saturating_sub(self.entries.len())
    }

    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.entries.iter().map(|e| e.record.clone()).collect()
    }

    pub fn count_in(&self, state: ConnectionState) -> usize {
        self.entries
            .iter()
            .filter(|e| e.record.state == state)
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Abort every connection task. Entries stay for inspection.
    pub fn shutdown(&self) {
        for mut entry in self.entries.iter_mut() {
            entry.abort_task();
        }
    }
}

/// Remove directory entries that have not been refreshed within the TTL.
///
/// Runs until the shutdown signal fires.
pub async fn expiry_loop(
    directory: PeerDirectory,
    ttl: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let period = ttl.clamp(Duration::from_millis(100), Duration::from_secs(1));
    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = interval.tick() => {
                let removed = directory.expire(ttl);
                if removed > 0 {
                    tracing::debug!(removed, "expired peer directory entries");
                }
            }
        }
    }
}

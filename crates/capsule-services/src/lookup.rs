//! Lookup capabilities: the distributed key→value store and rendezvous
//! provider records the core relies on but does not implement.
//!
//! Two implementations live here:
//!   - `MemoryLookup`: in-process, shareable between nodes in one process.
//!     Stands in for a DHT in tests and single-host deployments.
//!   - `DiskLookup`: content-addressed directory store. Nodes on one host
//!     that share the directory also rendezvous through it.
//!
//! Keys are lower-case hex digests, so for a given key every value ever
//! stored is identical. Both implementations are first-write-wins.

use std::fs;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use memmap2::Mmap;
use thiserror::Error;

use capsule_core::crypto::digest_hex;
use capsule_core::PeerId;

/// Subdirectory of a `DiskLookup` root holding provider records.
const PROVIDERS_DIR: &str = "providers";

/// Suffix of in-flight writes. Readers and `count` ignore these.
const TMP_SUFFIX: &str = ".tmp";

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// A temp path next to `path` owned by this writer alone.
fn unique_tmp(path: &Path) -> PathBuf {
    let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(
        "{name}.{}.{seq}{TMP_SUFFIX}",
        std::process::id()
    ))
}

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("lookup capability unreachable: {0}")]
    Unreachable(String),
    #[error("write rejected: {0}")]
    Rejected(String),
    #[error("lookup I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// `put(key, value)` / `get(key)`; eventually consistent, not linearizable.
#[async_trait]
pub trait LookupCapability: Send + Sync {
    async fn put(&self, key: &str, value: Bytes) -> Result<(), LookupError>;

    /// `Ok(None)` is NotFound.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, LookupError>;
}

/// A node advertised under a rendezvous key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderRecord {
    pub peer: PeerId,
    pub addrs: Vec<SocketAddr>,
}

/// Provider advertisement and lookup under an opaque rendezvous key.
#[async_trait]
pub trait Rendezvous: Send + Sync {
    async fn provide(&self, key: &str, provider: ProviderRecord) -> Result<(), LookupError>;

    /// Candidate providers. Unordered, and may never end for a live DHT.
    async fn find_providers(
        &self,
        key: &str,
    ) -> Result<BoxStream<'static, ProviderRecord>, LookupError>;
}

// ── In-memory ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DhtEntry {
    pub value: Bytes,
    pub contributor: Option<PeerId>,
}

/// Shared in-process lookup and rendezvous.
///
/// Clones share state. `handle_for` gives each node its own view so stored
/// entries record who contributed them.
#[derive(Clone, Default)]
pub struct MemoryLookup {
    entries: Arc<DashMap<String, DhtEntry>>,
    providers: Arc<DashMap<String, Vec<ProviderRecord>>>,
    unreachable: Arc<AtomicBool>,
    puts: Arc<AtomicUsize>,
    contributor: Option<PeerId>,
}

impl MemoryLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle_for(&self, peer: PeerId) -> Self {
        Self {
            contributor: Some(peer),
            ..self.clone()
        }
    }

    /// Simulate the capability dropping off the network.
    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    pub fn entry(&self, key: &str) -> Option<DhtEntry> {
        self.entries.get(key).map(|e| e.clone())
    }

    /// Number of `put` calls that reached the store.
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn check_reachable(&self) -> Result<(), LookupError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(LookupError::Unreachable("memory lookup offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl LookupCapability for MemoryLookup {
    async fn put(&self, key: &str, value: Bytes) -> Result<(), LookupError> {
        self.check_reachable()?;
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.entries.entry(key.to_string()).or_insert(DhtEntry {
            value,
            contributor: self.contributor,
        });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, LookupError> {
        self.check_reachable()?;
        Ok(self.entries.get(key).map(|e| e.value.clone()))
    }
}

#[async_trait]
impl Rendezvous for MemoryLookup {
    async fn provide(&self, key: &str, provider: ProviderRecord) -> Result<(), LookupError> {
        self.check_reachable()?;
        let mut list = self.providers.entry(key.to_string()).or_default();
        match list.iter_mut().find(|p| p.peer == provider.peer) {
            Some(existing) => *existing = provider,
            None => list.push(provider),
        }
        Ok(())
    }

    async fn find_providers(
        &self,
        key: &str,
    ) -> Result<BoxStream<'static, ProviderRecord>, LookupError> {
        self.check_reachable()?;
        let snapshot = self
            .providers
            .get(key)
            .map(|list| list.clone())
            .unwrap_or_default();
        Ok(stream::iter(snapshot).boxed())
    }
}

// ── On disk ──────────────────────────────────────────────────────────────────

/// Content-addressed directory store.
///
/// Values are stored by key in a two-level layout:
///   {root}/{key[0..2]}/{key}
///
/// Files are immutable: if the key exists, the content is correct.
///
/// Provider records live under {root}/providers/{hash(key)}/{peer}, one
/// address per line. A re-advertisement replaces the peer's file.
#[derive(Clone)]
pub struct DiskLookup {
    root: PathBuf,
}

impl DiskLookup {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, LookupError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn value_path(&self, key: &str) -> Result<PathBuf, LookupError> {
        let valid = key.len() >= 2
            && key
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !valid {
            return Err(LookupError::Rejected(format!("not a hex digest key: {key}")));
        }
        Ok(self.root.join(&key[0..2]).join(key))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.value_path(key).map(|p| p.exists()).unwrap_or(false)
    }

    fn put_blocking(&self, key: &str, value: &[u8]) -> Result<(), LookupError> {
        let path = self.value_path(key)?;
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Atomic write: private tmp file → rename. A published file is
        // never truncated, so concurrent mmap readers stay valid.
        let tmp_path = unique_tmp(&path);
        let written = (|| -> io::Result<()> {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(value)?;
            file.sync_all()?;
            fs::rename(&tmp_path, &path)
        })();
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp_path);
            // Another writer stored the same immutable value first
            if path.exists() {
                tracing::trace!(key, "lookup value already stored");
                return Ok(());
            }
            return Err(e.into());
        }

        tracing::trace!(key, bytes = value.len(), "lookup value stored");
        Ok(())
    }

    fn get_blocking(&self, key: &str) -> Result<Option<Bytes>, LookupError> {
        let path = self.value_path(key)?;
        if !path.exists() {
            return Ok(None);
        }
        let file = fs::File::open(&path)?;
        if file.metadata()?.len() == 0 {
            return Ok(Some(Bytes::new()));
        }
        // Safety: opened read-only, files are never rewritten in place
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Some(Bytes::copy_from_slice(&mmap)))
    }

    fn provider_dir(&self, key: &str) -> PathBuf {
        self.root.join(PROVIDERS_DIR).join(digest_hex(key.as_bytes()))
    }

    fn provide_blocking(&self, key: &str, provider: &ProviderRecord) -> Result<(), LookupError> {
        let dir = self.provider_dir(key);
        fs::create_dir_all(&dir)?;
        let path = dir.join(provider.peer.to_hex());
        let tmp_path = unique_tmp(&path);
        let body: String = provider.addrs.iter().map(|a| format!("{a}\n")).collect();
        let written = fs::write(&tmp_path, body).and_then(|()| fs::rename(&tmp_path, &path));
        if written.is_err() {
            let _ = fs::remove_file(&tmp_path);
        }
        Ok(written?)
    }

    fn providers_blocking(&self, key: &str) -> Result<Vec<ProviderRecord>, LookupError> {
        let entries = match fs::read_dir(self.provider_dir(key)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut providers = Vec::new();
        for entry in entries.flatten() {
            // Skips in-flight .tmp files
            let Some(peer) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<PeerId>().ok())
            else {
                continue;
            };
            let Ok(text) = fs::read_to_string(entry.path()) else {
                continue;
            };
            let addrs = text
                .lines()
                .filter_map(|line| line.trim().parse::<SocketAddr>().ok())
                .collect();
            providers.push(ProviderRecord { peer, addrs });
        }
        Ok(providers)
    }

    /// Number of stored values.
    pub fn count(&self) -> usize {
        let mut total = 0;
        if let Ok(entries) = fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                if entry.file_name() == PROVIDERS_DIR {
                    continue;
                }
                if let Ok(subdir) = fs::read_dir(entry.path()) {
                    total += subdir
                        .flatten()
                        .filter(|e| !e.file_name().to_string_lossy().ends_with(TMP_SUFFIX))
                        .count();
                }
            }
        }
        total
    }
}

#[async_trait]
impl LookupCapability for DiskLookup {
    async fn put(&self, key: &str, value: Bytes) -> Result<(), LookupError> {
        let this = self.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || this.put_blocking(&key, &value))
            .await
            .map_err(|e| LookupError::Unreachable(e.to_string()))?
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, LookupError> {
        let this = self.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || this.get_blocking(&key))
            .await
            .map_err(|e| LookupError::Unreachable(e.to_string()))?
    }
}

#[async_trait]
impl Rendezvous for DiskLookup {
    async fn provide(&self, key: &str, provider: ProviderRecord) -> Result<(), LookupError> {
        let this = self.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || this.provide_blocking(&key, &provider))
            .await
            .map_err(|e| LookupError::Unreachable(e.to_string()))?
    }

    async fn find_providers(
        &self,
        key: &str,
    ) -> Result<BoxStream<'static, ProviderRecord>, LookupError> {
        let this = self.clone();
        let key = key.to_string();
        let providers = tokio::task::spawn_blocking(move || this.providers_blocking(&key))
            .await
            .map_err(|e| LookupError::Unreachable(e.to_string()))??;
        Ok(stream::iter(providers).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_disk() -> (DiskLookup, PathBuf) {
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!(
            "capsule-lookup-test-{}-{}",
            std::process::id(),
            id
        ));
        let _ = fs::remove_dir_all(&dir);
        (DiskLookup::new(&dir).unwrap(), dir)
    }

    #[tokio::test]
    async fn memory_put_is_first_write_wins() {
        let shared = MemoryLookup::new();
        let a = shared.handle_for(PeerId([1; 32]));
        let b = shared.handle_for(PeerId([2; 32]));

        a.put("k", Bytes::from_static(b"v")).await.unwrap();
        b.put("k", Bytes::from_static(b"v")).await.unwrap();

        let entry = shared.entry("k").unwrap();
        assert_eq!(entry.value, "v");
        assert_eq!(entry.contributor, Some(PeerId([1; 32])));
        assert_eq!(shared.put_count(), 2);
    }

    #[tokio::test]
    async fn memory_unreachable_surfaces_errors() {
        let lookup = MemoryLookup::new();
        lookup.set_reachable(false);
        assert!(matches!(
            lookup.get("k").await,
            Err(LookupError::Unreachable(_))
        ));
        lookup.set_reachable(true);
        assert!(lookup.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn providers_are_replaced_per_peer() {
        let lookup = MemoryLookup::new();
        let p = PeerId([3; 32]);
        let a1: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let a2: SocketAddr = "127.0.0.1:2".parse().unwrap();
        lookup
            .provide("room", ProviderRecord { peer: p, addrs: vec![a1] })
            .await
            .unwrap();
        lookup
            .provide("room", ProviderRecord { peer: p, addrs: vec![a2] })
            .await
            .unwrap();

        let found: Vec<_> = lookup.find_providers("room").await.unwrap().collect().await;
        assert_eq!(found, vec![ProviderRecord { peer: p, addrs: vec![a2] }]);
        let none: Vec<_> = lookup.find_providers("other").await.unwrap().collect().await;
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn disk_put_get_roundtrip() {
        let (disk, dir) = temp_disk();
        let key = digest_hex(b"hello world");
        disk.put(&key, Bytes::from_static(b"hello world")).await.unwrap();
        assert!(disk.contains(&key));
        assert_eq!(disk.get(&key).await.unwrap().unwrap(), "hello world");
        assert_eq!(disk.count(), 1);
        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn disk_put_is_idempotent_and_missing_is_none() {
        let (disk, dir) = temp_disk();
        let key = digest_hex(b"once");
        disk.put(&key, Bytes::from_static(b"once")).await.unwrap();
        disk.put(&key, Bytes::from_static(b"once")).await.unwrap();
        assert_eq!(disk.count(), 1);
        assert!(disk.get(&digest_hex(b"absent")).await.unwrap().is_none());
        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn disk_concurrent_identical_puts_all_succeed() {
        let (disk, dir) = temp_disk();
        let value = Bytes::from(vec![0x5a; 256 * 1024]);
        let key = digest_hex(&value);

        let reader = {
            let disk = disk.clone();
            let key = key.clone();
            let len = value.len();
            tokio::spawn(async move {
                for _ in 0..200 {
                    if let Some(v) = disk.get(&key).await.unwrap() {
                        assert_eq!(v.len(), len);
                    }
                    tokio::task::yield_now().await;
                }
            })
        };

        let mut writers = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let disk = disk.clone();
            let key = key.clone();
            let value = value.clone();
            writers.spawn(async move { disk.put(&key, value).await });
        }
        while let Some(res) = writers.join_next().await {
            res.unwrap().unwrap();
        }
        reader.await.unwrap();

        assert_eq!(disk.get(&key).await.unwrap().unwrap(), value);
        assert_eq!(disk.count(), 1);
        let leftovers = fs::read_dir(dir.join(&key[0..2])).unwrap().count();
        assert_eq!(leftovers, 1);
        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn disk_rejects_non_digest_keys() {
        let (disk, dir) = temp_disk();
        assert!(matches!(
            disk.put("../escape", Bytes::new()).await,
            Err(LookupError::Rejected(_))
        ));
        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn disk_rendezvous_is_shared_through_the_directory() {
        let (disk, dir) = temp_disk();
        let other = DiskLookup::new(&dir).unwrap();
        let p = PeerId([4; 32]);
        let a1: SocketAddr = "127.0.0.1:7001".parse().unwrap();
        let a2: SocketAddr = "[::1]:7002".parse().unwrap();

        disk.provide("room", ProviderRecord { peer: p, addrs: vec![a1] })
            .await
            .unwrap();
        disk.provide("room", ProviderRecord { peer: p, addrs: vec![a1, a2] })
            .await
            .unwrap();

        let found: Vec<_> = other.find_providers("room").await.unwrap().collect().await;
        assert_eq!(found, vec![ProviderRecord { peer: p, addrs: vec![a1, a2] }]);
        let none: Vec<_> = other.find_providers("elsewhere").await.unwrap().collect().await;
        assert!(none.is_empty());
        assert_eq!(disk.count(), 0);
        let _ = fs::remove_dir_all(&dir);
    }
}

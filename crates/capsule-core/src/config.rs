//! Configuration system for Capsule.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $CAPSULE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/capsule/config.toml
//!   3. ~/.config/capsule/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CapsuleConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub discovery: DiscoveryConfig,
    pub storage: StorageConfig,
    pub gossip: GossipConfig,
    pub signaling: SignalingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Path to the X25519 private key. Generated on first run.
    pub keypair_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Interface for local-segment multicast. Empty = local-segment discovery off.
    pub interface: String,
    /// TCP port accepting secured streams. 0 = OS-assigned.
    pub listen_port: u16,
    /// UDP port for local-segment announcements.
    pub announce_port: u16,
    /// Local HTTP API port.
    pub api_port: u16,
    /// Bound on a single outbound connect + secure upgrade.
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Namespace shared by peers that should find each other.
    pub rendezvous_key: String,
    pub advertise_interval_secs: u64,
    pub lookup_interval_secs: u64,
    /// Peers not seen for this long are evicted from the directory.
    pub peer_ttl_secs: u64,
    pub local_segment: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of the node-local content-addressed lookup store.
    pub lookup_root: PathBuf,
    /// Segment size used when capsules are split.
    pub chunk_size: usize,
    /// Local capsule index retention. 0 = keep forever.
    pub retention_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    /// Depth of the dispatcher's command queue.
    pub queue_capacity: usize,
    /// Per-subscriber buffer. A subscriber that falls this far behind is dropped.
    pub subscriber_buffer: usize,
    /// Topic on which content announcements are published.
    pub content_topic: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// How long an offer may wait for its answer before the session fails.
    pub answer_timeout_secs: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            keypair_path: config_dir().join("keypair"),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            interface: String::new(),
            listen_port: 0,
            announce_port: 9400,
            api_port: 9401,
            connect_timeout_secs: 10,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            rendezvous_key: "capsule/rendezvous".to_string(),
            advertise_interval_secs: 60,
            lookup_interval_secs: 30,
            peer_ttl_secs: 300,
            local_segment: true,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            lookup_root: data_dir().join("lookup"),
            chunk_size: crate::capsule::DEFAULT_CHUNK_SIZE,
            retention_secs: 7 * 24 * 3600,
        }
    }
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            subscriber_buffer: 256,
            content_topic: "capsule/content".to_string(),
        }
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            answer_timeout_secs: 30,
        }
    }
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl DiscoveryConfig {
    pub fn advertise_interval(&self) -> Duration {
        Duration::from_secs(self.advertise_interval_secs)
    }

    pub fn lookup_interval(&self) -> Duration {
        Duration::from_secs(self.lookup_interval_secs)
    }

    pub fn peer_ttl(&self) -> Duration {
        Duration::from_secs(self.peer_ttl_secs)
    }
}

impl StorageConfig {
    pub fn retention(&self) -> Option<Duration> {
        (self.retention_secs > 0).then(|| Duration::from_secs(self.retention_secs))
    }
}

impl SignalingConfig {
    pub fn answer_timeout(&self) -> Duration {
        Duration::from_secs(self.answer_timeout_secs)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

pub fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("capsule")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("capsule")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl CapsuleConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            CapsuleConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn file_path() -> PathBuf {
        std::env::var("CAPSULE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&CapsuleConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply CAPSULE_* overrides. `lookup` reads a variable by name.
    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("CAPSULE_NETWORK__INTERFACE") {
            self.network.interface = v;
        }
        if let Some(p) = lookup("CAPSULE_NETWORK__LISTEN_PORT").and_then(|v| v.parse().ok()) {
            self.network.listen_port = p;
        }
        if let Some(p) = lookup("CAPSULE_NETWORK__API_PORT").and_then(|v| v.parse().ok()) {
            self.network.api_port = p;
        }
        if let Some(v) = lookup("CAPSULE_DISCOVERY__RENDEZVOUS_KEY") {
            self.discovery.rendezvous_key = v;
        }
        if let Some(v) = lookup("CAPSULE_DISCOVERY__LOCAL_SEGMENT") {
            self.discovery.local_segment = v == "true" || v == "1";
        }
        if let Some(v) = lookup("CAPSULE_STORAGE__LOOKUP_ROOT") {
            self.storage.lookup_root = PathBuf::from(v);
        }
        if let Some(n) = lookup("CAPSULE_STORAGE__CHUNK_SIZE").and_then(|v| v.parse().ok()) {
            self.storage.chunk_size = n;
        }
        if let Some(s) = lookup("CAPSULE_SIGNALING__ANSWER_TIMEOUT_SECS").and_then(|v| v.parse().ok())
        {
            self.signaling.answer_timeout_secs = s;
        }
    }
}

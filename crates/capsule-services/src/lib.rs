//! capsule-services: the overlay's moving parts.
//!
//! Peer bookkeeping, content storage, gossip fan-out, discovery, signaling,
//! and secure channel upgrade, plus `Node`, which wires them together.

pub mod discovery;
pub mod gossip;
pub mod lookup;
pub mod node;
pub mod peer;
pub mod protocol;
pub mod secure;
pub mod signaling;
pub mod store;

pub use discovery::{Connector, DiscoveryEngine, DiscoveryError, PassReport, PeerFoundHandler};
pub use gossip::{GossipBus, GossipError, PubSubCapability, Subscription, TopicHandle, TopicInfo};
pub use lookup::{DiskLookup, LookupCapability, LookupError, MemoryLookup, ProviderRecord, Rendezvous};
pub use node::{Node, NodeError, NodeStatus, SignalingSetup};
pub use peer::{ConnectionState, PeerDirectory, PeerRecord};
pub use protocol::{FileSharingHandler, ProtocolError, ProtocolRouter, StreamHandler};
pub use secure::{
    NoiseSecureTransport, SecureChannelUpgrader, SecureTransport, SecuredChannel, SecurityError,
};
pub use signaling::{
    ChannelEvent, FailReason, MemoryChannelFactory, MemoryPeerChannel, MemoryRelay, PeerChannel,
    PeerChannelFactory, Role, SessionDriver, SessionHandle, SessionState, SessionTable,
    SignalingError, SignalingRelay, SignalingSession,
};
pub use store::{ContentCapsuleStore, PublishOutcome, PublishedCapsule, StorageError};

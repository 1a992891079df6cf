//! capsule-core: shared types, wire formats, and cryptographic primitives.
//! All other Capsule crates depend on this one.

pub mod capsule;
pub mod config;
pub mod crypto;
pub mod wire;

pub use capsule::{capsulize, capsulize_with, split, ContentKind, DataCapsule, Segmenter};
pub use crypto::{Digest, PeerId};
pub use wire::{ContentAnnouncement, SignalKind, SignalMessage};

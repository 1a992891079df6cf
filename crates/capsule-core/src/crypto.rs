//! Cryptographic primitives for Capsule.
//!
//! Provides three things:
//!   1. BLAKE3 content digests, used as capsule identity and DHT keys
//!   2. Node identity: a static X25519 keypair whose public half is the PeerId
//!   3. Noise_XX handshake + transport state for securing raw streams
//!
//! snow drives the Noise_XX state machine using keys managed by x25519-dalek.
//! All key material derives ZeroizeOnDrop.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use snow::{Builder, HandshakeState, TransportState};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

// ── Digests ───────────────────────────────────────────────────────────────────

/// Hash a byte slice, returning a 32-byte BLAKE3 digest.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Lower-case hex digest of a payload. This string is the DHT key.
pub fn digest_hex(data: &[u8]) -> String {
    hex::encode(hash(data))
}

/// A 256-bit content digest. Displays as 64 lower-case hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(pub [u8; 32]);

impl Digest {
    pub fn of(data: &[u8]) -> Self {
        Self(hash(data))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short form for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.short())
    }
}

impl FromStr for Digest {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_hex32(s).map(Self)
    }
}

impl TryFrom<String> for Digest {
    type Error = CryptoError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> Self {
        d.to_hex()
    }
}

/// Incremental BLAKE3 hasher for payloads that arrive in pieces.
///
/// # Example
/// ```
/// use capsule_core::crypto::Hasher;
/// let mut h = Hasher::new();
/// h.update(b"aaa");
/// h.update(b"bbb");
/// assert_eq!(h.finalize(), capsule_core::crypto::hash(b"aaabbb"));
/// ```
pub struct Hasher(blake3::Hasher);

impl Hasher {
    pub fn new() -> Self {
        Self(blake3::Hasher::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> [u8; 32] {
        *self.0.finalize().as_bytes()
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

// ── Identity ──────────────────────────────────────────────────────────────────

/// A node's identity: its static X25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl FromStr for PeerId {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_hex32(s).map(Self)
    }
}

impl TryFrom<String> for PeerId {
    type Error = CryptoError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<PeerId> for String {
    fn from(p: PeerId) -> Self {
        p.to_hex()
    }
}

fn parse_hex32(s: &str) -> Result<[u8; 32], CryptoError> {
    let bytes = hex::decode(s).map_err(|_| CryptoError::BadHex(s.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| CryptoError::BadHex(s.to_string()))
}

/// The Noise protocol pattern Capsule uses to secure streams.
///
/// Noise_XX: mutual authentication, both static keys transmitted encrypted.
const NOISE_PATTERN: &str = "Noise_XX_25519_ChaChaPoly_BLAKE2s";

/// Largest Noise message snow will produce or accept.
pub const MAX_NOISE_MSG: usize = 65535;

/// Poly1305 tag appended to every transport message.
pub const NOISE_TAG_LEN: usize = 16;

/// A node's long-term static X25519 keypair.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Keypair {
    private: Zeroizing<[u8; 32]>,
    pub public: [u8; 32],
}

impl Keypair {
    /// Generate a new random X25519 keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::thread_rng());
        Self::from_private(secret.to_bytes())
    }

    /// Reconstruct a keypair from stored private key bytes.
    pub fn from_private(private_bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(private_bytes);
        let public = PublicKey::from(&secret);
        Self {
            private: Zeroizing::new(private_bytes),
            public: *public.as_bytes(),
        }
    }

    pub fn private_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(*self.private)
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId(self.public)
    }

    /// Load the private key from `path`, or generate and persist a new one.
    pub fn load_or_generate(path: &Path) -> Result<Self, CryptoError> {
        if path.exists() {
            let bytes = Zeroizing::new(
                std::fs::read(path).map_err(|e| CryptoError::KeyIo(path.display().to_string(), e))?,
            );
            let private: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| CryptoError::BadKeyFile(path.display().to_string()))?;
            return Ok(Self::from_private(private));
        }

        let keypair = Self::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CryptoError::KeyIo(parent.display().to_string(), e))?;
        }
        std::fs::write(path, &*keypair.private)
            .map_err(|e| CryptoError::KeyIo(path.display().to_string(), e))?;
        Ok(keypair)
    }
}

// ── Noise handshake ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    Initiator,
    Responder,
}

/// One side of an in-progress Noise_XX handshake.
///
/// The caller moves messages: while `!is_finished()`, call `write_message` when
/// `is_my_turn()` and send the bytes, otherwise feed the next received message
/// to `read_message`.
pub struct NoiseHandshake {
    state: HandshakeState,
}

impl NoiseHandshake {
    pub fn new(keypair: &Keypair, role: HandshakeRole) -> Result<Self, CryptoError> {
        let builder = Builder::new(NOISE_PATTERN.parse().map_err(|_| CryptoError::BadPattern)?)
            .local_private_key(&*keypair.private);
        let state = match role {
            HandshakeRole::Initiator => builder.build_initiator(),
            HandshakeRole::Responder => builder.build_responder(),
        }
        .map_err(CryptoError::Noise)?;
        Ok(Self { state })
    }

    pub fn is_my_turn(&self) -> bool {
        self.state.is_my_turn()
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_handshake_finished()
    }

    pub fn write_message(&mut self) -> Result<Vec<u8>, CryptoError> {
        let mut msg = vec![0u8; MAX_NOISE_MSG];
        let len = self
            .state
            .write_message(&[], &mut msg)
            .map_err(CryptoError::Noise)?;
        msg.truncate(len);
        Ok(msg)
    }

    pub fn read_message(&mut self, msg: &[u8]) -> Result<(), CryptoError> {
        let mut payload = vec![0u8; msg.len()];
        self.state
            .read_message(msg, &mut payload)
            .map_err(CryptoError::Noise)?;
        Ok(())
    }

    /// Switch to transport mode. The remote static key becomes the peer's identity.
    pub fn finish(self) -> Result<NoiseTransport, CryptoError> {
        let remote: [u8; 32] = self
            .state
            .get_remote_static()
            .ok_or(CryptoError::NoRemoteStatic)?
            .try_into()
            .map_err(|_| CryptoError::NoRemoteStatic)?;
        let state = self
            .state
            .into_transport_mode()
            .map_err(CryptoError::Noise)?;
        Ok(NoiseTransport {
            state,
            remote: PeerId(remote),
        })
    }
}

/// A completed Noise_XX session over an ordered, reliable stream.
///
/// Uses the stateful TransportState; nonces are implicit and strictly
/// sequential: frames must arrive in order and none may be lost.
pub struct NoiseTransport {
    state: TransportState,
    remote: PeerId,
}

impl NoiseTransport {
    pub fn remote(&self) -> PeerId {
        self.remote
    }

    /// Encrypt `plaintext` into `out` (plaintext + 16-byte tag).
    pub fn encrypt(&mut self, plaintext: &[u8], out: &mut Vec<u8>) -> Result<(), CryptoError> {
        if plaintext.len() + NOISE_TAG_LEN > MAX_NOISE_MSG {
            return Err(CryptoError::TooLong(plaintext.len()));
        }
        out.resize(plaintext.len() + NOISE_TAG_LEN, 0);
        let written = self
            .state
            .write_message(plaintext, out)
            .map_err(CryptoError::Noise)?;
        out.truncate(written);
        Ok(())
    }

    /// Decrypt `ciphertext` into `out`, verifying the tag.
    pub fn decrypt(&mut self, ciphertext: &[u8], out: &mut Vec<u8>) -> Result<(), CryptoError> {
        if ciphertext.len() < NOISE_TAG_LEN {
            return Err(CryptoError::TooShort);
        }
        out.resize(ciphertext.len(), 0);
        let written = self
            .state
            .read_message(ciphertext, out)
            .map_err(CryptoError::Noise)?;
        out.truncate(written);
        Ok(())
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid Noise pattern string")]
    BadPattern,

    #[error("Noise protocol error: {0}")]
    Noise(#[from] snow::Error),

    #[error("ciphertext too short (need at least 16 bytes of MAC)")]
    TooShort,

    #[error("plaintext of {0} bytes exceeds one Noise message")]
    TooLong(usize),

    #[error("handshake finished without a remote static key")]
    NoRemoteStatic,

    #[error("not a 32-byte hex value: {0}")]
    BadHex(String),

    #[error("key file {0}: {1}")]
    KeyIo(String, std::io::Error),

    #[error("key file {0} does not hold a 32-byte private key")]
    BadKeyFile(String),
}

//! Secure channel upgrade: raw stream in, authenticated encrypted channel out.
//!
//! The handshake itself belongs to a `SecureTransport`. `NoiseSecureTransport`
//! runs Noise_XX over u16 length-prefixed frames. The upgrader consumes the
//! raw stream: on failure it is dropped, so a caller can never read or write
//! a half-upgraded connection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use capsule_core::crypto::{
    CryptoError, HandshakeRole, Keypair, NoiseHandshake, NoiseTransport, MAX_NOISE_MSG,
    NOISE_TAG_LEN,
};
use capsule_core::wire::FRAME_HEADER_LEN;
use capsule_core::PeerId;

/// Any bidirectional byte stream: TCP, an in-memory duplex, a relayed tunnel.
pub trait RawStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> RawStream for T {}

pub type BoxedStream = Box<dyn RawStream>;

/// Plaintext bytes per encrypted frame, after the one-byte continuation flag.
const MAX_CHUNK: usize = MAX_NOISE_MSG - NOISE_TAG_LEN - 1;

const FLAG_LAST: u8 = 0;
const FLAG_MORE: u8 = 1;

/// Largest reassembled message `recv` will accept.
pub const MAX_MESSAGE_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),
    #[error("handshake failed: {0}")]
    Handshake(#[from] CryptoError),
    #[error("stream I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("authenticated as {actual}, expected {expected}")]
    UnexpectedPeer { expected: PeerId, actual: PeerId },
    #[error("malformed secured frame")]
    BadFrame,
    #[error("message of {0} bytes exceeds the channel limit")]
    TooLarge(usize),
}

/// Performs the cryptographic handshake on a raw stream.
#[async_trait]
pub trait SecureTransport: Send + Sync {
    async fn handshake(
        &self,
        raw: BoxedStream,
        role: HandshakeRole,
    ) -> Result<SecuredChannel, SecurityError>;
}

/// Noise_XX_25519_ChaChaPoly_BLAKE2s with the node's static keypair.
pub struct NoiseSecureTransport {
    keypair: Arc<Keypair>,
    handshake_timeout: Duration,
}

impl NoiseSecureTransport {
    pub fn new(keypair: Arc<Keypair>, handshake_timeout: Duration) -> Self {
        Self {
            keypair,
            handshake_timeout,
        }
    }

    async fn run(
        &self,
        mut raw: BoxedStream,
        role: HandshakeRole,
    ) -> Result<SecuredChannel, SecurityError> {
        let mut noise = NoiseHandshake::new(&self.keypair, role)?;
        while !noise.is_finished() {
            if noise.is_my_turn() {
                let msg = noise.write_message()?;
                write_frame(&mut raw, &msg).await?;
            } else {
                let msg = read_frame(&mut raw).await?;
                noise.read_message(&msg)?;
            }
        }
        let transport = noise.finish()?;
        Ok(SecuredChannel::new(raw, transport))
    }
}

#[async_trait]
impl SecureTransport for NoiseSecureTransport {
    async fn handshake(
        &self,
        raw: BoxedStream,
        role: HandshakeRole,
    ) -> Result<SecuredChannel, SecurityError> {
        timeout(self.handshake_timeout, self.run(raw, role))
            .await
            .map_err(|_| SecurityError::Timeout(self.handshake_timeout))?
    }
}

/// Wraps raw streams into secured channels. Never retries.
#[derive(Clone)]
pub struct SecureChannelUpgrader {
    transport: Arc<dyn SecureTransport>,
}

impl SecureChannelUpgrader {
    pub fn new(transport: Arc<dyn SecureTransport>) -> Self {
        Self { transport }
    }

    pub async fn upgrade(
        &self,
        raw: impl RawStream,
        role: HandshakeRole,
    ) -> Result<SecuredChannel, SecurityError> {
        let channel = self.transport.handshake(Box::new(raw), role).await?;
        tracing::debug!(peer = %channel.remote(), ?role, "secure channel established");
        Ok(channel)
    }

    /// Upgrade and check the remote proved the identity we dialled.
    pub async fn upgrade_expecting(
        &self,
        raw: impl RawStream,
        expected: PeerId,
    ) -> Result<SecuredChannel, SecurityError> {
        let channel = self.upgrade(raw, HandshakeRole::Initiator).await?;
        if channel.remote() != expected {
            return Err(SecurityError::UnexpectedPeer {
                expected,
                actual: channel.remote(),
            });
        }
        Ok(channel)
    }
}

/// An authenticated, encrypted message channel.
///
/// Messages of any size up to `MAX_MESSAGE_LEN` are split across frames; each
/// frame's plaintext starts with a flag byte marking whether more follow.
pub struct SecuredChannel {
    stream: BoxedStream,
    noise: NoiseTransport,
    scratch: Vec<u8>,
}

impl SecuredChannel {
    fn new(stream: BoxedStream, noise: NoiseTransport) -> Self {
        Self {
            stream,
            noise,
            scratch: Vec::with_capacity(MAX_NOISE_MSG),
        }
    }

    /// Identity proven during the handshake.
    pub fn remote(&self) -> PeerId {
        self.noise.remote()
    }

    pub async fn send(&mut self, message: &[u8]) -> Result<(), SecurityError> {
        if message.len() > MAX_MESSAGE_LEN {
            return Err(SecurityError::TooLarge(message.len()));
        }
        let mut chunks = message.chunks(MAX_CHUNK).peekable();
        if chunks.peek().is_none() {
            return self.send_chunk(&[], FLAG_LAST).await;
        }
        while let Some(chunk) = chunks.next() {
            let flag = if chunks.peek().is_some() {
                FLAG_MORE
            } else {
                FLAG_LAST
            };
            self.send_chunk(chunk, flag).await?;
        }
        self.stream.flush().await?;
        Ok(())
    }

    async fn send_chunk(&mut self, chunk: &[u8], flag: u8) -> Result<(), SecurityError> {
        let mut plain = Vec::with_capacity(chunk.len() + 1);
        plain.push(flag);
        plain.extend_from_slice(chunk);
        self.noise.encrypt(&plain, &mut self.scratch)?;
        write_frame(&mut self.stream, &self.scratch).await
    }

    /// Next whole message, or `None` on a clean close between messages.
    pub async fn recv(&mut self) -> Result<Option<Bytes>, SecurityError> {
        let mut message = BytesMut::new();
        let mut first = true;
        loop {
            let frame = match read_frame(&mut self.stream).await {
                Ok(frame) => frame,
                Err(SecurityError::Io(e))
                    if first && e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(None)
                }
                Err(e) => return Err(e),
            };
            first = false;

            self.noise.decrypt(&frame, &mut self.scratch)?;
            let (&flag, body) = self.scratch.split_first().ok_or(SecurityError::BadFrame)?;
            if message.len() + body.len() > MAX_MESSAGE_LEN {
                return Err(SecurityError::TooLarge(message.len() + body.len()));
            }
            message.extend_from_slice(body);
            match flag {
                FLAG_LAST => return Ok(Some(message.freeze())),
                FLAG_MORE => continue,
                _ => return Err(SecurityError::BadFrame),
            }
        }
    }

    pub async fn close(mut self) -> Result<(), SecurityError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

async fn write_frame(stream: &mut BoxedStream, body: &[u8]) -> Result<(), SecurityError> {
    let len = u16::try_from(body.len()).map_err(|_| SecurityError::TooLarge(body.len()))?;
    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(body);
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_frame(stream: &mut BoxedStream) -> Result<Vec<u8>, SecurityError> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    stream.read_exact(&mut header).await?;
    let len = u16::from_be_bytes(header) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(body)
}

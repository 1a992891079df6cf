//! TCP transport: the listener that accepts secured streams and the
//! connector discovery uses to dial peers.
//!
//! Every connection is upgraded before anything else is read or written.
//! Inbound channels are handed to the protocol router; outbound channels
//! are held open by a per-peer task until either side closes.

use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use capsule_core::crypto::HandshakeRole;
use capsule_services::{
    Connector, DiscoveryError, PeerDirectory, PeerRecord, ProtocolRouter, SecureChannelUpgrader,
    SecuredChannel,
};

/// Bind a dual-stack listener on `port` (0 = OS-assigned).
pub fn bind(port: u16) -> Result<TcpListener> {
    let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP)).context("socket()")?;
    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket.set_only_v6(false).context("IPV6_V6ONLY")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;

    let addr = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0);
    socket.bind(&addr.into()).context("bind()")?;
    socket.listen(128).context("listen()")?;

    TcpListener::from_std(socket.into()).context("failed to convert to tokio TcpListener")
}

/// Accept, upgrade, and serve inbound connections until shutdown.
pub async fn accept_loop(
    listener: TcpListener,
    upgrader: SecureChannelUpgrader,
    router: Arc<ProtocolRouter>,
    directory: PeerDirectory,
    mut shutdown: broadcast::Receiver<()>,
) {
    tracing::info!(
        protocols = ?router.protocols(),
        "accepting secured streams"
    );
    loop {
        let (stream, from) = tokio::select! {
            _ = shutdown.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok(a) => a,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            },
        };
        let _ = stream.set_nodelay(true);

        let upgrader = upgrader.clone();
        let router = router.clone();
        let directory = directory.clone();
        tokio::spawn(async move {
            let channel = match upgrader.upgrade(stream, HandshakeRole::Responder).await {
                Ok(c) => c,
                Err(e) => {
                    tracing::debug!(%from, error = %e, "inbound upgrade failed");
                    return;
                }
            };
            let remote = channel.remote();
            directory.touch(&remote);
            if let Err(e) = router.serve(channel).await {
                tracing::debug!(peer = %remote, %from, error = %e, "stream ended with error");
            }
        });
    }
    tracing::info!("listener stopped");
}

/// Dials over TCP and keeps the secured channel open as the peer link.
pub struct TcpConnector {
    upgrader: SecureChannelUpgrader,
    directory: PeerDirectory,
}

impl TcpConnector {
    pub fn new(upgrader: SecureChannelUpgrader, directory: PeerDirectory) -> Self {
        Self {
            upgrader,
            directory,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, peer: &PeerRecord, addr: SocketAddr) -> Result<(), DiscoveryError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| DiscoveryError::Unreachable {
                addr,
                reason: e.to_string(),
            })?;
        let _ = stream.set_nodelay(true);
        let channel = self.upgrader.upgrade_expecting(stream, peer.id).await?;

        let directory = self.directory.clone();
        let id = peer.id;
        let link = tokio::spawn(async move {
            hold(channel).await;
            tracing::info!(peer = %id, "peer link closed");
            directory.mark_disconnected(&id);
        });
        self.directory.attach_task(&peer.id, link.abort_handle());
        Ok(())
    }
}

/// Wait until the remote closes the channel or it fails.
async fn hold(mut channel: SecuredChannel) {
    loop {
        match channel.recv().await {
            Ok(Some(_)) => continue,
            Ok(None) => return,
            Err(e) => {
                tracing::debug!(peer = %channel.remote(), error = %e, "peer link failed");
                return;
            }
        }
    }
}

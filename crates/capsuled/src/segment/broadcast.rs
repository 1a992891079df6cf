//! Local announcement broadcast.
//!
//! Periodically sends this node's `LocalAnnouncement` to the link-local
//! multicast group so nearby nodes learn where to dial it.

use std::net::SocketAddrV6;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::time;
use zerocopy::AsBytes;

use capsule_core::wire::LocalAnnouncement;
use capsule_core::PeerId;

use super::{multicast_group, ANNOUNCE_INTERVAL};

/// Announce `local` every `ANNOUNCE_INTERVAL` until shutdown.
pub async fn broadcast_loop(
    local: PeerId,
    listen_port: u16,
    interface_index: u32,
    announce_port: u16,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let socket = make_multicast_socket(interface_index)
        .context("failed to create multicast broadcast socket")?;
    let socket = UdpSocket::from_std(socket.into()).context("failed to convert to tokio UdpSocket")?;

    let dest = SocketAddrV6::new(multicast_group()?, announce_port, 0, interface_index);
    let announcement = LocalAnnouncement::new(local, listen_port);
    let mut interval = time::interval(ANNOUNCE_INTERVAL);

    tracing::info!(
        interface_index,
        listen_port,
        interval_secs = ANNOUNCE_INTERVAL.as_secs(),
        "local announcement broadcast starting"
    );

    loop {
        tokio::select! {
            _ = shutdown.recv() => return Ok(()),
            _ = interval.tick() => {
                match socket.send_to(announcement.as_bytes(), dest).await {
                    Ok(n) => tracing::trace!(bytes = n, "announcement sent"),
                    Err(e) => tracing::warn!(error = %e, "announcement send failed"),
                }
            }
        }
    }
}

/// UDP socket for sending IPv6 multicast on one interface.
fn make_multicast_socket(interface_index: u32) -> Result<Socket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;

    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket.set_multicast_if_v6(interface_index).context("IPV6_MULTICAST_IF")?;
    // TTL 1: link-local only
    socket.set_multicast_hops_v6(1).context("IPV6_MULTICAST_HOPS")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;

    Ok(socket)
}

//! Local announcement listener.
//!
//! Joins ff02::1 and hands every valid announcement from another node to
//! the discovery engine. Expiry of peers that go quiet is the directory's
//! job, not ours.

use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use capsule_core::wire::LocalAnnouncement;
use capsule_services::DiscoveryEngine;

use super::{candidate, multicast_group};

/// Feed heard announcements into `engine` until shutdown.
pub async fn listener_loop(
    engine: DiscoveryEngine,
    interface_index: u32,
    announce_port: u16,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let socket = make_listener_socket(interface_index, announce_port)
        .context("failed to create multicast listener socket")?;
    let socket = UdpSocket::from_std(socket).context("failed to convert to tokio UdpSocket")?;

    let local = engine.local_id();
    let mut buf = vec![0u8; 1024];

    tracing::info!(port = announce_port, "local announcement listener starting");

    loop {
        let (len, from) = tokio::select! {
            _ = shutdown.recv() => return Ok(()),
            received = socket.recv_from(&mut buf) => match received {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(error = %e, "recv_from failed");
                    continue;
                }
            },
        };

        let sender = match from {
            SocketAddr::V6(v6) => *v6.ip(),
            SocketAddr::V4(_) => {
                tracing::warn!("received IPv4 datagram on IPv6 socket, ignoring");
                continue;
            }
        };

        let announcement = match LocalAnnouncement::parse(&buf[..len]) {
            Ok(a) => a,
            Err(e) => {
                tracing::trace!(%from, error = %e, "ignoring datagram");
                continue;
            }
        };
        if announcement.peer_id() == local {
            tracing::trace!("ignoring own announcement");
            continue;
        }

        let record = candidate(&announcement, sender, interface_index);
        if engine.on_peer_found(record) {
            tracing::debug!(peer = %announcement.peer_id(), %from, "local peer found, dialling");
        }
    }
}

/// UDP socket joined to the multicast group on `interface_index`.
fn make_listener_socket(interface_index: u32, port: u16) -> Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;

    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket.set_only_v6(true).context("IPV6_V6ONLY")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;

    let bind_addr = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0);
    socket.bind(&bind_addr.into()).context("bind()")?;
    socket
        .join_multicast_v6(&multicast_group()?, interface_index)
        .context("IPV6_JOIN_GROUP")?;

    Ok(socket.into())
}

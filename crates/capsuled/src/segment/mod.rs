//! Local-segment discovery.
//!
//! Every node multicasts a `LocalAnnouncement` to ff02::1 on one interface
//! and listens for everyone else's. A heard announcement becomes a discovery
//! candidate; the discovery engine decides whether to dial it.

use std::ffi::CString;
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6, UdpSocket};
use std::time::Duration;

use anyhow::{Context, Result};

use capsule_core::wire::{LocalAnnouncement, MULTICAST_ADDR};
use capsule_services::PeerRecord;

pub mod broadcast;
pub mod listener;

/// How often this node announces itself on the segment.
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(5);

/// OS interface index for a named interface.
pub fn if_index(name: &str) -> Result<u32> {
    let name_cstr = CString::new(name).context("interface name contains null byte")?;
    let index = unsafe { libc::if_nametoindex(name_cstr.as_ptr()) };
    if index == 0 {
        anyhow::bail!("interface '{}' not found", name);
    }
    Ok(index)
}

/// The link-local address the kernel would source multicast from.
pub fn link_local_addr(interface_index: u32, announce_port: u16) -> Result<Ipv6Addr> {
    let probe = UdpSocket::bind("[::]:0")?;
    let dest = SocketAddrV6::new(multicast_group()?, announce_port, 0, interface_index);
    probe.connect(dest)?;
    match probe.local_addr()? {
        SocketAddr::V6(v6) => Ok(*v6.ip()),
        SocketAddr::V4(_) => anyhow::bail!("expected IPv6 local address"),
    }
}

pub(crate) fn multicast_group() -> Result<Ipv6Addr> {
    MULTICAST_ADDR
        .parse()
        .context("invalid multicast group address")
}

/// Candidate built from an announcement heard from `sender`.
pub(crate) fn candidate(
    announcement: &LocalAnnouncement,
    sender: Ipv6Addr,
    interface_index: u32,
) -> PeerRecord {
    let port = announcement.listen_port;
    let addr = SocketAddrV6::new(sender, port, 0, interface_index);
    PeerRecord::discovered(announcement.peer_id(), vec![SocketAddr::V6(addr)])
}

//! Socket construction and interface enumeration.
//!
//! The interface engine treats enumeration as a black box producing
//! `(name, address, internal)` tuples; everything platform-specific is
//! behind the `if-addrs` and `socket2` crates.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::UdpSocket;

pub(crate) const MDNS_PORT: u16 = 5353;
pub(crate) const MDNS_GROUP_V4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
pub(crate) const MDNS_GROUP_V6: Ipv6Addr = Ipv6Addr::new(0xFF02, 0, 0, 0, 0, 0, 0, 0xFB);

#[derive(Debug, Clone)]
pub(crate) struct IfaceAddress {
    pub name: String,
    pub address: IpAddr,
    pub internal: bool,
}

/// Every address of every OS network interface.
pub(crate) fn local_interfaces() -> Vec<IfaceAddress> {
    match if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces
            .into_iter()
            .map(|iface| IfaceAddress {
                internal: iface.is_loopback(),
                address: iface.ip(),
                name: iface.name,
            })
            .collect(),
        Err(error) => {
            tracing::warn!("unable to enumerate network interfaces: {error}");
            Vec::new()
        }
    }
}

pub(crate) fn local_addresses() -> Vec<IpAddr> {
    local_interfaces()
        .into_iter()
        .map(|iface| iface.address)
        .collect()
}

/// The shared multicast socket: 0.0.0.0:5353, address reuse so several
/// processes can answer, group membership on every usable address.
pub(crate) fn bind_shared(multicast_address: Option<Ipv4Addr>) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, MDNS_PORT)).into())?;

    // join on every non-loopback address; individual failures are
    // survivable as long as one of them sticks
    let mut joined = false;
    for iface in local_interfaces() {
        let IpAddr::V4(address) = iface.address else {
            continue;
        };
        if iface.internal {
            continue;
        }
        match socket.join_multicast_v4(&MDNS_GROUP_V4, &address) {
            Ok(()) => joined = true,
            Err(error) => {
                tracing::warn!(interface = %iface.name, "multicast join failed: {error}");
            }
        }
    }
    if !joined {
        socket.join_multicast_v4(&MDNS_GROUP_V4, &Ipv4Addr::UNSPECIFIED)?;
    }

    socket.set_multicast_loop_v4(true)?;
    socket.set_multicast_ttl_v4(255)?;
    if let Some(address) = multicast_address {
        socket.set_multicast_if_v4(&address)?;
    }

    UdpSocket::from_std(socket.into())
}

/// An ephemeral-port socket for one-shot queries. Its traffic shows up at
/// responders as legacy unicast DNS.
pub(crate) fn bind_ephemeral(multicast_address: Option<Ipv4Addr>) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)).into())?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_multicast_ttl_v4(255)?;
    if let Some(address) = multicast_address {
        socket.set_multicast_if_v4(&address)?;
    }

    UdpSocket::from_std(socket.into())
}

/// Traffic must never leave the local network. Without a routing table
/// the best approximation is address scope: private, link-local,
/// loopback and the mDNS groups pass, global unicast does not.
pub(crate) fn is_local_scope(address: IpAddr) -> bool {
    match address {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_link_local() || v4.is_loopback() || v4 == MDNS_GROUP_V4
        }
        IpAddr::V6(v6) => {
            v6.is_loopback() || (v6.segments()[0] & 0xFFC0) == 0xFE80 || v6 == MDNS_GROUP_V6
        }
    }
}

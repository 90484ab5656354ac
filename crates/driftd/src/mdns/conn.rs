//! Multicast sockets and interface discovery for mDNS.

use std::collections::BTreeMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use anyhow::{Context, Result};
use drift_core::dns::{mdns_v4, mdns_v6, MDNS_GROUP_V4, MDNS_GROUP_V6, MDNS_PORT};
use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::net::UdpSocket;

/// Multicast hop limit. Receivers drop anything that arrives with less.
const MULTICAST_HOPS: u32 = 255;

// ── Interfaces ────────────────────────────────────────────────────────────────

/// An up, multicast-capable, non-loopback interface and the addresses we
/// advertise on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub index: u32,
    pub v4: Option<Ipv4Addr>,
    /// At most one link-local and one routable address.
    pub v6: Vec<Ipv6Addr>,
}

impl Interface {
    pub fn addrs(&self) -> Vec<IpAddr> {
        self.v4
            .map(IpAddr::V4)
            .into_iter()
            .chain(self.v6.iter().copied().map(IpAddr::V6))
            .collect()
    }
}

/// Get the OS interface index for a named network interface.
pub fn if_index(name: &str) -> Result<u32> {
    let name_cstr = std::ffi::CString::new(name).context("interface name contains null byte")?;
    let index = unsafe { libc::if_nametoindex(name_cstr.as_ptr()) };
    if index == 0 {
        anyhow::bail!("interface '{}' not found", name);
    }
    Ok(index)
}

fn is_link_local(addr: &Ipv6Addr) -> bool {
    addr.segments()[0] & 0xffc0 == 0xfe80
}

/// Enumerate usable interfaces, restricted to `allow` when it is non-empty.
pub fn interfaces(allow: &[String]) -> Result<Vec<Interface>> {
    let wanted = InterfaceFlags::IFF_UP | InterfaceFlags::IFF_MULTICAST;
    let mut found: BTreeMap<String, Interface> = BTreeMap::new();

    for ifa in getifaddrs().context("getifaddrs")? {
        if !ifa.flags.contains(wanted) || ifa.flags.contains(InterfaceFlags::IFF_LOOPBACK) {
            continue;
        }
        if !allow.is_empty() && !allow.iter().any(|n| *n == ifa.interface_name) {
            continue;
        }
        let Some(addr) = ifa.address else {
            continue;
        };

        if !found.contains_key(&ifa.interface_name) {
            let index = match if_index(&ifa.interface_name) {
                Ok(index) => index,
                Err(e) => {
                    tracing::debug!(error = %e, "skipping interface");
                    continue;
                }
            };
            found.insert(
                ifa.interface_name.clone(),
                Interface {
                    name: ifa.interface_name.clone(),
                    index,
                    v4: None,
                    v6: Vec::new(),
                },
            );
        }
        let Some(iface) = found.get_mut(&ifa.interface_name) else {
            continue;
        };

        if let Some(sin) = addr.as_sockaddr_in() {
            iface.v4.get_or_insert(Ipv4Addr::from(sin.ip()));
        } else if let Some(sin6) = addr.as_sockaddr_in6() {
            let ip = sin6.ip();
            if !iface.v6.iter().any(|a| is_link_local(a) == is_link_local(&ip)) {
                iface.v6.push(ip);
            }
        }
    }

    Ok(found
        .into_values()
        .filter(|iface| iface.v4.is_some() || !iface.v6.is_empty())
        .collect())
}

// ── Sockets ───────────────────────────────────────────────────────────────────

/// One socket per address family bound to the mDNS port. Either may be
/// missing on hosts without that family, but not both.
#[derive(Debug)]
pub struct Sockets {
    pub v4: Option<UdpSocket>,
    pub v6: Option<UdpSocket>,
}

impl Sockets {
    pub fn open() -> Result<Self> {
        let v4 = match make_v4_socket() {
            Ok(s) => Some(s),
            Err(e) => {
                tracing::warn!(error = %e, "IPv4 mDNS socket unavailable");
                None
            }
        };
        let v6 = match make_v6_socket() {
            Ok(s) => Some(s),
            Err(e) => {
                tracing::warn!(error = %e, "IPv6 mDNS socket unavailable");
                None
            }
        };
        if v4.is_none() && v6.is_none() {
            anyhow::bail!("could not open any mDNS socket on port {MDNS_PORT}");
        }
        Ok(Self {
            v4: v4.map(UdpSocket::from_std).transpose()?,
            v6: v6.map(UdpSocket::from_std).transpose()?,
        })
    }

    /// Join the mDNS groups on `iface`. Already-joined groups are fine.
    pub fn join(&self, iface: &Interface) {
        if let (Some(sock), Some(addr)) = (&self.v4, iface.v4) {
            if let Err(e) = sock.join_multicast_v4(MDNS_GROUP_V4, addr) {
                tracing::debug!(iface = %iface.name, error = %e, "IPv4 group join");
            }
        }
        if let (Some(sock), false) = (&self.v6, iface.v6.is_empty()) {
            if let Err(e) = sock.join_multicast_v6(&MDNS_GROUP_V6, iface.index) {
                tracing::debug!(iface = %iface.name, error = %e, "IPv6 group join");
            }
        }
    }

    /// Send `packet` to the mDNS group on `iface` over every family it has.
    pub async fn send_multicast(&self, iface: &Interface, packet: &[u8]) {
        if let (Some(sock), Some(addr)) = (&self.v4, iface.v4) {
            let sent = match SockRef::from(sock).set_multicast_if_v4(&addr) {
                Ok(()) => sock.send_to(packet, mdns_v4()).await.map(drop),
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                tracing::debug!(iface = %iface.name, error = %e, "IPv4 multicast send failed");
            }
        }
        if let (Some(sock), false) = (&self.v6, iface.v6.is_empty()) {
            let sent = match SockRef::from(sock).set_multicast_if_v6(iface.index) {
                Ok(()) => sock.send_to(packet, mdns_v6(iface.index)).await.map(drop),
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                tracing::debug!(iface = %iface.name, error = %e, "IPv6 multicast send failed");
            }
        }
    }

    pub async fn send_unicast(&self, to: SocketAddr, packet: &[u8]) -> io::Result<()> {
        let sock = match to {
            SocketAddr::V4(_) => self.v4.as_ref(),
            SocketAddr::V6(_) => self.v6.as_ref(),
        };
        let sock = sock.ok_or_else(|| io::Error::new(io::ErrorKind::Unsupported, "no socket for family"))?;
        sock.send_to(packet, to).await.map(drop)
    }
}

/// Receive on `sock`, or never if the family is unavailable.
pub async fn recv_from(sock: Option<&UdpSocket>, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
    match sock {
        Some(sock) => sock.recv_from(buf).await,
        None => std::future::pending().await,
    }
}

fn make_v4_socket() -> Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;

    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    #[cfg(unix)]
    socket.set_reuse_port(true).context("SO_REUSEPORT")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;
    socket.set_multicast_ttl_v4(MULTICAST_HOPS).context("IP_MULTICAST_TTL")?;
    socket.set_multicast_loop_v4(true).context("IP_MULTICAST_LOOP")?;

    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, MDNS_PORT);
    socket.bind(&bind_addr.into()).context("bind()")?;

    Ok(socket.into())
}

fn make_v6_socket() -> Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;

    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    #[cfg(unix)]
    socket.set_reuse_port(true).context("SO_REUSEPORT")?;
    socket.set_only_v6(true).context("IPV6_V6ONLY")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;
    socket.set_multicast_hops_v6(MULTICAST_HOPS).context("IPV6_MULTICAST_HOPS")?;
    socket.set_multicast_loop_v6(true).context("IPV6_MULTICAST_LOOP")?;

    let bind_addr = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, MDNS_PORT, 0, 0);
    socket.bind(&bind_addr.into()).context("bind()")?;

    Ok(socket.into())
}

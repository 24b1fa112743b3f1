use std::fmt::Display;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};

/// Used when no destination is given: any globally routed address selects the default route
pub const DEFAULT_PROBE_DESTINATION: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);
const PROBE_PORT: u16 = 53;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Address(Ipv4Addr),
    Host(String),
}

impl From<Ipv4Addr> for Destination {
    fn from(ip: Ipv4Addr) -> Self {
        Destination::Address(ip)
    }
}

impl From<&str> for Destination {
    fn from(host: &str) -> Self {
        match host.parse() {
            Ok(ip) => Destination::Address(ip),
            Err(_) => Destination::Host(host.to_string()),
        }
    }
}

impl From<String> for Destination {
    fn from(host: String) -> Self {
        Destination::from(host.as_str())
    }
}

impl Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Destination::Address(ip) => write!(f, "{ip}"),
            Destination::Host(host) => write!(f, "{host}"),
        }
    }
}

/// Address of the local interface that traffic to `destination` would leave through.
///
/// Connecting a UDP socket only performs route selection, so nothing is sent and the destination
/// does not have to be reachable. Falls back to `127.0.0.1` if no route can be determined.
pub fn resolve_egress_ipv4(destination: impl Into<Destination>) -> Ipv4Addr {
    let destination = destination.into();
    match try_resolve_egress_ipv4(&destination) {
        Ok(ip) => ip,
        Err(e) => {
            tracing::event!(
                tracing::Level::DEBUG,
                destination = %destination,
                error = %e,
                "EGRESS_RESOLUTION_FAILED"
            );
            Ipv4Addr::LOCALHOST
        }
    }
}

fn try_resolve_egress_ipv4(destination: &Destination) -> std::io::Result<Ipv4Addr> {
    let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    match destination {
        Destination::Address(ip) => socket.connect((*ip, PROBE_PORT))?,
        Destination::Host(host) => socket.connect((host.as_str(), PROBE_PORT))?,
    }
    match socket.local_addr()? {
        SocketAddr::V4(local) => Ok(*local.ip()),
        SocketAddr::V6(local) => Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            format!("resolved to non-IPv4 address {local}"),
        )),
    }
}

/// The socket unicast clients send their streams to
pub fn bind_unicast_socket(bind_addr: SocketAddrV4) -> std::io::Result<tokio::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddr::V4(bind_addr).into())?;

    let std_socket: std::net::UdpSocket = socket.into();
    std_socket.set_nonblocking(true)?;
    tokio::net::UdpSocket::from_std(std_socket)
}

/// The socket translated streams are published from
pub fn multicast_socket(source_ip: Ipv4Addr, ttl: u32) -> std::io::Result<tokio::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_multicast_ttl_v4(ttl)?;

    // Without an explicit interface the kernel picks one from the routing table, which is
    // usually the same interface anyway
    if let Err(e) = socket.set_multicast_if_v4(&source_ip) {
        tracing::event!(
            tracing::Level::WARN,
            source_ip = %source_ip,
            error = %e,
            "MULTICAST_INTERFACE_NOT_SET"
        );
    }

    socket.bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).into())?;

    let std_socket: std::net::UdpSocket = socket.into();
    std_socket.set_nonblocking(true)?;
    tokio::net::UdpSocket::from_std(std_socket)
}

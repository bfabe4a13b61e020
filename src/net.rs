//! Socket construction helpers

use std::{
    io::{self, ErrorKind},
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs},
};

use mio::net::{TcpListener, UdpSocket};
use socket2::{Domain, Protocol, Socket, Type};

/// Listen backlog of relay listeners
pub const LISTEN_BACKLOG: i32 = 1024;

/// Address family
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AddrFamily {
    Ipv4,
    Ipv6,
}

impl From<&SocketAddr> for AddrFamily {
    fn from(addr: &SocketAddr) -> AddrFamily {
        match *addr {
            SocketAddr::V4(..) => AddrFamily::Ipv4,
            SocketAddr::V6(..) => AddrFamily::Ipv6,
        }
    }
}

impl AddrFamily {
    /// Wildcard address with an ephemeral port of this family
    pub fn unspecified(self) -> SocketAddr {
        match self {
            AddrFamily::Ipv4 => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            AddrFamily::Ipv6 => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        }
    }
}

/// Create a non-blocking TCP listener bound to `addr` with `SO_REUSEADDR`
pub fn create_tcp_listener(addr: &SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&(*addr).into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(TcpListener::from_std(socket.into()))
}

/// Create a non-blocking UDP socket bound to `addr`
pub fn create_udp_socket(addr: &SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(*addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&(*addr).into())?;
    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket.into()))
}

/// Blocking resolution of `host:port`, first address wins
///
/// Only meant for startup and the UDP relay's synchronous cache.
pub fn lookup_host(host: &str, port: u16) -> io::Result<SocketAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    match (host, port).to_socket_addrs()?.next() {
        Some(addr) => Ok(addr),
        None => Err(io::Error::new(
            ErrorKind::AddrNotAvailable,
            format!("{host} resolved to no address"),
        )),
    }
}

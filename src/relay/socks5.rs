//! Socks5 protocol definition (RFC1928)
//!
//! Only the parts the relay speaks are implemented: method selection with the
//! no-authentication method, CONNECT / UDP ASSOCIATE requests and the address
//! header shared by the SOCKS5 control channel, the relay channel and UDP datagrams.
//!
//! All parsers work on already received byte slices, they never block and never
//! read past the end of the slice they were given.

use std::{
    fmt::{self, Debug, Formatter},
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
};

use bytes::{BufMut, BytesMut};

pub use self::consts::{
    SOCKS5_AUTH_METHOD_GSSAPI,
    SOCKS5_AUTH_METHOD_NONE,
    SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE,
    SOCKS5_AUTH_METHOD_PASSWORD,
    SOCKS5_VERSION,
};

#[rustfmt::skip]
mod consts {
    pub const SOCKS5_VERSION:                          u8 = 0x05;

    pub const SOCKS5_AUTH_METHOD_NONE:                 u8 = 0x00;
    pub const SOCKS5_AUTH_METHOD_GSSAPI:               u8 = 0x01;
    pub const SOCKS5_AUTH_METHOD_PASSWORD:             u8 = 0x02;
    pub const SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE:       u8 = 0xff;

    pub const SOCKS5_CMD_TCP_CONNECT:                  u8 = 0x01;
    pub const SOCKS5_CMD_TCP_BIND:                     u8 = 0x02;
    pub const SOCKS5_CMD_UDP_ASSOCIATE:                u8 = 0x03;

    pub const SOCKS5_ADDR_TYPE_IPV4:                   u8 = 0x01;
    pub const SOCKS5_ADDR_TYPE_DOMAIN_NAME:            u8 = 0x03;
    pub const SOCKS5_ADDR_TYPE_IPV6:                   u8 = 0x04;

    // Upper bits of ATYP are reserved for flags by some implementations
    pub const SOCKS5_ADDR_TYPE_MASK:                   u8 = 0x0f;

    pub const SOCKS5_REPLY_SUCCEEDED:                  u8 = 0x00;
    pub const SOCKS5_REPLY_GENERAL_FAILURE:            u8 = 0x01;
    pub const SOCKS5_REPLY_CONNECTION_NOT_ALLOWED:     u8 = 0x02;
    pub const SOCKS5_REPLY_NETWORK_UNREACHABLE:        u8 = 0x03;
    pub const SOCKS5_REPLY_HOST_UNREACHABLE:           u8 = 0x04;
    pub const SOCKS5_REPLY_CONNECTION_REFUSED:         u8 = 0x05;
    pub const SOCKS5_REPLY_TTL_EXPIRED:                u8 = 0x06;
    pub const SOCKS5_REPLY_COMMAND_NOT_SUPPORTED:      u8 = 0x07;
    pub const SOCKS5_REPLY_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;
}

/// SOCKS5 command
#[derive(Clone, Debug, Copy, PartialEq, Eq)]
pub enum Command {
    /// CONNECT command (TCP tunnel)
    TcpConnect,
    /// BIND command (not supported)
    TcpBind,
    /// UDP ASSOCIATE command
    UdpAssociate,
}

impl Command {
    #[inline]
    #[rustfmt::skip]
    pub fn from_u8(code: u8) -> Option<Command> {
        match code {
            consts::SOCKS5_CMD_TCP_CONNECT   => Some(Command::TcpConnect),
            consts::SOCKS5_CMD_TCP_BIND      => Some(Command::TcpBind),
            consts::SOCKS5_CMD_UDP_ASSOCIATE => Some(Command::UdpAssociate),
            _                                => None,
        }
    }
}

/// SOCKS5 reply code
#[derive(Clone, Debug, Copy, PartialEq, Eq)]
pub enum Reply {
    Succeeded,
    GeneralFailure,
    ConnectionNotAllowed,
    NetworkUnreachable,
    HostUnreachable,
    ConnectionRefused,
    TtlExpired,
    CommandNotSupported,
    AddressTypeNotSupported,

    OtherReply(u8),
}

impl Reply {
    #[inline]
    #[rustfmt::skip]
    pub fn as_u8(self) -> u8 {
        match self {
            Reply::Succeeded               => consts::SOCKS5_REPLY_SUCCEEDED,
            Reply::GeneralFailure          => consts::SOCKS5_REPLY_GENERAL_FAILURE,
            Reply::ConnectionNotAllowed    => consts::SOCKS5_REPLY_CONNECTION_NOT_ALLOWED,
            Reply::NetworkUnreachable      => consts::SOCKS5_REPLY_NETWORK_UNREACHABLE,
            Reply::HostUnreachable         => consts::SOCKS5_REPLY_HOST_UNREACHABLE,
            Reply::ConnectionRefused       => consts::SOCKS5_REPLY_CONNECTION_REFUSED,
            Reply::TtlExpired              => consts::SOCKS5_REPLY_TTL_EXPIRED,
            Reply::CommandNotSupported     => consts::SOCKS5_REPLY_COMMAND_NOT_SUPPORTED,
            Reply::AddressTypeNotSupported => consts::SOCKS5_REPLY_ADDRESS_TYPE_NOT_SUPPORTED,
            Reply::OtherReply(c)           => c,
        }
    }
}

/// SOCKS5 protocol error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("address type {0:#x} not supported")]
    AddressTypeNotSupported(u8),
    #[error("address domain name must be UTF-8 encoding")]
    AddressDomainInvalidEncoding,
    #[error("address domain name is empty")]
    AddressDomainEmpty,
    #[error("header truncated, {0} bytes available")]
    Truncated(usize),
    #[error("unsupported socks version {0:#x}")]
    UnsupportedSocksVersion(u8),
    #[error("unsupported command {0:#x}")]
    UnsupportedCommand(u8),
    #[error("malformed method selection header")]
    BadHeader,
    #[error("none of the requested authentication methods is acceptable")]
    NoAcceptableMethods,
}

/// SOCKS5 address type
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Address {
    /// Socket address (IP Address)
    SocketAddress(SocketAddr),
    /// Domain name address
    DomainNameAddress(String, u16),
}

impl Address {
    /// Parse an address from the beginning of `buf`
    ///
    /// Returns the address and the number of bytes it occupied.
    pub fn read_from_slice(buf: &[u8]) -> Result<(Address, usize), Error> {
        if buf.is_empty() {
            return Err(Error::Truncated(0));
        }

        let atyp = buf[0] & consts::SOCKS5_ADDR_TYPE_MASK;
        match atyp {
            consts::SOCKS5_ADDR_TYPE_IPV4 => {
                if buf.len() < 1 + 4 + 2 {
                    return Err(Error::Truncated(buf.len()));
                }
                let addr = Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]);
                let port = u16::from_be_bytes([buf[5], buf[6]]);
                Ok((Address::SocketAddress(SocketAddr::V4(SocketAddrV4::new(addr, port))), 7))
            }
            consts::SOCKS5_ADDR_TYPE_IPV6 => {
                if buf.len() < 1 + 16 + 2 {
                    return Err(Error::Truncated(buf.len()));
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[1..17]);
                let addr = Ipv6Addr::from(octets);
                let port = u16::from_be_bytes([buf[17], buf[18]]);
                Ok((
                    Address::SocketAddress(SocketAddr::V6(SocketAddrV6::new(addr, port, 0, 0))),
                    19,
                ))
            }
            consts::SOCKS5_ADDR_TYPE_DOMAIN_NAME => {
                if buf.len() < 2 {
                    return Err(Error::Truncated(buf.len()));
                }
                let domain_len = buf[1] as usize;
                if domain_len == 0 {
                    return Err(Error::AddressDomainEmpty);
                }

                // ATYP + LEN + DOMAIN + PORT
                let total_len = 2 + domain_len + 2;
                if buf.len() < total_len {
                    return Err(Error::Truncated(buf.len()));
                }
                let domain = std::str::from_utf8(&buf[2..2 + domain_len])
                    .map_err(|_| Error::AddressDomainInvalidEncoding)?;
                let port = u16::from_be_bytes([buf[2 + domain_len], buf[3 + domain_len]]);
                Ok((Address::DomainNameAddress(domain.to_owned(), port), total_len))
            }
            _ => Err(Error::AddressTypeNotSupported(buf[0])),
        }
    }

    /// Writes to buffer
    #[inline]
    pub fn write_to_buf<B: BufMut>(&self, buf: &mut B) {
        write_address(self, buf)
    }

    /// Get required buffer size for serializing
    #[inline]
    pub fn serialized_len(&self) -> usize {
        get_addr_len(self)
    }

    /// Get associated port number
    pub fn port(&self) -> u16 {
        match *self {
            Address::SocketAddress(addr) => addr.port(),
            Address::DomainNameAddress(.., port) => port,
        }
    }

    /// Get host address string
    pub fn host(&self) -> String {
        match *self {
            Address::SocketAddress(ref addr) => addr.ip().to_string(),
            Address::DomainNameAddress(ref domain, ..) => domain.to_owned(),
        }
    }
}

impl Debug for Address {
    #[inline]
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match *self {
            Address::SocketAddress(ref addr) => write!(f, "{addr}"),
            Address::DomainNameAddress(ref addr, ref port) => write!(f, "{addr}:{port}"),
        }
    }
}

impl fmt::Display for Address {
    #[inline]
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match *self {
            Address::SocketAddress(ref addr) => write!(f, "{addr}"),
            Address::DomainNameAddress(ref addr, ref port) => write!(f, "{addr}:{port}"),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(s: SocketAddr) -> Address {
        Address::SocketAddress(s)
    }
}

impl From<(String, u16)> for Address {
    fn from((dn, port): (String, u16)) -> Address {
        Address::DomainNameAddress(dn, port)
    }
}

fn write_ipv4_address<B: BufMut>(addr: &SocketAddrV4, buf: &mut B) {
    buf.put_u8(consts::SOCKS5_ADDR_TYPE_IPV4); // Address type
    buf.put_slice(&addr.ip().octets()); // Ipv4 bytes
    buf.put_u16(addr.port()); // Port
}

fn write_ipv6_address<B: BufMut>(addr: &SocketAddrV6, buf: &mut B) {
    buf.put_u8(consts::SOCKS5_ADDR_TYPE_IPV6); // Address type
    buf.put_slice(&addr.ip().octets()); // Ipv6 bytes
    buf.put_u16(addr.port()); // Port
}

fn write_domain_name_address<B: BufMut>(dnaddr: &str, port: u16, buf: &mut B) {
    assert!(
        dnaddr.len() <= u8::MAX as usize,
        "domain name length must be smaller than 256"
    );

    buf.put_u8(consts::SOCKS5_ADDR_TYPE_DOMAIN_NAME);
    buf.put_u8(dnaddr.len() as u8);
    buf.put_slice(dnaddr.as_bytes());
    buf.put_u16(port);
}

fn write_address<B: BufMut>(addr: &Address, buf: &mut B) {
    match *addr {
        Address::SocketAddress(SocketAddr::V4(ref addr)) => write_ipv4_address(addr, buf),
        Address::SocketAddress(SocketAddr::V6(ref addr)) => write_ipv6_address(addr, buf),
        Address::DomainNameAddress(ref dnaddr, port) => write_domain_name_address(dnaddr, port, buf),
    }
}

#[inline]
fn get_addr_len(atyp: &Address) -> usize {
    match *atyp {
        Address::SocketAddress(SocketAddr::V4(..)) => 1 + 4 + 2,
        Address::SocketAddress(SocketAddr::V6(..)) => 1 + 8 * 2 + 2,
        Address::DomainNameAddress(ref dmname, _) => 1 + 1 + dmname.len() + 2,
    }
}

/// Destination descriptor parsed from the head of a buffer
///
/// ```plain
/// +------+----------+----------+
/// | ATYP | DST.ADDR | DST.PORT |
/// +------+----------+----------+
/// |  1   | Variable |    2     |
/// +------+----------+----------+
/// ```
///
/// `header_length` is the exact number of bytes the header occupied, callers slice
/// the trailing payload with it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddressHeader {
    pub address: Address,
    pub header_length: usize,
}

impl AddressHeader {
    pub fn parse(buf: &[u8]) -> Result<AddressHeader, Error> {
        let (address, header_length) = Address::read_from_slice(buf)?;
        Ok(AddressHeader { address, header_length })
    }

    /// Textual host, either an IP literal or a domain name
    pub fn host(&self) -> String {
        self.address.host()
    }

    pub fn port(&self) -> u16 {
        self.address.port()
    }
}

/// Validate a method selection message
///
/// ```plain
/// +----+----------+----------+
/// |VER | NMETHODS | METHODS  |
/// +----+----------+----------+
/// | 1  |    1     | 1 to 255 |
/// +----+----------+----------+
/// ```
///
/// Fails with `Error::BadHeader` when the message is structurally malformed, and with
/// `Error::NoAcceptableMethods` when the client did not offer the no-authentication method.
pub fn check_auth_methods(buf: &[u8]) -> Result<(), Error> {
    // VER, NMETHODS, and at least 1 METHODS
    if buf.len() < 3 {
        return Err(Error::BadHeader);
    }

    if buf[0] != consts::SOCKS5_VERSION {
        return Err(Error::UnsupportedSocksVersion(buf[0]));
    }

    let nmethods = buf[1] as usize;
    if nmethods < 1 || buf.len() != nmethods + 2 {
        return Err(Error::BadHeader);
    }

    if buf[2..].contains(&consts::SOCKS5_AUTH_METHOD_NONE) {
        Ok(())
    } else {
        Err(Error::NoAcceptableMethods)
    }
}

/// Method selection reply
///
/// ```plain
/// +----+--------+
/// |VER | METHOD |
/// +----+--------+
/// | 1  |   1    |
/// +----+--------+
/// ```
pub fn handshake_response(chosen_method: u8) -> [u8; 2] {
    [consts::SOCKS5_VERSION, chosen_method]
}

/// TCP request header after handshake, without the address part
///
/// ```plain
/// +----+-----+-------+------+----------+----------+
/// |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
///
/// Returns the raw command byte. The address starts at `TCP_REQUEST_PREFIX_LEN`.
pub fn read_request_command(buf: &[u8]) -> Result<u8, Error> {
    if buf.len() < TCP_REQUEST_PREFIX_LEN {
        return Err(Error::Truncated(buf.len()));
    }
    if buf[0] != consts::SOCKS5_VERSION {
        return Err(Error::UnsupportedSocksVersion(buf[0]));
    }
    Ok(buf[1])
}

/// Length of `VER CMD RSV` in front of a TCP request's address
pub const TCP_REQUEST_PREFIX_LEN: usize = 3;

/// TCP response header
///
/// ```plain
/// +----+-----+-------+------+----------+----------+
/// |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
#[derive(Clone, Debug)]
pub struct TcpResponseHeader {
    /// SOCKS5 reply
    pub reply: Reply,
    /// Reply address
    pub address: Address,
}

impl TcpResponseHeader {
    /// Creates a response header
    pub fn new(reply: Reply, address: Address) -> TcpResponseHeader {
        TcpResponseHeader { reply, address }
    }

    /// Write to a mutable buffer
    pub fn write_to_buf<B: BufMut>(&self, buf: &mut B) {
        let TcpResponseHeader { ref reply, ref address } = *self;
        buf.put_slice(&[consts::SOCKS5_VERSION, reply.as_u8(), 0x00]);
        address.write_to_buf(buf);
    }

    /// Serialize into a fresh buffer
    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.serialized_len());
        self.write_to_buf(&mut buf);
        buf
    }

    /// Length in bytes
    #[inline]
    pub fn serialized_len(&self) -> usize {
        self.address.serialized_len() + 3
    }
}

/// The reply sent to a CONNECT request before the destination is known
pub fn unspecified_bound_address() -> Address {
    Address::SocketAddress(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
}

/// UDP ASSOCIATE request header
///
/// ```plain
/// +----+------+------+----------+----------+----------+
/// |RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
/// +----+------+------+----------+----------+----------+
/// | 2  |  1   |  1   | Variable |    2     | Variable |
/// +----+------+------+----------+----------+----------+
/// ```
#[derive(Clone, Debug)]
pub struct UdpAssociateHeader {
    /// Fragment
    pub frag: u8,
    /// Remote address
    pub address: Address,
}

/// Length of `RSV RSV FRAG` in front of a UDP datagram's address
pub const UDP_ASSOCIATE_PREFIX_LEN: usize = 3;

impl UdpAssociateHeader {
    /// Creates a header
    pub fn new(frag: u8, address: Address) -> UdpAssociateHeader {
        UdpAssociateHeader { frag, address }
    }

    /// Read the `FRAG` field, failing on datagrams too short to carry an address
    pub fn read_frag(buf: &[u8]) -> Result<u8, Error> {
        if buf.len() <= UDP_ASSOCIATE_PREFIX_LEN {
            return Err(Error::Truncated(buf.len()));
        }
        Ok(buf[2])
    }

    /// Write to a mutable buffer
    pub fn write_to_buf<B: BufMut>(&self, buf: &mut B) {
        let UdpAssociateHeader { ref frag, ref address } = *self;
        buf.put_slice(&[0x00, 0x00, *frag]);
        address.write_to_buf(buf);
    }

    /// Length in bytes
    #[inline]
    pub fn serialized_len(&self) -> usize {
        UDP_ASSOCIATE_PREFIX_LEN + self.address.serialized_len()
    }
}

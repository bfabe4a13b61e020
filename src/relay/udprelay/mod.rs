//! UDP relay
//!
//! ```plain
//! SOCKS5 UDP request / response
//! +----+------+------+----------+----------+----------+
//! |RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
//! +----+------+------+----------+----------+----------+
//! | 2  |  1   |  1   | Variable |    2     | Variable |
//! +----+------+------+----------+----------+----------+
//!
//! Relay request / response
//! +------+----------+----------+----------+
//! | ATYP | DST.ADDR | DST.PORT |   DATA   |
//! +------+----------+----------+----------+
//! |  1   | Variable |    2     | Variable |
//! +------+----------+----------+----------+
//! ```
//!
//! Every client address gets its own outbound socket, so replies find their way back
//! without any per packet bookkeeping. Idle associations are closed by the periodic
//! sweep.

use std::{
    cell::RefCell,
    collections::HashMap,
    io::{self, ErrorKind},
    net::{IpAddr, SocketAddr},
    os::unix::io::AsRawFd,
    rc::{Rc, Weak},
    time::Duration,
};

use byte_string::ByteStr;
use bytes::{BufMut, BytesMut};
use log::{debug, error, info, trace, warn};
use lru_time_cache::LruCache;
use mio::net::UdpSocket;

use crate::{
    cache::TimeCache,
    config::Config,
    event_loop::{EventLoop, PeriodicHandler, Ready, SocketHandler, SocketId},
    net::{create_udp_socket, lookup_host, AddrFamily},
    relay::socks5::{Address, AddressHeader, UdpAssociateHeader, UDP_ASSOCIATE_PREFIX_LEN},
};

/// Largest datagram handled
pub const MAXIMUM_UDP_PAYLOAD_SIZE: usize = 65536;

/// Default idle timeout of an association
pub const DEFAULT_UDP_TIMEOUT: Duration = Duration::from_secs(300);

const DNS_CACHE_CAPACITY: usize = 256;

/// Association key: the client's address plus the family of the forwarding target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NatKey {
    pub client_ip: IpAddr,
    pub client_port: u16,
    pub family: AddrFamily,
}

impl NatKey {
    fn new(client: &SocketAddr, target: &SocketAddr) -> NatKey {
        NatKey {
            client_ip: client.ip(),
            client_port: client.port(),
            family: AddrFamily::from(target),
        }
    }
}

struct Association {
    socket: UdpSocket,
    client: SocketAddr,
    key: NatKey,
}

struct UdpRelayInner {
    listener: Option<UdpSocket>,
    listener_id: SocketId,
    added: bool,
    closed: bool,
    dns_cache: LruCache<String, IpAddr>,
    nat: TimeCache<NatKey, SocketId>,
    associations: HashMap<SocketId, Association>,
}

/// UDP relay of either role
pub struct UdpRelay {
    is_local: bool,
    /// Upstream relay server, client role only
    server_host: String,
    server_port: u16,
    local_addr: SocketAddr,
    inner: RefCell<UdpRelayInner>,
    me: Weak<UdpRelay>,
}

impl UdpRelay {
    /// Bind on the same address the TCP relay of `config`'s role listens on
    pub fn new(config: &Config) -> io::Result<Rc<UdpRelay>> {
        let (host, port) = config.listen_address();
        let addr = lookup_host(host, port)?;
        UdpRelay::bind(
            &addr,
            config.is_local(),
            config.server_address.clone(),
            config.server_port,
            config.udp_timeout,
        )
    }

    pub fn bind(
        addr: &SocketAddr,
        is_local: bool,
        server_host: String,
        server_port: u16,
        timeout: Duration,
    ) -> io::Result<Rc<UdpRelay>> {
        let listener = create_udp_socket(addr)?;
        let local_addr = listener.local_addr()?;
        let listener_id = listener.as_raw_fd();

        info!(
            "udp relay ({}) listening on {}, association timeout {:?}",
            if is_local { "local" } else { "server" },
            local_addr,
            timeout
        );

        Ok(Rc::new_cyclic(|me| UdpRelay {
            is_local,
            server_host,
            server_port,
            local_addr,
            inner: RefCell::new(UdpRelayInner {
                listener: Some(listener),
                listener_id,
                added: false,
                closed: false,
                dns_cache: LruCache::with_expiry_duration_and_capacity(timeout, DNS_CACHE_CAPACITY),
                nat: TimeCache::new(timeout.as_millis() as u64),
                associations: HashMap::new(),
            }),
            me: me.clone(),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of live associations
    pub fn association_count(&self) -> usize {
        self.inner.borrow().associations.len()
    }

    /// Register the listener and the expiry sweep
    pub fn add_to_loop(&self, event_loop: &mut EventLoop) -> io::Result<()> {
        let me = match self.me.upgrade() {
            Some(me) => me,
            None => return Err(io::Error::new(ErrorKind::Other, "udp relay is being dropped")),
        };

        let mut inner = self.inner.borrow_mut();
        if inner.added {
            return Err(io::Error::new(ErrorKind::Other, "udp relay already added to a loop"));
        }
        if inner.closed {
            return Err(io::Error::new(ErrorKind::Other, "udp relay already closed"));
        }

        event_loop.add(inner.listener_id, Ready::READABLE | Ready::ERROR, me.clone())?;
        event_loop.add_periodic(me);
        inner.added = true;
        Ok(())
    }

    /// Close the listener and every association
    pub fn close(&self, event_loop: &mut EventLoop) {
        let mut inner = self.inner.borrow_mut();
        if inner.closed {
            return;
        }
        inner.closed = true;
        info!("udp relay on {} closing", self.local_addr);

        if let Err(err) = event_loop.remove(inner.listener_id) {
            warn!("failed to remove udp listener from loop, error: {}", err);
        }
        inner.listener = None;

        for (id, assoc) in inner.associations.drain() {
            let _ = event_loop.remove(id);
            debug!("udp association of {} closed", assoc.client);
        }
        inner.nat.clear();

        if let Some(me) = self.me.upgrade() {
            let me: Rc<dyn PeriodicHandler> = me;
            event_loop.remove_periodic(&me);
        }
    }

    fn resolve(&self, inner: &mut UdpRelayInner, host: &str, port: u16) -> io::Result<SocketAddr> {
        if let Some(ip) = inner.dns_cache.get(host) {
            return Ok(SocketAddr::new(*ip, port));
        }
        let addr = lookup_host(host, port)?;
        inner.dns_cache.insert(host.to_owned(), addr.ip());
        Ok(addr)
    }

    /// Datagrams from clients (client role) or from client relays (server role)
    fn handle_listener(&self, event_loop: &mut EventLoop) {
        let mut buffer = vec![0u8; MAXIMUM_UDP_PAYLOAD_SIZE];
        loop {
            let mut inner = self.inner.borrow_mut();
            let recv = match inner.listener {
                Some(ref l) => l.recv_from(&mut buffer),
                None => return,
            };

            let (n, client) = match recv {
                Ok(r) => r,
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => return,
                Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!("udp relay recv failed, error: {}", err);
                    return;
                }
            };

            if n == 0 {
                warn!("udp relay received an empty datagram from {}", client);
                continue;
            }

            self.handle_request(&mut inner, event_loop, &buffer[..n], client);
        }
    }

    fn handle_request(&self, inner: &mut UdpRelayInner, event_loop: &mut EventLoop, data: &[u8], client: SocketAddr) {
        let data = if self.is_local {
            match UdpAssociateHeader::read_frag(data) {
                Ok(0) => &data[UDP_ASSOCIATE_PREFIX_LEN..],
                Ok(frag) => {
                    warn!("udp dropped a fragmented datagram (FRAG {}) from {}", frag, client);
                    return;
                }
                Err(err) => {
                    warn!("udp dropped a malformed datagram from {}, error: {}", client, err);
                    return;
                }
            }
        } else {
            data
        };

        let header = match AddressHeader::parse(data) {
            Ok(h) => h,
            Err(err) => {
                error!("udp can't parse header from {}, error: {}", client, err);
                return;
            }
        };
        debug!("udp {} -> {}, {} bytes", client, header.address, data.len());

        let (host, port, payload) = if self.is_local {
            (self.server_host.clone(), self.server_port, data)
        } else {
            (header.host(), header.port(), &data[header.header_length..])
        };

        if payload.is_empty() {
            trace!("udp dropped a datagram without payload from {}", client);
            return;
        }

        let target = match self.resolve(inner, &host, port) {
            Ok(t) => t,
            Err(err) => {
                warn!("udp failed to resolve {}:{}, error: {}", host, port, err);
                return;
            }
        };

        let key = NatKey::new(&client, &target);
        let id = match inner.nat.get(&key) {
            Some(id) => *id,
            None => match self.open_association(inner, event_loop, key, client) {
                Some(id) => id,
                None => return,
            },
        };

        let assoc = match inner.associations.get(&id) {
            Some(a) => a,
            None => return,
        };
        match assoc.socket.send_to(payload, target) {
            Ok(..) => trace!("udp sent {} bytes to {}", payload.len(), target),
            Err(err) => warn!("udp send to {} failed, error: {}", target, err),
        }
    }

    fn open_association(
        &self,
        inner: &mut UdpRelayInner,
        event_loop: &mut EventLoop,
        key: NatKey,
        client: SocketAddr,
    ) -> Option<SocketId> {
        let socket = match create_udp_socket(&key.family.unspecified()) {
            Ok(s) => s,
            Err(err) => {
                error!("udp failed to open association for {}, error: {}", client, err);
                return None;
            }
        };
        let id = socket.as_raw_fd();

        let me: Rc<dyn SocketHandler> = self.me.upgrade()?;
        if let Err(err) = event_loop.add(id, Ready::READABLE, me) {
            error!("udp failed to register association for {}, error: {}", client, err);
            return None;
        }

        debug!("udp association opened for {}", client);
        inner.nat.insert(key, id);
        inner.associations.insert(id, Association { socket, client, key });
        Some(id)
    }

    /// Datagrams coming back on an association socket
    fn handle_association(&self, event_loop: &mut EventLoop, id: SocketId) {
        let mut buffer = vec![0u8; MAXIMUM_UDP_PAYLOAD_SIZE];
        loop {
            let mut inner = self.inner.borrow_mut();
            let recv = match inner.associations.get(&id) {
                Some(assoc) => assoc.socket.recv_from(&mut buffer),
                None => return,
            };

            let (n, from) = match recv {
                Ok(r) => r,
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => return,
                Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!("udp association recv failed, error: {}", err);
                    self.drop_association(&mut inner, event_loop, id);
                    return;
                }
            };
            let data = &buffer[..n];
            trace!("udp reply from {}: {:?}", from, ByteStr::new(data));

            let mut response = BytesMut::with_capacity(n + 32);
            if self.is_local {
                let (address, header_length) = match Address::read_from_slice(data) {
                    Ok(r) => r,
                    Err(err) => {
                        warn!("udp dropped a malformed reply from {}, error: {}", from, err);
                        continue;
                    }
                };
                UdpAssociateHeader::new(0, address).write_to_buf(&mut response);
                response.put_slice(&data[header_length..]);
            } else {
                Address::from(from).write_to_buf(&mut response);
                response.put_slice(data);
            }

            let (client, key) = match inner.associations.get(&id) {
                Some(assoc) => (assoc.client, assoc.key),
                None => return,
            };
            // Traffic in either direction keeps the association alive
            let _ = inner.nat.get(&key);

            let sent = match inner.listener {
                Some(ref l) => l.send_to(&response, client),
                None => return,
            };
            if let Err(err) = sent {
                warn!("udp reply to {} failed, error: {}", client, err);
            }
        }
    }

    fn drop_association(&self, inner: &mut UdpRelayInner, event_loop: &mut EventLoop, id: SocketId) {
        if let Some(assoc) = inner.associations.remove(&id) {
            inner.nat.remove(&assoc.key);
            let _ = event_loop.remove(id);
            debug!("udp association of {} closed", assoc.client);
        }
    }
}

impl SocketHandler for UdpRelay {
    fn handle_event(&self, event_loop: &mut EventLoop, socket: SocketId, ready: Ready) {
        let is_listener = self.inner.borrow().listener_id == socket;

        if ready.is_error() {
            debug!("udp socket {} reported error", socket);
        }

        if is_listener {
            self.handle_listener(event_loop);
        } else {
            self.handle_association(event_loop, socket);
        }
    }
}

impl PeriodicHandler for UdpRelay {
    fn handle_periodic(&self, event_loop: &mut EventLoop) {
        let mut inner = self.inner.borrow_mut();
        let expired = inner.nat.sweep();
        for (key, id) in expired {
            if inner.associations.remove(&id).is_some() {
                let _ = event_loop.remove(id);
                debug!("udp association of {}:{} expired", key.client_ip, key.client_port);
            }
        }
    }
}

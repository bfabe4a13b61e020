//! Asynchronous stub DNS resolver
//!
//! Queries are sent over one non-blocking UDP socket registered in the `EventLoop`.
//! Callers get an answer right away from the fast paths (IP literal, hosts file,
//! cache), otherwise they are parked as waiters and notified through `DnsNotify`
//! when the response arrives. Waiters of the same hostname share a single query.

use std::{
    cell::RefCell,
    collections::HashMap,
    fmt::{self, Display},
    io::{self, ErrorKind},
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    os::unix::io::AsRawFd,
    path::Path,
    rc::{Rc, Weak},
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use byte_string::ByteStr;
use log::{debug, error, info, trace, warn};
use mio::net::UdpSocket;

use crate::{
    cache::TimeCache,
    event_loop::{EventLoop, Ready, SocketHandler, SocketId},
};

pub use self::{
    hosts::{load_hosts, parse_hosts, DEFAULT_HOSTS_PATH},
    wire::{RecordType, WireError},
};

mod hosts;
pub mod wire;

/// DNS server port
pub const DNS_PORT: u16 = 53;

/// Resolved names are forgotten after being idle for this long
pub const CACHE_TIMEOUT: Duration = Duration::from_secs(300);

/// How often the cache is swept
pub const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

const RECV_BUFFER_SIZE: usize = 1024;

/// Identity of a party waiting for a resolution
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WaiterId(u64);

impl WaiterId {
    /// Allocate a process unique id
    pub fn next() -> WaiterId {
        static NEXT_WAITER_ID: AtomicU64 = AtomicU64::new(1);
        WaiterId(NEXT_WAITER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for WaiterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Resolution failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("empty hostname")]
    EmptyHostname,
    #[error("invalid hostname {0}")]
    InvalidHostname(String),
    #[error("no address found for {0}")]
    NoAddress(String),
    #[error("resolver is not running")]
    Unavailable,
}

pub type ResolveResult = Result<IpAddr, ResolveError>;

/// Receiver of asynchronous resolutions
pub trait DnsNotify {
    fn dns_resolved(&self, event_loop: &mut EventLoop, waiter: WaiterId, hostname: &str, result: ResolveResult);
}

/// A parked caller
#[derive(Clone)]
pub struct Waiter {
    pub id: WaiterId,
    pub notify: Weak<dyn DnsNotify>,
}

impl Waiter {
    pub fn new(id: WaiterId, notify: Weak<dyn DnsNotify>) -> Waiter {
        Waiter { id, notify }
    }
}

/// Hostname resolution service
pub trait Resolve {
    /// Resolve `hostname`
    ///
    /// Returns `Some` when the answer is known without a network round trip, the
    /// waiter is not notified in that case. Otherwise the waiter is notified later,
    /// unless `remove_callback` cancels it first.
    fn resolve(&self, hostname: &str, waiter: Waiter) -> Option<ResolveResult>;

    /// Cancel a pending wait, a no-op for unknown waiters
    fn remove_callback(&self, waiter: WaiterId);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum HostStatus {
    /// Asked for A records
    First,
    /// Retried as AAAA after an empty A answer
    Second,
}

struct Completion {
    hostname: String,
    waiters: Vec<Waiter>,
    result: ResolveResult,
}

struct ResolverState {
    servers: Vec<SocketAddr>,
    socket: Option<UdpSocket>,
    socket_id: Option<SocketId>,
    hosts: HashMap<String, IpAddr>,
    cache: TimeCache<String, IpAddr>,
    hostname_status: HashMap<String, HostStatus>,
    hostname_to_waiters: HashMap<String, Vec<Waiter>>,
    waiter_to_hostname: HashMap<WaiterId, String>,
    last_sweep: Instant,
    added: bool,
    closed: bool,
}

pub struct DnsResolver {
    state: RefCell<ResolverState>,
    me: Weak<DnsResolver>,
}

fn new_socket(servers: &[SocketAddr]) -> io::Result<UdpSocket> {
    let bind_addr = match servers.first() {
        Some(SocketAddr::V6(..)) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        _ => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
    };
    UdpSocket::bind(bind_addr)
}

impl DnsResolver {
    /// Creates a resolver asking `servers`, with `hosts` as static mappings
    pub fn new(servers: Vec<SocketAddr>, hosts: HashMap<String, IpAddr>) -> Rc<DnsResolver> {
        Rc::new_cyclic(|me| DnsResolver {
            state: RefCell::new(ResolverState {
                servers,
                socket: None,
                socket_id: None,
                hosts,
                cache: TimeCache::new(CACHE_TIMEOUT.as_millis() as u64),
                hostname_status: HashMap::new(),
                hostname_to_waiters: HashMap::new(),
                waiter_to_hostname: HashMap::new(),
                last_sweep: Instant::now(),
                added: false,
                closed: false,
            }),
            me: me.clone(),
        })
    }

    /// Creates a resolver with static mappings read from a hosts file
    ///
    /// A missing or unreadable hosts file only disables the static mappings.
    pub fn with_hosts_file<P: AsRef<Path>>(servers: Vec<SocketAddr>, path: P) -> Rc<DnsResolver> {
        let path = path.as_ref();
        let hosts = match load_hosts(path) {
            Ok(hosts) => {
                debug!("loaded {} hosts from {}", hosts.len(), path.display());
                hosts
            }
            Err(err) => {
                warn!("failed to read hosts file {}, error: {}", path.display(), err);
                HashMap::new()
            }
        };
        DnsResolver::new(servers, hosts)
    }

    /// Bind the query socket and start receiving responses
    pub fn add_to_loop(&self, event_loop: &mut EventLoop) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        if state.added {
            return Err(io::Error::new(ErrorKind::AlreadyExists, "dns resolver already added to loop"));
        }
        if state.closed {
            return Err(io::Error::new(ErrorKind::Other, "dns resolver already closed"));
        }

        let socket = new_socket(&state.servers)?;
        let socket_id = socket.as_raw_fd();
        event_loop.add(socket_id, Ready::READABLE | Ready::ERROR, self.handler()?)?;

        state.socket = Some(socket);
        state.socket_id = Some(socket_id);
        state.added = true;
        Ok(())
    }

    /// Unregister and drop the query socket, pending waiters are forgotten
    pub fn close(&self, event_loop: &mut EventLoop) {
        let mut state = self.state.borrow_mut();
        if state.closed {
            return;
        }
        state.closed = true;

        if let Some(socket_id) = state.socket_id.take() {
            if let Err(err) = event_loop.remove(socket_id) {
                warn!("failed to remove dns socket from loop, error: {}", err);
            }
        }
        state.socket = None;
        state.hostname_status.clear();
        state.hostname_to_waiters.clear();
        state.waiter_to_hostname.clear();
    }

    /// Number of waiters still expecting an answer
    pub fn pending_waiters(&self) -> usize {
        self.state.borrow().waiter_to_hostname.len()
    }

    /// Whether `hostname` has a cached answer
    pub fn is_cached(&self, hostname: &str) -> bool {
        self.state.borrow().cache.contains_key(&hostname.to_owned())
    }

    fn handler(&self) -> io::Result<Rc<dyn SocketHandler>> {
        match self.me.upgrade() {
            Some(me) => Ok(me),
            None => Err(io::Error::new(ErrorKind::Other, "dns resolver dropped")),
        }
    }

    fn renew_socket(&self, state: &mut ResolverState, event_loop: &mut EventLoop) {
        if let Some(socket_id) = state.socket_id.take() {
            let _ = event_loop.remove(socket_id);
        }
        state.socket = None;

        let result = new_socket(&state.servers).and_then(|socket| {
            let socket_id = socket.as_raw_fd();
            event_loop.add(socket_id, Ready::READABLE | Ready::ERROR, self.handler()?)?;
            Ok((socket, socket_id))
        });

        match result {
            Ok((socket, socket_id)) => {
                state.socket = Some(socket);
                state.socket_id = Some(socket_id);
            }
            Err(err) => {
                error!("failed to recreate dns socket, error: {}", err);
            }
        }
    }

    fn deliver(event_loop: &mut EventLoop, completions: Vec<Completion>) {
        for Completion {
            hostname,
            waiters,
            result,
        } in completions
        {
            for waiter in waiters {
                match waiter.notify.upgrade() {
                    Some(notify) => notify.dns_resolved(event_loop, waiter.id, &hostname, result.clone()),
                    None => trace!("dns waiter {} of {} is gone", waiter.id, hostname),
                }
            }
        }
    }
}

impl ResolverState {
    fn send_request(&self, hostname: &str, qtype: RecordType) -> Result<(), ResolveError> {
        let socket = self.socket.as_ref().ok_or(ResolveError::Unavailable)?;
        let packet = wire::build_query(rand::random::<u16>(), hostname, qtype).map_err(|err| {
            warn!("cannot build query for {}, error: {}", hostname, err);
            ResolveError::InvalidHostname(hostname.to_owned())
        })?;

        for server in &self.servers {
            match socket.send_to(&packet, *server) {
                Ok(..) => trace!("dns query {:?} {} sent to {}", qtype, hostname, server),
                Err(err) => warn!("failed to send dns query to {}, error: {}", server, err),
            }
        }
        Ok(())
    }

    fn is_server(&self, addr: &SocketAddr) -> bool {
        self.servers.iter().any(|s| s.ip() == addr.ip())
    }

    fn take_waiters(&mut self, hostname: &str, result: ResolveResult) -> Completion {
        let waiters = self.hostname_to_waiters.remove(hostname).unwrap_or_default();
        for waiter in &waiters {
            self.waiter_to_hostname.remove(&waiter.id);
        }
        self.hostname_status.remove(hostname);

        Completion {
            hostname: hostname.to_owned(),
            waiters,
            result,
        }
    }

    fn remove_waiter(&mut self, id: WaiterId) {
        let hostname = match self.waiter_to_hostname.remove(&id) {
            Some(h) => h,
            None => return,
        };

        if let Some(waiters) = self.hostname_to_waiters.get_mut(&hostname) {
            waiters.retain(|w| w.id != id);
            if waiters.is_empty() {
                self.hostname_to_waiters.remove(&hostname);
                self.hostname_status.remove(&hostname);
            }
        }
    }

    fn handle_data(&mut self, packet: &[u8]) -> Option<Completion> {
        let response = match wire::parse_response(packet) {
            Ok(r) => r,
            Err(err) => {
                warn!("malformed dns response, error: {}, packet: {:?}", err, ByteStr::new(packet));
                return None;
            }
        };

        let hostname = response.hostname;
        let status = match self.hostname_status.get(&hostname) {
            Some(s) => *s,
            None => {
                trace!("dns response for {} has no waiter", hostname);
                return None;
            }
        };

        if let Some(&ip) = response.addresses.first() {
            debug!("resolved {} to {}", hostname, ip);
            self.cache.insert(hostname.clone(), ip);
            return Some(self.take_waiters(&hostname, Ok(ip)));
        }

        match (status, response.question_type) {
            (HostStatus::First, Some(RecordType::A)) => {
                self.hostname_status.insert(hostname.clone(), HostStatus::Second);
                if let Err(err) = self.send_request(&hostname, RecordType::Aaaa) {
                    return Some(self.take_waiters(&hostname, Err(err)));
                }
                None
            }
            (HostStatus::Second, Some(RecordType::A)) => {
                // Another server's answer to the first query
                None
            }
            _ => {
                info!("failed to resolve {}", hostname);
                let err = ResolveError::NoAddress(hostname.clone());
                Some(self.take_waiters(&hostname, Err(err)))
            }
        }
    }

    fn receive(&mut self) -> Vec<Completion> {
        let mut completions = Vec::new();
        let mut buffer = [0u8; RECV_BUFFER_SIZE];

        loop {
            let socket = match self.socket {
                Some(ref s) => s,
                None => break,
            };

            let (n, addr) = match socket.recv_from(&mut buffer) {
                Ok(r) => r,
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!("dns socket recv failed, error: {}", err);
                    break;
                }
            };

            if !self.is_server(&addr) {
                warn!("received a dns packet from {} which is not a configured server", addr);
                continue;
            }

            completions.extend(self.handle_data(&buffer[..n]));
        }

        if self.last_sweep.elapsed() >= CACHE_SWEEP_INTERVAL {
            let evicted = self.cache.sweep();
            trace!("dns cache swept, {} names evicted", evicted.len());
            self.last_sweep = Instant::now();
        }

        completions
    }
}

impl Resolve for DnsResolver {
    fn resolve(&self, hostname: &str, waiter: Waiter) -> Option<ResolveResult> {
        if hostname.is_empty() {
            return Some(Err(ResolveError::EmptyHostname));
        }
        if let Ok(ip) = hostname.parse::<IpAddr>() {
            return Some(Ok(ip));
        }

        let hostname = hostname.trim_end_matches('.');
        let mut state = self.state.borrow_mut();

        if let Some(ip) = state.hosts.get(hostname) {
            return Some(Ok(*ip));
        }
        if let Some(ip) = state.cache.get(&hostname.to_owned()) {
            return Some(Ok(*ip));
        }
        if state.socket.is_none() {
            return Some(Err(ResolveError::Unavailable));
        }

        if state.waiter_to_hostname.contains_key(&waiter.id) {
            warn!("dns waiter {} is already waiting, replacing its request", waiter.id);
            state.remove_waiter(waiter.id);
        }

        if !state.hostname_status.contains_key(hostname) {
            if let Err(err) = state.send_request(hostname, RecordType::A) {
                return Some(Err(err));
            }
            state.hostname_status.insert(hostname.to_owned(), HostStatus::First);
        }

        state.waiter_to_hostname.insert(waiter.id, hostname.to_owned());
        state
            .hostname_to_waiters
            .entry(hostname.to_owned())
            .or_default()
            .push(waiter);

        None
    }

    fn remove_callback(&self, waiter: WaiterId) {
        self.state.borrow_mut().remove_waiter(waiter);
    }
}

impl SocketHandler for DnsResolver {
    fn handle_event(&self, event_loop: &mut EventLoop, socket: SocketId, ready: Ready) {
        let completions = {
            let mut state = self.state.borrow_mut();
            if state.socket_id != Some(socket) {
                error!("dns resolver received an event of socket {}", socket);
                return;
            }

            if ready.is_error() {
                info!("dns socket error, recreating");
                self.renew_socket(&mut state, event_loop);
                return;
            }

            state.receive()
        };

        DnsResolver::deliver(event_loop, completions);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct Nobody;

    impl DnsNotify for Nobody {
        fn dns_resolved(&self, _: &mut EventLoop, _: WaiterId, _: &str, _: ResolveResult) {}
    }

    fn waiter(notify: &Rc<Nobody>) -> Waiter {
        let notify: Rc<dyn DnsNotify> = notify.clone();
        Waiter::new(WaiterId::next(), Rc::downgrade(&notify))
    }

    #[test]
    fn fast_paths() {
        let mut hosts = HashMap::new();
        hosts.insert("router.lan".to_owned(), "192.168.1.1".parse().unwrap());
        let resolver = DnsResolver::new(vec!["127.0.0.1:53".parse().unwrap()], hosts);
        let nobody = Rc::new(Nobody);

        assert_eq!(
            resolver.resolve("", waiter(&nobody)),
            Some(Err(ResolveError::EmptyHostname))
        );
        assert_eq!(
            resolver.resolve("10.1.2.3", waiter(&nobody)),
            Some(Ok("10.1.2.3".parse().unwrap()))
        );
        assert_eq!(
            resolver.resolve("::1", waiter(&nobody)),
            Some(Ok("::1".parse().unwrap()))
        );
        assert_eq!(
            resolver.resolve("router.lan", waiter(&nobody)),
            Some(Ok("192.168.1.1".parse().unwrap()))
        );
        // Not in the loop yet
        assert_eq!(
            resolver.resolve("example.com", waiter(&nobody)),
            Some(Err(ResolveError::Unavailable))
        );
        assert_eq!(resolver.pending_waiters(), 0);
    }

    #[test]
    fn waiter_tables_stay_consistent() {
        let resolver = DnsResolver::new(vec!["127.0.0.1:53".parse().unwrap()], HashMap::new());
        let mut state = resolver.state.borrow_mut();
        let nobody = Rc::new(Nobody);

        let a = waiter(&nobody);
        let b = waiter(&nobody);
        let (a_id, b_id) = (a.id, b.id);

        for w in [a, b] {
            state.waiter_to_hostname.insert(w.id, "example.com".to_owned());
            state.hostname_to_waiters.entry("example.com".to_owned()).or_default().push(w);
        }
        state.hostname_status.insert("example.com".to_owned(), HostStatus::First);

        state.remove_waiter(a_id);
        assert_eq!(state.hostname_to_waiters["example.com"].len(), 1);
        assert!(state.hostname_status.contains_key("example.com"));

        state.remove_waiter(a_id);
        state.remove_waiter(b_id);
        assert!(state.hostname_to_waiters.is_empty());
        assert!(state.hostname_status.is_empty());
        assert!(state.waiter_to_hostname.is_empty());
    }

    #[test]
    fn add_to_loop_twice_fails() {
        let mut event_loop = EventLoop::new(crate::event_loop::MultiplexerKind::Poll).unwrap();
        let resolver = DnsResolver::new(vec!["127.0.0.1:53".parse().unwrap()], HashMap::new());

        resolver.add_to_loop(&mut event_loop).unwrap();
        assert!(resolver.add_to_loop(&mut event_loop).is_err());

        resolver.close(&mut event_loop);
        assert!(resolver.add_to_loop(&mut event_loop).is_err());

        let nobody = Rc::new(Nobody);
        assert_eq!(
            resolver.resolve("example.com", waiter(&nobody)),
            Some(Err(ResolveError::Unavailable))
        );
    }
}

//! Per connection state machine

use std::{
    fmt,
    io::{self, ErrorKind, Read, Write},
    net::SocketAddr,
    os::unix::io::AsRawFd,
    rc::Rc,
};

use bytes::{Buf, BytesMut};
use log::{debug, error, info, trace, warn};
use mio::net::TcpStream;

use super::{RelayContext, SessionId, TcpRelaySettings};
use crate::{
    crypto::{new_stream, CipherResult, CryptoMode, StreamCipher},
    event_loop::{Ready, SocketId},
    relay::{
        dns_resolver::{ResolveResult, Waiter},
        socks5::{
            self,
            handshake_response,
            unspecified_bound_address,
            Address,
            AddressHeader,
            Command,
            Reply,
            TcpResponseHeader,
            SOCKS5_AUTH_METHOD_NONE,
            SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE,
            TCP_REQUEST_PREFIX_LEN,
        },
    },
};

/// Read size on the application facing leg
const UPSTREAM_BUF_SIZE: usize = 16 * 1024;
/// Read size on the remote leg
const DOWNSTREAM_BUF_SIZE: usize = 32 * 1024;

/// Bytes the client role writes to the application on its own: method selection
/// reply plus the canned IPv4 connect reply
const LOCAL_HANDSHAKE_LEN: u64 = 12;

/// Session stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    Addr,
    UdpAssoc,
    Dns,
    Connecting,
    Stream,
    Destroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitStatus {
    Init,
    Reading,
    Writing,
    ReadWriting,
}

impl WaitStatus {
    fn reading(self) -> bool {
        matches!(self, WaitStatus::Reading | WaitStatus::ReadWriting)
    }

    fn writing(self) -> bool {
        matches!(self, WaitStatus::Writing | WaitStatus::ReadWriting)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// Application to remote
    Up,
    /// Remote to application
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Leg {
    Local,
    Remote,
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Leg::Local => f.write_str("local"),
            Leg::Remote => f.write_str("remote"),
        }
    }
}

/// One relayed connection: the accepted local leg and, once resolved, the remote leg
pub struct TcpRelayHandler {
    id: SessionId,
    settings: Rc<TcpRelaySettings>,
    stage: Stage,

    local: TcpStream,
    local_id: SocketId,
    peer_addr: SocketAddr,

    remote: Option<TcpStream>,
    remote_id: Option<SocketId>,
    remote_host: String,
    remote_port: u16,

    data_to_local: BytesMut,
    data_to_remote: BytesMut,
    upstream_status: WaitStatus,
    downstream_status: WaitStatus,

    received_from_remote: u64,
    sent_to_local: u64,

    upstream_cipher: Box<dyn StreamCipher>,
    downstream_cipher: Box<dyn StreamCipher>,
}

impl TcpRelayHandler {
    pub(crate) fn new(
        id: SessionId,
        local: TcpStream,
        peer_addr: SocketAddr,
        settings: Rc<TcpRelaySettings>,
    ) -> TcpRelayHandler {
        let (up_mode, down_mode) = if settings.is_local {
            (CryptoMode::Encrypt, CryptoMode::Decrypt)
        } else {
            (CryptoMode::Decrypt, CryptoMode::Encrypt)
        };

        TcpRelayHandler {
            id,
            stage: if settings.is_local { Stage::Init } else { Stage::Addr },
            local_id: local.as_raw_fd(),
            local,
            peer_addr,
            remote: None,
            remote_id: None,
            remote_host: String::new(),
            remote_port: 0,
            data_to_local: BytesMut::new(),
            data_to_remote: BytesMut::new(),
            upstream_status: WaitStatus::Reading,
            downstream_status: WaitStatus::Init,
            received_from_remote: 0,
            sent_to_local: 0,
            upstream_cipher: new_stream(settings.method, up_mode),
            downstream_cipher: new_stream(settings.method, down_mode),
            settings,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn is_destroyed(&self) -> bool {
        self.stage == Stage::Destroyed
    }

    pub(crate) fn handle_event(&mut self, ctx: &mut RelayContext<'_>, socket: SocketId, ready: Ready) {
        if self.is_destroyed() {
            trace!("session {} ignoring {:?} after destroy", self.id, ready);
            return;
        }

        let leg = if socket == self.local_id {
            Leg::Local
        } else if Some(socket) == self.remote_id {
            Leg::Remote
        } else {
            warn!("session {} got an event of foreign socket {}", self.id, socket);
            return;
        };

        if ready.is_error() {
            self.on_error(leg);
            return;
        }

        if ready.intersects(Ready::READABLE | Ready::HANGUP) {
            match leg {
                Leg::Local => self.on_local_read(ctx),
                Leg::Remote => self.on_remote_read(ctx),
            }
            if self.is_destroyed() {
                return;
            }
        }

        if ready.is_writable() {
            match leg {
                Leg::Local => {
                    self.flush(ctx, Leg::Local);
                }
                Leg::Remote => self.on_remote_write(ctx),
            }
        }
    }

    pub(crate) fn on_dns_resolved(&mut self, ctx: &mut RelayContext<'_>, hostname: &str, result: ResolveResult) {
        if self.is_destroyed() {
            return;
        }

        let ip = match result {
            Ok(ip) => ip,
            Err(err) => {
                warn!("session {} failed to resolve {}, error: {}", self.id, hostname, err);
                self.destroy();
                return;
            }
        };

        let addr = SocketAddr::new(ip, self.remote_port);
        self.stage = Stage::Connecting;

        let stream = match TcpStream::connect(addr) {
            Ok(s) => s,
            Err(err) => {
                warn!("session {} connect {} failed, error: {}", self.id, addr, err);
                self.destroy();
                return;
            }
        };
        if let Err(err) = stream.set_nodelay(true) {
            debug!("failed to set TCP_NODELAY to {}, error: {}", addr, err);
        }

        let remote_id = stream.as_raw_fd();
        if let Some(stale) = ctx.sockets.insert(remote_id, self.id) {
            warn!("socket {} was still owned by session {}", remote_id, stale);
        }
        self.remote = Some(stream);
        self.remote_id = Some(remote_id);

        if let Err(err) = ctx
            .event_loop
            .add(remote_id, Ready::ERROR | Ready::WRITABLE, ctx.receiver.clone())
        {
            error!("session {} failed to register remote socket, error: {}", self.id, err);
            self.destroy();
            return;
        }

        self.update_stream(ctx, Direction::Up, WaitStatus::ReadWriting);
        self.update_stream(ctx, Direction::Down, WaitStatus::Reading);
    }

    fn on_error(&mut self, leg: Leg) {
        let stream = match leg {
            Leg::Local => Some(&self.local),
            Leg::Remote => self.remote.as_ref(),
        };
        match stream.map(TcpStream::take_error) {
            Some(Ok(Some(err))) | Some(Err(err)) => debug!("session {} {} error: {}", self.id, leg, err),
            _ => debug!("session {} {} error", self.id, leg),
        }
        self.destroy();
    }

    fn on_local_read(&mut self, ctx: &mut RelayContext<'_>) {
        let mut buffer = [0u8; UPSTREAM_BUF_SIZE];
        let n = match read_some(&mut self.local, &mut buffer) {
            Ok(Some(0)) => {
                debug!("session {} local {} closed", self.id, self.peer_addr);
                self.destroy();
                return;
            }
            Ok(Some(n)) => n,
            Ok(None) => return,
            Err(err) => {
                debug!("session {} local read error: {}", self.id, err);
                self.destroy();
                return;
            }
        };

        // The server role's local leg carries the relay channel
        let data = if self.settings.is_local {
            BytesMut::from(&buffer[..n])
        } else {
            match transform(&mut *self.upstream_cipher, &buffer[..n]) {
                Ok(d) => d,
                Err(err) => {
                    error!("session {} decrypt failed, error: {}", self.id, err);
                    self.destroy();
                    return;
                }
            }
        };

        match self.stage {
            Stage::Stream => self.handle_stage_stream(ctx, &data),
            Stage::Dns | Stage::Connecting => self.handle_stage_connecting(ctx, &data),
            Stage::Init => self.handle_stage_init(ctx, &data),
            Stage::Addr => self.handle_stage_addr(ctx, &data),
            Stage::UdpAssoc => trace!("session {} discarding {} bytes on UDP association", self.id, n),
            Stage::Destroyed => {}
        }
    }

    fn on_remote_read(&mut self, ctx: &mut RelayContext<'_>) {
        let remote = match self.remote {
            Some(ref mut r) => r,
            None => return,
        };

        let mut buffer = [0u8; DOWNSTREAM_BUF_SIZE];
        let n = match read_some(remote, &mut buffer) {
            Ok(Some(0)) => {
                debug!("session {} remote {}:{} closed", self.id, self.remote_host, self.remote_port);
                self.destroy();
                return;
            }
            Ok(Some(n)) => n,
            Ok(None) => return,
            Err(err) => {
                debug!("session {} remote read error: {}", self.id, err);
                self.destroy();
                return;
            }
        };
        self.received_from_remote += n as u64;

        let data = match transform(&mut *self.downstream_cipher, &buffer[..n]) {
            Ok(d) => d,
            Err(err) => {
                error!("session {} downstream cipher failed, error: {}", self.id, err);
                self.destroy();
                return;
            }
        };

        self.write_to_sock(ctx, &data, Leg::Local);
    }

    fn on_remote_write(&mut self, ctx: &mut RelayContext<'_>) {
        if self.stage == Stage::Connecting {
            let remote = match self.remote {
                Some(ref r) => r,
                None => return,
            };

            match remote.take_error() {
                Ok(Some(err)) | Err(err) => {
                    warn!(
                        "session {} connect {}:{} failed, error: {}",
                        self.id, self.remote_host, self.remote_port, err
                    );
                    self.destroy();
                    return;
                }
                Ok(None) => {}
            }

            match remote.peer_addr() {
                Ok(addr) => debug!("session {} connected to {}", self.id, addr),
                Err(ref err) if err.kind() == ErrorKind::NotConnected => return,
                Err(err) => {
                    warn!("session {} connect failed, error: {}", self.id, err);
                    self.destroy();
                    return;
                }
            }

            self.stage = Stage::Stream;
        }

        self.flush(ctx, Leg::Remote);
    }

    fn handle_stage_init(&mut self, ctx: &mut RelayContext<'_>, data: &[u8]) {
        match socks5::check_auth_methods(data) {
            Ok(()) => {
                let reply = handshake_response(SOCKS5_AUTH_METHOD_NONE);
                if self.write_to_sock(ctx, &reply, Leg::Local) {
                    self.stage = Stage::Addr;
                }
            }
            Err(socks5::Error::NoAcceptableMethods) => {
                warn!("session {} {} offered no acceptable method", self.id, self.peer_addr);
                let reply = handshake_response(SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE);
                self.write_to_sock(ctx, &reply, Leg::Local);
                self.destroy();
            }
            Err(err) => {
                warn!("session {} bad method selection from {}, error: {}", self.id, self.peer_addr, err);
                self.destroy();
            }
        }
    }

    fn handle_stage_addr(&mut self, ctx: &mut RelayContext<'_>, mut data: &[u8]) {
        if self.settings.is_local {
            let cmd = match socks5::read_request_command(data) {
                Ok(c) => c,
                Err(err) => {
                    warn!("session {} bad request from {}, error: {}", self.id, self.peer_addr, err);
                    self.destroy();
                    return;
                }
            };

            match Command::from_u8(cmd) {
                Some(Command::TcpConnect) => data = &data[TCP_REQUEST_PREFIX_LEN..],
                Some(Command::UdpAssociate) => {
                    debug!("session {} UDP associate from {}", self.id, self.peer_addr);
                    let bound = match self.local.local_addr() {
                        Ok(addr) => Address::SocketAddress(addr),
                        Err(..) => unspecified_bound_address(),
                    };
                    let reply = TcpResponseHeader::new(Reply::Succeeded, bound).to_bytes();
                    if self.write_to_sock(ctx, &reply, Leg::Local) {
                        self.stage = Stage::UdpAssoc;
                    }
                    return;
                }
                _ => {
                    warn!("session {} unsupported command {:#x} from {}", self.id, cmd, self.peer_addr);
                    self.destroy();
                    return;
                }
            }
        }

        let header = match AddressHeader::parse(data) {
            Ok(h) => h,
            Err(err) => {
                warn!("session {} bad address header from {}, error: {}", self.id, self.peer_addr, err);
                self.destroy();
                return;
            }
        };

        info!(
            "session {} connecting {} from {}",
            self.id, header.address, self.peer_addr
        );

        self.update_stream(ctx, Direction::Up, WaitStatus::Writing);
        self.stage = Stage::Dns;

        if self.settings.is_local {
            let reply = TcpResponseHeader::new(Reply::Succeeded, unspecified_bound_address()).to_bytes();
            if !self.write_to_sock(ctx, &reply, Leg::Local) {
                return;
            }

            // The relay server gets the address header along with any early payload
            match transform(&mut *self.upstream_cipher, data) {
                Ok(payload) => self.data_to_remote.extend_from_slice(&payload),
                Err(err) => {
                    error!("session {} encrypt failed, error: {}", self.id, err);
                    self.destroy();
                    return;
                }
            }
            self.remote_host = self.settings.server_host.clone();
            self.remote_port = self.settings.server_port;
        } else {
            self.data_to_remote.extend_from_slice(&data[header.header_length..]);
            self.remote_host = header.host();
            self.remote_port = header.port();
        }

        let hostname = self.remote_host.clone();
        let waiter = Waiter::new(self.id, ctx.notify.clone());
        if let Some(result) = ctx.resolver.resolve(&hostname, waiter) {
            self.on_dns_resolved(ctx, &hostname, result);
        }
    }

    fn handle_stage_connecting(&mut self, ctx: &mut RelayContext<'_>, data: &[u8]) {
        match self.upstream_payload(data) {
            Some(payload) => {
                self.data_to_remote.extend_from_slice(&payload);
                trace!(
                    "session {} queued {} bytes while connecting",
                    self.id,
                    self.data_to_remote.len()
                );
            }
            None => self.destroy(),
        }
        // Stop reading the application until the remote drains the queue
        self.update_stream(ctx, Direction::Up, WaitStatus::Writing);
    }

    fn handle_stage_stream(&mut self, ctx: &mut RelayContext<'_>, data: &[u8]) {
        if let Some(payload) = self.upstream_payload(data) {
            self.write_to_sock(ctx, &payload, Leg::Remote);
        } else {
            self.destroy();
        }
    }

    /// Data read from the local leg turned into what the remote leg expects
    fn upstream_payload(&mut self, data: &[u8]) -> Option<BytesMut> {
        if !self.settings.is_local {
            // Already decrypted on read
            return Some(BytesMut::from(data));
        }
        match transform(&mut *self.upstream_cipher, data) {
            Ok(payload) => Some(payload),
            Err(err) => {
                error!("session {} encrypt failed, error: {}", self.id, err);
                None
            }
        }
    }

    /// Queue `data` behind anything pending on `leg` and write as much as the socket takes
    fn write_to_sock(&mut self, ctx: &mut RelayContext<'_>, data: &[u8], leg: Leg) -> bool {
        match leg {
            Leg::Local => self.data_to_local.extend_from_slice(data),
            Leg::Remote => self.data_to_remote.extend_from_slice(data),
        }
        self.flush(ctx, leg)
    }

    fn flush(&mut self, ctx: &mut RelayContext<'_>, leg: Leg) -> bool {
        let (stream, queue) = match leg {
            Leg::Local => (&mut self.local, &mut self.data_to_local),
            Leg::Remote => match self.remote {
                Some(ref mut r) => (r, &mut self.data_to_remote),
                None => return true,
            },
        };

        let mut written = 0;
        let mut failure = None;
        while written < queue.len() {
            match stream.write(&queue[written..]) {
                Ok(0) => {
                    failure = Some(io::Error::from(ErrorKind::WriteZero));
                    break;
                }
                Ok(n) => written += n,
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        queue.advance(written);
        let pending = !queue.is_empty();

        if leg == Leg::Local {
            self.sent_to_local += written as u64;
        }

        if let Some(err) = failure {
            error!("session {} write to {} failed, error: {}", self.id, leg, err);
            self.destroy();
            return false;
        }

        let (direction, status) = match (leg, pending) {
            (Leg::Local, true) => (Direction::Down, WaitStatus::Writing),
            (Leg::Local, false) => (Direction::Down, WaitStatus::Reading),
            (Leg::Remote, true) => (Direction::Up, WaitStatus::Writing),
            (Leg::Remote, false) => (Direction::Up, WaitStatus::Reading),
        };
        self.update_stream(ctx, direction, status);
        true
    }

    /// Recompute the interests of both legs after a direction changed status
    fn update_stream(&mut self, ctx: &mut RelayContext<'_>, direction: Direction, status: WaitStatus) {
        let current = match direction {
            Direction::Up => &mut self.upstream_status,
            Direction::Down => &mut self.downstream_status,
        };
        if *current == status {
            return;
        }
        *current = status;

        if self.is_destroyed() {
            return;
        }

        let mut local_interest = Ready::ERROR;
        if self.downstream_status.writing() {
            local_interest |= Ready::WRITABLE;
        }
        if self.upstream_status.reading() {
            local_interest |= Ready::READABLE;
        }
        if let Err(err) = ctx.event_loop.modify(self.local_id, local_interest) {
            warn!("session {} failed to update local interest, error: {}", self.id, err);
        }

        if let Some(remote_id) = self.remote_id {
            let mut remote_interest = Ready::ERROR;
            if self.downstream_status.reading() {
                remote_interest |= Ready::READABLE;
            }
            if self.upstream_status.writing() {
                remote_interest |= Ready::WRITABLE;
            }
            if let Err(err) = ctx.event_loop.modify(remote_id, remote_interest) {
                warn!("session {} failed to update remote interest, error: {}", self.id, err);
            }
        }
    }

    /// Mark for teardown, the owner releases the session after the current dispatch
    fn destroy(&mut self) {
        if self.is_destroyed() {
            warn!("session {} already destroyed", self.id);
            return;
        }
        debug!("session {} destroyed in {:?}", self.id, self.stage);
        self.stage = Stage::Destroyed;
    }

    /// Unregister both legs and cancel any pending resolution, sockets close on drop
    pub(crate) fn release(self, ctx: &mut RelayContext<'_>) {
        if self.remote.is_some() && self.settings.is_local {
            let expected = self.received_from_remote + LOCAL_HANDSHAKE_LEN;
            if self.sent_to_local != expected {
                warn!(
                    "session {} sent {} bytes to {} but received {} from remote",
                    self.id, self.sent_to_local, self.peer_addr, self.received_from_remote
                );
            }
        }

        if let Some(remote_id) = self.remote_id {
            if let Err(err) = ctx.event_loop.remove(remote_id) {
                debug!("session {} remove remote socket, error: {}", self.id, err);
            }
            ctx.sockets.remove(&remote_id);
        }
        if let Err(err) = ctx.event_loop.remove(self.local_id) {
            debug!("session {} remove local socket, error: {}", self.id, err);
        }
        ctx.sockets.remove(&self.local_id);

        ctx.resolver.remove_callback(self.id);

        debug!(
            "session {} from {} released, {} bytes down",
            self.id, self.peer_addr, self.sent_to_local
        );
    }
}

/// `Ok(None)` when the socket has nothing for us right now
fn read_some<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<Option<usize>> {
    match reader.read(buf) {
        Ok(n) => Ok(Some(n)),
        Err(ref err) if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::Interrupted => Ok(None),
        Err(err) => Err(err),
    }
}

fn transform(cipher: &mut dyn StreamCipher, data: &[u8]) -> CipherResult<BytesMut> {
    let mut out = BytesMut::with_capacity(cipher.buffer_size(data));
    cipher.update(data, &mut out)?;
    Ok(out)
}

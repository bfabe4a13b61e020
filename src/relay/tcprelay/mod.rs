//! TCP relay
//!
//! One listener, one `TcpRelayHandler` per accepted connection. The relay owns every
//! session and routes readiness events of both legs to the owning session through
//! the socket registry.

use std::{
    cell::RefCell,
    collections::HashMap,
    io::{self, ErrorKind},
    net::SocketAddr,
    os::unix::io::AsRawFd,
    rc::{Rc, Weak},
};

use log::{debug, error, info, trace, warn};
use mio::net::TcpListener;

use crate::{
    config::Config,
    crypto::CipherKind,
    event_loop::{EventLoop, Ready, SocketHandler, SocketId},
    net::{create_tcp_listener, lookup_host},
    relay::dns_resolver::{DnsNotify, Resolve, ResolveResult, WaiterId},
};

pub use self::handler::{Stage, TcpRelayHandler};

mod handler;

/// Session identity, doubles as the session's DNS waiter id
pub type SessionId = WaiterId;

/// Settings shared by all sessions of a relay
#[derive(Debug, Clone)]
pub struct TcpRelaySettings {
    /// Client role speaks SOCKS5 to applications, server role speaks the relay protocol
    pub is_local: bool,
    /// Upstream relay server, used by the client role only
    pub server_host: String,
    pub server_port: u16,
    pub method: CipherKind,
}

impl TcpRelaySettings {
    pub fn from_config(config: &Config) -> TcpRelaySettings {
        TcpRelaySettings {
            is_local: config.is_local(),
            server_host: config.server_address.clone(),
            server_port: config.server_port,
            method: config.method,
        }
    }
}

/// Everything a session may touch while handling an event
pub(crate) struct RelayContext<'a> {
    pub event_loop: &'a mut EventLoop,
    pub resolver: &'a dyn Resolve,
    pub sockets: &'a mut HashMap<SocketId, SessionId>,
    pub receiver: Rc<dyn SocketHandler>,
    pub notify: Weak<dyn DnsNotify>,
}

struct TcpRelayInner {
    listener: Option<TcpListener>,
    listener_id: SocketId,
    added: bool,
    closed: bool,
    handlers: HashMap<SessionId, TcpRelayHandler>,
    sockets: HashMap<SocketId, SessionId>,
}

/// TCP relay of either role
pub struct TcpRelay {
    settings: Rc<TcpRelaySettings>,
    resolver: Rc<dyn Resolve>,
    local_addr: SocketAddr,
    inner: RefCell<TcpRelayInner>,
    me: Weak<TcpRelay>,
}

impl TcpRelay {
    /// Bind the listener of `config`'s role
    ///
    /// The client role listens on `local_address:local_port`, the server role on
    /// `server_address:server_port`.
    pub fn new(config: &Config, resolver: Rc<dyn Resolve>) -> io::Result<Rc<TcpRelay>> {
        let (host, port) = config.listen_address();
        let addr = lookup_host(host, port)?;
        TcpRelay::bind(&addr, TcpRelaySettings::from_config(config), resolver)
    }

    /// Bind the listener on `addr` directly
    pub fn bind(addr: &SocketAddr, settings: TcpRelaySettings, resolver: Rc<dyn Resolve>) -> io::Result<Rc<TcpRelay>> {
        let listener = create_tcp_listener(addr)?;
        let local_addr = listener.local_addr()?;
        let listener_id = listener.as_raw_fd();

        info!(
            "tcp relay ({}) listening on {}",
            if settings.is_local { "local" } else { "server" },
            local_addr
        );

        Ok(Rc::new_cyclic(|me| TcpRelay {
            settings: Rc::new(settings),
            resolver,
            local_addr,
            inner: RefCell::new(TcpRelayInner {
                listener: Some(listener),
                listener_id,
                added: false,
                closed: false,
                handlers: HashMap::new(),
                sockets: HashMap::new(),
            }),
            me: me.clone(),
        }))
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.inner.borrow().handlers.len()
    }

    /// Stage of every live session
    pub fn session_stages(&self) -> Vec<Stage> {
        self.inner.borrow().handlers.values().map(TcpRelayHandler::stage).collect()
    }

    /// Register the listener, fails if already added or closed
    pub fn add_to_loop(&self, event_loop: &mut EventLoop) -> io::Result<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.added {
            return Err(io::Error::new(ErrorKind::Other, "tcp relay already added to a loop"));
        }
        if inner.closed {
            return Err(io::Error::new(ErrorKind::Other, "tcp relay already closed"));
        }

        event_loop.add(inner.listener_id, Ready::READABLE | Ready::ERROR, self.receiver()?)?;
        inner.added = true;
        Ok(())
    }

    /// Stop accepting and tear down every session
    pub fn close(&self, event_loop: &mut EventLoop) {
        let mut inner = self.inner.borrow_mut();
        if inner.closed {
            return;
        }
        inner.closed = true;
        info!("tcp relay on {} closing", self.local_addr);

        if let Err(err) = event_loop.remove(inner.listener_id) {
            warn!("failed to remove tcp listener from loop, error: {}", err);
        }
        inner.listener = None;

        let (receiver, notify) = match self.me.upgrade() {
            Some(me) => {
                let receiver: Rc<dyn SocketHandler> = me.clone();
                let notify: Rc<dyn DnsNotify> = me;
                (receiver, Rc::downgrade(&notify))
            }
            None => return,
        };

        let inner = &mut *inner;
        let mut ctx = RelayContext {
            event_loop,
            resolver: &*self.resolver,
            sockets: &mut inner.sockets,
            receiver,
            notify,
        };
        for (_, handler) in inner.handlers.drain() {
            handler.release(&mut ctx);
        }
    }

    fn receiver(&self) -> io::Result<Rc<dyn SocketHandler>> {
        match self.me.upgrade() {
            Some(me) => Ok(me),
            None => Err(io::Error::new(ErrorKind::Other, "tcp relay is being dropped")),
        }
    }

    fn accept(&self, inner: &mut TcpRelayInner, event_loop: &mut EventLoop, receiver: Rc<dyn SocketHandler>) {
        let listener = match inner.listener {
            Some(ref l) => l,
            None => return,
        };

        let (stream, peer_addr) = match listener.accept() {
            Ok(s) => s,
            Err(ref err) if err.kind() == ErrorKind::WouldBlock => return,
            Err(err) => {
                warn!("tcp relay accept failed, error: {}", err);
                return;
            }
        };

        if let Err(err) = stream.set_nodelay(true) {
            debug!("failed to set TCP_NODELAY on {}, error: {}", peer_addr, err);
        }

        let id = SessionId::next();
        let local_id = stream.as_raw_fd();
        if let Some(stale) = inner.sockets.insert(local_id, id) {
            warn!("socket {} was still owned by session {}", local_id, stale);
        }

        if let Err(err) = event_loop.add(local_id, Ready::READABLE | Ready::ERROR, receiver) {
            error!("failed to register connection from {}, error: {}", peer_addr, err);
            inner.sockets.remove(&local_id);
            return;
        }

        debug!("session {} accepted {}", id, peer_addr);
        let handler = TcpRelayHandler::new(id, stream, peer_addr, self.settings.clone());
        inner.handlers.insert(id, handler);
    }

    /// Run `f` on session `id`, dropping the session if it ended up destroyed
    fn with_session<F>(&self, event_loop: &mut EventLoop, id: SessionId, f: F)
    where
        F: FnOnce(&mut TcpRelayHandler, &mut RelayContext<'_>),
    {
        let me = match self.me.upgrade() {
            Some(me) => me,
            None => return,
        };
        let receiver: Rc<dyn SocketHandler> = me.clone();
        let notify: Rc<dyn DnsNotify> = me;

        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;

        let handler = match inner.handlers.get_mut(&id) {
            Some(h) => h,
            None => {
                trace!("session {} already gone", id);
                return;
            }
        };

        let mut ctx = RelayContext {
            event_loop,
            resolver: &*self.resolver,
            sockets: &mut inner.sockets,
            receiver,
            notify: Rc::downgrade(&notify),
        };

        f(handler, &mut ctx);

        if handler.is_destroyed() {
            if let Some(handler) = inner.handlers.remove(&id) {
                handler.release(&mut ctx);
            }
        }
    }
}

impl SocketHandler for TcpRelay {
    fn handle_event(&self, event_loop: &mut EventLoop, socket: SocketId, ready: Ready) {
        let session = {
            let mut inner = self.inner.borrow_mut();

            if socket == inner.listener_id {
                if ready.is_error() {
                    error!("tcp listener on {} failed, stopping", self.local_addr);
                    event_loop.stop();
                    return;
                }

                match self.receiver() {
                    Ok(receiver) => self.accept(&mut inner, event_loop, receiver),
                    Err(err) => warn!("{}", err),
                }
                return;
            }

            match inner.sockets.get(&socket) {
                Some(id) => *id,
                None => {
                    debug!("event {:?} on unowned socket {}", ready, socket);
                    return;
                }
            }
        };

        self.with_session(event_loop, session, |handler, ctx| {
            handler.handle_event(ctx, socket, ready);
        });
    }
}

impl DnsNotify for TcpRelay {
    fn dns_resolved(&self, event_loop: &mut EventLoop, waiter: WaiterId, hostname: &str, result: ResolveResult) {
        self.with_session(event_loop, waiter, |handler, ctx| {
            handler.on_dns_resolved(ctx, hostname, result);
        });
    }
}

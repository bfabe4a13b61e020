//! Scalable strategy on top of `mio` (epoll / kqueue)

use std::{
    collections::{BTreeMap, HashMap},
    io::{self, ErrorKind},
    time::Duration,
};

use log::trace;
use mio::{event::Event, unix::SourceFd, Events, Interest, Poll, Token};

use super::{Multiplexer, Ready};
use crate::event_loop::SocketId;

const EVENTS_CAPACITY: usize = 1024;

/// `mio` registrations are edge triggered. Every socket reported by a `poll` is
/// re-registered before the next wait, which makes the kernel re-check its readiness
/// and gives level triggered behaviour to the `EventLoop`.
///
/// `mio` can't express an interest without read or write, so sockets only watched
/// for errors are registered readable and their readable events are filtered out.
/// Filtered sockets are not re-armed, the next edge (new data, an error, a hangup)
/// wakes them up again.
pub struct MioMultiplexer {
    poll: Poll,
    events: Events,
    interests: HashMap<SocketId, Ready>,
    rearm: Vec<SocketId>,
}

fn to_interest(ready: Ready) -> Interest {
    match (ready.is_readable(), ready.is_writable()) {
        (true, true) => Interest::READABLE.add(Interest::WRITABLE),
        (false, true) => Interest::WRITABLE,
        _ => Interest::READABLE,
    }
}

/// Readiness of `event` as seen through `interest`
fn to_ready(event: &Event, interest: Ready) -> Ready {
    let mut ready = Ready::EMPTY;
    if interest.is_readable() && event.is_readable() {
        ready |= Ready::READABLE;
    }
    if interest.is_writable() && event.is_writable() {
        ready |= Ready::WRITABLE;
    }
    if event.is_error() {
        ready |= Ready::ERROR;
    }
    // A peer's FIN only shows up for readers, a full hangup for everyone
    if event.is_write_closed() || (interest.is_readable() && event.is_read_closed()) {
        ready |= Ready::HANGUP;
    }
    ready
}

#[inline]
fn token(socket: SocketId) -> Token {
    Token(socket as usize)
}

impl MioMultiplexer {
    pub fn new() -> io::Result<MioMultiplexer> {
        Ok(MioMultiplexer {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENTS_CAPACITY),
            interests: HashMap::new(),
            rearm: Vec::new(),
        })
    }
}

impl Multiplexer for MioMultiplexer {
    fn register(&mut self, socket: SocketId, interest: Ready) -> io::Result<()> {
        if self.interests.contains_key(&socket) {
            return Err(io::Error::new(ErrorKind::AlreadyExists, "socket already registered"));
        }
        self.poll
            .registry()
            .register(&mut SourceFd(&socket), token(socket), to_interest(interest))?;
        self.interests.insert(socket, interest);
        Ok(())
    }

    fn modify(&mut self, socket: SocketId, interest: Ready) -> io::Result<()> {
        if !self.interests.contains_key(&socket) {
            return Err(io::Error::new(ErrorKind::NotFound, "socket not registered"));
        }
        self.poll
            .registry()
            .reregister(&mut SourceFd(&socket), token(socket), to_interest(interest))?;
        self.interests.insert(socket, interest);
        Ok(())
    }

    fn unregister(&mut self, socket: SocketId) -> io::Result<()> {
        if self.interests.remove(&socket).is_none() {
            return Err(io::Error::new(ErrorKind::NotFound, "socket not registered"));
        }
        self.poll.registry().deregister(&mut SourceFd(&socket))
    }

    fn poll(&mut self, events: &mut BTreeMap<SocketId, Ready>, timeout: Duration) -> io::Result<()> {
        for socket in self.rearm.drain(..) {
            let interest = match self.interests.get(&socket) {
                Some(i) => to_interest(*i),
                None => continue,
            };
            let registry = self.poll.registry();
            if let Err(err) = registry.reregister(&mut SourceFd(&socket), token(socket), interest) {
                trace!("rearm socket {} failed, error: {}", socket, err);
            }
        }

        if let Err(err) = self.poll.poll(&mut self.events, Some(timeout)) {
            if err.kind() == ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        for event in self.events.iter() {
            let socket = event.token().0 as SocketId;
            let interest = match self.interests.get(&socket) {
                Some(i) => *i,
                None => continue,
            };

            let ready = to_ready(event, interest);
            if ready.is_empty() {
                continue;
            }

            *events.entry(socket).or_default() |= ready;
            self.rearm.push(socket);
        }

        Ok(())
    }
}

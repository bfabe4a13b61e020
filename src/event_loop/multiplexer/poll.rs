//! Portable strategy on top of `poll(2)`

use std::{
    collections::BTreeMap,
    io::{self, ErrorKind},
    time::Duration,
};

use super::{Multiplexer, Ready};
use crate::event_loop::SocketId;

/// Rebuilds the `pollfd` set from the recorded interests on every call
#[derive(Default)]
pub struct PollMultiplexer {
    interests: BTreeMap<SocketId, Ready>,
    fds: Vec<libc::pollfd>,
}

impl PollMultiplexer {
    pub fn new() -> PollMultiplexer {
        PollMultiplexer::default()
    }
}

impl Multiplexer for PollMultiplexer {
    fn register(&mut self, socket: SocketId, interest: Ready) -> io::Result<()> {
        if self.interests.contains_key(&socket) {
            return Err(io::Error::new(ErrorKind::AlreadyExists, "socket already registered"));
        }
        self.interests.insert(socket, interest);
        Ok(())
    }

    fn modify(&mut self, socket: SocketId, interest: Ready) -> io::Result<()> {
        match self.interests.get_mut(&socket) {
            Some(i) => {
                *i = interest;
                Ok(())
            }
            None => Err(io::Error::new(ErrorKind::NotFound, "socket not registered")),
        }
    }

    fn unregister(&mut self, socket: SocketId) -> io::Result<()> {
        match self.interests.remove(&socket) {
            Some(..) => Ok(()),
            None => Err(io::Error::new(ErrorKind::NotFound, "socket not registered")),
        }
    }

    fn poll(&mut self, events: &mut BTreeMap<SocketId, Ready>, timeout: Duration) -> io::Result<()> {
        self.fds.clear();
        for (&socket, &interest) in &self.interests {
            let mut flags: libc::c_short = 0;
            if interest.is_readable() {
                flags |= libc::POLLIN;
            }
            if interest.is_writable() {
                flags |= libc::POLLOUT;
            }
            self.fds.push(libc::pollfd {
                fd: socket,
                events: flags,
                revents: 0,
            });
        }

        let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
        let ret = unsafe { libc::poll(self.fds.as_mut_ptr(), self.fds.len() as libc::nfds_t, timeout_ms) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }
        if ret == 0 {
            return Ok(());
        }

        for pfd in &self.fds {
            if pfd.revents == 0 {
                continue;
            }

            let mut ready = Ready::EMPTY;
            if pfd.revents & (libc::POLLIN | libc::POLLPRI) != 0 {
                ready |= Ready::READABLE;
            }
            if pfd.revents & libc::POLLOUT != 0 {
                ready |= Ready::WRITABLE;
            }
            if pfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
                ready |= Ready::ERROR;
            }
            if pfd.revents & libc::POLLHUP != 0 {
                ready |= Ready::HANGUP;
            }

            *events.entry(pfd.fd).or_default() |= ready;
        }

        Ok(())
    }
}

//! Readiness multiplexers
//!
//! One interface, several interchangeable strategies. The strategy is picked when the
//! `EventLoop` is built, so every strategy runs through the same test suite.

use std::{
    collections::BTreeMap,
    fmt::{self, Debug, Display},
    io,
    ops::{BitAnd, BitOr, BitOrAssign, Sub},
    str::FromStr,
    time::Duration,
};

use super::SocketId;

pub use self::{mio_poller::MioMultiplexer, poll::PollMultiplexer};

mod mio_poller;
mod poll;

/// Readiness / interest mask
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Ready(u8);

impl Ready {
    pub const EMPTY: Ready = Ready(0);
    pub const READABLE: Ready = Ready(0b0001);
    pub const WRITABLE: Ready = Ready(0b0010);
    pub const ERROR: Ready = Ready(0b0100);
    pub const HANGUP: Ready = Ready(0b1000);

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn contains(self, other: Ready) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn intersects(self, other: Ready) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub fn is_readable(self) -> bool {
        self.contains(Ready::READABLE)
    }

    #[inline]
    pub fn is_writable(self) -> bool {
        self.contains(Ready::WRITABLE)
    }

    #[inline]
    pub fn is_error(self) -> bool {
        self.contains(Ready::ERROR)
    }

    #[inline]
    pub fn is_hangup(self) -> bool {
        self.contains(Ready::HANGUP)
    }
}

impl BitOr for Ready {
    type Output = Ready;

    fn bitor(self, rhs: Ready) -> Ready {
        Ready(self.0 | rhs.0)
    }
}

impl BitOrAssign for Ready {
    fn bitor_assign(&mut self, rhs: Ready) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Ready {
    type Output = Ready;

    fn bitand(self, rhs: Ready) -> Ready {
        Ready(self.0 & rhs.0)
    }
}

impl Sub for Ready {
    type Output = Ready;

    fn sub(self, rhs: Ready) -> Ready {
        Ready(self.0 & !rhs.0)
    }
}

impl Debug for Ready {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Ready, &str); 4] = [
            (Ready::READABLE, "READABLE"),
            (Ready::WRITABLE, "WRITABLE"),
            (Ready::ERROR, "ERROR"),
            (Ready::HANGUP, "HANGUP"),
        ];

        if self.is_empty() {
            return f.write_str("EMPTY");
        }

        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str(" | ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Readiness event source
///
/// Interest masks only carry `READABLE` and `WRITABLE` meaningfully, errors and
/// hangups are reported for every registered socket, including sockets with an
/// `ERROR` only interest.
/// Events are level triggered: a socket that stays ready is reported on every `poll`.
pub trait Multiplexer {
    fn register(&mut self, socket: SocketId, interest: Ready) -> io::Result<()>;
    fn modify(&mut self, socket: SocketId, interest: Ready) -> io::Result<()>;
    fn unregister(&mut self, socket: SocketId) -> io::Result<()>;

    /// Wait at most `timeout` and fill `events` with the ready sockets
    ///
    /// An interrupted wait is reported as success with no events.
    fn poll(&mut self, events: &mut BTreeMap<SocketId, Ready>, timeout: Duration) -> io::Result<()>;
}

/// Available multiplexer strategies
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum MultiplexerKind {
    /// epoll / kqueue through `mio`
    #[default]
    Mio,
    /// Portable `poll(2)` over a readiness set
    Poll,
}

impl MultiplexerKind {
    pub fn name(self) -> &'static str {
        match self {
            MultiplexerKind::Mio => "mio",
            MultiplexerKind::Poll => "poll",
        }
    }

    pub fn available() -> &'static [&'static str] {
        &["mio", "poll"]
    }

    /// Creates a multiplexer of this kind
    pub fn create(self) -> io::Result<Box<dyn Multiplexer>> {
        Ok(match self {
            MultiplexerKind::Mio => Box::new(MioMultiplexer::new()?),
            MultiplexerKind::Poll => Box::new(PollMultiplexer::new()),
        })
    }
}

impl Display for MultiplexerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error parsing `MultiplexerKind`
#[derive(Debug, Clone)]
pub struct MultiplexerKindError;

impl Display for MultiplexerKindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("unknown multiplexer, expecting \"mio\" or \"poll\"")
    }
}

impl std::error::Error for MultiplexerKindError {}

impl FromStr for MultiplexerKind {
    type Err = MultiplexerKindError;

    fn from_str(s: &str) -> Result<MultiplexerKind, MultiplexerKindError> {
        match s {
            "mio" | "epoll" | "kqueue" => Ok(MultiplexerKind::Mio),
            "poll" | "select" => Ok(MultiplexerKind::Poll),
            _ => Err(MultiplexerKindError),
        }
    }
}

#[cfg(test)]
mod test {
    use std::{
        io::Write,
        net::{TcpListener, TcpStream, UdpSocket},
        os::unix::io::AsRawFd,
    };

    use socket2::SockRef;

    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(100);

    fn socket_pair() -> (UdpSocket, UdpSocket) {
        let a = UdpSocket::bind("127.0.0.1:0").unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        (a, b)
    }

    fn poll_once(m: &mut dyn Multiplexer) -> BTreeMap<SocketId, Ready> {
        let mut events = BTreeMap::new();
        m.poll(&mut events, TIMEOUT).unwrap();
        events
    }

    fn conformance(kind: MultiplexerKind) {
        let _ = env_logger::try_init();

        let mut m = kind.create().unwrap();
        let (rx, tx) = socket_pair();
        let fd = rx.as_raw_fd();

        m.register(fd, Ready::READABLE | Ready::ERROR).unwrap();
        assert!(poll_once(&mut *m).get(&fd).is_none(), "{kind}: idle socket reported");

        tx.send_to(b"ping", rx.local_addr().unwrap()).unwrap();
        let events = poll_once(&mut *m);
        assert!(events.get(&fd).copied().unwrap_or_default().is_readable(), "{kind}: not readable");

        // Level triggered, nothing was read yet
        let events = poll_once(&mut *m);
        assert!(events.get(&fd).copied().unwrap_or_default().is_readable(), "{kind}: not level triggered");

        m.modify(fd, Ready::ERROR).unwrap();
        assert!(poll_once(&mut *m).get(&fd).is_none(), "{kind}: reported without interest");

        m.modify(fd, Ready::READABLE | Ready::WRITABLE).unwrap();
        let ready = poll_once(&mut *m).get(&fd).copied().unwrap_or_default();
        assert!(ready.is_readable() && ready.is_writable(), "{kind}: {ready:?}");

        m.unregister(fd).unwrap();
        assert!(poll_once(&mut *m).get(&fd).is_none(), "{kind}: reported after unregister");
    }

    /// Sockets watched for errors only still report resets, but never data
    fn error_only_conformance(kind: MultiplexerKind) {
        let _ = env_logger::try_init();

        let mut m = kind.create().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut peer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        let fd = accepted.as_raw_fd();

        m.register(fd, Ready::ERROR).unwrap();
        peer.write_all(b"unread").unwrap();
        assert!(poll_once(&mut *m).get(&fd).is_none(), "{kind}: data reported without interest");

        SockRef::from(&peer).set_linger(Some(Duration::ZERO)).unwrap();
        drop(peer);

        let mut ready = Ready::EMPTY;
        for _ in 0..10 {
            ready |= poll_once(&mut *m).get(&fd).copied().unwrap_or_default();
            if !ready.is_empty() {
                break;
            }
        }
        assert!(ready.intersects(Ready::ERROR | Ready::HANGUP), "{kind}: reset not reported, {ready:?}");
        assert!(!ready.is_readable(), "{kind}: {ready:?}");

        m.unregister(fd).unwrap();
    }

    #[test]
    fn mio_conformance() {
        conformance(MultiplexerKind::Mio);
        error_only_conformance(MultiplexerKind::Mio);
    }

    #[test]
    fn poll_conformance() {
        conformance(MultiplexerKind::Poll);
        error_only_conformance(MultiplexerKind::Poll);
    }

    #[test]
    fn ready_ops() {
        let r = Ready::READABLE | Ready::ERROR;
        assert!(r.is_readable());
        assert!(r.is_error());
        assert!(!r.is_writable());
        assert!(r.intersects(Ready::ERROR | Ready::HANGUP));
        assert_eq!(r - Ready::ERROR, Ready::READABLE);
        assert_eq!(format!("{r:?}"), "READABLE | ERROR");
        assert_eq!(format!("{:?}", Ready::EMPTY), "EMPTY");
    }

    #[test]
    fn kind_from_str() {
        assert_eq!("mio".parse::<MultiplexerKind>().unwrap(), MultiplexerKind::Mio);
        assert_eq!("poll".parse::<MultiplexerKind>().unwrap(), MultiplexerKind::Poll);
        assert!("iocp".parse::<MultiplexerKind>().is_err());
    }
}

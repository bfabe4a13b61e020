//! Single threaded readiness loop
//!
//! The loop owns one `Multiplexer`, maps every registered socket to the object that
//! receives its events, and fires periodic callbacks on a coarse cadence. Handlers
//! are shared `Rc`s taking `&self`, they keep their own state in `RefCell`s and get
//! the loop back as `&mut EventLoop` to adjust registrations while dispatching.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    io::{self, ErrorKind},
    mem,
    os::unix::io::RawFd,
    rc::Rc,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use log::{error, trace, warn};

pub use self::multiplexer::{Multiplexer, MultiplexerKind, Ready};

pub mod multiplexer;

/// Identity of a socket registered in the loop
pub type SocketId = RawFd;

/// Default wait of one poll
pub const POLL_TIMEOUT: Duration = Duration::from_millis(10);

/// Default cadence of periodic callbacks
pub const TIMEOUT_PRECISION: Duration = Duration::from_secs(10);

/// Receiver of readiness events
pub trait SocketHandler {
    fn handle_event(&self, event_loop: &mut EventLoop, socket: SocketId, ready: Ready);
}

/// Receiver of periodic callbacks
pub trait PeriodicHandler {
    fn handle_periodic(&self, event_loop: &mut EventLoop);
}

/// Stops an `EventLoop` from anywhere, including other threads
#[derive(Clone, Debug)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }
}

pub struct EventLoop {
    multiplexer: Box<dyn Multiplexer>,
    handlers: HashMap<SocketId, Rc<dyn SocketHandler>>,
    periodic: Vec<Rc<dyn PeriodicHandler>>,
    events: BTreeMap<SocketId, Ready>,
    // Sockets removed or replaced since the last poll, their polled events are stale
    released: HashSet<SocketId>,
    poll_timeout: Duration,
    timeout_precision: Duration,
    last_tick: Instant,
    stopping: Arc<AtomicBool>,
}

#[inline]
fn same_object<T: ?Sized>(a: &Rc<T>, b: &Rc<T>) -> bool {
    Rc::as_ptr(a) as *const () == Rc::as_ptr(b) as *const ()
}

impl EventLoop {
    /// Creates a loop with a multiplexer of `kind`
    pub fn new(kind: MultiplexerKind) -> io::Result<EventLoop> {
        let multiplexer = kind.create()?;
        trace!("event loop created with {} multiplexer", kind);
        Ok(EventLoop::with_multiplexer(multiplexer))
    }

    pub fn with_multiplexer(multiplexer: Box<dyn Multiplexer>) -> EventLoop {
        EventLoop {
            multiplexer,
            handlers: HashMap::new(),
            periodic: Vec::new(),
            events: BTreeMap::new(),
            released: HashSet::new(),
            poll_timeout: POLL_TIMEOUT,
            timeout_precision: TIMEOUT_PRECISION,
            last_tick: Instant::now(),
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Set the wait of a single poll
    pub fn set_poll_timeout(&mut self, timeout: Duration) {
        self.poll_timeout = timeout;
    }

    /// Set the cadence of periodic callbacks
    pub fn set_timeout_precision(&mut self, precision: Duration) {
        self.timeout_precision = precision;
    }

    /// Register `socket` with `interest`, dispatching its events to `handler`
    pub fn add(&mut self, socket: SocketId, interest: Ready, handler: Rc<dyn SocketHandler>) -> io::Result<()> {
        if self.handlers.contains_key(&socket) {
            warn!("socket {} is already in the event loop, replacing its handler", socket);
            self.multiplexer.modify(socket, interest)?;
            self.released.insert(socket);
        } else {
            self.multiplexer.register(socket, interest)?;
        }
        self.handlers.insert(socket, handler);
        Ok(())
    }

    /// Unregister `socket`, a no-op for unknown sockets
    pub fn remove(&mut self, socket: SocketId) -> io::Result<()> {
        if self.handlers.remove(&socket).is_none() {
            return Ok(());
        }
        self.released.insert(socket);
        self.multiplexer.unregister(socket)
    }

    pub fn modify(&mut self, socket: SocketId, interest: Ready) -> io::Result<()> {
        if !self.handlers.contains_key(&socket) {
            return Err(io::Error::new(ErrorKind::NotFound, "socket is not in the event loop"));
        }
        self.multiplexer.modify(socket, interest)
    }

    pub fn contains(&self, socket: SocketId) -> bool {
        self.handlers.contains_key(&socket)
    }

    /// Subscribe to periodic callbacks, subscribing twice has no effect
    pub fn add_periodic(&mut self, handler: Rc<dyn PeriodicHandler>) {
        if !self.periodic.iter().any(|h| same_object(h, &handler)) {
            self.periodic.push(handler);
        }
    }

    pub fn remove_periodic(&mut self, handler: &Rc<dyn PeriodicHandler>) {
        self.periodic.retain(|h| !same_object(h, handler));
    }

    /// Ask the loop to stop, observed before the next iteration and between dispatches
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.stopping.clone())
    }

    /// Run until stopped or until the multiplexer fails
    pub fn run(&mut self) -> io::Result<()> {
        while !self.is_stopped() {
            if let Err(err) = self.run_once() {
                error!("event loop poll failed, error: {}", err);
                return Err(err);
            }
        }
        Ok(())
    }

    /// One poll, periodic callbacks if they are due, and dispatch of the polled events
    pub fn run_once(&mut self) -> io::Result<()> {
        let mut events = mem::take(&mut self.events);
        events.clear();

        let result = self.multiplexer.poll(&mut events, self.poll_timeout);
        if let Err(err) = result {
            self.events = events;
            return Err(err);
        }
        self.released.clear();

        if self.last_tick.elapsed() >= self.timeout_precision {
            let periodic = self.periodic.clone();
            for handler in periodic {
                handler.handle_periodic(self);
            }
            self.last_tick = Instant::now();
        }

        for (&socket, &ready) in &events {
            if self.is_stopped() {
                break;
            }

            // Removed by a handler dispatched earlier in this pass, possibly with its
            // descriptor already reused by a new registration
            if self.released.contains(&socket) {
                trace!("dropping stale {:?} of socket {}", ready, socket);
                continue;
            }
            let handler = match self.handlers.get(&socket) {
                Some(h) => h.clone(),
                None => continue,
            };
            handler.handle_event(self, socket, ready);
        }

        self.events = events;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::{cell::RefCell, collections::VecDeque};

    use super::*;

    #[derive(Default)]
    struct Script {
        polls: VecDeque<Vec<(SocketId, Ready)>>,
        registered: HashMap<SocketId, Ready>,
    }

    struct ScriptedMultiplexer(Rc<RefCell<Script>>);

    impl Multiplexer for ScriptedMultiplexer {
        fn register(&mut self, socket: SocketId, interest: Ready) -> io::Result<()> {
            self.0.borrow_mut().registered.insert(socket, interest);
            Ok(())
        }

        fn modify(&mut self, socket: SocketId, interest: Ready) -> io::Result<()> {
            self.0.borrow_mut().registered.insert(socket, interest);
            Ok(())
        }

        fn unregister(&mut self, socket: SocketId) -> io::Result<()> {
            self.0.borrow_mut().registered.remove(&socket);
            Ok(())
        }

        fn poll(&mut self, events: &mut BTreeMap<SocketId, Ready>, _: Duration) -> io::Result<()> {
            if let Some(batch) = self.0.borrow_mut().polls.pop_front() {
                events.extend(batch);
            }
            Ok(())
        }
    }

    enum Action {
        Nothing,
        Stop,
        Remove(SocketId),
        /// Close `SocketId` and register a new socket under the same descriptor
        Reuse(SocketId, Rc<Recorder>),
    }

    struct Recorder {
        seen: RefCell<Vec<(SocketId, Ready)>>,
        action: Action,
    }

    impl Recorder {
        fn new(action: Action) -> Rc<Recorder> {
            Rc::new(Recorder {
                seen: RefCell::new(Vec::new()),
                action,
            })
        }
    }

    impl SocketHandler for Recorder {
        fn handle_event(&self, event_loop: &mut EventLoop, socket: SocketId, ready: Ready) {
            self.seen.borrow_mut().push((socket, ready));
            match self.action {
                Action::Nothing => {}
                Action::Stop => event_loop.stop(),
                Action::Remove(s) => event_loop.remove(s).unwrap(),
                Action::Reuse(s, ref owner) => {
                    event_loop.remove(s).unwrap();
                    event_loop.add(s, Ready::READABLE, owner.clone()).unwrap();
                }
            }
        }
    }

    struct Ticker(RefCell<usize>);

    impl PeriodicHandler for Ticker {
        fn handle_periodic(&self, _: &mut EventLoop) {
            *self.0.borrow_mut() += 1;
        }
    }

    fn scripted() -> (EventLoop, Rc<RefCell<Script>>) {
        let script = Rc::new(RefCell::new(Script::default()));
        let event_loop = EventLoop::with_multiplexer(Box::new(ScriptedMultiplexer(script.clone())));
        (event_loop, script)
    }

    #[test]
    fn dispatches_to_registered_handler() {
        let (mut event_loop, script) = scripted();
        let h = Recorder::new(Action::Nothing);
        event_loop.add(3, Ready::READABLE, h.clone()).unwrap();
        assert_eq!(script.borrow().registered.get(&3), Some(&Ready::READABLE));

        script.borrow_mut().polls.push_back(vec![(3, Ready::READABLE), (4, Ready::READABLE)]);
        event_loop.run_once().unwrap();

        assert_eq!(*h.seen.borrow(), vec![(3, Ready::READABLE)]);
    }

    #[test]
    fn stop_interrupts_dispatch() {
        let (mut event_loop, script) = scripted();
        let stopper = Recorder::new(Action::Stop);
        let later = Recorder::new(Action::Nothing);
        event_loop.add(3, Ready::READABLE, stopper.clone()).unwrap();
        event_loop.add(5, Ready::READABLE, later.clone()).unwrap();

        script.borrow_mut().polls.push_back(vec![(3, Ready::READABLE), (5, Ready::READABLE)]);
        event_loop.run().unwrap();

        assert_eq!(stopper.seen.borrow().len(), 1);
        assert!(later.seen.borrow().is_empty());
        assert!(event_loop.is_stopped());
    }

    #[test]
    fn removed_socket_is_skipped_in_same_pass() {
        let (mut event_loop, script) = scripted();
        let remover = Recorder::new(Action::Remove(5));
        let victim = Recorder::new(Action::Nothing);
        event_loop.add(3, Ready::READABLE, remover).unwrap();
        event_loop.add(5, Ready::READABLE, victim.clone()).unwrap();

        script.borrow_mut().polls.push_back(vec![(3, Ready::READABLE), (5, Ready::WRITABLE)]);
        event_loop.run_once().unwrap();

        assert!(victim.seen.borrow().is_empty());
        assert!(!event_loop.contains(5));
        assert!(!script.borrow().registered.contains_key(&5));
    }

    #[test]
    fn reused_descriptor_skips_stale_events() {
        let (mut event_loop, script) = scripted();
        let newcomer = Recorder::new(Action::Nothing);
        let releaser = Recorder::new(Action::Reuse(5, newcomer.clone()));
        let old_owner = Recorder::new(Action::Nothing);
        event_loop.add(3, Ready::READABLE, releaser).unwrap();
        event_loop.add(5, Ready::READABLE, old_owner.clone()).unwrap();

        script.borrow_mut().polls.push_back(vec![(3, Ready::READABLE), (5, Ready::ERROR)]);
        event_loop.run_once().unwrap();

        // The old owner's error belongs to the old socket
        assert!(old_owner.seen.borrow().is_empty());
        assert!(newcomer.seen.borrow().is_empty());
        assert!(event_loop.contains(5));

        script.borrow_mut().polls.push_back(vec![(5, Ready::READABLE)]);
        event_loop.run_once().unwrap();
        assert_eq!(*newcomer.seen.borrow(), vec![(5, Ready::READABLE)]);
    }

    #[test]
    fn remove_unknown_socket_is_noop() {
        let (mut event_loop, _script) = scripted();
        event_loop.remove(42).unwrap();
        assert!(event_loop.modify(42, Ready::READABLE).is_err());
    }

    #[test]
    fn periodic_fires_on_cadence() {
        let (mut event_loop, _script) = scripted();
        let ticker = Rc::new(Ticker(RefCell::new(0)));
        let periodic: Rc<dyn PeriodicHandler> = ticker.clone();
        event_loop.add_periodic(periodic.clone());
        event_loop.add_periodic(periodic.clone());

        event_loop.set_timeout_precision(Duration::from_secs(3600));
        event_loop.run_once().unwrap();
        assert_eq!(*ticker.0.borrow(), 0);

        event_loop.set_timeout_precision(Duration::ZERO);
        event_loop.run_once().unwrap();
        event_loop.run_once().unwrap();
        assert_eq!(*ticker.0.borrow(), 2);

        event_loop.remove_periodic(&periodic);
        event_loop.run_once().unwrap();
        assert_eq!(*ticker.0.borrow(), 2);
    }

    #[test]
    fn stop_handle_from_other_thread() {
        let (mut event_loop, _script) = scripted();
        let handle = event_loop.stop_handle();
        std::thread::spawn(move || handle.stop()).join().unwrap();
        event_loop.run().unwrap();
        assert!(event_loop.is_stopped());
    }
}

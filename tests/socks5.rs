#![cfg(unix)]

use std::{
    cell::RefCell,
    collections::HashMap,
    io::{ErrorKind, Read, Write},
    net::{IpAddr, SocketAddr, TcpListener, TcpStream, UdpSocket},
    rc::Rc,
};

use fssocks::{
    crypto::CipherKind,
    event_loop::{EventLoop, MultiplexerKind},
    relay::{
        dns_resolver::{DnsResolver, Resolve, ResolveError, ResolveResult, Waiter, WaiterId},
        tcprelay::{Stage, TcpRelay, TcpRelaySettings},
    },
};

/// Answers IP literals synchronously and remembers every hostname it was asked for
#[derive(Default)]
struct RecordingResolver {
    asked: RefCell<Vec<String>>,
    removed: RefCell<Vec<WaiterId>>,
}

impl Resolve for RecordingResolver {
    fn resolve(&self, hostname: &str, _waiter: Waiter) -> Option<ResolveResult> {
        self.asked.borrow_mut().push(hostname.to_owned());
        Some(
            hostname
                .parse::<IpAddr>()
                .map_err(|_| ResolveError::NoAddress(hostname.to_owned())),
        )
    }

    fn remove_callback(&self, waiter: WaiterId) {
        self.removed.borrow_mut().push(waiter);
    }
}

/// Nameserver on a plain UDP socket, answering only when told to
struct FakeNameserver {
    socket: UdpSocket,
}

impl FakeNameserver {
    fn new() -> FakeNameserver {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_nonblocking(true).unwrap();
        FakeNameserver { socket }
    }

    fn addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    /// Pump `event_loop` until a query arrives
    fn expect_query(&self, event_loop: &mut EventLoop) -> (Vec<u8>, SocketAddr) {
        let mut buf = [0u8; 512];
        for _ in 0..500 {
            match self.socket.recv_from(&mut buf) {
                Ok((n, from)) => return (buf[..n].to_vec(), from),
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => {}
                Err(err) => panic!("nameserver recv failed: {err}"),
            }
            event_loop.run_once().unwrap();
        }
        panic!("no dns query received");
    }

    /// Answer `query` with a single A record
    fn answer_a(&self, query: &(Vec<u8>, SocketAddr), ip: [u8; 4]) {
        let (packet, from) = query;
        let mut resp = Vec::new();
        resp.extend_from_slice(&packet[0..2]);
        resp.extend_from_slice(&[0x81, 0x80, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00]);
        resp.extend_from_slice(&packet[12..]);
        resp.extend_from_slice(&[0xC0, 0x0C, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x0E, 0x10, 0x00, 0x04]);
        resp.extend_from_slice(&ip);
        self.socket.send_to(&resp, from).unwrap();
    }
}

fn settings(is_local: bool, server: SocketAddr) -> TcpRelaySettings {
    TcpRelaySettings {
        is_local,
        server_host: server.ip().to_string(),
        server_port: server.port(),
        method: CipherKind::None,
    }
}

fn relay(event_loop: &mut EventLoop, settings: TcpRelaySettings, resolver: &Rc<RecordingResolver>) -> Rc<TcpRelay> {
    relay_with(event_loop, settings, resolver.clone())
}

fn relay_with(event_loop: &mut EventLoop, settings: TcpRelaySettings, resolver: Rc<dyn Resolve>) -> Rc<TcpRelay> {
    let relay = TcpRelay::bind(&"127.0.0.1:0".parse().unwrap(), settings, resolver).unwrap();
    relay.add_to_loop(event_loop).unwrap();
    relay
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_nonblocking(true).unwrap();
    stream
}

/// Append whatever is readable right now, returns `true` on EOF
fn read_available(stream: &mut TcpStream, buf: &mut Vec<u8>) -> bool {
    let mut chunk = [0u8; 4096];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => return true,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(ref err) if err.kind() == ErrorKind::WouldBlock => return false,
            Err(ref err) if err.kind() == ErrorKind::ConnectionReset => return true,
            Err(err) => panic!("read failed: {err}"),
        }
    }
}

fn pump_until<F: FnMut() -> bool>(event_loop: &mut EventLoop, mut done: F) -> bool {
    for _ in 0..500 {
        event_loop.run_once().unwrap();
        if done() {
            return true;
        }
    }
    false
}

/// Pump until `stream` produced at least `n` bytes
fn pump_read(event_loop: &mut EventLoop, stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = Vec::new();
    assert!(
        pump_until(event_loop, || {
            read_available(stream, &mut buf);
            buf.len() >= n
        }),
        "expected {} bytes, got {:?}",
        n,
        buf
    );
    buf
}

fn pump_eof(event_loop: &mut EventLoop, stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    assert!(pump_until(event_loop, || read_available(stream, &mut buf)));
    buf
}

fn accept(event_loop: &mut EventLoop, listener: &TcpListener) -> TcpStream {
    let mut accepted = None;
    assert!(pump_until(event_loop, || match listener.accept() {
        Ok((s, _)) => {
            accepted = Some(s);
            true
        }
        Err(ref err) if err.kind() == ErrorKind::WouldBlock => false,
        Err(err) => panic!("accept failed: {err}"),
    }));
    let stream = accepted.unwrap();
    stream.set_nonblocking(true).unwrap();
    stream
}

fn upstream() -> TcpListener {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    listener
}

fn unused_addr() -> SocketAddr {
    TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap()
}

fn setup() -> (EventLoop, Rc<RecordingResolver>) {
    let _ = env_logger::try_init();
    (
        EventLoop::new(MultiplexerKind::Mio).unwrap(),
        Rc::new(RecordingResolver::default()),
    )
}

#[test]
fn method_selection() {
    let (mut event_loop, resolver) = setup();
    let relay = relay(&mut event_loop, settings(true, unused_addr()), &resolver);

    let mut client = connect(relay.local_addr());
    client.write_all(&[0x05, 0x01, 0x00]).unwrap();

    assert_eq!(pump_read(&mut event_loop, &mut client, 2), [0x05, 0x00]);
    assert_eq!(relay.session_stages(), [Stage::Addr]);
}

#[test]
fn no_acceptable_method() {
    let (mut event_loop, resolver) = setup();
    let relay = relay(&mut event_loop, settings(true, unused_addr()), &resolver);

    let mut client = connect(relay.local_addr());
    client.write_all(&[0x05, 0x01, 0x02]).unwrap();

    assert_eq!(pump_eof(&mut event_loop, &mut client), [0x05, 0xFF]);
    assert_eq!(relay.session_count(), 0);
    assert!(resolver.asked.borrow().is_empty());
}

#[test]
fn unsupported_command() {
    let (mut event_loop, resolver) = setup();
    let relay = relay(&mut event_loop, settings(true, unused_addr()), &resolver);

    let mut client = connect(relay.local_addr());
    client.write_all(&[0x05, 0x01, 0x00]).unwrap();
    pump_read(&mut event_loop, &mut client, 2);

    // BIND
    client
        .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50])
        .unwrap();
    assert!(pump_eof(&mut event_loop, &mut client).is_empty());
    assert_eq!(relay.session_count(), 0);
}

#[test]
fn udp_associate_waits_for_disconnect() {
    let (mut event_loop, resolver) = setup();
    let relay = relay(&mut event_loop, settings(true, unused_addr()), &resolver);
    let bound = relay.local_addr();

    let mut client = connect(bound);
    client.write_all(&[0x05, 0x01, 0x00]).unwrap();
    pump_read(&mut event_loop, &mut client, 2);

    client
        .write_all(&[0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0x00, 0x00])
        .unwrap();
    let reply = pump_read(&mut event_loop, &mut client, 10);
    let port = bound.port().to_be_bytes();
    assert_eq!(reply, [0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, port[0], port[1]]);
    assert_eq!(relay.session_stages(), [Stage::UdpAssoc]);

    // Ignored while associated
    client.write_all(b"noise").unwrap();
    for _ in 0..5 {
        event_loop.run_once().unwrap();
    }
    assert_eq!(relay.session_stages(), [Stage::UdpAssoc]);

    drop(client);
    assert!(pump_until(&mut event_loop, || relay.session_count() == 0));
}

#[test]
fn local_forwards_to_configured_server() {
    let (mut event_loop, resolver) = setup();
    let server = upstream();
    let relay = relay(&mut event_loop, settings(true, server.local_addr().unwrap()), &resolver);

    let mut client = connect(relay.local_addr());
    client.write_all(&[0x05, 0x01, 0x00]).unwrap();
    assert_eq!(pump_read(&mut event_loop, &mut client, 2), [0x05, 0x00]);

    let mut request = vec![0x05, 0x01, 0x00, 0x03, 11];
    request.extend_from_slice(b"example.com");
    request.extend_from_slice(&[0x00, 0x50]);
    request.extend_from_slice(b"GET / HTTP/1.0\r\n\r\n");
    client.write_all(&request).unwrap();

    assert_eq!(
        pump_read(&mut event_loop, &mut client, 10),
        [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
    );

    // The relay server gets the address header and the payload, untouched
    let mut remote = accept(&mut event_loop, &server);
    let forwarded = pump_read(&mut event_loop, &mut remote, request.len() - 3);
    assert_eq!(forwarded, &request[3..]);

    // Resolution targets the relay server, not the destination
    assert_eq!(*resolver.asked.borrow(), ["127.0.0.1"]);
    assert_eq!(relay.session_stages(), [Stage::Stream]);

    remote.write_all(b"HTTP/1.0 200 OK\r\n\r\nhello").unwrap();
    assert_eq!(
        pump_read(&mut event_loop, &mut client, 24),
        b"HTTP/1.0 200 OK\r\n\r\nhello"
    );

    drop(remote);
    assert!(pump_eof(&mut event_loop, &mut client).is_empty());
    assert_eq!(relay.session_count(), 0);
    assert_eq!(resolver.removed.borrow().len(), 1);
}

#[test]
fn server_connect_refused() {
    let (mut event_loop, resolver) = setup();
    let relay = relay(&mut event_loop, settings(false, unused_addr()), &resolver);
    let target = unused_addr();

    let mut client = connect(relay.local_addr());
    let mut request = vec![0x01, 127, 0, 0, 1];
    request.extend_from_slice(&target.port().to_be_bytes());
    request.extend_from_slice(b"payload");
    client.write_all(&request).unwrap();

    assert!(pump_eof(&mut event_loop, &mut client).is_empty());
    assert_eq!(relay.session_count(), 0);
    assert_eq!(*resolver.asked.borrow(), ["127.0.0.1"]);
}

#[test]
fn server_resolution_failure() {
    let (mut event_loop, resolver) = setup();
    let relay = relay(&mut event_loop, settings(false, unused_addr()), &resolver);

    let mut client = connect(relay.local_addr());
    let mut request = vec![0x03, 12];
    request.extend_from_slice(b"nowhere.test");
    request.extend_from_slice(&[0x00, 0x50]);
    client.write_all(&request).unwrap();

    assert!(pump_eof(&mut event_loop, &mut client).is_empty());
    assert_eq!(relay.session_count(), 0);
    assert_eq!(*resolver.asked.borrow(), ["nowhere.test"]);
}

/// Server relay resolving through a real resolver that asks `nameserver`
fn setup_with_nameserver(nameserver: &FakeNameserver) -> (EventLoop, Rc<DnsResolver>, Rc<TcpRelay>) {
    let _ = env_logger::try_init();
    let mut event_loop = EventLoop::new(MultiplexerKind::Mio).unwrap();
    let resolver = DnsResolver::new(vec![nameserver.addr()], HashMap::new());
    resolver.add_to_loop(&mut event_loop).unwrap();
    let relay = relay_with(&mut event_loop, settings(false, unused_addr()), resolver.clone());
    (event_loop, resolver, relay)
}

fn hostname_request(hostname: &str, port: u16, payload: &[u8]) -> Vec<u8> {
    let mut request = vec![0x03, hostname.len() as u8];
    request.extend_from_slice(hostname.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    request.extend_from_slice(payload);
    request
}

#[test]
fn server_forwards_early_payload_after_resolution() {
    let nameserver = FakeNameserver::new();
    let (mut event_loop, resolver, relay) = setup_with_nameserver(&nameserver);
    let target = upstream();
    let port = target.local_addr().unwrap().port();

    let mut client = connect(relay.local_addr());
    client.write_all(&hostname_request("foo.test", port, b"early")).unwrap();

    let query = nameserver.expect_query(&mut event_loop);
    assert_eq!(relay.session_stages(), [Stage::Dns]);
    assert_eq!(resolver.pending_waiters(), 1);

    nameserver.answer_a(&query, [127, 0, 0, 1]);
    let mut stream = accept(&mut event_loop, &target);
    assert_eq!(pump_read(&mut event_loop, &mut stream, 5), b"early");

    assert_eq!(relay.session_stages(), [Stage::Stream]);
    assert_eq!(resolver.pending_waiters(), 0);
    assert!(resolver.is_cached("foo.test"));

    stream.write_all(b"late").unwrap();
    assert_eq!(pump_read(&mut event_loop, &mut client, 4), b"late");
}

#[test]
fn teardown_during_resolution_cancels_waiter() {
    let nameserver = FakeNameserver::new();
    let (mut event_loop, resolver, relay) = setup_with_nameserver(&nameserver);
    let target = upstream();
    let port = target.local_addr().unwrap().port();

    let client = connect(relay.local_addr());
    (&client).write_all(&hostname_request("slow.test", port, b"early")).unwrap();

    let query = nameserver.expect_query(&mut event_loop);
    assert_eq!(resolver.pending_waiters(), 1);

    drop(client);
    assert!(pump_until(&mut event_loop, || relay.session_count() == 0));
    assert_eq!(resolver.pending_waiters(), 0);

    // A late answer reaches nobody
    nameserver.answer_a(&query, [127, 0, 0, 1]);
    for _ in 0..10 {
        event_loop.run_once().unwrap();
    }
    assert_eq!(target.accept().unwrap_err().kind(), ErrorKind::WouldBlock);
    assert_eq!(relay.session_count(), 0);
}

#[test]
fn local_and_server_chain_to_echo() {
    let (mut event_loop, resolver) = setup();
    let echo = upstream();
    let echo_addr = echo.local_addr().unwrap();

    let server = relay(&mut event_loop, settings(false, unused_addr()), &resolver);
    let local = relay(&mut event_loop, settings(true, server.local_addr()), &resolver);

    let mut client = connect(local.local_addr());
    client.write_all(&[0x05, 0x01, 0x00]).unwrap();
    pump_read(&mut event_loop, &mut client, 2);

    let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
    request.extend_from_slice(&echo_addr.port().to_be_bytes());
    client.write_all(&request).unwrap();
    pump_read(&mut event_loop, &mut client, 10);

    let mut echo_stream = accept(&mut event_loop, &echo);

    let message = vec![0x5Au8; 100_000];
    let mut sent = 0;
    let mut received = Vec::new();
    let mut pending = Vec::new();
    assert!(pump_until(&mut event_loop, || {
        if sent < message.len() {
            match client.write(&message[sent..]) {
                Ok(n) => sent += n,
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => {}
                Err(err) => panic!("client write failed: {err}"),
            }
        }

        read_available(&mut echo_stream, &mut pending);
        if !pending.is_empty() {
            match echo_stream.write(&pending) {
                Ok(n) => {
                    pending.drain(..n);
                }
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => {}
                Err(err) => panic!("echo write failed: {err}"),
            }
        }

        read_available(&mut client, &mut received);
        received.len() >= message.len()
    }));
    assert_eq!(received, message);

    assert_eq!(local.session_stages(), [Stage::Stream]);
    assert_eq!(server.session_stages(), [Stage::Stream]);

    drop(client);
    assert!(pump_until(&mut event_loop, || local.session_count() == 0));

    local.close(&mut event_loop);
    server.close(&mut event_loop);
    assert_eq!(server.session_count(), 0);
}

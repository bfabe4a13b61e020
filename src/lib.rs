//! fssocks is a SOCKS5 forwarding proxy built on a single threaded readiness loop.
//!
//! ## Usage
//!
//! Build fssocks and you will get 2 binaries: `fslocal` and `fsserver`
//!
//! `fslocal` accepts SOCKS5 clients and forwards their streams and datagrams to a
//! `fsserver`, which connects to the real destinations.
//!
//! ```json
//! {
//!    "server": "my_server_ip",
//!    "server_port": 8388,
//!    "local_address": "127.0.0.1",
//!    "local_port": 1080,
//!    "method": "none"
//! }
//! ```
//!
//! ```bash
//! fsserver -c fssocks.json
//! fslocal -c fssocks.json
//! curl --socks5-hostname 127.0.0.1:1080 http://example.com
//! ```
//!
//! ## API Usage
//!
//! ```no_run
//! use fssocks::{run, Config, ConfigType};
//!
//! let config = Config::load_from_file("fssocks.json", ConfigType::Local).unwrap();
//! run(config).unwrap();
//! ```

#![cfg(unix)]

use std::{io, rc::Rc};

use log::{info, warn};

pub use self::{
    config::{Config, ConfigType},
    event_loop::{EventLoop, MultiplexerKind, StopHandle},
    relay::{dns_resolver::DnsResolver, tcprelay::TcpRelay, udprelay::UdpRelay},
};

pub mod cache;
pub mod config;
pub mod crypto;
pub mod event_loop;
pub mod logging;
pub mod net;
pub mod relay;
pub mod service;
mod vparser;

/// fssocks version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit code when server aborted
pub const EXIT_CODE_SERVER_ABORTED: u8 = sysexits::EX_SOFTWARE;
/// Exit code when loading configuration from file fails
pub const EXIT_CODE_LOAD_CONFIG_FAILURE: u8 = sysexits::EX_CONFIG;
/// Exit code when insufficient params are passed via CLI
pub const EXIT_CODE_INSUFFICIENT_PARAMS: u8 = sysexits::EX_USAGE;

mod sysexits {
    pub const EX_USAGE: u8 = 64;
    pub const EX_SOFTWARE: u8 = 70;
    pub const EX_CONFIG: u8 = 78;
}

/// Every component of one running role
pub struct Instance {
    pub event_loop: EventLoop,
    pub resolver: Rc<DnsResolver>,
    pub tcp_relay: Rc<TcpRelay>,
    pub udp_relay: Rc<UdpRelay>,
}

impl Instance {
    /// Create and register the resolver and both relays of `config`'s role
    pub fn new(config: &Config) -> io::Result<Instance> {
        let mut event_loop = EventLoop::new(config.multiplexer)?;

        let resolver = DnsResolver::with_hosts_file(config.nameservers.clone(), &config.hosts_path);
        resolver.add_to_loop(&mut event_loop)?;

        let tcp_relay = TcpRelay::new(config, resolver.clone())?;
        tcp_relay.add_to_loop(&mut event_loop)?;

        let udp_relay = UdpRelay::new(config)?;
        udp_relay.add_to_loop(&mut event_loop)?;

        Ok(Instance {
            event_loop,
            resolver,
            tcp_relay,
            udp_relay,
        })
    }

    /// Run until stopped, then close everything in reverse order of creation
    pub fn run(mut self) -> io::Result<()> {
        let result = self.event_loop.run();
        if let Err(ref err) = result {
            warn!("event loop aborted, error: {}", err);
        }

        self.udp_relay.close(&mut self.event_loop);
        self.tcp_relay.close(&mut self.event_loop);
        self.resolver.close(&mut self.event_loop);
        info!("all relays closed");

        result
    }
}

/// Run the role described by `config` until the loop stops
pub fn run(config: Config) -> io::Result<()> {
    info!(
        "fssocks {} starting {} with {} multiplexer",
        VERSION,
        if config.is_local() { "local" } else { "server" },
        config.multiplexer
    );

    Instance::new(&config)?.run()
}

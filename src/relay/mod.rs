//! Relay stages of both roles
//!
//! The client role accepts SOCKS5 on its listener and forwards everything to the
//! relay server, which connects to the address carried in front of the stream.

pub mod dns_resolver;
pub mod socks5;
pub mod tcprelay;
pub mod udprelay;

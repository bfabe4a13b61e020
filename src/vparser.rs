//! Command line argument value parsers

use std::net::SocketAddr;

use crate::{config, crypto::CipherKind, event_loop::MultiplexerKind};

macro_rules! value_parser_type {
    ($name:ident, $ty:ty, $help:expr) => {
        pub fn $name(v: &str) -> Result<$ty, String> {
            match v.parse::<$ty>() {
                Ok(t) => Ok(t),
                Err(..) => Err($help.to_owned()),
            }
        }
    };
}

value_parser_type!(parse_cipher_kind, CipherKind, "invalid method");
value_parser_type!(
    parse_multiplexer_kind,
    MultiplexerKind,
    "should be \"mio\" or \"poll\""
);

pub fn parse_nameservers(v: &str) -> Result<Vec<SocketAddr>, String> {
    config::parse_nameservers(v).map_err(|err| err.to_string())
}

//! Payload transform hooks
//!
//! The relay channel runs every payload chunk through a `StreamCipher`, one per
//! direction. Only the passthrough method exists, the hook is where a real stream
//! cipher would plug in.

use std::{
    fmt::{self, Display},
    str::FromStr,
};

use bytes::BufMut;

pub use self::dummy::DummyCipher;

mod dummy;

#[rustfmt::skip]
mod consts {
    pub const CIPHER_NONE:  &str = "none";
    pub const CIPHER_PLAIN: &str = "plain";
}

/// Cipher error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CipherError {
    #[error("unknown cipher method {0:?}")]
    UnknownCipherType(String),
}

pub type CipherResult<T> = Result<T, CipherError>;

/// Crypto mode, encrypt or decrypt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CryptoMode {
    Encrypt,
    Decrypt,
}

/// Available payload methods
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CipherKind {
    /// Copy payload as is
    #[default]
    None,
}

impl CipherKind {
    pub fn name(self) -> &'static str {
        match self {
            CipherKind::None => consts::CIPHER_NONE,
        }
    }

    pub fn available() -> &'static [&'static str] {
        &[consts::CIPHER_NONE, consts::CIPHER_PLAIN]
    }
}

impl Display for CipherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CipherKind {
    type Err = CipherError;

    fn from_str(s: &str) -> Result<CipherKind, CipherError> {
        match s {
            consts::CIPHER_NONE | consts::CIPHER_PLAIN | "" => Ok(CipherKind::None),
            _ => Err(CipherError::UnknownCipherType(s.to_owned())),
        }
    }
}

/// Streaming payload transform
pub trait StreamCipher {
    /// Transform `data`, appending the output to `out`
    fn update(&mut self, data: &[u8], out: &mut dyn BufMut) -> CipherResult<()>;
    /// Upper bound of the output size of `update(data)`
    fn buffer_size(&self, data: &[u8]) -> usize;
}

/// Creates a cipher of `kind` working in `mode`
pub fn new_stream(kind: CipherKind, mode: CryptoMode) -> Box<dyn StreamCipher> {
    match (kind, mode) {
        (CipherKind::None, _) => Box::new(DummyCipher),
    }
}

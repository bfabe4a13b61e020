//! Passthrough cipher

use bytes::BufMut;

use super::{CipherResult, StreamCipher};

/// Copies payload to the output untouched
pub struct DummyCipher;

impl StreamCipher for DummyCipher {
    fn update(&mut self, data: &[u8], out: &mut dyn BufMut) -> CipherResult<()> {
        out.put_slice(data);
        Ok(())
    }

    fn buffer_size(&self, data: &[u8]) -> usize {
        data.len()
    }
}

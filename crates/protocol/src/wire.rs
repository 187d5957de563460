//! Scalar encodings shared by the envelope and message codecs.
//!
//! Integers travel little-endian, strings as a `u32` length followed by
//! UTF-8 bytes, chunks as exactly [`CHUNK_SIZE`] raw bytes.

use crate::error::ProtocolError;
use crate::types::{CHUNK_SIZE, Chunk, ClientId};

pub(crate) fn put_u8(buf: &mut Vec<u8>, value: u8) {
    buf.push(value);
}

pub(crate) fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_bool(buf: &mut Vec<u8>, value: bool) {
    buf.push(u8::from(value));
}

pub(crate) fn put_string(buf: &mut Vec<u8>, value: &str) {
    put_u32(buf, value.len() as u32);
    buf.extend_from_slice(value.as_bytes());
}

pub(crate) fn put_chunk(buf: &mut Vec<u8>, chunk: &Chunk) {
    buf.extend_from_slice(chunk.as_bytes());
}

pub(crate) fn put_client(buf: &mut Vec<u8>, client: &ClientId) {
    put_string(buf, client.addr());
    put_string(buf, client.path());
}

/// Cursor over a received payload. Every accessor checks the remaining
/// length and reports the exact shortfall on truncation.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        let remaining = self.buf.len() - self.pos;
        if remaining < len {
            return Err(ProtocolError::Truncated {
                needed: len - remaining,
                offset: self.pos,
            });
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u32(&mut self) -> Result<u32, ProtocolError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().expect("4-byte slice")))
    }

    pub(crate) fn u64(&mut self) -> Result<u64, ProtocolError> {
        let bytes = self.take(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().expect("8-byte slice")))
    }

    pub(crate) fn bool(&mut self) -> Result<bool, ProtocolError> {
        Ok(self.u8()? != 0)
    }

    pub(crate) fn string(&mut self) -> Result<String, ProtocolError> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        Ok(String::from_utf8(bytes.to_vec())?)
    }

    pub(crate) fn chunk(&mut self) -> Result<Chunk, ProtocolError> {
        let bytes = self.take(CHUNK_SIZE)?;
        Ok(Chunk::new(bytes.try_into().expect("chunk-sized slice")))
    }

    pub(crate) fn client(&mut self) -> Result<ClientId, ProtocolError> {
        let addr = self.string()?;
        let path = self.string()?;
        Ok(ClientId::new(addr, path))
    }

    /// Rejects payloads that carry bytes past the final field.
    pub(crate) fn finish(self) -> Result<(), ProtocolError> {
        let rest = self.buf.len() - self.pos;
        if rest == 0 {
            Ok(())
        } else {
            Err(ProtocolError::TrailingBytes(rest))
        }
    }
}

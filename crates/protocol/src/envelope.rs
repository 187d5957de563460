//! Frame layout: a fixed header of payload length (`u32` LE), frame kind
//! (one byte), and call sequence number (`u32` LE), followed by the payload.
//!
//! The header length field covers the payload only. Replies and faults echo
//! the sequence number of the call they answer.

use std::io::{self, Read, Write};

use crate::error::ProtocolError;

/// Upper bound on a frame payload. The largest legal message is a chunk
/// reply of a few dozen bytes; the cap only exists to bound a corrupted or
/// hostile length field.
pub const MAX_PAYLOAD: u32 = 16 * 1024;

/// Number of bytes in an encoded frame header.
pub(crate) const HEADER_LEN: usize = 9;

/// Discriminates the three frame shapes on a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    /// A method invocation, answered by exactly one `Reply` or `Fault`.
    Call,
    /// Successful answer to a call.
    Reply,
    /// Typed failure answer to a call.
    Fault,
}

impl FrameKind {
    const fn wire_code(self) -> u8 {
        match self {
            Self::Call => 0,
            Self::Reply => 1,
            Self::Fault => 2,
        }
    }

    const fn from_wire(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Call),
            1 => Some(Self::Reply),
            2 => Some(Self::Fault),
            _ => None,
        }
    }
}

/// One framed message: kind, sequence number, and payload bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Frame shape.
    pub kind: FrameKind,
    /// Caller-assigned sequence number; echoed by the answer.
    pub seq: u32,
    /// Encoded message payload.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Builds a frame, rejecting payloads over [`MAX_PAYLOAD`].
    pub fn new(kind: FrameKind, seq: u32, payload: Vec<u8>) -> Result<Self, ProtocolError> {
        if payload.len() > MAX_PAYLOAD as usize {
            return Err(ProtocolError::Oversized {
                length: payload.len() as u32,
            });
        }
        Ok(Self { kind, seq, payload })
    }

    /// Serializes the frame into `writer`.
    pub fn write_to(&self, writer: &mut impl Write) -> Result<(), ProtocolError> {
        debug_assert!(self.payload.len() <= MAX_PAYLOAD as usize);
        let mut header = [0u8; HEADER_LEN];
        header[..4].copy_from_slice(&(self.payload.len() as u32).to_le_bytes());
        header[4] = self.kind.wire_code();
        header[5..].copy_from_slice(&self.seq.to_le_bytes());
        writer.write_all(&header)?;
        writer.write_all(&self.payload)?;
        writer.flush()?;
        Ok(())
    }

    /// Reads one frame from `reader`. Returns `Ok(None)` when the peer
    /// closed the stream cleanly between frames; an EOF inside a frame is a
    /// protocol error.
    pub fn read_from(reader: &mut impl Read) -> Result<Option<Self>, ProtocolError> {
        let mut header = [0u8; HEADER_LEN];
        let mut filled = 0usize;
        while filled < HEADER_LEN {
            let n = reader.read(&mut header[filled..])?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(ProtocolError::Closed);
            }
            filled += n;
        }

        let length = u32::from_le_bytes(header[..4].try_into().expect("4-byte slice"));
        if length > MAX_PAYLOAD {
            return Err(ProtocolError::Oversized { length });
        }
        let kind =
            FrameKind::from_wire(header[4]).ok_or(ProtocolError::UnknownKind(header[4]))?;
        let seq = u32::from_le_bytes(header[5..].try_into().expect("4-byte slice"));

        let mut payload = vec![0u8; length as usize];
        reader.read_exact(&mut payload).map_err(|error| {
            if error.kind() == io::ErrorKind::UnexpectedEof {
                ProtocolError::Closed
            } else {
                ProtocolError::Io(error)
            }
        })?;

        Ok(Some(Self { kind, seq, payload }))
    }
}

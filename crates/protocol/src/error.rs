use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::envelope::MAX_PAYLOAD;

/// Failures raised by the framing layer and the RPC transport.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A frame advertised a payload larger than [`MAX_PAYLOAD`].
    #[error("frame payload of {length} bytes exceeds the {MAX_PAYLOAD}-byte limit")]
    Oversized {
        /// Length the offending header advertised.
        length: u32,
    },

    /// A payload ended before the advertised field boundary.
    #[error("truncated payload: needed {needed} more bytes at offset {offset}")]
    Truncated {
        /// Bytes still required by the field being decoded.
        needed: usize,
        /// Offset at which decoding stopped.
        offset: usize,
    },

    /// A payload carried bytes past the last field of its message.
    #[error("payload contains {0} trailing bytes after the final field")]
    TrailingBytes(usize),

    /// The frame kind byte did not name a known kind.
    #[error("unknown frame kind {0:#04x}")]
    UnknownKind(u8),

    /// The method byte of a call did not name a known method.
    #[error("unknown method code {0:#04x}")]
    UnknownMethod(u8),

    /// The discriminant byte of a reply did not name a known reply.
    #[error("unknown reply code {0:#04x}")]
    UnknownReply(u8),

    /// The code byte of a fault did not name a known fault.
    #[error("unknown fault code {0:#04x}")]
    UnknownFault(u8),

    /// A mode byte did not name a known open mode.
    #[error("unknown open mode {0:#04x}")]
    UnknownMode(u8),

    /// A wire string was not valid UTF-8.
    #[error("wire string is not valid UTF-8")]
    InvalidString(#[from] std::string::FromUtf8Error),

    /// A well-formed reply did not match the shape of the call it answered.
    #[error("reply does not match the call it answers")]
    ReplyMismatch,

    /// The peer closed the connection, or the reader thread died and
    /// poisoned the caller.
    #[error("connection closed by peer")]
    Closed,

    /// No reply arrived within the caller's deadline.
    #[error("call timed out after {0:?}")]
    Deadline(Duration),

    /// An underlying socket operation failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

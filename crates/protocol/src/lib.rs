#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_docs)]

//! # Overview
//!
//! `protocol` defines the wire format and the symmetric RPC transport shared
//! by the chunkfs client library and the coordinator daemon. Both peers speak
//! the same framed request/reply dialect: the client dials the daemon and
//! issues calls on that stream, and the daemon dials back to the client's
//! advertised listen address to pull chunk bytes on demand. Each stream
//! carries calls in one direction and replies in the other, so a connection
//! is always "caller on one side, servant on the other".
//!
//! # Design
//!
//! - The envelope module frames every message as a fixed nine-byte header
//!   (payload length, frame kind, call sequence number) followed by the
//!   payload, bounded by [`MAX_PAYLOAD`].
//! - The message module encodes the method set: [`Call`] covers both
//!   directions of the protocol, [`Reply`] the success payloads, and
//!   [`Fault`] the typed failures a servant can report.
//! - The multiplex module implements the outbound half: a [`Caller`] stamps
//!   each call with a fresh sequence number, a background reader routes
//!   replies to the blocked callers, and a per-call deadline turns a silent
//!   peer into a transport error. Heartbeats and a blocking chunk fetch can
//!   therefore share one stream without queueing behind each other.
//! - [`serve`] implements the inbound half: a loop that decodes calls,
//!   dispatches them to a [`Handler`], and writes the reply or fault under a
//!   shared writer lock. Each call is served on its own thread so a slow
//!   resolution cannot starve the heartbeats arriving on the same stream.
//!
//! # Invariants
//!
//! - Sequence numbers are assigned by the caller and strictly increase per
//!   connection; a reply or fault always echoes the sequence number of the
//!   call it answers.
//! - Payloads never exceed [`MAX_PAYLOAD`] bytes; both encode and decode
//!   enforce the cap.
//! - Chunk payloads are exactly [`CHUNK_SIZE`] opaque bytes.
//! - Loss of the stream is the failure signal: once the reader thread exits,
//!   every pending and future call on that [`Caller`] fails with
//!   [`ProtocolError::Closed`].
//!
//! # See also
//!
//! - The `client` crate for the mountable library built on this transport.
//! - The `daemon` crate for the coordinator that serves the directory half
//!   of the method set.

mod envelope;
mod error;
mod message;
mod multiplex;
mod serve;
mod types;
mod wire;

pub use crate::envelope::{Frame, FrameKind, MAX_PAYLOAD};
pub use crate::error::ProtocolError;
pub use crate::message::{Call, Fault, FaultCode, Reply};
pub use crate::multiplex::{CallError, Caller};
pub use crate::serve::{Handler, serve};
pub use crate::types::{
    CHUNK_SIZE, Chunk, ChunkIndex, ClientId, FILE_SIZE, HEARTBEAT_INTERVAL, NUM_CHUNKS, OpenMode,
    Version, valid_file_name,
};

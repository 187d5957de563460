//! The method set and its payload codecs.
//!
//! A single [`Call`] enum covers both directions of the protocol; a peer
//! answers [`FaultCode::UnknownMethod`] for methods it does not serve. The
//! daemon serves the directory methods, the client serves [`Call::Ping`] and
//! [`Call::RetrieveChunk`] on the reverse stream.

use std::error::Error;
use std::fmt;

use crate::error::ProtocolError;
use crate::types::{Chunk, ChunkIndex, ClientId, OpenMode, Version};
use crate::wire::{Reader, put_bool, put_chunk, put_client, put_string, put_u8, put_u64};

mod method {
    pub(super) const REGISTER: u8 = 1;
    pub(super) const UNREGISTER: u8 = 2;
    pub(super) const HEARTBEAT: u8 = 3;
    pub(super) const ESTABLISH_REVERSE: u8 = 4;
    pub(super) const FILE_EXISTS: u8 = 5;
    pub(super) const OPEN_FILE: u8 = 6;
    pub(super) const COMMIT_WRITE: u8 = 7;
    pub(super) const FETCH_CHUNK: u8 = 8;
    pub(super) const CLOSE_FILE: u8 = 9;
    pub(super) const PING: u8 = 10;
    pub(super) const RETRIEVE_CHUNK: u8 = 11;
}

mod reply {
    pub(super) const OK: u8 = 0;
    pub(super) const EXISTS: u8 = 1;
    pub(super) const COMMITTED: u8 = 2;
    pub(super) const FETCHED: u8 = 3;
    pub(super) const CHUNK: u8 = 4;
}

/// A method invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    /// Join the membership. Duplicate registration is a fault.
    Register(ClientId),
    /// Leave the membership. Unknown clients succeed silently so teardown
    /// is idempotent.
    Unregister(ClientId),
    /// Refresh the liveness stamp.
    Heartbeat(ClientId),
    /// Ask the daemon to dial back to the client's advertised address and
    /// cache the resulting reverse channel.
    EstablishReverse(ClientId),
    /// Does a file exist anywhere in the service?
    FileExists {
        /// File name without the on-disk suffix.
        name: String,
    },
    /// Open a file, creating its metadata record on first open and
    /// acquiring the write lock for [`OpenMode::Write`].
    OpenFile {
        /// Caller identity.
        client: ClientId,
        /// File name.
        name: String,
        /// Requested mode.
        mode: OpenMode,
    },
    /// Commit a write: bump the chunk version and collapse its owner set to
    /// the caller.
    CommitWrite {
        /// Caller identity; must hold the file's write lock.
        client: ClientId,
        /// File name.
        name: String,
        /// Chunk that was written.
        index: ChunkIndex,
    },
    /// Resolve a chunk: stale-ok when the caller is current, otherwise pull
    /// bytes from a live owner.
    FetchChunk {
        /// Caller identity.
        client: ClientId,
        /// File name.
        name: String,
        /// Chunk to resolve.
        index: ChunkIndex,
        /// Version of the caller's local copy.
        local_version: Version,
    },
    /// Close a handle, releasing the write lock when `mode` is
    /// [`OpenMode::Write`] and the caller holds it.
    CloseFile {
        /// Caller identity.
        client: ClientId,
        /// File name.
        name: String,
        /// Mode the handle was opened in.
        mode: OpenMode,
    },
    /// Liveness probe.
    Ping,
    /// Read the peer's local copy of a chunk (daemon → client).
    RetrieveChunk {
        /// File name.
        name: String,
        /// Chunk to read.
        index: ChunkIndex,
    },
}

impl Call {
    /// Encodes the call payload (method byte plus fields).
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Self::Register(client) => {
                put_u8(&mut buf, method::REGISTER);
                put_client(&mut buf, client);
            }
            Self::Unregister(client) => {
                put_u8(&mut buf, method::UNREGISTER);
                put_client(&mut buf, client);
            }
            Self::Heartbeat(client) => {
                put_u8(&mut buf, method::HEARTBEAT);
                put_client(&mut buf, client);
            }
            Self::EstablishReverse(client) => {
                put_u8(&mut buf, method::ESTABLISH_REVERSE);
                put_client(&mut buf, client);
            }
            Self::FileExists { name } => {
                put_u8(&mut buf, method::FILE_EXISTS);
                put_string(&mut buf, name);
            }
            Self::OpenFile { client, name, mode } => {
                put_u8(&mut buf, method::OPEN_FILE);
                put_client(&mut buf, client);
                put_string(&mut buf, name);
                put_u8(&mut buf, mode.wire_code());
            }
            Self::CommitWrite {
                client,
                name,
                index,
            } => {
                put_u8(&mut buf, method::COMMIT_WRITE);
                put_client(&mut buf, client);
                put_string(&mut buf, name);
                put_u8(&mut buf, *index);
            }
            Self::FetchChunk {
                client,
                name,
                index,
                local_version,
            } => {
                put_u8(&mut buf, method::FETCH_CHUNK);
                put_client(&mut buf, client);
                put_string(&mut buf, name);
                put_u8(&mut buf, *index);
                put_u64(&mut buf, *local_version);
            }
            Self::CloseFile { client, name, mode } => {
                put_u8(&mut buf, method::CLOSE_FILE);
                put_client(&mut buf, client);
                put_string(&mut buf, name);
                put_u8(&mut buf, mode.wire_code());
            }
            Self::Ping => {
                put_u8(&mut buf, method::PING);
            }
            Self::RetrieveChunk { name, index } => {
                put_u8(&mut buf, method::RETRIEVE_CHUNK);
                put_string(&mut buf, name);
                put_u8(&mut buf, *index);
            }
        }
        buf
    }

    /// Decodes a call payload, rejecting trailing bytes.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = Reader::new(payload);
        let call = match reader.u8()? {
            method::REGISTER => Self::Register(reader.client()?),
            method::UNREGISTER => Self::Unregister(reader.client()?),
            method::HEARTBEAT => Self::Heartbeat(reader.client()?),
            method::ESTABLISH_REVERSE => Self::EstablishReverse(reader.client()?),
            method::FILE_EXISTS => Self::FileExists {
                name: reader.string()?,
            },
            method::OPEN_FILE => Self::OpenFile {
                client: reader.client()?,
                name: reader.string()?,
                mode: decode_mode(&mut reader)?,
            },
            method::COMMIT_WRITE => Self::CommitWrite {
                client: reader.client()?,
                name: reader.string()?,
                index: reader.u8()?,
            },
            method::FETCH_CHUNK => Self::FetchChunk {
                client: reader.client()?,
                name: reader.string()?,
                index: reader.u8()?,
                local_version: reader.u64()?,
            },
            method::CLOSE_FILE => Self::CloseFile {
                client: reader.client()?,
                name: reader.string()?,
                mode: decode_mode(&mut reader)?,
            },
            method::PING => Self::Ping,
            method::RETRIEVE_CHUNK => Self::RetrieveChunk {
                name: reader.string()?,
                index: reader.u8()?,
            },
            other => return Err(ProtocolError::UnknownMethod(other)),
        };
        reader.finish()?;
        Ok(call)
    }

    /// Short method name for diagnostics.
    #[must_use]
    pub fn method_name(&self) -> &'static str {
        match self {
            Self::Register(_) => "register",
            Self::Unregister(_) => "unregister",
            Self::Heartbeat(_) => "heartbeat",
            Self::EstablishReverse(_) => "establish-reverse",
            Self::FileExists { .. } => "file-exists",
            Self::OpenFile { .. } => "open-file",
            Self::CommitWrite { .. } => "commit-write",
            Self::FetchChunk { .. } => "fetch-chunk",
            Self::CloseFile { .. } => "close-file",
            Self::Ping => "ping",
            Self::RetrieveChunk { .. } => "retrieve-chunk",
        }
    }
}

fn decode_mode(reader: &mut Reader<'_>) -> Result<OpenMode, ProtocolError> {
    let code = reader.u8()?;
    OpenMode::from_wire(code).ok_or(ProtocolError::UnknownMode(code))
}

/// Successful answer to a call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    /// Plain acknowledgement.
    Ok,
    /// Answer to [`Call::FileExists`].
    Exists(bool),
    /// Answer to [`Call::CommitWrite`]: the post-increment global version.
    Committed {
        /// New global version of the committed chunk.
        version: Version,
    },
    /// Answer to [`Call::FetchChunk`]. `data` is `None` when the caller's
    /// copy is already current (stale-ok), `Some` when newer bytes were
    /// pulled from an owner.
    Fetched {
        /// Global version of the chunk.
        version: Version,
        /// Fresh bytes, absent on the stale-ok path.
        data: Option<Chunk>,
    },
    /// Answer to [`Call::RetrieveChunk`]: the peer's local bytes.
    Chunk(Chunk),
}

impl Reply {
    /// Encodes the reply payload.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Self::Ok => put_u8(&mut buf, reply::OK),
            Self::Exists(exists) => {
                put_u8(&mut buf, reply::EXISTS);
                put_bool(&mut buf, *exists);
            }
            Self::Committed { version } => {
                put_u8(&mut buf, reply::COMMITTED);
                put_u64(&mut buf, *version);
            }
            Self::Fetched { version, data } => {
                put_u8(&mut buf, reply::FETCHED);
                put_u64(&mut buf, *version);
                put_bool(&mut buf, data.is_some());
                if let Some(chunk) = data {
                    put_chunk(&mut buf, chunk);
                }
            }
            Self::Chunk(chunk) => {
                put_u8(&mut buf, reply::CHUNK);
                put_chunk(&mut buf, chunk);
            }
        }
        buf
    }

    /// Decodes a reply payload, rejecting trailing bytes.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = Reader::new(payload);
        let reply = match reader.u8()? {
            reply::OK => Self::Ok,
            reply::EXISTS => Self::Exists(reader.bool()?),
            reply::COMMITTED => Self::Committed {
                version: reader.u64()?,
            },
            reply::FETCHED => {
                let version = reader.u64()?;
                let data = if reader.bool()? {
                    Some(reader.chunk()?)
                } else {
                    None
                };
                Self::Fetched { version, data }
            }
            reply::CHUNK => Self::Chunk(reader.chunk()?),
            other => return Err(ProtocolError::UnknownReply(other)),
        };
        reader.finish()?;
        Ok(reply)
    }
}

/// Typed failure a servant reports instead of a reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultCode {
    /// The client is already registered.
    AlreadyRegistered,
    /// The client is not registered (heartbeat, open, commit, fetch).
    NotRegistered,
    /// The daemon could not dial the client's advertised address.
    ReverseDial,
    /// Another client holds the file's write lock.
    WriteConflict,
    /// The caller does not hold the write lock it tried to commit under.
    NotWriter,
    /// No live owner of the chunk's current version could be reached.
    ChunkUnavailable,
    /// The named file has no record (or no local copy, on the reverse path).
    UnknownFile,
    /// The file name is not a legal chunkfs name.
    BadName,
    /// The peer does not serve the invoked method.
    UnknownMethod,
    /// The servant failed internally.
    Internal,
}

impl FaultCode {
    const fn wire_code(self) -> u8 {
        match self {
            Self::AlreadyRegistered => 1,
            Self::NotRegistered => 2,
            Self::ReverseDial => 3,
            Self::WriteConflict => 4,
            Self::NotWriter => 5,
            Self::ChunkUnavailable => 6,
            Self::UnknownFile => 7,
            Self::BadName => 8,
            Self::UnknownMethod => 9,
            Self::Internal => 10,
        }
    }

    const fn from_wire(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::AlreadyRegistered),
            2 => Some(Self::NotRegistered),
            3 => Some(Self::ReverseDial),
            4 => Some(Self::WriteConflict),
            5 => Some(Self::NotWriter),
            6 => Some(Self::ChunkUnavailable),
            7 => Some(Self::UnknownFile),
            8 => Some(Self::BadName),
            9 => Some(Self::UnknownMethod),
            10 => Some(Self::Internal),
            _ => None,
        }
    }

    const fn label(self) -> &'static str {
        match self {
            Self::AlreadyRegistered => "already registered",
            Self::NotRegistered => "not registered",
            Self::ReverseDial => "reverse dial failed",
            Self::WriteConflict => "write lock held",
            Self::NotWriter => "not the write lock holder",
            Self::ChunkUnavailable => "chunk unavailable",
            Self::UnknownFile => "unknown file",
            Self::BadName => "bad file name",
            Self::UnknownMethod => "unknown method",
            Self::Internal => "internal error",
        }
    }
}

/// A fault: a code plus a human-readable detail string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fault {
    /// Machine-readable failure class.
    pub code: FaultCode,
    /// Context for logs and error messages.
    pub detail: String,
}

impl Fault {
    /// Builds a fault from a code and detail text.
    #[must_use]
    pub fn new(code: FaultCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }

    /// Encodes the fault payload.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_u8(&mut buf, self.code.wire_code());
        put_string(&mut buf, &self.detail);
        buf
    }

    /// Decodes a fault payload, rejecting trailing bytes.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = Reader::new(payload);
        let code = reader.u8()?;
        let code = FaultCode::from_wire(code).ok_or(ProtocolError::UnknownFault(code))?;
        let detail = reader.string()?;
        reader.finish()?;
        Ok(Self { code, detail })
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.detail.is_empty() {
            f.write_str(self.code.label())
        } else {
            write!(f, "{}: {}", self.code.label(), self.detail)
        }
    }
}

impl Error for Fault {}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_client() -> ClientId {
        ClientId::new("127.0.0.1:7001", "/mnt/dfs")
    }

    fn all_calls() -> Vec<Call> {
        let client = sample_client();
        vec![
            Call::Register(client.clone()),
            Call::Unregister(client.clone()),
            Call::Heartbeat(client.clone()),
            Call::EstablishReverse(client.clone()),
            Call::FileExists {
                name: "openTest".into(),
            },
            Call::OpenFile {
                client: client.clone(),
                name: "openTest".into(),
                mode: OpenMode::Write,
            },
            Call::CommitWrite {
                client: client.clone(),
                name: "openTest".into(),
                index: 0,
            },
            Call::FetchChunk {
                client: client.clone(),
                name: "dreadTest".into(),
                index: 10,
                local_version: 3,
            },
            Call::CloseFile {
                client,
                name: "openTest".into(),
                mode: OpenMode::Write,
            },
            Call::Ping,
            Call::RetrieveChunk {
                name: "dreadTest".into(),
                index: 255,
            },
        ]
    }

    #[test]
    fn every_call_round_trips() {
        for call in all_calls() {
            let decoded = Call::decode(&call.encode()).expect("call decodes");
            assert_eq!(decoded, call);
        }
    }

    #[test]
    fn every_reply_round_trips() {
        let replies = vec![
            Reply::Ok,
            Reply::Exists(true),
            Reply::Exists(false),
            Reply::Committed { version: 1 },
            Reply::Fetched {
                version: 4,
                data: None,
            },
            Reply::Fetched {
                version: 4,
                data: Some(Chunk::padded(b"Testing disconnected reads")),
            },
            Reply::Chunk(Chunk::padded(b"Hello world!")),
        ];
        for reply in replies {
            let decoded = Reply::decode(&reply.encode()).expect("reply decodes");
            assert_eq!(decoded, reply);
        }
    }

    #[test]
    fn faults_round_trip_and_render_their_detail() {
        let fault = Fault::new(FaultCode::WriteConflict, "openTest");
        let decoded = Fault::decode(&fault.encode()).expect("fault decodes");
        assert_eq!(decoded, fault);
        assert_eq!(decoded.to_string(), "write lock held: openTest");
    }

    #[test]
    fn unknown_method_byte_is_rejected() {
        let err = Call::decode(&[0xEE]).expect_err("unknown method");
        assert!(matches!(err, ProtocolError::UnknownMethod(0xEE)));
    }

    #[test]
    fn unknown_mode_byte_is_rejected() {
        let mut call = Call::OpenFile {
            client: sample_client(),
            name: "openTest".into(),
            mode: OpenMode::Read,
        }
        .encode();
        let last = call.len() - 1;
        call[last] = 9;
        let err = Call::decode(&call).expect_err("unknown mode");
        assert!(matches!(err, ProtocolError::UnknownMode(9)));
    }

    #[test]
    fn trailing_bytes_after_a_call_are_rejected() {
        let mut payload = Call::Ping.encode();
        payload.push(0);
        let err = Call::decode(&payload).expect_err("trailing bytes");
        assert!(matches!(err, ProtocolError::TrailingBytes(1)));
    }

    #[test]
    fn truncated_fetch_reply_is_rejected() {
        let reply = Reply::Fetched {
            version: 9,
            data: Some(Chunk::padded(b"abc")),
        };
        let mut payload = reply.encode();
        payload.truncate(payload.len() - 1);
        let err = Reply::decode(&payload).expect_err("truncated chunk");
        assert!(matches!(err, ProtocolError::Truncated { .. }));
    }

    proptest! {
        #[test]
        fn fetch_chunk_round_trips_for_arbitrary_fields(
            addr in "[a-z0-9.:]{1,24}",
            path in "[a-zA-Z0-9/_.]{1,40}",
            name in "[a-zA-Z0-9]{1,16}",
            index in any::<u8>(),
            local_version in any::<u64>(),
        ) {
            let call = Call::FetchChunk {
                client: ClientId::new(addr, path),
                name,
                index,
                local_version,
            };
            prop_assert_eq!(Call::decode(&call.encode()).unwrap(), call);
        }

        #[test]
        fn chunk_replies_round_trip_for_arbitrary_bytes(bytes in any::<[u8; 32]>()) {
            let reply = Reply::Chunk(Chunk::new(bytes));
            prop_assert_eq!(Reply::decode(&reply.encode()).unwrap(), reply);
        }
    }
}

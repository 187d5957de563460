#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_docs)]

//! # Overview
//!
//! `client` is the mountable half of chunkfs. A [`Mount`] roots the library
//! at a local directory, registers with the coordinator daemon, and exposes
//! fixed-size files of 256 chunks of 32 bytes each. One client at a time may
//! write a file; reads are resolved by the daemon, which pulls the latest
//! bytes from whichever mounted peer last wrote them. Every chunk a client
//! writes or refreshes is persisted in a flat backing file under the mount
//! root, so the data survives the process and can be served to peers.
//!
//! # Design
//!
//! - [`Mount::open`] dials the daemon, registers, binds a listener at the
//!   advertised address, asks the daemon to dial back, and starts the
//!   heartbeat thread. The daemon reaps a mount that stays silent for the
//!   heartbeat interval, so heartbeats go out at half that interval.
//! - The listener serves the daemon's reverse calls: liveness pings and
//!   chunk retrievals backed by the local store.
//! - [`FileHandle`] tracks a per-chunk local version. Reads send that
//!   version to the daemon, which answers "your copy is current" or ships
//!   newer bytes; writes persist and sync locally before committing the
//!   version bump, so a peer fetch can never observe a committed version
//!   whose bytes have not reached disk.
//! - Disconnected reads ([`FileHandle::dread`]) fall back to the local
//!   backing file instead of failing when the daemon is unreachable.
//!
//! # Invariants
//!
//! - At most one [`Mount`] is active per process; a second mount fails with
//!   [`ClientError::MountActive`] until the first is unmounted.
//! - Backing files are exactly 8192 bytes and zero-filled on creation.
//! - A 32-byte chunk is never observed torn: the store serializes chunk
//!   writes against both local reads and reverse-channel retrievals.
//! - The library never panics the host program; every public entry point
//!   returns a [`Result`].

mod error;
mod file;
mod mount;
mod store;

pub use crate::error::ClientError;
pub use crate::file::FileHandle;
pub use crate::mount::{Mount, MountOptions};
pub use protocol::{
    CHUNK_SIZE, Chunk, ChunkIndex, ClientId, FILE_SIZE, NUM_CHUNKS, OpenMode, Version,
};

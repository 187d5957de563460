//! Open-file handles and the read/write/dread operations.

use std::io;
use std::sync::Arc;

use tracing::debug;

use protocol::{
    Call, CallError, Chunk, ChunkIndex, FaultCode, NUM_CHUNKS, OpenMode, ProtocolError, Reply,
    Version,
};

use crate::error::ClientError;
use crate::mount::{Session, fault_error};

/// An open file on a mount.
///
/// The handle tracks, per chunk, the version its on-disk bytes correspond
/// to. Versions start at zero for every fresh handle, so the first read of
/// each chunk consults the daemon and refreshes the local copy if a newer
/// global version exists.
///
/// Operations take `&mut self`: callers serialize access to one handle by
/// construction. Distinct handles, including the reverse-channel reads the
/// daemon performs for peers, may run concurrently; the store's per-file
/// lock keeps individual chunks consistent.
pub struct FileHandle {
    session: Arc<Session>,
    name: String,
    mode: OpenMode,
    local: [Version; NUM_CHUNKS],
    write_ok: bool,
    closed: bool,
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("local", &self.local)
            .field("write_ok", &self.write_ok)
            .field("closed", &self.closed)
            .finish()
    }
}

impl FileHandle {
    pub(crate) fn new(session: Arc<Session>, name: String, mode: OpenMode) -> Self {
        Self {
            session,
            name,
            mode,
            local: [0; NUM_CHUNKS],
            write_ok: mode == OpenMode::Write,
            closed: false,
        }
    }

    /// The file's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The mode the handle was opened in.
    #[must_use]
    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Reads chunk `index` at the latest globally known version.
    ///
    /// The daemon either confirms the local copy is current, in which case
    /// the bytes come straight from the backing file, or ships newer bytes
    /// pulled from the owning peer, which are persisted locally before they
    /// are returned. When no owner of the latest version is reachable the
    /// read fails with [`ClientError::ChunkUnavailable`].
    pub fn read(&mut self, index: ChunkIndex, out: &mut Chunk) -> Result<(), ClientError> {
        if self.mode == OpenMode::Dread && !self.session.is_connected() {
            // Disconnected handles must use `dread`, which never needs the
            // daemon.
            return Err(ClientError::BadFileMode(self.mode));
        }
        if !self.session.is_connected() {
            return Err(ClientError::ChunkUnavailable(index));
        }
        self.fetch(index, out)
    }

    /// Reads chunk `index`, falling back to the local copy when the daemon
    /// is unreachable. Fails only when no local copy of the file exists.
    pub fn dread(&mut self, index: ChunkIndex, out: &mut Chunk) -> Result<(), ClientError> {
        if self.session.is_connected() {
            match self.fetch(index, out) {
                Ok(()) => return Ok(()),
                Err(error) => {
                    debug!(%error, file = %self.name, index, "dread falling back to local copy");
                }
            }
        }

        match self.session.store().read_chunk(&self.name, index) {
            Ok(chunk) => {
                *out = chunk;
                Ok(())
            }
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                Err(ClientError::FileUnavailable(self.name.clone()))
            }
            Err(error) => Err(ClientError::Io(error)),
        }
    }

    /// Writes chunk `index`. The bytes are persisted and synced locally
    /// before the daemon commits the version bump, so a committed version
    /// always has its bytes on disk and retrievable by peers.
    pub fn write(&mut self, index: ChunkIndex, chunk: &Chunk) -> Result<(), ClientError> {
        if self.mode != OpenMode::Write {
            return Err(ClientError::BadFileMode(self.mode));
        }
        if !self.write_ok || !self.session.is_connected() {
            return Err(ClientError::WriteTimeout(self.name.clone()));
        }

        self.session.store().write_chunk(&self.name, index, chunk)?;

        match self.session.call(Call::CommitWrite {
            client: self.session.id().clone(),
            name: self.name.clone(),
            index,
        }) {
            Ok(Reply::Committed { version }) => {
                self.local[usize::from(index)] = version;
                Ok(())
            }
            Ok(_) => Err(ClientError::Protocol(ProtocolError::ReplyMismatch)),
            Err(CallError::Fault(fault))
                if matches!(fault.code, FaultCode::NotWriter | FaultCode::NotRegistered) =>
            {
                // The daemon reaped this client and may have granted the
                // lock elsewhere; the handle is no longer a writer.
                debug!(%fault, file = %self.name, "write lock lost");
                self.write_ok = false;
                Err(ClientError::WriteTimeout(self.name.clone()))
            }
            Err(CallError::Fault(fault)) => Err(fault_error(fault, &self.name)),
            Err(CallError::Transport(error)) => {
                debug!(%error, file = %self.name, "daemon lost during write");
                self.write_ok = false;
                Err(ClientError::WriteTimeout(self.name.clone()))
            }
        }
    }

    /// Closes the handle, releasing the write lock for write-mode handles.
    /// Transport errors are logged and swallowed; the daemon also releases
    /// the lock when it reaps a silent client.
    pub fn close(&mut self) -> Result<(), ClientError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if self.session.is_connected() {
            let result = self.session.call(Call::CloseFile {
                client: self.session.id().clone(),
                name: self.name.clone(),
                mode: self.mode,
            });
            if let Err(error) = result {
                debug!(%error, file = %self.name, "close not acknowledged");
            }
        }
        Ok(())
    }

    fn fetch(&mut self, index: ChunkIndex, out: &mut Chunk) -> Result<(), ClientError> {
        let local_version = self.local[usize::from(index)];
        match self.session.call(Call::FetchChunk {
            client: self.session.id().clone(),
            name: self.name.clone(),
            index,
            local_version,
        }) {
            Ok(Reply::Fetched {
                data: None,
                ..
            }) => {
                *out = self.session.store().read_chunk(&self.name, index)?;
                Ok(())
            }
            Ok(Reply::Fetched {
                version,
                data: Some(chunk),
            }) => {
                self.session.store().write_chunk(&self.name, index, &chunk)?;
                self.local[usize::from(index)] = version;
                *out = chunk;
                Ok(())
            }
            Ok(_) => Err(ClientError::Protocol(ProtocolError::ReplyMismatch)),
            Err(CallError::Fault(fault)) if fault.code == FaultCode::ChunkUnavailable => {
                Err(ClientError::ChunkUnavailable(index))
            }
            Err(CallError::Fault(fault)) => Err(fault_error(fault, &self.name)),
            Err(CallError::Transport(error)) => {
                debug!(%error, file = %self.name, index, "daemon lost during read");
                Err(ClientError::ChunkUnavailable(index))
            }
        }
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

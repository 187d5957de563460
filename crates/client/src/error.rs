use std::io;
use std::path::PathBuf;

use thiserror::Error;

use protocol::{ChunkIndex, Fault, OpenMode, ProtocolError};

/// Failures surfaced by the client library.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The mount root does not exist or is not a directory.
    #[error("local path '{0}' does not exist or is not a directory")]
    LocalPath(PathBuf),

    /// Another mount is already active in this process.
    #[error("a mount is already active in this process")]
    MountActive,

    /// The daemon refused a request with a fault the other variants do not
    /// model.
    #[error("daemon refused the request: {0}")]
    Daemon(Fault),

    /// The file name is not one to sixteen Unicode letters or digits.
    #[error("invalid file name '{0}'")]
    BadFilename(String),

    /// The operation is not permitted in the handle's mode.
    #[error("operation not permitted on a handle opened in {0} mode")]
    BadFileMode(OpenMode),

    /// Another client holds the file's write lock.
    #[error("file '{0}' is already open for writing by another client")]
    OpenWriteConflict(String),

    /// The daemon became unreachable during a write. The handle refuses
    /// further writes; reopen the file to continue.
    #[error("lost the daemon while writing '{0}'")]
    WriteTimeout(String),

    /// A disconnected open or read found no local copy of the file.
    #[error("file '{0}' has no local copy")]
    FileUnavailable(String),

    /// The daemon could not reach any owner of the chunk's latest version.
    #[error("no reachable copy of chunk {0}")]
    ChunkUnavailable(ChunkIndex),

    /// The operation needs the daemon but the session is disconnected.
    #[error("not connected to the daemon")]
    Disconnected,

    /// The transport failed in a way the domain errors do not cover.
    #[error("protocol failure")]
    Protocol(#[source] ProtocolError),

    /// Local disk I/O failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

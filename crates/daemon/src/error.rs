use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Failures that can escape daemon startup.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// The listen address could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address the daemon tried to listen on.
        addr: SocketAddr,
        /// Underlying bind failure.
        source: io::Error,
    },

    /// Other startup I/O failed (thread spawn, local address lookup).
    #[error(transparent)]
    Io(#[from] io::Error),
}

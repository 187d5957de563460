#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_docs)]

//! # Overview
//!
//! `daemon` is the chunkfs coordinator. It stores no file data: it is a
//! metadata directory (which files exist, which version each chunk is at,
//! which clients hold bytes at that version, who holds each write lock) and
//! a membership service with heartbeat-based failure detection. When a read
//! needs bytes the client does not already hold, the daemon pulls them from
//! an owning client over a daemon-initiated reverse channel and relays them
//! in its reply.
//!
//! # Design
//!
//! - The membership registry tracks registered clients, their heartbeat
//!   stamps, and the cached reverse channels. One monitor thread per client
//!   reaps it once heartbeats lapse past the configured interval.
//! - The directory owns the per-file metadata: the write lock, per-chunk
//!   versions, and per-chunk owner lists in insertion order.
//! - The service binds both to the RPC surface and implements chunk
//!   resolution: snapshot the version and owner list, then try each live
//!   owner in insertion order until one answers. The first responsive owner
//!   is authoritative; there is no quorum.
//! - Reaping is deliberately lazy about owner lists: a dead client's
//!   entries linger and are skipped (or timed out) during resolution. This
//!   avoids scanning every file on every reap.
//!
//! # Invariants
//!
//! - At most one client holds a file's write lock; a crashed holder is
//!   superseded on the next write-mode open after its reaping.
//! - Chunk versions never decrease, and each committed write increments the
//!   version of exactly one chunk by exactly one.
//! - The daemon never caches chunk bytes and never serves them from itself.
//! - The daemon keeps no persistent state: a restart loses membership and
//!   versions, and clients must re-register.
//!
//! # Errors
//!
//! Only a failure to bind the listen address escapes [`run`]; the binary
//! turns it into a nonzero exit. Per-connection failures end that
//! connection's serve thread and are logged.

mod directory;
mod error;
mod membership;
mod service;

pub use crate::error::DaemonError;

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use protocol::{HEARTBEAT_INTERVAL, serve};

use crate::service::Service;

/// Runtime configuration for a coordinator.
#[derive(Clone, Debug)]
pub struct DaemonConfig {
    /// Address to listen on.
    pub listen: SocketAddr,
    /// Liveness budget: clients silent for this long are reaped, and
    /// reverse calls give up after it passes.
    pub heartbeat_interval: Duration,
}

impl DaemonConfig {
    /// Configuration with the default heartbeat interval.
    #[must_use]
    pub fn new(listen: SocketAddr) -> Self {
        Self {
            listen,
            heartbeat_interval: HEARTBEAT_INTERVAL,
        }
    }
}

struct Shared {
    closing: AtomicBool,
    conns: Mutex<Vec<TcpStream>>,
}

/// A running coordinator. Dropping the handle shuts the daemon down.
pub struct DaemonHandle {
    addr: SocketAddr,
    shared: Arc<Shared>,
    accept: Mutex<Option<thread::JoinHandle<()>>>,
}

impl DaemonHandle {
    /// The address the daemon actually bound (useful with port 0).
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stops accepting connections and severs every established one.
    /// Idempotent.
    pub fn shutdown(&self) {
        if self.shared.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(addr = %self.addr, "daemon shutting down");

        let conns = self.shared.conns.lock().expect("connection table lock");
        for conn in conns.iter() {
            let _ = conn.shutdown(std::net::Shutdown::Both);
        }
        drop(conns);

        // Wake the accept loop so it observes the closing flag.
        let _ = TcpStream::connect_timeout(&self.addr, Duration::from_millis(100));
    }

    /// Blocks until the accept loop exits.
    pub fn join(&self) {
        let handle = self.accept.lock().expect("accept handle lock").take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for DaemonHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Binds the listener and starts serving in the background.
pub fn spawn(config: DaemonConfig) -> Result<DaemonHandle, DaemonError> {
    let listener = TcpListener::bind(config.listen).map_err(|source| DaemonError::Bind {
        addr: config.listen,
        source,
    })?;
    let addr = listener.local_addr()?;

    let service = Arc::new(Service::new(config.heartbeat_interval));
    let shared = Arc::new(Shared {
        closing: AtomicBool::new(false),
        conns: Mutex::new(Vec::new()),
    });

    let accept_shared = Arc::clone(&shared);
    let accept = thread::Builder::new()
        .name("accept".into())
        .spawn(move || accept_loop(listener, &accept_shared, &service))?;

    info!(%addr, "daemon listening");
    Ok(DaemonHandle {
        addr,
        shared,
        accept: Mutex::new(Some(accept)),
    })
}

/// Binds the listener and serves until shut down. This is the binary's
/// entry point; under normal operation it does not return.
pub fn run(config: DaemonConfig) -> Result<(), DaemonError> {
    let handle = spawn(config)?;
    handle.join();
    Ok(())
}

fn accept_loop(listener: TcpListener, shared: &Arc<Shared>, service: &Arc<Service>) {
    for stream in listener.incoming() {
        if shared.closing.load(Ordering::Acquire) {
            break;
        }
        let stream = match stream {
            Ok(stream) => stream,
            Err(error) => {
                warn!(%error, "accept failed");
                continue;
            }
        };

        if let Ok(clone) = stream.try_clone() {
            let mut conns = shared.conns.lock().expect("connection table lock");
            conns.push(clone);
        }

        let peer = stream.peer_addr().ok();
        let service = Arc::clone(service);
        let spawned = thread::Builder::new().name("conn".into()).spawn(move || {
            debug!(?peer, "client connected");
            match serve(stream, service) {
                Ok(()) => debug!(?peer, "client disconnected"),
                Err(error) => debug!(?peer, %error, "connection ended"),
            }
        });
        if let Err(error) = spawned {
            warn!(%error, "failed to spawn connection thread");
        }
    }
}

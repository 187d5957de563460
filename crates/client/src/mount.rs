//! Mount lifecycle: session setup, heartbeats, and the reverse listener.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Sender, bounded};
use tracing::{debug, info, warn};

use protocol::{
    Call, CallError, Caller, ClientId, Fault, FaultCode, HEARTBEAT_INTERVAL, Handler, OpenMode,
    ProtocolError, Reply, serve, valid_file_name,
};

use crate::error::ClientError;
use crate::file::FileHandle;
use crate::store::ChunkStore;

/// One mount per process: the daemon identifies a client by its advertised
/// address and path, and the library enforces the singleton locally.
static MOUNT_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Tunables for a mount.
#[derive(Clone, Debug)]
pub struct MountOptions {
    /// Liveness budget shared with the daemon: heartbeats go out at half
    /// this interval, and calls give up after it passes without a reply.
    pub heartbeat_interval: Duration,
    /// Skip the one-mount-per-process check. The service contract is one
    /// mount per process; this exists for test harnesses that stand up
    /// several clients inside a single process.
    pub allow_concurrent_mounts: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: HEARTBEAT_INTERVAL,
            allow_concurrent_mounts: false,
        }
    }
}

/// Shared state of a live mount: identity, daemon connection, local store.
pub(crate) struct Session {
    id: ClientId,
    caller: Caller,
    connected: AtomicBool,
    closing: AtomicBool,
    store: ChunkStore,
}

impl Session {
    pub(crate) fn id(&self) -> &ClientId {
        &self.id
    }

    pub(crate) fn store(&self) -> &ChunkStore {
        &self.store
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && self.caller.is_alive()
    }

    pub(crate) fn mark_disconnected(&self) {
        if self.connected.swap(false, Ordering::AcqRel) && !self.closing.load(Ordering::Acquire) {
            warn!(client = %self.id, "daemon connection lost");
        }
    }

    /// Issues a call, downgrading the session on transport failure.
    pub(crate) fn call(&self, call: Call) -> Result<Reply, CallError> {
        if !self.is_connected() {
            return Err(CallError::Transport(ProtocolError::Closed));
        }
        let result = self.caller.call(call);
        if let Err(CallError::Transport(_)) = &result {
            self.mark_disconnected();
        }
        result
    }
}

/// Servant for the daemon's reverse calls.
struct Inbound {
    store: ChunkStore,
}

impl Handler for Inbound {
    fn handle(&self, call: Call) -> Result<Reply, Fault> {
        match call {
            Call::Ping => Ok(Reply::Ok),
            Call::RetrieveChunk { name, index } => {
                match self.store.read_chunk(&name, index) {
                    Ok(chunk) => Ok(Reply::Chunk(chunk)),
                    Err(error) if error.kind() == io::ErrorKind::NotFound => {
                        Err(Fault::new(FaultCode::UnknownFile, name))
                    }
                    Err(error) => {
                        warn!(%name, index, %error, "failed to read chunk for a peer");
                        Err(Fault::new(FaultCode::Internal, error.to_string()))
                    }
                }
            }
            other => Err(Fault::new(FaultCode::UnknownMethod, other.method_name())),
        }
    }
}

/// A live client-library instance rooted at a local directory and bound to
/// a coordinator daemon. Dropping the mount tears the session down; call
/// [`Mount::unmount`] for an orderly exit.
pub struct Mount {
    session: Arc<Session>,
    listen_addr: SocketAddr,
    heartbeat_stop: Sender<()>,
    claimed_singleton: bool,
}

impl std::fmt::Debug for Mount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mount")
            .field("listen_addr", &self.listen_addr)
            .field("claimed_singleton", &self.claimed_singleton)
            .finish()
    }
}

impl Mount {
    /// Mounts the service: validates `local_path`, dials `server_addr`,
    /// registers, starts the reverse listener at `local_addr`, asks the
    /// daemon to dial back, and begins heartbeating.
    pub fn open(
        server_addr: &str,
        local_addr: &str,
        local_path: impl AsRef<Path>,
        options: MountOptions,
    ) -> Result<Self, ClientError> {
        let local_path = local_path.as_ref();
        if !local_path.is_dir() {
            return Err(ClientError::LocalPath(local_path.to_path_buf()));
        }
        let root = local_path
            .canonicalize()
            .map_err(|_| ClientError::LocalPath(local_path.to_path_buf()))?;

        let claimed = !options.allow_concurrent_mounts;
        if claimed && MOUNT_ACTIVE.swap(true, Ordering::AcqRel) {
            return Err(ClientError::MountActive);
        }
        // Released by Mount's teardown, or here on any setup failure.
        let result = Self::connect(server_addr, local_addr, root, options, claimed);
        if claimed && result.is_err() {
            MOUNT_ACTIVE.store(false, Ordering::Release);
        }
        result
    }

    fn connect(
        server_addr: &str,
        local_addr: &str,
        root: std::path::PathBuf,
        options: MountOptions,
        claimed_singleton: bool,
    ) -> Result<Self, ClientError> {
        let interval = options.heartbeat_interval;
        let store = ChunkStore::new(&root);

        let listener = TcpListener::bind(local_addr)?;
        let listen_addr = listener.local_addr()?;
        let id = ClientId::new(listen_addr.to_string(), root.to_string_lossy());

        let stream = dial(server_addr, interval)?;
        let caller = Caller::start(stream, interval)?;

        let session = Arc::new(Session {
            id: id.clone(),
            caller,
            connected: AtomicBool::new(true),
            closing: AtomicBool::new(false),
            store: store.clone(),
        });

        spawn_accept_loop(listener, &session, store)?;

        let registered = session
            .call(Call::Register(id.clone()))
            .and_then(|_| session.call(Call::EstablishReverse(id.clone())));
        if let Err(error) = registered {
            // Stop the accept loop and sever the half-built session.
            session.closing.store(true, Ordering::Release);
            session.caller.shutdown();
            let _ = TcpStream::connect_timeout(&listen_addr, Duration::from_millis(100));
            return Err(setup_error(error));
        }

        let heartbeat_stop = spawn_heartbeat(&session, interval / 2)?;
        info!(client = %id, server = server_addr, "mounted");

        Ok(Self {
            session,
            listen_addr,
            heartbeat_stop,
            claimed_singleton,
        })
    }

    /// The identity the daemon knows this mount by.
    #[must_use]
    pub fn client_id(&self) -> &ClientId {
        self.session.id()
    }

    /// Whether the daemon connection is still live.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    /// Whether a backing file for `name` exists under the mount root.
    /// Purely local; never touches the network.
    #[must_use]
    pub fn local_file_exists(&self, name: &str) -> bool {
        self.session.store().exists(name)
    }

    /// Whether any client has ever created `name` in the service.
    pub fn global_file_exists(&self, name: &str) -> Result<bool, ClientError> {
        if !valid_file_name(name) {
            return Err(ClientError::BadFilename(name.to_owned()));
        }
        match self.session.call(Call::FileExists {
            name: name.to_owned(),
        }) {
            Ok(Reply::Exists(exists)) => Ok(exists),
            Ok(_) => Err(ClientError::Protocol(ProtocolError::ReplyMismatch)),
            Err(CallError::Fault(fault)) => Err(fault_error(fault, name)),
            Err(CallError::Transport(_)) => Err(ClientError::Disconnected),
        }
    }

    /// Opens `name` in `mode`, creating the file on first open. `Read` and
    /// `Write` require a live session; `Dread` falls back to the local copy
    /// when the daemon is unreachable.
    pub fn open_file(&self, name: &str, mode: OpenMode) -> Result<FileHandle, ClientError> {
        if !valid_file_name(name) {
            return Err(ClientError::BadFilename(name.to_owned()));
        }

        match mode {
            OpenMode::Read | OpenMode::Write => {
                self.register_open(name, mode)?;
                self.session.store().ensure(name)?;
            }
            OpenMode::Dread => {
                if self.session.is_connected() {
                    match self.register_open(name, mode) {
                        Ok(()) => self.session.store().ensure(name)?,
                        // Degrade to a purely local open when the daemon
                        // went away mid-mount.
                        Err(ClientError::Disconnected) => self.require_local(name)?,
                        Err(other) => return Err(other),
                    }
                } else {
                    self.require_local(name)?;
                }
            }
        }

        Ok(FileHandle::new(
            Arc::clone(&self.session),
            name.to_owned(),
            mode,
        ))
    }

    fn register_open(&self, name: &str, mode: OpenMode) -> Result<(), ClientError> {
        match self.session.call(Call::OpenFile {
            client: self.session.id().clone(),
            name: name.to_owned(),
            mode,
        }) {
            Ok(Reply::Ok) => Ok(()),
            Ok(_) => Err(ClientError::Protocol(ProtocolError::ReplyMismatch)),
            Err(CallError::Fault(fault)) => Err(fault_error(fault, name)),
            Err(CallError::Transport(_)) => Err(ClientError::Disconnected),
        }
    }

    fn require_local(&self, name: &str) -> Result<(), ClientError> {
        if self.session.store().exists(name) {
            Ok(())
        } else {
            Err(ClientError::FileUnavailable(name.to_owned()))
        }
    }

    /// Unregisters from the daemon and tears the session down. Transport
    /// errors during teardown are logged and swallowed.
    pub fn unmount(self) -> Result<(), ClientError> {
        self.teardown();
        Ok(())
    }

    fn teardown(&self) {
        if self.session.closing.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Err(error) = self
            .session
            .call(Call::Unregister(self.session.id().clone()))
        {
            debug!(%error, "unregister failed during unmount");
        }

        self.session.connected.store(false, Ordering::Release);
        let _ = self.heartbeat_stop.send(());
        self.session.caller.shutdown();

        // Wake the accept loop so it observes the closing flag and exits.
        let _ = TcpStream::connect_timeout(&self.listen_addr, Duration::from_millis(100));

        info!(client = %self.session.id(), "unmounted");
        if self.claimed_singleton {
            MOUNT_ACTIVE.store(false, Ordering::Release);
        }
    }
}

impl Drop for Mount {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Resolves `addr` and connects to the first reachable candidate.
fn dial(addr: &str, timeout: Duration) -> io::Result<TcpStream> {
    let candidates: Vec<SocketAddr> = addr.to_socket_addrs()?.collect();
    let mut last_error = None;
    for candidate in candidates {
        match TcpStream::connect_timeout(&candidate, timeout) {
            Ok(stream) => return Ok(stream),
            Err(error) => last_error = Some(error),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, "address resolved to nothing")
    }))
}

fn spawn_accept_loop(
    listener: TcpListener,
    session: &Arc<Session>,
    store: ChunkStore,
) -> io::Result<()> {
    let session = Arc::clone(session);
    thread::Builder::new()
        .name("inbound-accept".into())
        .spawn(move || {
            let inbound = Arc::new(Inbound { store });
            for stream in listener.incoming() {
                if session.closing.load(Ordering::Acquire) {
                    break;
                }
                let stream = match stream {
                    Ok(stream) => stream,
                    Err(error) => {
                        debug!(%error, "reverse accept failed");
                        continue;
                    }
                };
                let inbound = Arc::clone(&inbound);
                let spawned = thread::Builder::new()
                    .name("inbound-conn".into())
                    .spawn(move || {
                        if let Err(error) = serve(stream, inbound) {
                            debug!(%error, "reverse connection ended");
                        }
                    });
                if let Err(error) = spawned {
                    warn!(%error, "failed to spawn reverse connection thread");
                }
            }
        })
        .map(drop)
}

fn spawn_heartbeat(session: &Arc<Session>, period: Duration) -> io::Result<Sender<()>> {
    let (stop_tx, stop_rx) = bounded::<()>(1);
    let session = Arc::clone(session);
    thread::Builder::new()
        .name("heartbeat".into())
        .spawn(move || {
            loop {
                // A stop signal or a dropped sender ends the task; only a
                // timeout means "still mounted, beat again".
                match stop_rx.recv_timeout(period) {
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                    _ => break,
                }
                if let Err(error) = session.call(Call::Heartbeat(session.id().clone())) {
                    if !session.closing.load(Ordering::Acquire) {
                        warn!(%error, "heartbeat failed; session is down");
                    }
                    session.mark_disconnected();
                    break;
                }
            }
        })?;
    Ok(stop_tx)
}

fn setup_error(error: CallError) -> ClientError {
    match error {
        CallError::Fault(fault) => ClientError::Daemon(fault),
        CallError::Transport(error) => ClientError::Protocol(error),
    }
}

/// Maps a daemon fault to the library error the operation surfaces.
pub(crate) fn fault_error(fault: Fault, name: &str) -> ClientError {
    match fault.code {
        FaultCode::WriteConflict => ClientError::OpenWriteConflict(name.to_owned()),
        FaultCode::BadName => ClientError::BadFilename(name.to_owned()),
        FaultCode::UnknownFile => ClientError::FileUnavailable(name.to_owned()),
        FaultCode::NotRegistered => ClientError::Disconnected,
        _ => ClientError::Daemon(fault),
    }
}

//! RPC dispatch and the chunk-resolution algorithm.

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use std::sync::Arc;

use tracing::{debug, warn};

use protocol::{
    Call, Caller, ClientId, Fault, FaultCode, Handler, Reply, valid_file_name,
};

use crate::directory::Directory;
use crate::membership::Membership;

/// The coordinator's servant: every inbound connection dispatches into one
/// shared instance.
///
/// Lock order: the directory lock may be taken while consulting membership
/// (write-lock recovery), never the other way around. Paths that need both
/// the other way take them sequentially.
pub(crate) struct Service {
    membership: Arc<Membership>,
    directory: Directory,
    interval: Duration,
}

impl Service {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            membership: Membership::new(interval),
            directory: Directory::new(),
            interval,
        }
    }

    fn require_registered(&self, client: &ClientId) -> Result<(), Fault> {
        if self.membership.is_registered(client) {
            Ok(())
        } else {
            Err(Fault::new(FaultCode::NotRegistered, client.to_string()))
        }
    }

    fn require_valid_name(name: &str) -> Result<(), Fault> {
        if valid_file_name(name) {
            Ok(())
        } else {
            Err(Fault::new(FaultCode::BadName, name))
        }
    }

    /// Dials the client back at its advertised address and caches the
    /// resulting reverse channel.
    fn establish_reverse(&self, client: &ClientId) -> Result<Reply, Fault> {
        self.require_registered(client)?;

        let stream = dial(client.addr(), self.interval).map_err(|error| {
            warn!(%client, %error, "reverse dial failed");
            Fault::new(FaultCode::ReverseDial, error.to_string())
        })?;
        let caller = Caller::start(stream, self.interval)
            .map_err(|error| Fault::new(FaultCode::ReverseDial, error.to_string()))?;

        self.membership.set_reverse(client, caller)?;
        debug!(%client, "reverse channel established");
        Ok(Reply::Ok)
    }

    fn open_file(&self, client: &ClientId, name: &str, mode: protocol::OpenMode) -> Result<Reply, Fault> {
        self.require_registered(client)?;
        Self::require_valid_name(name)?;
        self.directory.open(client, name, mode, |holder| {
            self.membership.is_registered(holder)
        })?;
        Ok(Reply::Ok)
    }

    fn commit_write(&self, client: &ClientId, name: &str, index: u8) -> Result<Reply, Fault> {
        self.require_registered(client)?;
        Self::require_valid_name(name)?;
        let version = self.directory.commit(client, name, index)?;
        Ok(Reply::Committed { version })
    }

    /// Resolves a chunk for `client`.
    ///
    /// The version and owner list are snapshotted under the directory lock,
    /// then owners are tried in insertion order outside it: the first one
    /// that answers is authoritative. Owners that were reaped, never got a
    /// reverse channel, or fail the call are skipped; that is also where
    /// stale owner entries from lazy reaping get discovered.
    fn fetch_chunk(
        &self,
        client: &ClientId,
        name: &str,
        index: u8,
        local_version: u64,
    ) -> Result<Reply, Fault> {
        self.require_registered(client)?;
        Self::require_valid_name(name)?;

        let (version, owners) = self.directory.chunk_snapshot(name, index)?;
        if local_version >= version {
            return Ok(Reply::Fetched {
                version,
                data: None,
            });
        }

        for owner in owners {
            let Some(caller) = self.membership.reverse(&owner) else {
                debug!(%owner, %name, index, "skipping owner without a reverse channel");
                continue;
            };
            match caller.call(Call::RetrieveChunk {
                name: name.to_owned(),
                index,
            }) {
                Ok(Reply::Chunk(chunk)) => {
                    // The requester now also holds the fetched version,
                    // unless a commit raced past the snapshot.
                    self.directory.record_owner(name, index, client, version);
                    return Ok(Reply::Fetched {
                        version,
                        data: Some(chunk),
                    });
                }
                Ok(other) => {
                    warn!(%owner, %name, index, ?other, "owner answered with the wrong reply");
                }
                Err(error) => {
                    warn!(%owner, %name, index, %error, "owner unreachable; trying the next one");
                }
            }
        }

        Err(Fault::new(FaultCode::ChunkUnavailable, index.to_string()))
    }
}

impl Handler for Service {
    fn handle(&self, call: Call) -> Result<Reply, Fault> {
        match call {
            Call::Register(client) => {
                self.membership.register(client)?;
                Ok(Reply::Ok)
            }
            Call::Unregister(client) => {
                self.membership.unregister(&client);
                Ok(Reply::Ok)
            }
            Call::Heartbeat(client) => {
                self.membership.heartbeat(&client)?;
                Ok(Reply::Ok)
            }
            Call::EstablishReverse(client) => self.establish_reverse(&client),
            Call::FileExists { name } => {
                Self::require_valid_name(&name)?;
                Ok(Reply::Exists(self.directory.exists(&name)))
            }
            Call::OpenFile { client, name, mode } => self.open_file(&client, &name, mode),
            Call::CommitWrite {
                client,
                name,
                index,
            } => self.commit_write(&client, &name, index),
            Call::FetchChunk {
                client,
                name,
                index,
                local_version,
            } => self.fetch_chunk(&client, &name, index, local_version),
            Call::CloseFile { client, name, mode } => {
                self.directory.close(&client, &name, mode);
                Ok(Reply::Ok)
            }
            Call::Ping => Ok(Reply::Ok),
            Call::RetrieveChunk { .. } => Err(Fault::new(
                FaultCode::UnknownMethod,
                "the coordinator does not serve chunk bytes",
            )),
        }
    }
}

/// Resolves `addr` and connects to the first reachable candidate.
fn dial(addr: &str, timeout: Duration) -> std::io::Result<TcpStream> {
    let candidates: Vec<SocketAddr> = addr.to_socket_addrs()?.collect();
    let mut last_error = None;
    for candidate in candidates {
        match TcpStream::connect_timeout(&candidate, timeout) {
            Ok(stream) => return Ok(stream),
            Err(error) => last_error = Some(error),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            "address resolved to nothing",
        )
    }))
}

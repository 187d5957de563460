//! Per-file metadata: write locks, chunk versions, and owner lists.

use std::sync::Mutex;

use rustc_hash::FxHashMap;
use tracing::{debug, info};

use protocol::{ChunkIndex, ClientId, Fault, FaultCode, NUM_CHUNKS, OpenMode, Version};

pub(crate) struct Directory {
    files: Mutex<FxHashMap<String, FileRecord>>,
}

struct FileRecord {
    writer: Option<ClientId>,
    chunks: Vec<ChunkState>,
    open_modes: FxHashMap<ClientId, OpenMode>,
}

#[derive(Default)]
struct ChunkState {
    version: Version,
    /// Clients believed to hold bytes at `version`, in insertion order.
    /// Entries for reaped clients linger until resolution skips past them.
    owners: Vec<ClientId>,
}

impl FileRecord {
    fn new() -> Self {
        let mut chunks = Vec::with_capacity(NUM_CHUNKS);
        chunks.resize_with(NUM_CHUNKS, ChunkState::default);
        Self {
            writer: None,
            chunks,
            open_modes: FxHashMap::default(),
        }
    }
}

impl Directory {
    pub(crate) fn new() -> Self {
        Self {
            files: Mutex::new(FxHashMap::default()),
        }
    }

    pub(crate) fn exists(&self, name: &str) -> bool {
        let files = self.files.lock().expect("directory lock");
        files.contains_key(name)
    }

    /// Opens `name` for `client`, creating the record on first open. For
    /// write mode the lock is granted when free, already held by `client`,
    /// or held by a client `writer_live` reports dead (crash recovery).
    pub(crate) fn open(
        &self,
        client: &ClientId,
        name: &str,
        mode: OpenMode,
        writer_live: impl Fn(&ClientId) -> bool,
    ) -> Result<(), Fault> {
        let mut files = self.files.lock().expect("directory lock");
        let record = files.entry(name.to_owned()).or_insert_with(|| {
            info!(%name, "file created");
            FileRecord::new()
        });

        if mode == OpenMode::Write {
            match &record.writer {
                Some(holder) if holder != client && writer_live(holder) => {
                    return Err(Fault::new(FaultCode::WriteConflict, name));
                }
                Some(holder) if holder != client => {
                    info!(%name, old = %holder, new = %client, "write lock recovered from a dead holder");
                    record.writer = Some(client.clone());
                }
                Some(_) => {}
                None => {
                    debug!(%name, %client, "write lock granted");
                    record.writer = Some(client.clone());
                }
            }
        }

        record.open_modes.insert(client.clone(), mode);
        Ok(())
    }

    /// Commits a write: bumps the chunk's version by one and collapses its
    /// owner list to the writer.
    pub(crate) fn commit(
        &self,
        client: &ClientId,
        name: &str,
        index: ChunkIndex,
    ) -> Result<Version, Fault> {
        let mut files = self.files.lock().expect("directory lock");
        let record = files
            .get_mut(name)
            .ok_or_else(|| Fault::new(FaultCode::UnknownFile, name))?;

        if record.writer.as_ref() != Some(client) {
            return Err(Fault::new(FaultCode::NotWriter, name));
        }

        let state = &mut record.chunks[usize::from(index)];
        state.version += 1;
        state.owners.clear();
        state.owners.push(client.clone());
        Ok(state.version)
    }

    /// The chunk's current version and owner list, for resolution outside
    /// the lock.
    pub(crate) fn chunk_snapshot(
        &self,
        name: &str,
        index: ChunkIndex,
    ) -> Result<(Version, Vec<ClientId>), Fault> {
        let files = self.files.lock().expect("directory lock");
        let record = files
            .get(name)
            .ok_or_else(|| Fault::new(FaultCode::UnknownFile, name))?;
        let state = &record.chunks[usize::from(index)];
        Ok((state.version, state.owners.clone()))
    }

    /// Records `client` as an additional owner of the chunk, provided the
    /// version is still the one its copy was fetched at.
    pub(crate) fn record_owner(
        &self,
        name: &str,
        index: ChunkIndex,
        client: &ClientId,
        fetched_version: Version,
    ) {
        let mut files = self.files.lock().expect("directory lock");
        let Some(record) = files.get_mut(name) else {
            return;
        };
        let state = &mut record.chunks[usize::from(index)];
        if state.version == fetched_version && !state.owners.contains(client) {
            state.owners.push(client.clone());
        }
    }

    /// Closes `client`'s handle, releasing the write lock when it holds
    /// one. Unknown files and clients are acknowledged silently.
    pub(crate) fn close(&self, client: &ClientId, name: &str, mode: OpenMode) {
        let mut files = self.files.lock().expect("directory lock");
        let Some(record) = files.get_mut(name) else {
            return;
        };
        record.open_modes.remove(client);
        if mode == OpenMode::Write && record.writer.as_ref() == Some(client) {
            debug!(%name, %client, "write lock released");
            record.writer = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(tag: &str) -> ClientId {
        ClientId::new(format!("127.0.0.1:{tag}"), format!("/mnt/{tag}"))
    }

    fn always_live(_: &ClientId) -> bool {
        true
    }

    #[test]
    fn first_open_creates_the_record() {
        let directory = Directory::new();
        assert!(!directory.exists("openTest"));

        directory
            .open(&client("1"), "openTest", OpenMode::Read, always_live)
            .expect("open");
        assert!(directory.exists("openTest"));

        let (version, owners) = directory.chunk_snapshot("openTest", 0).expect("snapshot");
        assert_eq!(version, 0);
        assert!(owners.is_empty());
    }

    #[test]
    fn two_live_writers_conflict() {
        let directory = Directory::new();
        let a = client("1");
        let b = client("2");

        directory
            .open(&a, "openTest", OpenMode::Write, always_live)
            .expect("first writer");
        let err = directory
            .open(&b, "openTest", OpenMode::Write, always_live)
            .expect_err("second writer");
        assert_eq!(err.code, FaultCode::WriteConflict);

        // Reads are unaffected by the held lock.
        directory
            .open(&b, "openTest", OpenMode::Read, always_live)
            .expect("reader");
    }

    #[test]
    fn the_holder_may_reopen_for_write() {
        let directory = Directory::new();
        let a = client("1");
        directory
            .open(&a, "openTest", OpenMode::Write, always_live)
            .expect("open");
        directory
            .open(&a, "openTest", OpenMode::Write, always_live)
            .expect("reopen by the holder");
    }

    #[test]
    fn a_dead_holder_is_superseded() {
        let directory = Directory::new();
        let a = client("1");
        let b = client("2");

        directory
            .open(&a, "tmo", OpenMode::Write, always_live)
            .expect("first writer");
        directory
            .open(&b, "tmo", OpenMode::Write, |holder| *holder != a)
            .expect("lock recovered from the dead holder");

        // The old holder can no longer commit.
        let err = directory.commit(&a, "tmo", 0).expect_err("stale writer");
        assert_eq!(err.code, FaultCode::NotWriter);
        directory.commit(&b, "tmo", 0).expect("new writer commits");
    }

    #[test]
    fn commit_bumps_the_version_and_collapses_owners() {
        let directory = Directory::new();
        let a = client("1");
        let b = client("2");

        directory
            .open(&a, "openTest", OpenMode::Write, always_live)
            .expect("open");
        assert_eq!(directory.commit(&a, "openTest", 0).expect("commit"), 1);
        directory.record_owner("openTest", 0, &b, 1);

        let (_, owners) = directory.chunk_snapshot("openTest", 0).expect("snapshot");
        assert_eq!(owners, vec![a.clone(), b.clone()]);

        // The next commit collapses the owner list back to the writer.
        assert_eq!(directory.commit(&a, "openTest", 0).expect("commit"), 2);
        let (version, owners) = directory.chunk_snapshot("openTest", 0).expect("snapshot");
        assert_eq!(version, 2);
        assert_eq!(owners, vec![a]);
    }

    #[test]
    fn commits_touch_only_their_own_chunk() {
        let directory = Directory::new();
        let a = client("1");
        directory
            .open(&a, "openTest", OpenMode::Write, always_live)
            .expect("open");

        directory.commit(&a, "openTest", 10).expect("commit");
        let (version, _) = directory.chunk_snapshot("openTest", 10).expect("snapshot");
        assert_eq!(version, 1);
        let (version, owners) = directory.chunk_snapshot("openTest", 11).expect("snapshot");
        assert_eq!(version, 0);
        assert!(owners.is_empty());
    }

    #[test]
    fn commit_without_the_lock_faults() {
        let directory = Directory::new();
        let a = client("1");
        directory
            .open(&a, "openTest", OpenMode::Read, always_live)
            .expect("open");

        let err = directory.commit(&a, "openTest", 0).expect_err("no lock");
        assert_eq!(err.code, FaultCode::NotWriter);
        let err = directory.commit(&a, "ghost", 0).expect_err("no record");
        assert_eq!(err.code, FaultCode::UnknownFile);
    }

    #[test]
    fn stale_fetches_do_not_pollute_the_owner_list() {
        let directory = Directory::new();
        let a = client("1");
        let b = client("2");

        directory
            .open(&a, "openTest", OpenMode::Write, always_live)
            .expect("open");
        directory.commit(&a, "openTest", 0).expect("commit v1");

        // A fetch observed version 1, but a second commit raced past it.
        directory.commit(&a, "openTest", 0).expect("commit v2");
        directory.record_owner("openTest", 0, &b, 1);

        let (_, owners) = directory.chunk_snapshot("openTest", 0).expect("snapshot");
        assert_eq!(owners, vec![a]);
    }

    #[test]
    fn close_releases_only_the_holders_lock() {
        let directory = Directory::new();
        let a = client("1");
        let b = client("2");

        directory
            .open(&a, "openTest", OpenMode::Write, always_live)
            .expect("open");

        // A reader closing does not release the writer's lock.
        directory
            .open(&b, "openTest", OpenMode::Read, always_live)
            .expect("reader");
        directory.close(&b, "openTest", OpenMode::Read);
        let err = directory
            .open(&b, "openTest", OpenMode::Write, always_live)
            .expect_err("lock still held");
        assert_eq!(err.code, FaultCode::WriteConflict);

        directory.close(&a, "openTest", OpenMode::Write);
        directory
            .open(&b, "openTest", OpenMode::Write, always_live)
            .expect("lock free after close");
    }
}

//! Local chunk storage.
//!
//! Every opened file is backed by `<root>/<name>.dfs`: a flat file of
//! exactly [`FILE_SIZE`] bytes, zero-filled on creation. The store keeps one
//! shared handle per file behind a reader/writer lock so chunk writes
//! serialize against both local reads and the reverse-channel retrievals the
//! daemon issues on behalf of other clients. Handles stay cached after a
//! [`FileHandle`](crate::FileHandle) closes because the mount keeps serving
//! the chunks it owns until it unmounts.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use rustc_hash::FxHashMap;

use protocol::{CHUNK_SIZE, Chunk, ChunkIndex, FILE_SIZE};

/// On-disk suffix of backing files.
const BACKING_SUFFIX: &str = ".dfs";

#[derive(Clone)]
pub(crate) struct ChunkStore {
    inner: Arc<Inner>,
}

struct Inner {
    root: PathBuf,
    files: Mutex<FxHashMap<String, Arc<RwLock<File>>>>,
}

impl ChunkStore {
    pub(crate) fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                root: root.into(),
                files: Mutex::new(FxHashMap::default()),
            }),
        }
    }

    pub(crate) fn backing_path(&self, name: &str) -> PathBuf {
        self.inner.root.join(format!("{name}{BACKING_SUFFIX}"))
    }

    /// Whether a backing file for `name` exists on disk.
    pub(crate) fn exists(&self, name: &str) -> bool {
        self.backing_path(name).is_file()
    }

    /// Creates the backing file if needed and pads it to [`FILE_SIZE`].
    pub(crate) fn ensure(&self, name: &str) -> io::Result<()> {
        self.handle(name, true).map(drop)
    }

    /// Reads one chunk. Fails with [`io::ErrorKind::NotFound`] when the file
    /// has never been stored locally.
    pub(crate) fn read_chunk(&self, name: &str, index: ChunkIndex) -> io::Result<Chunk> {
        let handle = self.handle(name, false)?;
        let file = handle.read().expect("backing file lock");
        let mut bytes = [0u8; CHUNK_SIZE];
        file.read_exact_at(&mut bytes, chunk_offset(index))?;
        Ok(Chunk::new(bytes))
    }

    /// Writes one chunk and syncs it to disk before returning.
    pub(crate) fn write_chunk(
        &self,
        name: &str,
        index: ChunkIndex,
        chunk: &Chunk,
    ) -> io::Result<()> {
        let handle = self.handle(name, true)?;
        let file = handle.write().expect("backing file lock");
        file.write_all_at(chunk.as_bytes(), chunk_offset(index))?;
        file.sync_data()
    }

    fn handle(&self, name: &str, create: bool) -> io::Result<Arc<RwLock<File>>> {
        let mut files = self.inner.files.lock().expect("store table lock");
        if let Some(handle) = files.get(name) {
            return Ok(Arc::clone(handle));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(self.backing_path(name))?;
        if file.metadata()?.len() < FILE_SIZE {
            file.set_len(FILE_SIZE)?;
        }

        let handle = Arc::new(RwLock::new(file));
        files.insert(name.to_owned(), Arc::clone(&handle));
        Ok(handle)
    }
}

fn chunk_offset(index: ChunkIndex) -> u64 {
    u64::from(index) * CHUNK_SIZE as u64
}

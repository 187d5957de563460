use std::fmt;
use std::time::Duration;

/// Size of a single chunk in bytes. All chunk I/O is performed in units of
/// this size; partial chunks do not exist on the wire or on disk.
pub const CHUNK_SIZE: usize = 32;

/// Number of chunks in every file. Chunk indices therefore fit in a `u8`.
pub const NUM_CHUNKS: usize = 256;

/// Exact size of a backing file on disk: [`NUM_CHUNKS`] chunks of
/// [`CHUNK_SIZE`] bytes, zero-filled on creation.
pub const FILE_SIZE: u64 = (NUM_CHUNKS * CHUNK_SIZE) as u64;

/// Default heartbeat interval. The daemon reaps a client that stays silent
/// for this long, and callers give up on an unanswered RPC after the same
/// duration. Clients emit heartbeats at half this interval.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(5000);

/// Index of a chunk within a file.
pub type ChunkIndex = u8;

/// Version of a chunk. Versions start at zero and only ever grow; each
/// accepted write increments the global version of the touched chunk by one.
pub type Version = u64;

/// Returns true when `name` is a legal chunkfs file name: one to sixteen
/// characters, every one of them in the Unicode letter-or-number class.
///
/// Names never carry the `.dfs` suffix the client appends on disk.
#[must_use]
pub fn valid_file_name(name: &str) -> bool {
    let mut chars = 0usize;
    for ch in name.chars() {
        if !ch.is_alphanumeric() {
            return false;
        }
        chars += 1;
        if chars > 16 {
            return false;
        }
    }
    chars >= 1
}

/// A single 32-byte chunk of file data, opaque to the transport.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Chunk([u8; CHUNK_SIZE]);

impl Chunk {
    /// Wraps an exact 32-byte array.
    #[must_use]
    pub const fn new(bytes: [u8; CHUNK_SIZE]) -> Self {
        Self(bytes)
    }

    /// Builds a chunk from up to 32 bytes, zero-padding the remainder.
    /// Longer inputs are truncated.
    #[must_use]
    pub fn padded(bytes: &[u8]) -> Self {
        let mut data = [0u8; CHUNK_SIZE];
        let take = bytes.len().min(CHUNK_SIZE);
        data[..take].copy_from_slice(&bytes[..take]);
        Self(data)
    }

    /// Borrows the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; CHUNK_SIZE] {
        &self.0
    }
}

impl Default for Chunk {
    fn default() -> Self {
        Self([0u8; CHUNK_SIZE])
    }
}

impl From<[u8; CHUNK_SIZE]> for Chunk {
    fn from(bytes: [u8; CHUNK_SIZE]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Chunk {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Chunk(\"{}\")", self.0.escape_ascii())
    }
}

/// Identity of a mounted client: the advertised listen address the daemon
/// dials back to, and the local mount path. Both fields participate in
/// equality, so two mounts on one host rooted at different paths are
/// distinct clients.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClientId {
    addr: String,
    path: String,
}

impl ClientId {
    /// Builds an identity from an advertised `host:port` and a mount path.
    #[must_use]
    pub fn new(addr: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            path: path.into(),
        }
    }

    /// The listen address the daemon dials for reverse calls.
    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// The mount's local root path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.addr, self.path)
    }
}

/// Mode a file is opened in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpenMode {
    /// Server-mediated reads only.
    Read,
    /// Exclusive writes plus reads. At most one client per file holds this.
    Write,
    /// Disconnected reads: fall back to the local copy when the daemon is
    /// unreachable.
    Dread,
}

impl OpenMode {
    /// Stable single-byte wire encoding.
    #[must_use]
    pub const fn wire_code(self) -> u8 {
        match self {
            Self::Read => 1,
            Self::Write => 2,
            Self::Dread => 3,
        }
    }

    /// Decodes a wire byte, returning `None` for unknown values.
    #[must_use]
    pub const fn from_wire(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Read),
            2 => Some(Self::Write),
            3 => Some(Self::Dread),
            _ => None,
        }
    }
}

impl fmt::Display for OpenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Dread => "dread",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_alphanumeric_names() {
        assert!(valid_file_name("openTest"));
        assert!(valid_file_name("a"));
        assert!(valid_file_name("0123456789abcdef"));
    }

    #[test]
    fn accepts_unicode_letters_and_digits() {
        assert!(valid_file_name("héllo"));
        assert!(valid_file_name("файл7"));
        assert!(valid_file_name("٣٤٥"));
    }

    #[test]
    fn rejects_empty_and_overlong_names() {
        assert!(!valid_file_name(""));
        assert!(!valid_file_name("0123456789abcdefg"));
    }

    #[test]
    fn rejects_punctuation_and_whitespace() {
        assert!(!valid_file_name("foo.dfs"));
        assert!(!valid_file_name("foo bar"));
        assert!(!valid_file_name("foo/bar"));
        assert!(!valid_file_name("&^"));
    }

    #[test]
    fn length_limit_counts_characters_not_bytes() {
        // Sixteen two-byte characters exceed sixteen bytes but stay legal.
        let name: String = "é".repeat(16);
        assert!(valid_file_name(&name));
        let long: String = "é".repeat(17);
        assert!(!valid_file_name(&long));
    }

    #[test]
    fn padded_chunk_zero_fills_the_tail() {
        let chunk = Chunk::padded(b"Hello world!");
        assert_eq!(&chunk.as_bytes()[..12], b"Hello world!");
        assert!(chunk.as_bytes()[12..].iter().all(|&b| b == 0));
    }

    #[test]
    fn client_ids_differ_by_path() {
        let a = ClientId::new("127.0.0.1:9000", "/tmp/a");
        let b = ClientId::new("127.0.0.1:9000", "/tmp/b");
        assert_ne!(a, b);
    }

    #[test]
    fn open_mode_round_trips_through_wire_codes() {
        for mode in [OpenMode::Read, OpenMode::Write, OpenMode::Dread] {
            assert_eq!(OpenMode::from_wire(mode.wire_code()), Some(mode));
        }
        assert_eq!(OpenMode::from_wire(0), None);
        assert_eq!(OpenMode::from_wire(4), None);
    }
}

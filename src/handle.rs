//! Opaque file handles and the handle registry.
//!
//! A handle is exactly 32 bytes on the wire: a per-filesystem file number,
//! the filesystem id, and a 24-byte suffix fixed for the life of the server
//! instance. The registry records every handle it ever minted in both
//! directions; nothing is evicted, so a handle from before an unmount keeps
//! decoding and the dispatcher can tell "stale" apart from "garbage".

use std::collections::HashMap;
use std::fmt;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use sha2::Digest;
use sha2::Sha256;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;
use zerocopy::byteorder::big_endian::U32;

use crate::NodeId;

/// Size of a file handle on the wire, RFC 1094 `FHSIZE`.
pub const FHSIZE: usize = 32;

/// Size of the server-instance suffix inside a handle.
const NONCE_SIZE: usize = 24;

/// Identifier of one mounted filesystem instance.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct FsId(pub u32);

impl fmt::Display for FsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Wire layout of a handle. Both integers are big-endian.
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
struct RawHandle {
    file_id: U32,
    fs_id: U32,
    nonce: [u8; NONCE_SIZE],
}

const _: () = assert!(size_of::<RawHandle>() == FHSIZE);

/// An opaque 32-byte NFS file handle.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct FileHandle([u8; FHSIZE]);

impl FileHandle {
    /// Wrap raw wire bytes. No validation happens here; unknown handles
    /// surface as stale at dispatch time.
    pub fn from_bytes(bytes: [u8; FHSIZE]) -> FileHandle {
        FileHandle(bytes)
    }

    /// The wire representation.
    pub fn as_bytes(&self) -> &[u8; FHSIZE] {
        &self.0
    }

    fn pack(file_id: u32, fs_id: FsId, nonce: &[u8; NONCE_SIZE]) -> FileHandle {
        let raw = RawHandle {
            file_id: U32::new(file_id),
            fs_id: U32::new(fs_id.0),
            nonce: *nonce,
        };
        let mut bytes = [0u8; FHSIZE];
        bytes.copy_from_slice(raw.as_bytes());
        FileHandle(bytes)
    }

    /// Structural decode into `(file_id, fs_id)`.
    pub fn parse(&self) -> (u32, FsId) {
        let raw = RawHandle::ref_from_bytes(&self.0).expect("handle layout is exactly FHSIZE");
        (raw.file_id.get(), FsId(raw.fs_id.get()))
    }
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (file_id, fs_id) = self.parse();
        write!(f, "FileHandle(file {file_id} on fs {fs_id})")
    }
}

/// Suffix stamped into every handle this server instance mints. Only
/// uniqueness across instances matters: a handle from a previous life fails
/// registry lookup and is answered with `NFSERR_STALE`.
fn instance_nonce() -> [u8; NONCE_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(std::process::id().to_be_bytes());
    if let Ok(elapsed) = SystemTime::now().duration_since(UNIX_EPOCH) {
        hasher.update(elapsed.as_nanos().to_be_bytes());
    }
    let digest = hasher.finalize();
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&digest[..NONCE_SIZE]);
    nonce
}

/// Bidirectional map between handles and backend node ids, partitioned by
/// filesystem.
pub struct HandleRegistry {
    nonce: [u8; NONCE_SIZE],
    by_handle: HashMap<FileHandle, NodeId>,
    by_node: HashMap<(FsId, NodeId), FileHandle>,
    next_file_id: HashMap<FsId, u32>,
}

impl HandleRegistry {
    /// Create a registry with a fresh instance nonce.
    pub fn new() -> HandleRegistry {
        HandleRegistry::with_nonce(instance_nonce())
    }

    /// Create a registry with a caller-chosen nonce.
    pub fn with_nonce(nonce: [u8; NONCE_SIZE]) -> HandleRegistry {
        HandleRegistry {
            nonce,
            by_handle: HashMap::new(),
            by_node: HashMap::new(),
            next_file_id: HashMap::new(),
        }
    }

    /// The backend node id a handle was minted for, or `None` for a handle
    /// this instance never issued (a stale handle).
    pub fn lookup_id(&self, fh: &FileHandle) -> Option<NodeId> {
        self.by_handle.get(fh).copied()
    }

    /// The handle for `(id, fs_id)`, minting one on first sight.
    ///
    /// Minting bumps the filesystem's file counter, so the first handle on a
    /// filesystem carries `file_id` 1; 0 is reserved. An id that was ever
    /// minted keeps returning its original handle, even after the owning
    /// filesystem is unmounted.
    pub fn handle_for(&mut self, id: NodeId, fs_id: FsId) -> FileHandle {
        if let Some(fh) = self.by_node.get(&(fs_id, id)) {
            return *fh;
        }
        let counter = self.next_file_id.entry(fs_id).or_insert(0);
        *counter += 1;
        let fh = FileHandle::pack(*counter, fs_id, &self.nonce);
        self.by_handle.insert(fh, id);
        self.by_node.insert((fs_id, id), fh);
        fh
    }

    /// Number of handles minted so far.
    pub fn len(&self) -> usize {
        self.by_handle.len()
    }

    /// Whether no handle was minted yet.
    pub fn is_empty(&self) -> bool {
        self.by_handle.is_empty()
    }
}

impl Default for HandleRegistry {
    fn default() -> HandleRegistry {
        HandleRegistry::new()
    }
}

impl fmt::Debug for HandleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleRegistry")
            .field("handles", &self.by_handle.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mint_and_look_up() {
        let mut reg = HandleRegistry::new();
        let fh = reg.handle_for(NodeId(42), FsId(1));
        assert_eq!(reg.lookup_id(&fh), Some(NodeId(42)));
        let (file_id, fs_id) = fh.parse();
        assert_eq!(file_id, 1);
        assert_eq!(fs_id, FsId(1));
    }

    #[test]
    fn minting_is_idempotent() {
        let mut reg = HandleRegistry::new();
        let a = reg.handle_for(NodeId(7), FsId(1));
        let b = reg.handle_for(NodeId(7), FsId(1));
        assert_eq!(a, b);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn counters_are_per_filesystem() {
        let mut reg = HandleRegistry::new();
        let a = reg.handle_for(NodeId(7), FsId(1));
        let b = reg.handle_for(NodeId(7), FsId(2));
        assert_ne!(a, b);
        assert_eq!(a.parse().0, 1);
        assert_eq!(b.parse().0, 1);
    }

    #[test]
    fn handles_are_unique() {
        let mut reg = HandleRegistry::new();
        let mut seen = std::collections::HashSet::new();
        for fs in 1..=3u32 {
            for id in 1..=100u64 {
                assert!(seen.insert(reg.handle_for(NodeId(id), FsId(fs))));
            }
        }
    }

    #[test]
    fn unknown_handle_is_stale() {
        let reg = HandleRegistry::new();
        let mut bytes = [0u8; FHSIZE];
        bytes[3] = 9;
        bytes[7] = 7;
        let fh = FileHandle::from_bytes(bytes);
        assert_eq!(reg.lookup_id(&fh), None);
        assert_eq!(fh.parse(), (9, FsId(7)));
    }

    #[test]
    fn wire_layout_is_big_endian() {
        let mut reg = HandleRegistry::with_nonce([0xab; 24]);
        let fh = reg.handle_for(NodeId(1), FsId(0x0102_0304));
        let bytes = fh.as_bytes();
        assert_eq!(&bytes[..4], &[0, 0, 0, 1]);
        assert_eq!(&bytes[4..8], &[1, 2, 3, 4]);
        assert_eq!(&bytes[8..], &[0xab; 24]);
    }

    #[test]
    fn instance_nonce_is_nontrivial() {
        assert_ne!(instance_nonce(), [0u8; NONCE_SIZE]);
    }
}

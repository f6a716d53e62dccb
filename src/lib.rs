//! Extensible NFSv2 server core.
//!
//! This crate is the protocol-independent middle of an NFS version 2 server
//! (RFC 1094): it owns the opaque file-handle namespace, the mount table,
//! the per-procedure NFS dispatch, and byte-range advisory locks for the
//! KLM program. The RPC transport (XDR decoding, UDP sockets, portmapper
//! registration) and the concrete filesystems live outside and talk to the
//! core through the types exported here.
//!
//! A filesystem plugs in by implementing [`BackendModule`] (the factory
//! that `mnt` drives) and [`Backend`] (the per-mount operation set). The
//! dispatcher never touches storage itself; every procedure reduces to one
//! or two backend callbacks plus attribute assembly and status translation.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

use std::fmt;

use log::warn;

pub use crate::attr::AttrValue;
pub use crate::attr::Fattr;
pub use crate::attr::FileType;
pub use crate::attr::ModeRole;
pub use crate::attr::ModeSpec;
pub use crate::attr::Perms;
pub use crate::attr::Sattr;
pub use crate::attr::TimeVal;
pub use crate::dispatch::DirEntry;
pub use crate::dispatch::FsStats;
pub use crate::dispatch::NFS_PORT;
pub use crate::dispatch::NFS_PROGRAM;
pub use crate::dispatch::NFS_VERSION;
pub use crate::dispatch::NfsCall;
pub use crate::dispatch::NfsReply;
pub use crate::dispatch::ReadDirOk;
pub use crate::handle::FHSIZE;
pub use crate::handle::FileHandle;
pub use crate::handle::FsId;
pub use crate::handle::HandleRegistry;
pub use crate::lock::Holder;
pub use crate::lock::KlmStat;
pub use crate::lock::LockOwner;
pub use crate::lock::LockRange;
pub use crate::lock::LockTable;
pub use crate::mount::ExportEntry;
pub use crate::mount::FhStatus;
pub use crate::mount::MOUNT_PORT;
pub use crate::mount::MOUNT_PROGRAM;
pub use crate::mount::MOUNT_VERSION;
pub use crate::mount::MountCall;
pub use crate::mount::MountEntry;
pub use crate::mount::MountOpts;
pub use crate::mount::MountReply;
pub use crate::mount::MountTable;
pub use crate::nlm::KLM_PORT;
pub use crate::nlm::KLM_PROGRAM;
pub use crate::nlm::KLM_VERSION;
pub use crate::nlm::KlmCall;
pub use crate::nlm::KlmLock;
pub use crate::nlm::KlmReply;
pub use crate::registry::BackendRegistry;
pub use crate::server::BackgroundServer;
pub use crate::server::Request;
pub use crate::server::RequestBody;
pub use crate::server::RequestMeta;
pub use crate::server::Response;
pub use crate::server::Server;
pub use crate::server::ServerConfig;
pub use crate::server::ServerHandle;
pub use crate::status::FsError;
pub use crate::status::NfsStat;

mod attr;
mod dispatch;
mod handle;
mod lock;
mod mount;
mod nlm;
mod registry;
mod server;
mod status;

/// Identifier a backend chose for one of its objects.
///
/// The core never interprets the value; it is an equality/hash key that the
/// handle registry maps to and from wire handles.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A filename or path as it appears on the wire: opaque bytes, not
/// necessarily UTF-8.
#[derive(Clone, Default, Eq, Hash, PartialEq)]
pub struct NfsString(pub Vec<u8>);

impl NfsString {
    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the string is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for NfsString {
    fn from(value: Vec<u8>) -> Self {
        NfsString(value)
    }
}

impl From<&[u8]> for NfsString {
    fn from(value: &[u8]) -> Self {
        NfsString(value.to_vec())
    }
}

impl From<&str> for NfsString {
    fn from(value: &str) -> Self {
        NfsString(value.as_bytes().to_vec())
    }
}

impl From<String> for NfsString {
    fn from(value: String) -> Self {
        NfsString(value.into_bytes())
    }
}

impl AsRef<[u8]> for NfsString {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for NfsString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Display for NfsString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// Factory for one kind of filesystem backend.
///
/// A module is registered with a mount entry and stays known for the life
/// of the server; `mnt` calls [`init`](BackendModule::init) to produce a
/// live [`Backend`] instance for that mount.
pub trait BackendModule: Send + Sync {
    /// Short name of the module, used in traces.
    fn name(&self) -> &str;

    /// Bring up an instance for a mount.
    ///
    /// Returns the backend's id for the filesystem root together with the
    /// instance that will serve every subsequent call on this mount.
    fn init(&self, opts: &MountOpts) -> Result<(NodeId, Box<dyn Backend>), FsError>;
}

impl fmt::Debug for dyn BackendModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BackendModule({})", self.name())
    }
}

/// One mounted filesystem instance: the operation set the NFS dispatcher
/// calls into.
///
/// Implementations only need the operations their filesystem can support;
/// the default bodies report the operation as unsupported, which clients
/// see as `NFSERR_NXIO`. Callbacks run one at a time on the dispatch
/// thread and may block on their own I/O.
#[allow(unused_variables)]
pub trait Backend: Send {
    /// Tear the instance down. Called once on unmount; the mount protocol
    /// reply does not depend on it.
    fn terminate(&mut self) {}

    /// Attributes of an object, as an ordered option list.
    fn getattr(&mut self, id: NodeId) -> Result<Vec<AttrValue>, FsError> {
        warn!("[Not Implemented] getattr(id: {id})");
        Err(FsError::OpUnsupported)
    }

    /// Apply settable attributes to an object.
    fn setattr(&mut self, id: NodeId, attrs: &Sattr) -> Result<(), FsError> {
        warn!("[Not Implemented] setattr(id: {id}, attrs: {attrs:?})");
        Err(FsError::OpUnsupported)
    }

    /// Resolve a name within a directory to the child's id.
    fn lookup(&mut self, dir: NodeId, name: &NfsString) -> Result<NodeId, FsError> {
        warn!("[Not Implemented] lookup(dir: {dir}, name: {name})");
        Err(FsError::OpUnsupported)
    }

    /// Target path of a symbolic link.
    fn readlink(&mut self, id: NodeId) -> Result<NfsString, FsError> {
        warn!("[Not Implemented] readlink(id: {id})");
        Err(FsError::OpUnsupported)
    }

    /// Read up to `count` bytes at `offset`. `total_count` is the client's
    /// stated transfer total, passed through unchanged.
    fn read(
        &mut self,
        id: NodeId,
        offset: u32,
        count: u32,
        total_count: u32,
    ) -> Result<Vec<u8>, FsError> {
        warn!("[Not Implemented] read(id: {id}, offset: {offset}, count: {count})");
        Err(FsError::OpUnsupported)
    }

    /// Write `data` at `offset`. `begin_offset` and `total_count` are the
    /// client's cache-consistency hints, passed through unchanged.
    fn write(
        &mut self,
        id: NodeId,
        begin_offset: u32,
        offset: u32,
        total_count: u32,
        data: &[u8],
    ) -> Result<(), FsError> {
        warn!(
            "[Not Implemented] write(id: {id}, offset: {offset}, len: {})",
            data.len()
        );
        Err(FsError::OpUnsupported)
    }

    /// Create a regular file in a directory.
    fn create(&mut self, dir: NodeId, name: &NfsString, attrs: &Sattr) -> Result<NodeId, FsError> {
        warn!("[Not Implemented] create(dir: {dir}, name: {name})");
        Err(FsError::OpUnsupported)
    }

    /// Remove a non-directory entry.
    fn remove(&mut self, dir: NodeId, name: &NfsString) -> Result<(), FsError> {
        warn!("[Not Implemented] remove(dir: {dir}, name: {name})");
        Err(FsError::OpUnsupported)
    }

    /// Rename an entry, possibly across directories of the same mount.
    fn rename(
        &mut self,
        from_dir: NodeId,
        from_name: &NfsString,
        to_dir: NodeId,
        to_name: &NfsString,
    ) -> Result<(), FsError> {
        warn!("[Not Implemented] rename({from_dir}/{from_name} -> {to_dir}/{to_name})");
        Err(FsError::OpUnsupported)
    }

    /// Create a hard link to `from` named `to_name` in `to_dir`.
    fn link(&mut self, from: NodeId, to_dir: NodeId, to_name: &NfsString) -> Result<(), FsError> {
        warn!("[Not Implemented] link(from: {from}, to: {to_dir}/{to_name})");
        Err(FsError::OpUnsupported)
    }

    /// Create a symbolic link.
    fn symlink(
        &mut self,
        dir: NodeId,
        name: &NfsString,
        target: &NfsString,
        attrs: &Sattr,
    ) -> Result<(), FsError> {
        warn!("[Not Implemented] symlink(dir: {dir}, name: {name}, target: {target})");
        Err(FsError::OpUnsupported)
    }

    /// Create a directory.
    fn mkdir(&mut self, dir: NodeId, name: &NfsString, attrs: &Sattr) -> Result<NodeId, FsError> {
        warn!("[Not Implemented] mkdir(dir: {dir}, name: {name})");
        Err(FsError::OpUnsupported)
    }

    /// Remove a directory entry.
    fn rmdir(&mut self, dir: NodeId, name: &NfsString) -> Result<(), FsError> {
        warn!("[Not Implemented] rmdir(dir: {dir}, name: {name})");
        Err(FsError::OpUnsupported)
    }

    /// Names contained in a directory. `count` is the client's reply-size
    /// budget; backends may ignore it.
    fn readdir(&mut self, id: NodeId, count: u32) -> Result<Vec<NfsString>, FsError> {
        warn!("[Not Implemented] readdir(id: {id}, count: {count})");
        Err(FsError::OpUnsupported)
    }

    /// Filesystem usage summary.
    fn statfs(&mut self, id: NodeId) -> Result<FsStats, FsError> {
        warn!("[Not Implemented] statfs(id: {id})");
        Err(FsError::OpUnsupported)
    }
}

impl fmt::Debug for dyn Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Backend")
    }
}

//! The mount table and the MOUNT program's call and reply shapes.
//!
//! Entries are added through the administrative surface and never removed;
//! unmounting only clears the mounted state, so a path keeps its backend
//! and options across mount cycles. Duplicate paths are allowed and the
//! first match wins, the same way an exports file behaves.

use std::fmt;
use std::sync::Arc;

use crate::BackendModule;
use crate::NfsString;
use crate::handle::FileHandle;
use crate::handle::FsId;

/// ONC RPC program number of the MOUNT protocol.
pub const MOUNT_PROGRAM: u32 = 100005;
/// MOUNT protocol version served by this crate.
pub const MOUNT_VERSION: u32 = 1;
/// Default UDP port, the conventional port moved into unprivileged space.
pub const MOUNT_PORT: u16 = 22050;

/// Options attached to a mount entry. The core does not interpret them;
/// they are handed to the backend's `init` verbatim.
pub type MountOpts = Vec<(String, String)>;

/// One exported path and its mount state.
pub struct MountEntry {
    /// Exported path as clients name it.
    pub path: NfsString,
    /// Module that serves this path.
    pub module: Arc<dyn BackendModule>,
    /// Options handed to `init` on every mount.
    pub opts: MountOpts,
    /// Root handle, present while mounted.
    pub root_fh: Option<FileHandle>,
    /// Filesystem id, present while mounted.
    pub fs_id: Option<FsId>,
}

impl MountEntry {
    /// Whether the entry is currently mounted.
    pub fn is_mounted(&self) -> bool {
        self.fs_id.is_some()
    }
}

impl fmt::Debug for MountEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountEntry")
            .field("path", &self.path)
            .field("module", &self.module.name())
            .field("fs_id", &self.fs_id)
            .finish()
    }
}

/// Ordered list of exported paths.
#[derive(Debug, Default)]
pub struct MountTable {
    entries: Vec<MountEntry>,
}

impl MountTable {
    /// Create an empty table.
    pub fn new() -> MountTable {
        MountTable::default()
    }

    /// Append an entry in the unmounted state.
    pub fn add(&mut self, path: NfsString, module: Arc<dyn BackendModule>, opts: MountOpts) {
        self.entries.push(MountEntry {
            path,
            module,
            opts,
            root_fh: None,
            fs_id: None,
        });
    }

    /// Index of the first entry matching `path`.
    pub fn find(&self, path: &NfsString) -> Option<usize> {
        self.entries.iter().position(|e| e.path == *path)
    }

    /// Entry by index.
    pub fn get(&self, index: usize) -> &MountEntry {
        &self.entries[index]
    }

    /// Mutable entry by index.
    pub fn get_mut(&mut self, index: usize) -> &mut MountEntry {
        &mut self.entries[index]
    }

    /// All entries, in registration order.
    pub fn entries(&self) -> &[MountEntry] {
        &self.entries
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A decoded MOUNT procedure call.
#[derive(Clone, Debug, PartialEq)]
pub enum MountCall {
    /// `MOUNTPROC_NULL`: ping.
    Null,
    /// `MOUNTPROC_MNT`: mount a path, returning its root handle.
    Mnt(NfsString),
    /// `MOUNTPROC_UMNT`: unmount a path.
    Umnt(NfsString),
    /// `MOUNTPROC_UMNTALL`: unmount everything.
    UmntAll,
    /// `MOUNTPROC_EXPORT`: list exported paths.
    Export,
}

/// Status-plus-handle reply of `MOUNTPROC_MNT`, RFC 1094 `fhstatus`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FhStatus {
    /// 0 on success, an errno-like value otherwise.
    pub status: u32,
    /// The root handle, present when `status` is 0.
    pub fh: Option<FileHandle>,
}

impl FhStatus {
    /// A successful reply carrying the root handle.
    pub fn ok(fh: FileHandle) -> FhStatus {
        FhStatus {
            status: 0,
            fh: Some(fh),
        }
    }

    /// A failed reply. The protocol reserves non-zero for errors; 1 is
    /// what this server reports for every mount failure.
    pub fn error() -> FhStatus {
        FhStatus {
            status: 1,
            fh: None,
        }
    }
}

/// One element of the `MOUNTPROC_EXPORT` listing.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExportEntry {
    /// Exported path.
    pub path: NfsString,
    /// Allowed groups. This server exports to everyone, so the list is
    /// always empty.
    pub groups: Vec<NfsString>,
}

/// Reply to a MOUNT procedure call.
#[derive(Clone, Debug, PartialEq)]
pub enum MountReply {
    /// Void reply (`NULL`, `UMNT`, `UMNTALL`).
    Void,
    /// Reply to `MNT`.
    Fh(FhStatus),
    /// Reply to `EXPORT`.
    Export(Vec<ExportEntry>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Backend;
    use crate::FsError;
    use crate::NodeId;

    struct NullModule;

    impl BackendModule for NullModule {
        fn name(&self) -> &str {
            "null"
        }

        fn init(&self, _opts: &MountOpts) -> Result<(NodeId, Box<dyn Backend>), FsError> {
            Err(FsError::OpUnsupported)
        }
    }

    #[test]
    fn first_match_wins() {
        let mut table = MountTable::new();
        let module: Arc<dyn BackendModule> = Arc::new(NullModule);
        table.add("/a".into(), module.clone(), vec![]);
        table.add("/b".into(), module.clone(), vec![]);
        table.add("/a".into(), module, vec![("flavor".into(), "two".into())]);

        assert_eq!(table.find(&"/a".into()), Some(0));
        assert_eq!(table.find(&"/b".into()), Some(1));
        assert_eq!(table.find(&"/c".into()), None);
        assert!(table.get(0).opts.is_empty());
    }

    #[test]
    fn entries_start_unmounted() {
        let mut table = MountTable::new();
        table.add("/a".into(), Arc::new(NullModule), vec![]);
        assert!(!table.get(0).is_mounted());
        assert!(table.get(0).root_fh.is_none());
    }
}

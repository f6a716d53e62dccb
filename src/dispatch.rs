//! The NFS procedure dispatcher.
//!
//! One handler per RFC 1094 procedure. Every handler follows the same
//! shape: resolve the incoming handles against the registry (unknown or
//! dead handles answer `NFSERR_STALE`), call the backend inside the crash
//! barrier, then assemble the typed reply, usually with a fresh `getattr`
//! for the attribute half. The dispatcher performs no I/O of its own.

use log::debug;

use crate::Backend;
use crate::NfsString;
use crate::NodeId;
use crate::attr::Fattr;
use crate::attr::Sattr;
use crate::handle::FileHandle;
use crate::handle::FsId;
use crate::server::Server;
use crate::server::crash_barrier;
use crate::status::FsError;
use crate::status::NfsStat;

/// ONC RPC program number of the NFS protocol.
pub const NFS_PROGRAM: u32 = 100003;
/// NFS protocol version served by this crate.
pub const NFS_VERSION: u32 = 2;
/// Default UDP port: the well-known 2049 moved into unprivileged space.
pub const NFS_PORT: u16 = 22049;

/// A decoded NFS procedure call.
///
/// Offsets, counts and sizes are 32-bit throughout; that is the protocol's
/// limit, not this implementation's.
#[derive(Clone, Debug, PartialEq)]
pub enum NfsCall {
    /// `NFSPROC_NULL`: ping.
    Null,
    /// `NFSPROC_GETATTR`: fetch attributes.
    Getattr {
        /// Object to describe.
        fh: FileHandle,
    },
    /// `NFSPROC_SETATTR`: change attributes.
    Setattr {
        /// Object to change.
        fh: FileHandle,
        /// Requested attribute values.
        attrs: Sattr,
    },
    /// `NFSPROC_ROOT`: obsolete in the protocol; answered with void.
    Root,
    /// `NFSPROC_LOOKUP`: resolve a name in a directory.
    Lookup {
        /// Directory to search.
        dir: FileHandle,
        /// Name to resolve.
        name: NfsString,
    },
    /// `NFSPROC_READLINK`: read a symbolic link's target.
    Readlink {
        /// The link.
        fh: FileHandle,
    },
    /// `NFSPROC_READ`: read file data.
    Read {
        /// File to read.
        fh: FileHandle,
        /// Starting byte.
        offset: u32,
        /// Bytes requested.
        count: u32,
        /// Client's stated transfer total, passed to the backend.
        total_count: u32,
    },
    /// `NFSPROC_WRITECACHE`: obsolete in the protocol; answered with void.
    Writecache,
    /// `NFSPROC_WRITE`: write file data.
    Write {
        /// File to write.
        fh: FileHandle,
        /// Cache-consistency hint, passed to the backend.
        begin_offset: u32,
        /// Starting byte.
        offset: u32,
        /// Cache-consistency hint, passed to the backend.
        total_count: u32,
        /// The bytes.
        data: Vec<u8>,
    },
    /// `NFSPROC_CREATE`: create a regular file.
    Create {
        /// Parent directory.
        dir: FileHandle,
        /// New name.
        name: NfsString,
        /// Requested initial attributes.
        attrs: Sattr,
    },
    /// `NFSPROC_REMOVE`: remove a non-directory entry.
    Remove {
        /// Parent directory.
        dir: FileHandle,
        /// Name to remove.
        name: NfsString,
    },
    /// `NFSPROC_RENAME`: move an entry within one filesystem.
    Rename {
        /// Source directory.
        from_dir: FileHandle,
        /// Source name.
        from_name: NfsString,
        /// Destination directory.
        to_dir: FileHandle,
        /// Destination name.
        to_name: NfsString,
    },
    /// `NFSPROC_LINK`: create a hard link.
    Link {
        /// Existing object.
        from: FileHandle,
        /// Directory for the new link.
        to_dir: FileHandle,
        /// Name of the new link.
        to_name: NfsString,
    },
    /// `NFSPROC_SYMLINK`: create a symbolic link.
    Symlink {
        /// Parent directory.
        dir: FileHandle,
        /// New name.
        name: NfsString,
        /// Link target path.
        target: NfsString,
        /// Requested initial attributes.
        attrs: Sattr,
    },
    /// `NFSPROC_MKDIR`: create a directory.
    Mkdir {
        /// Parent directory.
        dir: FileHandle,
        /// New name.
        name: NfsString,
        /// Requested initial attributes.
        attrs: Sattr,
    },
    /// `NFSPROC_RMDIR`: remove a directory.
    Rmdir {
        /// Parent directory.
        dir: FileHandle,
        /// Name to remove.
        name: NfsString,
    },
    /// `NFSPROC_READDIR`: list a directory.
    Readdir {
        /// Directory to list.
        fh: FileHandle,
        /// Resume cookie; this server returns full listings, so it is
        /// accepted and ignored.
        cookie: u32,
        /// Client's reply-size budget, passed to the backend.
        count: u32,
    },
    /// `NFSPROC_STATFS`: filesystem usage summary.
    Statfs {
        /// Any object on the filesystem of interest.
        fh: FileHandle,
    },
}

/// One `READDIR` reply entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DirEntry {
    /// File number of the entry, from its minted handle.
    pub fileid: u32,
    /// Entry name.
    pub name: NfsString,
    /// Cookie naming the position after this entry; 1-based.
    pub cookie: u32,
}

/// Successful `READDIR` reply payload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReadDirOk {
    /// Entries in backend order.
    pub entries: Vec<DirEntry>,
    /// Whether the listing is complete. Always true here; the full list
    /// goes out in one reply.
    pub eof: bool,
}

/// Successful `STATFS` reply payload, RFC 1094 `info`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FsStats {
    /// Optimum transfer size.
    pub tsize: u32,
    /// Block size of the filesystem.
    pub bsize: u32,
    /// Total number of blocks.
    pub blocks: u32,
    /// Free blocks.
    pub bfree: u32,
    /// Free blocks available to non-privileged users.
    pub bavail: u32,
}

/// A typed NFS reply, one shape per procedure family.
///
/// Attribute-bearing replies carry `Result`: the discriminated union of the
/// wire format, with the error arm holding the status.
#[derive(Clone, Debug, PartialEq)]
pub enum NfsReply {
    /// Void reply (`NULL`, `ROOT`, `WRITECACHE`).
    Void,
    /// `attrstat` reply (`GETATTR`, `SETATTR`, `WRITE`).
    Attr(Result<Fattr, NfsStat>),
    /// `diropres` reply (`LOOKUP`, `CREATE`, `MKDIR`).
    DirOp(Result<(FileHandle, Fattr), NfsStat>),
    /// `READLINK` reply.
    Readlink(Result<NfsString, NfsStat>),
    /// `READ` reply: attributes plus data.
    Read(Result<(Fattr, Vec<u8>), NfsStat>),
    /// Bare-status reply (`REMOVE`, `RENAME`, `LINK`, `SYMLINK`, `RMDIR`).
    Status(NfsStat),
    /// `READDIR` reply.
    Readdir(Result<ReadDirOk, NfsStat>),
    /// `STATFS` reply.
    Statfs(Result<FsStats, NfsStat>),
}

fn status_of(result: Result<(), NfsStat>) -> NfsStat {
    match result {
        Ok(()) => NfsStat::NFS_OK,
        Err(status) => status,
    }
}

impl Server {
    /// Handle an NFS program call.
    pub fn handle_nfs(&mut self, call: NfsCall) -> NfsReply {
        match call {
            NfsCall::Null | NfsCall::Root | NfsCall::Writecache => NfsReply::Void,
            NfsCall::Getattr { fh } => NfsReply::Attr(self.getattr(&fh)),
            NfsCall::Setattr { fh, attrs } => NfsReply::Attr(self.setattr(&fh, &attrs)),
            NfsCall::Lookup { dir, name } => NfsReply::DirOp(self.lookup(&dir, &name)),
            NfsCall::Readlink { fh } => NfsReply::Readlink(self.readlink(&fh)),
            NfsCall::Read {
                fh,
                offset,
                count,
                total_count,
            } => NfsReply::Read(self.read(&fh, offset, count, total_count)),
            NfsCall::Write {
                fh,
                begin_offset,
                offset,
                total_count,
                data,
            } => NfsReply::Attr(self.write(&fh, begin_offset, offset, total_count, &data)),
            NfsCall::Create { dir, name, attrs } => {
                NfsReply::DirOp(self.create(&dir, &name, &attrs))
            }
            NfsCall::Remove { dir, name } => {
                NfsReply::Status(status_of(self.remove(&dir, &name)))
            }
            NfsCall::Rename {
                from_dir,
                from_name,
                to_dir,
                to_name,
            } => NfsReply::Status(status_of(
                self.rename(&from_dir, &from_name, &to_dir, &to_name),
            )),
            NfsCall::Link { from, to_dir, to_name } => {
                NfsReply::Status(status_of(self.link(&from, &to_dir, &to_name)))
            }
            NfsCall::Symlink {
                dir,
                name,
                target,
                attrs,
            } => NfsReply::Status(status_of(self.symlink(&dir, &name, &target, &attrs))),
            NfsCall::Mkdir { dir, name, attrs } => {
                NfsReply::DirOp(self.mkdir(&dir, &name, &attrs))
            }
            NfsCall::Rmdir { dir, name } => NfsReply::Status(status_of(self.rmdir(&dir, &name))),
            NfsCall::Readdir {
                fh,
                cookie: _,
                count,
            } => NfsReply::Readdir(self.readdir(&fh, count)),
            NfsCall::Statfs { fh } => NfsReply::Statfs(self.statfs(&fh)),
        }
    }

    /// Call into the backend serving `fs_id` behind the crash barrier,
    /// translating failures to a wire status.
    fn backend_call<T>(
        &mut self,
        fs_id: FsId,
        op: &'static str,
        f: impl FnOnce(&mut dyn Backend) -> Result<T, FsError>,
    ) -> Result<T, NfsStat> {
        let Some(instance) = self.backends.instance_mut(fs_id) else {
            return Err(NfsStat::NFSERR_STALE);
        };
        crash_barrier(op, || f(instance.as_mut())).map_err(|err| {
            debug!("{op} on fs {fs_id} failed: {err}");
            NfsStat::from(err)
        })
    }

    /// Fetch and assemble the attributes behind a handle.
    fn fetch_attr(&mut self, fs_id: FsId, id: NodeId, fh: &FileHandle) -> Result<Fattr, NfsStat> {
        let attrs = self.backend_call(fs_id, "getattr", |b| b.getattr(id))?;
        let (file_id, FsId(fs_raw)) = fh.parse();
        Ok(Fattr::assemble(fs_raw, file_id, &attrs))
    }

    fn getattr(&mut self, fh: &FileHandle) -> Result<Fattr, NfsStat> {
        let (id, fs_id) = self.resolve(fh)?;
        self.fetch_attr(fs_id, id, fh)
    }

    fn setattr(&mut self, fh: &FileHandle, attrs: &Sattr) -> Result<Fattr, NfsStat> {
        let (id, fs_id) = self.resolve(fh)?;
        self.backend_call(fs_id, "setattr", |b| b.setattr(id, attrs))?;
        self.fetch_attr(fs_id, id, fh)
    }

    fn lookup(
        &mut self,
        dir: &FileHandle,
        name: &NfsString,
    ) -> Result<(FileHandle, Fattr), NfsStat> {
        let (dir_id, fs_id) = self.resolve(dir)?;
        let child = self.backend_call(fs_id, "lookup", |b| b.lookup(dir_id, name))?;
        let child_fh = self.handles.write().handle_for(child, fs_id);
        let fattr = self.fetch_attr(fs_id, child, &child_fh)?;
        Ok((child_fh, fattr))
    }

    fn readlink(&mut self, fh: &FileHandle) -> Result<NfsString, NfsStat> {
        let (id, fs_id) = self.resolve(fh)?;
        self.backend_call(fs_id, "readlink", |b| b.readlink(id))
    }

    fn read(
        &mut self,
        fh: &FileHandle,
        offset: u32,
        count: u32,
        total_count: u32,
    ) -> Result<(Fattr, Vec<u8>), NfsStat> {
        let (id, fs_id) = self.resolve(fh)?;
        let data = self.backend_call(fs_id, "read", |b| b.read(id, offset, count, total_count))?;
        let fattr = self.fetch_attr(fs_id, id, fh)?;
        Ok((fattr, data))
    }

    fn write(
        &mut self,
        fh: &FileHandle,
        begin_offset: u32,
        offset: u32,
        total_count: u32,
        data: &[u8],
    ) -> Result<Fattr, NfsStat> {
        let (id, fs_id) = self.resolve(fh)?;
        self.backend_call(fs_id, "write", |b| {
            b.write(id, begin_offset, offset, total_count, data)
        })?;
        self.fetch_attr(fs_id, id, fh)
    }

    /// Shared tail of `CREATE` and `MKDIR`: mint the child's handle, then
    /// describe it. A failing `getattr` fails the reply even though the
    /// object now exists; the client will retry and find it.
    fn describe_new_child(
        &mut self,
        fs_id: FsId,
        child: NodeId,
    ) -> Result<(FileHandle, Fattr), NfsStat> {
        let child_fh = self.handles.write().handle_for(child, fs_id);
        let fattr = self.fetch_attr(fs_id, child, &child_fh)?;
        Ok((child_fh, fattr))
    }

    fn create(
        &mut self,
        dir: &FileHandle,
        name: &NfsString,
        attrs: &Sattr,
    ) -> Result<(FileHandle, Fattr), NfsStat> {
        let (dir_id, fs_id) = self.resolve(dir)?;
        let child = self.backend_call(fs_id, "create", |b| b.create(dir_id, name, attrs))?;
        self.describe_new_child(fs_id, child)
    }

    fn mkdir(
        &mut self,
        dir: &FileHandle,
        name: &NfsString,
        attrs: &Sattr,
    ) -> Result<(FileHandle, Fattr), NfsStat> {
        let (dir_id, fs_id) = self.resolve(dir)?;
        let child = self.backend_call(fs_id, "mkdir", |b| b.mkdir(dir_id, name, attrs))?;
        self.describe_new_child(fs_id, child)
    }

    fn remove(&mut self, dir: &FileHandle, name: &NfsString) -> Result<(), NfsStat> {
        let (dir_id, fs_id) = self.resolve(dir)?;
        self.backend_call(fs_id, "remove", |b| b.remove(dir_id, name))
    }

    fn rmdir(&mut self, dir: &FileHandle, name: &NfsString) -> Result<(), NfsStat> {
        let (dir_id, fs_id) = self.resolve(dir)?;
        self.backend_call(fs_id, "rmdir", |b| b.rmdir(dir_id, name))
    }

    fn rename(
        &mut self,
        from_dir: &FileHandle,
        from_name: &NfsString,
        to_dir: &FileHandle,
        to_name: &NfsString,
    ) -> Result<(), NfsStat> {
        let (from_id, from_fs) = self.resolve(from_dir)?;
        let (to_id, to_fs) = self.resolve(to_dir)?;
        if from_fs != to_fs {
            // Cross-filesystem rename is refused before either backend
            // hears about it.
            return Err(NfsStat::NFSERR_NODEV);
        }
        self.backend_call(from_fs, "rename", |b| {
            b.rename(from_id, from_name, to_id, to_name)
        })
    }

    fn link(
        &mut self,
        from: &FileHandle,
        to_dir: &FileHandle,
        to_name: &NfsString,
    ) -> Result<(), NfsStat> {
        let (from_id, from_fs) = self.resolve(from)?;
        let (to_id, to_fs) = self.resolve(to_dir)?;
        if from_fs != to_fs {
            return Err(NfsStat::NFSERR_NODEV);
        }
        self.backend_call(from_fs, "link", |b| b.link(from_id, to_id, to_name))
    }

    fn symlink(
        &mut self,
        dir: &FileHandle,
        name: &NfsString,
        target: &NfsString,
        attrs: &Sattr,
    ) -> Result<(), NfsStat> {
        let (dir_id, fs_id) = self.resolve(dir)?;
        self.backend_call(fs_id, "symlink", |b| b.symlink(dir_id, name, target, attrs))
    }

    fn readdir(&mut self, fh: &FileHandle, count: u32) -> Result<ReadDirOk, NfsStat> {
        let (dir_id, fs_id) = self.resolve(fh)?;
        let names = self.backend_call(fs_id, "readdir", |b| b.readdir(dir_id, count))?;

        let mut entries = Vec::with_capacity(names.len());
        for (position, name) in names.into_iter().enumerate() {
            // Cookies are 1-based positions in the backend's listing; a
            // skipped name leaves a hole rather than renumbering the rest.
            let cookie = (position + 1) as u32;
            match self.backend_call(fs_id, "lookup", |b| b.lookup(dir_id, &name)) {
                Ok(child) => {
                    let child_fh = self.handles.write().handle_for(child, fs_id);
                    let (fileid, _) = child_fh.parse();
                    entries.push(DirEntry {
                        fileid,
                        name,
                        cookie,
                    });
                }
                Err(status) => {
                    // The entry vanished between readdir and lookup; drop
                    // it from the listing instead of failing the reply.
                    debug!("readdir: skipping {name}: {status:?}");
                }
            }
        }
        Ok(ReadDirOk { entries, eof: true })
    }

    fn statfs(&mut self, fh: &FileHandle) -> Result<FsStats, NfsStat> {
        let (id, fs_id) = self.resolve(fh)?;
        self.backend_call(fs_id, "statfs", |b| b.statfs(id))
    }
}

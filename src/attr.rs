//! File attribute records and their assembly.
//!
//! Backends describe an object as an ordered list of [`AttrValue`] options.
//! The dispatcher folds that list onto a base [`Fattr`] record before the
//! reply goes out; `fsid` and `fileid` default to the values packed in the
//! file handle, so most backends never set them.

#![allow(clippy::unnecessary_cast)] // libc::S_* are u16 or u32 depending on the platform

use bitflags::bitflags;
use num_enum::IntoPrimitive;
use num_enum::TryFromPrimitive;

/// File types, transcribed from RFC 1094 section 2.3.2 plus the BSD
/// extensions NFSv2 servers conventionally answer with.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum FileType {
    /// Non-file or unknown type.
    NFNON = 0,
    /// Regular file.
    NFREG = 1,
    /// Directory.
    NFDIR = 2,
    /// Block-special device.
    NFBLK = 3,
    /// Character-special device.
    NFCHR = 4,
    /// Symbolic link.
    NFLNK = 5,
    /// Unix domain socket.
    NFSOCK = 6,
    /// Unused placeholder from the BSD headers.
    NFBAD = 7,
    /// Named pipe.
    NFFIFO = 8,
}

impl FileType {
    /// The `S_IF*` bits this type contributes to a mode word.
    pub fn mode_bits(self) -> u32 {
        match self {
            FileType::NFNON | FileType::NFBAD => 0,
            FileType::NFREG => libc::S_IFREG as u32,
            FileType::NFDIR => libc::S_IFDIR as u32,
            FileType::NFBLK => libc::S_IFBLK as u32,
            FileType::NFCHR => libc::S_IFCHR as u32,
            FileType::NFLNK => libc::S_IFLNK as u32,
            FileType::NFSOCK => libc::S_IFSOCK as u32,
            FileType::NFFIFO => libc::S_IFIFO as u32,
        }
    }
}

/// A protocol timestamp: seconds and microseconds since the epoch.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TimeVal {
    /// Whole seconds.
    pub seconds: u32,
    /// Microseconds within the second.
    pub useconds: u32,
}

impl TimeVal {
    /// Construct from seconds and microseconds.
    pub fn new(seconds: u32, useconds: u32) -> Self {
        TimeVal { seconds, useconds }
    }
}

bitflags! {
    /// A `[r,w,x]` permission-letter set for one of the user/group/other
    /// classes of a symbolic mode.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct Perms: u32 {
        /// Readable.
        const READ = 0b100;
        /// Writable.
        const WRITE = 0b010;
        /// Executable / searchable.
        const EXEC = 0b001;
    }
}

/// Named mode roles a backend may use instead of raw bits.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ModeRole {
    /// Regular file (`S_IFREG`).
    Regular,
    /// Directory (`S_IFDIR`).
    Directory,
    /// Character-special device (`S_IFCHR`).
    Device,
    /// Block-special device (`S_IFBLK`).
    Block,
    /// Symbolic link (`S_IFLNK`).
    Symlink,
    /// Unix domain socket (`S_IFSOCK`).
    Socket,
    /// Set-user-id bit.
    SetUid,
    /// Set-group-id bit.
    SetGid,
}

impl ModeRole {
    fn bits(self) -> u32 {
        match self {
            ModeRole::Regular => libc::S_IFREG as u32,
            ModeRole::Directory => libc::S_IFDIR as u32,
            ModeRole::Device => libc::S_IFCHR as u32,
            ModeRole::Block => libc::S_IFBLK as u32,
            ModeRole::Symlink => libc::S_IFLNK as u32,
            ModeRole::Socket => libc::S_IFSOCK as u32,
            ModeRole::SetUid => libc::S_ISUID as u32,
            ModeRole::SetGid => libc::S_ISGID as u32,
        }
    }
}

/// A mode value as a backend may express it: raw bits, a symbolic
/// user/group/other triple, or a named role.
///
/// Whatever the spelling, the resulting bits are OR'd into the mode word
/// already accumulated on the record.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ModeSpec {
    /// Raw mode bits.
    Bits(u32),
    /// Symbolic permission triple.
    Symbolic {
        /// Owner class.
        user: Perms,
        /// Group class.
        group: Perms,
        /// Other class.
        other: Perms,
    },
    /// Named role.
    Role(ModeRole),
}

impl ModeSpec {
    fn bits(self) -> u32 {
        match self {
            ModeSpec::Bits(bits) => bits,
            ModeSpec::Symbolic { user, group, other } => {
                (user.bits() << 6) | (group.bits() << 3) | other.bits()
            }
            ModeSpec::Role(role) => role.bits(),
        }
    }
}

/// One attribute option in a backend's `getattr` reply.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AttrValue {
    /// File type; also contributes its `S_IF*` bits to the mode word.
    Type(FileType),
    /// Mode bits, OR'd into the mode word.
    Mode(ModeSpec),
    /// Hard link count.
    Nlink(u32),
    /// Owner uid.
    Uid(u32),
    /// Owner gid.
    Gid(u32),
    /// Size in bytes (NFSv2 caps sizes at 32 bits).
    Size(u32),
    /// Preferred I/O block size.
    Blocksize(u32),
    /// Device number, for special files.
    Rdev(u32),
    /// Allocation in blocks.
    Blocks(u32),
    /// Filesystem id override.
    Fsid(u32),
    /// File id override.
    Fileid(u32),
    /// Last access time.
    Atime(TimeVal),
    /// Last modification time.
    Mtime(TimeVal),
    /// Last status change time.
    Ctime(TimeVal),
}

/// File attributes as returned to clients, RFC 1094 `fattr`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Fattr {
    /// File type.
    pub ftype: FileType,
    /// Protection mode bits, type bits included.
    pub mode: u32,
    /// Number of hard links.
    pub nlink: u32,
    /// Owner uid.
    pub uid: u32,
    /// Owner gid.
    pub gid: u32,
    /// Size in bytes.
    pub size: u32,
    /// Preferred I/O block size.
    pub blocksize: u32,
    /// Device number of the file, for special files.
    pub rdev: u32,
    /// Number of blocks the file takes on disk.
    pub blocks: u32,
    /// Filesystem identifier.
    pub fsid: u32,
    /// File number within its filesystem.
    pub fileid: u32,
    /// Time of last access.
    pub atime: TimeVal,
    /// Time of last modification.
    pub mtime: TimeVal,
    /// Time of last status change.
    pub ctime: TimeVal,
}

impl Fattr {
    /// The base record attribute options are folded onto.
    fn base(fsid: u32, fileid: u32) -> Fattr {
        Fattr {
            ftype: FileType::NFNON,
            mode: 0,
            nlink: 0,
            uid: 0,
            gid: 0,
            size: 0,
            blocksize: 1024,
            rdev: 0,
            blocks: 1,
            fsid,
            fileid,
            atime: TimeVal::default(),
            mtime: TimeVal::default(),
            ctime: TimeVal::default(),
        }
    }

    /// Fold an ordered attribute-option list onto the base record.
    ///
    /// `fsid` and `fileid` come from the file handle the request named and
    /// stand unless the backend overrides them.
    pub fn assemble(fsid: u32, fileid: u32, attrs: &[AttrValue]) -> Fattr {
        let mut fattr = Fattr::base(fsid, fileid);
        for attr in attrs {
            match *attr {
                AttrValue::Type(ftype) => {
                    fattr.ftype = ftype;
                    fattr.mode |= ftype.mode_bits();
                }
                AttrValue::Mode(spec) => fattr.mode |= spec.bits(),
                AttrValue::Nlink(n) => fattr.nlink = n,
                AttrValue::Uid(uid) => fattr.uid = uid,
                AttrValue::Gid(gid) => fattr.gid = gid,
                AttrValue::Size(size) => fattr.size = size,
                AttrValue::Blocksize(bs) => fattr.blocksize = bs,
                AttrValue::Rdev(rdev) => fattr.rdev = rdev,
                AttrValue::Blocks(blocks) => fattr.blocks = blocks,
                AttrValue::Fsid(fsid) => fattr.fsid = fsid,
                AttrValue::Fileid(fileid) => fattr.fileid = fileid,
                AttrValue::Atime(t) => fattr.atime = t,
                AttrValue::Mtime(t) => fattr.mtime = t,
                AttrValue::Ctime(t) => fattr.ctime = t,
            }
        }
        fattr
    }
}

/// Settable attributes, RFC 1094 `sattr`.
///
/// The transport decodes the protocol's `-1` don't-change sentinel into
/// `None` before the call reaches the core.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Sattr {
    /// Mode bits to set.
    pub mode: Option<u32>,
    /// Owner uid to set.
    pub uid: Option<u32>,
    /// Owner gid to set.
    pub gid: Option<u32>,
    /// Size to truncate or extend to.
    pub size: Option<u32>,
    /// Access time to set.
    pub atime: Option<TimeVal>,
    /// Modification time to set.
    pub mtime: Option<TimeVal>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_type_ors_mode_bits() {
        let attrs = [
            AttrValue::Type(FileType::NFDIR),
            AttrValue::Mode(ModeSpec::Bits(0o755)),
        ];
        let fattr = Fattr::assemble(1, 1, &attrs);
        assert_eq!(fattr.ftype, FileType::NFDIR);
        assert_eq!(fattr.mode, 0o040755);
    }

    #[test]
    fn defaults_come_from_the_handle() {
        let fattr = Fattr::assemble(3, 17, &[]);
        assert_eq!(fattr.fsid, 3);
        assert_eq!(fattr.fileid, 17);
        assert_eq!(fattr.blocksize, 1024);
        assert_eq!(fattr.blocks, 1);
        assert_eq!(fattr.ftype, FileType::NFNON);
    }

    #[test]
    fn backend_overrides_handle_ids() {
        let attrs = [AttrValue::Fsid(9), AttrValue::Fileid(100)];
        let fattr = Fattr::assemble(1, 1, &attrs);
        assert_eq!(fattr.fsid, 9);
        assert_eq!(fattr.fileid, 100);
    }

    #[test]
    fn symbolic_mode_triple() {
        let spec = ModeSpec::Symbolic {
            user: Perms::READ | Perms::WRITE | Perms::EXEC,
            group: Perms::READ | Perms::EXEC,
            other: Perms::READ,
        };
        let fattr = Fattr::assemble(1, 1, &[AttrValue::Mode(spec)]);
        assert_eq!(fattr.mode, 0o754);
    }

    #[test]
    fn roles_accumulate() {
        let attrs = [
            AttrValue::Mode(ModeSpec::Role(ModeRole::Regular)),
            AttrValue::Mode(ModeSpec::Role(ModeRole::SetUid)),
            AttrValue::Mode(ModeSpec::Bits(0o644)),
        ];
        let fattr = Fattr::assemble(1, 1, &attrs);
        assert_eq!(fattr.mode, 0o104644);
        // Mode alone never changes the recorded type.
        assert_eq!(fattr.ftype, FileType::NFNON);
    }

    #[test]
    fn later_options_win() {
        let attrs = [AttrValue::Size(10), AttrValue::Size(20)];
        assert_eq!(Fattr::assemble(1, 1, &attrs).size, 20);
    }

    #[test]
    fn wire_type_values() {
        assert_eq!(u32::from(FileType::NFLNK), 5);
        assert_eq!(FileType::try_from(8u32).unwrap(), FileType::NFFIFO);
        assert!(FileType::try_from(9u32).is_err());
    }
}

//! NFS status codes and backend failure reasons.
//!
//! Backends report failures as [`FsError`], a POSIX-like reason code. The
//! dispatcher translates every reason to the `stat` value RFC 1094 allows on
//! the wire before a reply leaves the core.

use std::error;
use std::fmt;

use num_enum::IntoPrimitive;
use num_enum::TryFromPrimitive;

/// Protocol status values, transcribed from RFC 1094 section 2.3.1.
///
/// The discriminants are the on-the-wire values.
#[allow(non_camel_case_types)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum NfsStat {
    /// The call completed successfully and the results are valid.
    NFS_OK = 0,
    /// Not owner. The caller does not have correct ownership to perform
    /// the requested operation.
    NFSERR_PERM = 1,
    /// No such file or directory.
    NFSERR_NOENT = 2,
    /// Some sort of hard error occurred when the operation was in progress.
    /// This could be a disk error, for example.
    NFSERR_IO = 5,
    /// No such device or address.
    NFSERR_NXIO = 6,
    /// Permission denied. The caller does not have the correct permission
    /// to perform the requested operation.
    NFSERR_ACCES = 13,
    /// File exists. The file specified already exists.
    NFSERR_EXIST = 17,
    /// No such device.
    NFSERR_NODEV = 19,
    /// Not a directory. The caller specified a non-directory in a
    /// directory operation.
    NFSERR_NOTDIR = 20,
    /// Is a directory. The caller specified a directory in a non-directory
    /// operation.
    NFSERR_ISDIR = 21,
    /// File too large. The operation caused a file to grow beyond the
    /// server's limit.
    NFSERR_FBIG = 27,
    /// No space left on device.
    NFSERR_NOSPC = 28,
    /// Read-only filesystem. Write attempted on a read-only filesystem.
    NFSERR_ROFS = 30,
    /// File name too long.
    NFSERR_NAMETOOLONG = 63,
    /// Attempted to remove a directory that was not empty.
    NFSERR_NOTEMPTY = 66,
    /// Disk quota exceeded.
    NFSERR_DQUOT = 69,
    /// The file handle given in the arguments was invalid. That file
    /// referred to by that file handle no longer exists, or access to it
    /// has been revoked.
    NFSERR_STALE = 70,
    /// The server's write cache used in the `WRITECACHE` call got flushed
    /// to disk.
    NFSERR_WFLUSH = 99,
}

impl NfsStat {
    /// Whether this status reports success.
    pub fn is_ok(self) -> bool {
        self == NfsStat::NFS_OK
    }
}

/// Failure reason reported by a backend callback.
///
/// The set is wider than POSIX errno because backends may bridge to storage
/// services with their own failure vocabulary (`no_connection`,
/// `write_protect`, ...). Reasons without a dedicated NFS status collapse
/// into `NFSERR_IO`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FsError {
    /// Operation not permitted for the caller.
    Perm,
    /// No such file or directory.
    NoEnt,
    /// A path component names a missing file.
    NoSuchFile,
    /// A path prefix does not exist.
    NoSuchPath,
    /// Hard I/O error.
    Io,
    /// Unspecified backend failure.
    Failure,
    /// The backend received a malformed message from its storage service.
    BadMessage,
    /// The backend could not reach its storage service.
    NoConnection,
    /// The backend lost its connection mid-operation.
    ConnectionLost,
    /// The storage service rejected the backend's principal.
    UnknownPrinciple,
    /// A storage-side lock conflicted with the operation.
    LockConflict,
    /// Unexpected end of file.
    Eof,
    /// The backend timed out waiting for its storage service.
    Timeout,
    /// No such device or address.
    Nxio,
    /// The backend does not implement this operation.
    OpUnsupported,
    /// No medium present in the drive.
    NoMedia,
    /// Permission denied.
    Acces,
    /// Permission denied, backend-service spelling.
    PermissionDenied,
    /// The target is write-protected.
    WriteProtect,
    /// The target cannot be deleted.
    CannotDelete,
    /// The file already exists.
    Exist,
    /// The file already exists, backend-service spelling.
    FileAlreadyExists,
    /// No such device.
    NoDev,
    /// Not a directory.
    NotDir,
    /// Not a directory, backend-service spelling.
    NotADirectory,
    /// Is a directory.
    IsDir,
    /// Is a directory, backend-service spelling.
    FileIsADirectory,
    /// File too large.
    Fbig,
    /// No space left on the filesystem.
    NoSpc,
    /// No space left, backend-service spelling.
    NoSpaceOnFilesystem,
    /// Read-only filesystem.
    Rofs,
    /// File name too long.
    NameTooLong,
    /// Directory not empty.
    NotEmpty,
    /// Quota exceeded.
    Dquot,
    /// Quota exceeded, backend-service spelling.
    QuotaExceeded,
    /// The id is not known to the backend (revoked or never existed).
    Stale,
    /// The id failed the backend's consistency checks.
    InvalidHandle,
    /// The server's write cache was flushed.
    Wflush,
}

impl FsError {
    /// The wire status this reason translates to.
    pub fn status(self) -> NfsStat {
        use FsError::*;
        match self {
            Perm => NfsStat::NFSERR_PERM,
            NoEnt | NoSuchFile | NoSuchPath => NfsStat::NFSERR_NOENT,
            Io | Failure | BadMessage | NoConnection | ConnectionLost | UnknownPrinciple
            | LockConflict | Eof | Timeout => NfsStat::NFSERR_IO,
            Nxio | OpUnsupported | NoMedia => NfsStat::NFSERR_NXIO,
            Acces | PermissionDenied | WriteProtect | CannotDelete => NfsStat::NFSERR_ACCES,
            Exist | FileAlreadyExists => NfsStat::NFSERR_EXIST,
            NoDev => NfsStat::NFSERR_NODEV,
            NotDir | NotADirectory => NfsStat::NFSERR_NOTDIR,
            IsDir | FileIsADirectory => NfsStat::NFSERR_ISDIR,
            Fbig => NfsStat::NFSERR_FBIG,
            NoSpc | NoSpaceOnFilesystem => NfsStat::NFSERR_NOSPC,
            Rofs => NfsStat::NFSERR_ROFS,
            NameTooLong => NfsStat::NFSERR_NAMETOOLONG,
            NotEmpty => NfsStat::NFSERR_NOTEMPTY,
            Dquot | QuotaExceeded => NfsStat::NFSERR_DQUOT,
            Stale | InvalidHandle => NfsStat::NFSERR_STALE,
            Wflush => NfsStat::NFSERR_WFLUSH,
        }
    }
}

impl From<FsError> for NfsStat {
    fn from(err: FsError) -> NfsStat {
        err.status()
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            FsError::Perm => "operation not permitted",
            FsError::NoEnt => "no such file or directory",
            FsError::NoSuchFile => "no such file",
            FsError::NoSuchPath => "no such path",
            FsError::Io => "input/output error",
            FsError::Failure => "backend failure",
            FsError::BadMessage => "bad message from storage service",
            FsError::NoConnection => "no connection to storage service",
            FsError::ConnectionLost => "connection to storage service lost",
            FsError::UnknownPrinciple => "principal unknown to storage service",
            FsError::LockConflict => "storage-side lock conflict",
            FsError::Eof => "unexpected end of file",
            FsError::Timeout => "storage service timed out",
            FsError::Nxio => "no such device or address",
            FsError::OpUnsupported => "operation not supported by backend",
            FsError::NoMedia => "no medium found",
            FsError::Acces => "permission denied",
            FsError::PermissionDenied => "permission denied",
            FsError::WriteProtect => "target is write-protected",
            FsError::CannotDelete => "target cannot be deleted",
            FsError::Exist => "file exists",
            FsError::FileAlreadyExists => "file already exists",
            FsError::NoDev => "no such device",
            FsError::NotDir => "not a directory",
            FsError::NotADirectory => "not a directory",
            FsError::IsDir => "is a directory",
            FsError::FileIsADirectory => "is a directory",
            FsError::Fbig => "file too large",
            FsError::NoSpc => "no space left on device",
            FsError::NoSpaceOnFilesystem => "no space left on filesystem",
            FsError::Rofs => "read-only filesystem",
            FsError::NameTooLong => "file name too long",
            FsError::NotEmpty => "directory not empty",
            FsError::Dquot => "disk quota exceeded",
            FsError::QuotaExceeded => "quota exceeded",
            FsError::Stale => "stale identifier",
            FsError::InvalidHandle => "invalid identifier",
            FsError::Wflush => "write cache flushed",
        };
        f.write_str(msg)
    }
}

impl error::Error for FsError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_values_round_trip() {
        assert_eq!(u32::from(NfsStat::NFS_OK), 0);
        assert_eq!(u32::from(NfsStat::NFSERR_STALE), 70);
        assert_eq!(NfsStat::try_from(70u32).unwrap(), NfsStat::NFSERR_STALE);
        assert_eq!(NfsStat::try_from(99u32).unwrap(), NfsStat::NFSERR_WFLUSH);
        assert!(NfsStat::try_from(3u32).is_err());
    }

    #[test]
    fn aliases_share_a_status() {
        assert_eq!(FsError::NoEnt.status(), NfsStat::NFSERR_NOENT);
        assert_eq!(FsError::NoSuchFile.status(), NfsStat::NFSERR_NOENT);
        assert_eq!(FsError::NoSuchPath.status(), NfsStat::NFSERR_NOENT);
        assert_eq!(FsError::WriteProtect.status(), NfsStat::NFSERR_ACCES);
        assert_eq!(FsError::QuotaExceeded.status(), NfsStat::NFSERR_DQUOT);
        assert_eq!(FsError::InvalidHandle.status(), NfsStat::NFSERR_STALE);
    }

    #[test]
    fn io_class_collapses() {
        for err in [
            FsError::Io,
            FsError::Failure,
            FsError::BadMessage,
            FsError::NoConnection,
            FsError::ConnectionLost,
            FsError::UnknownPrinciple,
            FsError::LockConflict,
            FsError::Eof,
            FsError::Timeout,
        ] {
            assert_eq!(err.status(), NfsStat::NFSERR_IO, "{err}");
        }
    }

    #[test]
    fn unsupported_maps_to_nxio() {
        assert_eq!(FsError::OpUnsupported.status(), NfsStat::NFSERR_NXIO);
        assert_eq!(FsError::NoMedia.status(), NfsStat::NFSERR_NXIO);
    }
}

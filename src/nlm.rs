//! The KLM dispatcher: kernel lock manager calls over the lock table.
//!
//! This is a thin layer. The file handle in a lock request is an opaque
//! key into the lock table; it is deliberately not resolved through the
//! handle registry, so lock traffic keeps its own failure vocabulary even
//! on handles the NFS side would call stale.

use crate::NfsString;
use crate::lock::Holder;
use crate::lock::KlmStat;
use crate::lock::LockOwner;
use crate::handle::FileHandle;
use crate::server::Server;

/// ONC RPC program number of the kernel lock manager.
pub const KLM_PROGRAM: u32 = 100020;
/// KLM protocol version served by this crate.
pub const KLM_VERSION: u32 = 1;
/// Default UDP port in unprivileged space.
pub const KLM_PORT: u16 = 22045;

/// The `(server_name, fh, owner, offset, length)` tuple every KLM call
/// carries, RFC-style `klm_lock`.
#[derive(Clone, Debug, PartialEq)]
pub struct KlmLock {
    /// Name of the host said to hold the lock. Decoded for wire
    /// compatibility and ignored.
    pub server_name: NfsString,
    /// File the lock applies to, used as an opaque key.
    pub fh: FileHandle,
    /// Requesting process.
    pub owner: LockOwner,
    /// First byte of the range.
    pub offset: u32,
    /// Length of the range in bytes.
    pub length: u32,
}

/// A decoded KLM procedure call.
#[derive(Clone, Debug, PartialEq)]
pub enum KlmCall {
    /// `KLM_TEST`: would this lock be granted?
    Test {
        /// Test for an exclusive lock.
        exclusive: bool,
        /// The lock in question.
        alock: KlmLock,
    },
    /// `KLM_LOCK`: acquire a lock.
    Lock {
        /// Client is willing to wait. Accepted but never honored;
        /// denials are immediate.
        block: bool,
        /// Request an exclusive lock.
        exclusive: bool,
        /// The lock to acquire.
        alock: KlmLock,
    },
    /// `KLM_CANCEL`: cancel a blocked request. Nothing ever blocks here,
    /// so this acknowledges without effect.
    Cancel {
        /// Mirror of the original request's flag.
        block: bool,
        /// Mirror of the original request's flag.
        exclusive: bool,
        /// The lock whose request to cancel.
        alock: KlmLock,
    },
    /// `KLM_UNLOCK`: release a lock.
    Unlock {
        /// The lock to release.
        alock: KlmLock,
    },
}

/// Reply to a KLM procedure call.
#[derive(Clone, Debug, PartialEq)]
pub enum KlmReply {
    /// `KLM_TEST` reply: `None` when the lock would be granted, otherwise
    /// the conflicting holder.
    Test(Option<Holder>),
    /// Status reply for `LOCK`, `CANCEL` and `UNLOCK`.
    Stat(KlmStat),
}

impl Server {
    /// Handle a KLM program call.
    pub fn handle_klm(&mut self, call: KlmCall) -> KlmReply {
        match call {
            KlmCall::Test { exclusive, alock } => KlmReply::Test(self.locks.test(
                exclusive,
                &alock.fh,
                alock.owner,
                alock.offset,
                alock.length,
            )),
            KlmCall::Lock {
                block,
                exclusive,
                alock,
            } => KlmReply::Stat(self.locks.lock(
                block,
                exclusive,
                &alock.fh,
                alock.owner,
                alock.offset,
                alock.length,
            )),
            KlmCall::Cancel {
                block,
                exclusive,
                alock,
            } => KlmReply::Stat(self.locks.cancel(
                block,
                exclusive,
                &alock.fh,
                alock.owner,
                alock.offset,
                alock.length,
            )),
            KlmCall::Unlock { alock } => KlmReply::Stat(self.locks.unlock(
                &alock.fh,
                alock.owner,
                alock.offset,
                alock.length,
            )),
        }
    }
}

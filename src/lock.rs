//! Byte-range advisory locks, indexed by file handle.
//!
//! The table implements the KLM side of the server: shared/exclusive
//! range-locks with owner-aware overlap tests. Blocking is not implemented;
//! a request that cannot be granted is denied immediately and the client is
//! expected to retry.

use std::collections::HashMap;
use std::fmt;

use num_enum::IntoPrimitive;
use num_enum::TryFromPrimitive;
use smallvec::SmallVec;
use smallvec::smallvec;

use crate::handle::FileHandle;

/// Lock holder identity supplied by the client, typically a process id.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct LockOwner(pub u32);

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// KLM reply status values, from the `klm_stats` enumeration.
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum KlmStat {
    /// The call completed and the lock request was granted.
    Granted = 0,
    /// The request conflicts with a lock held by someone else.
    Denied = 1,
    /// The request named a lock the server does not hold.
    DeniedNolocks = 2,
    /// The server is still working on a previous request. Never produced
    /// here since no request blocks.
    Working = 3,
}

/// One locked byte range.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LockRange {
    /// Holder of the range.
    pub owner: LockOwner,
    /// First byte of the range.
    pub offset: u32,
    /// Length of the range in bytes.
    pub length: u32,
}

/// The conflicting lock reported by a denied `TEST`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Holder {
    /// Whether the conflicting record is exclusive.
    pub exclusive: bool,
    /// Holder of the conflicting range.
    pub owner: LockOwner,
    /// First byte of the conflicting range.
    pub offset: u32,
    /// Length of the conflicting range.
    pub length: u32,
}

/// Closed-interval overlap: `max(a0,b0) <= min(a_end, b_end)`. A
/// zero-length range has no bytes and never overlaps anything.
fn ranges_overlap(a_off: u32, a_len: u32, b_off: u32, b_len: u32) -> bool {
    if a_len == 0 || b_len == 0 {
        return false;
    }
    // Widen so offset + length - 1 cannot wrap.
    let (a_off, a_len) = (u64::from(a_off), u64::from(a_len));
    let (b_off, b_len) = (u64::from(b_off), u64::from(b_len));
    a_off.max(b_off) <= (a_off + a_len - 1).min(b_off + b_len - 1)
}

#[derive(Debug)]
struct FileLock {
    exclusive: bool,
    // Grants prepend, so the first element is the youngest range. Most
    // files carry one or two ranges.
    ranges: SmallVec<[LockRange; 2]>,
}

/// Per-handle lock records.
///
/// The handle is an opaque key here; the lock table never consults the
/// handle registry, so lock traffic on a stale handle is answered in lock
/// terms, not with an NFS error.
#[derive(Debug, Default)]
pub struct LockTable {
    locks: HashMap<FileHandle, FileLock>,
}

impl LockTable {
    /// Create an empty table.
    pub fn new() -> LockTable {
        LockTable::default()
    }

    /// Would a lock be granted? Returns `None` when it would, or the first
    /// conflicting range when it would not.
    ///
    /// The scan stops at the first range overlapping the queried interval;
    /// an overlap held by the same owner is not a conflict.
    pub fn test(
        &self,
        _exclusive: bool,
        fh: &FileHandle,
        owner: LockOwner,
        offset: u32,
        length: u32,
    ) -> Option<Holder> {
        let lock = self.locks.get(fh)?;
        let found = lock
            .ranges
            .iter()
            .find(|r| ranges_overlap(r.offset, r.length, offset, length))?;
        if found.owner == owner {
            return None;
        }
        Some(Holder {
            exclusive: lock.exclusive,
            owner: found.owner,
            offset: found.offset,
            length: found.length,
        })
    }

    /// Acquire a range lock.
    ///
    /// `block` is accepted for wire compatibility but denials are always
    /// immediate. A granted range is prepended to the record. An exclusive
    /// record admits only its first range's owner; a shared record admits
    /// anything that overlaps nothing held by another owner.
    pub fn lock(
        &mut self,
        _block: bool,
        exclusive: bool,
        fh: &FileHandle,
        owner: LockOwner,
        offset: u32,
        length: u32,
    ) -> KlmStat {
        let range = LockRange {
            owner,
            offset,
            length,
        };
        let Some(lock) = self.locks.get_mut(fh) else {
            self.locks.insert(
                *fh,
                FileLock {
                    exclusive,
                    ranges: smallvec![range],
                },
            );
            return KlmStat::Granted;
        };
        if lock.ranges.is_empty() {
            // All ranges were unlocked; the record behaves like a new one.
            lock.exclusive = exclusive;
            lock.ranges.insert(0, range);
            return KlmStat::Granted;
        }
        if lock.exclusive {
            if lock.ranges[0].owner != owner {
                return KlmStat::Denied;
            }
            lock.ranges.insert(0, range);
            return KlmStat::Granted;
        }
        let conflict = lock
            .ranges
            .iter()
            .any(|r| r.owner != owner && ranges_overlap(r.offset, r.length, offset, length));
        if conflict {
            return KlmStat::Denied;
        }
        lock.ranges.insert(0, range);
        KlmStat::Granted
    }

    /// Release every range of `owner` overlapping the given interval.
    ///
    /// Reports [`KlmStat::DeniedNolocks`] when nothing came off, including
    /// when the handle has no record at all.
    pub fn unlock(
        &mut self,
        fh: &FileHandle,
        owner: LockOwner,
        offset: u32,
        length: u32,
    ) -> KlmStat {
        let Some(lock) = self.locks.get_mut(fh) else {
            return KlmStat::DeniedNolocks;
        };
        let before = lock.ranges.len();
        lock.ranges
            .retain(|r| !(r.owner == owner && ranges_overlap(r.offset, r.length, offset, length)));
        if lock.ranges.len() == before {
            KlmStat::DeniedNolocks
        } else {
            KlmStat::Granted
        }
    }

    /// Acknowledge a cancel request.
    ///
    /// No request ever blocks, so there is never a waiter to unwind; the
    /// call is a stateless acknowledgement.
    pub fn cancel(
        &mut self,
        _block: bool,
        _exclusive: bool,
        _fh: &FileHandle,
        _owner: LockOwner,
        _offset: u32,
        _length: u32,
    ) -> KlmStat {
        KlmStat::Granted
    }

    /// Number of handles with a lock record.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no handle has a lock record.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fh(tag: u8) -> FileHandle {
        FileHandle::from_bytes([tag; 32])
    }

    #[test]
    fn overlap_formula() {
        assert!(ranges_overlap(0, 100, 99, 10));
        assert!(ranges_overlap(50, 1, 0, 100));
        assert!(!ranges_overlap(0, 100, 100, 10));
        assert!(!ranges_overlap(200, 5, 0, 100));
    }

    #[test]
    fn zero_length_never_overlaps() {
        assert!(!ranges_overlap(0, 0, 0, 100));
        assert!(!ranges_overlap(0, 100, 50, 0));
        assert!(!ranges_overlap(0, 0, 0, 0));
    }

    #[test]
    fn conflict_scenario() {
        let mut table = LockTable::new();
        let handle = fh(1);

        assert_eq!(table.test(true, &handle, LockOwner(1), 0, 100), None);
        assert_eq!(
            table.lock(false, true, &handle, LockOwner(1), 0, 100),
            KlmStat::Granted
        );
        assert_eq!(
            table.lock(false, true, &handle, LockOwner(2), 50, 100),
            KlmStat::Denied
        );
        assert_eq!(
            table.test(true, &handle, LockOwner(2), 50, 100),
            Some(Holder {
                exclusive: true,
                owner: LockOwner(1),
                offset: 0,
                length: 100,
            })
        );
    }

    #[test]
    fn same_owner_stacks_on_exclusive() {
        let mut table = LockTable::new();
        let handle = fh(1);
        assert_eq!(
            table.lock(false, true, &handle, LockOwner(1), 0, 10),
            KlmStat::Granted
        );
        assert_eq!(
            table.lock(false, true, &handle, LockOwner(1), 5, 10),
            KlmStat::Granted
        );
        // Someone else stays out even with a disjoint range.
        assert_eq!(
            table.lock(false, true, &handle, LockOwner(2), 1000, 10),
            KlmStat::Denied
        );
    }

    #[test]
    fn shared_locks_coexist_when_disjoint() {
        let mut table = LockTable::new();
        let handle = fh(1);
        assert_eq!(
            table.lock(false, false, &handle, LockOwner(1), 0, 10),
            KlmStat::Granted
        );
        assert_eq!(
            table.lock(false, false, &handle, LockOwner(2), 100, 10),
            KlmStat::Granted
        );
        assert_eq!(
            table.lock(false, false, &handle, LockOwner(2), 5, 10),
            KlmStat::Denied
        );
        // Overlap with own range is fine.
        assert_eq!(
            table.lock(false, false, &handle, LockOwner(1), 5, 10),
            KlmStat::Granted
        );
    }

    #[test]
    fn unlock_removes_overlapping_owned_ranges() {
        let mut table = LockTable::new();
        let handle = fh(1);
        table.lock(false, false, &handle, LockOwner(1), 0, 10);
        table.lock(false, false, &handle, LockOwner(1), 20, 10);
        table.lock(false, false, &handle, LockOwner(2), 40, 10);

        assert_eq!(
            table.unlock(&handle, LockOwner(1), 0, 30),
            KlmStat::Granted
        );
        // Owner 1 ranges are gone; owner 2 survives.
        assert_eq!(table.test(false, &handle, LockOwner(1), 0, 30), None);
        assert!(table.test(true, &handle, LockOwner(1), 40, 10).is_some());
    }

    #[test]
    fn unlock_without_record_is_denied_nolocks() {
        let mut table = LockTable::new();
        assert_eq!(
            table.unlock(&fh(9), LockOwner(1), 0, 100),
            KlmStat::DeniedNolocks
        );
    }

    #[test]
    fn unlock_missing_range_is_denied_nolocks() {
        let mut table = LockTable::new();
        let handle = fh(1);
        table.lock(false, false, &handle, LockOwner(1), 0, 10);
        assert_eq!(
            table.unlock(&handle, LockOwner(2), 0, 10),
            KlmStat::DeniedNolocks
        );
        assert_eq!(
            table.unlock(&handle, LockOwner(1), 500, 10),
            KlmStat::DeniedNolocks
        );
    }

    #[test]
    fn lock_unlock_round_trip() {
        let mut table = LockTable::new();
        let handle = fh(1);
        table.lock(false, true, &handle, LockOwner(1), 0, 100);
        table.unlock(&handle, LockOwner(1), 0, 100);
        // Behaviorally back to the initial state: anyone can lock again.
        assert_eq!(table.test(true, &handle, LockOwner(2), 0, 100), None);
        assert_eq!(
            table.lock(false, false, &handle, LockOwner(2), 0, 100),
            KlmStat::Granted
        );
        assert_eq!(
            table.unlock(&handle, LockOwner(2), 0, 100),
            KlmStat::Granted
        );
        assert_eq!(
            table.unlock(&handle, LockOwner(2), 0, 100),
            KlmStat::DeniedNolocks
        );
    }

    #[test]
    fn emptied_record_takes_new_exclusivity() {
        let mut table = LockTable::new();
        let handle = fh(1);
        table.lock(false, true, &handle, LockOwner(1), 0, 10);
        table.unlock(&handle, LockOwner(1), 0, 10);
        // The record was exclusive; a fresh shared lock resets the flag.
        table.lock(false, false, &handle, LockOwner(2), 0, 10);
        assert_eq!(
            table.lock(false, false, &handle, LockOwner(3), 100, 10),
            KlmStat::Granted
        );
    }

    #[test]
    fn cancel_changes_nothing() {
        let mut table = LockTable::new();
        let handle = fh(1);
        table.lock(false, true, &handle, LockOwner(1), 0, 10);
        assert_eq!(
            table.cancel(false, true, &handle, LockOwner(2), 0, 10),
            KlmStat::Granted
        );
        assert!(table.test(true, &handle, LockOwner(2), 0, 10).is_some());
    }
}

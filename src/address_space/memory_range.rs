use crate::remote_ptr::{RemotePtr, Void};
use std::cmp::{max, min};
use std::fmt::{Display, Formatter, Result};

/// Note: The end point (end_) is implicitly NOT included in the MemoryRange
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct MemoryRange {
    pub(super) start_: RemotePtr<Void>,
    pub(super) end_: RemotePtr<Void>,
}

impl MemoryRange {
    pub fn new_range(addr: RemotePtr<Void>, num_bytes: usize) -> MemoryRange {
        // Overflow panics in debug builds, so start_ <= end_ holds.
        MemoryRange {
            start_: addr,
            end_: addr + num_bytes,
        }
    }

    pub fn from_range(addr: RemotePtr<Void>, end: RemotePtr<Void>) -> MemoryRange {
        let result = MemoryRange {
            start_: addr,
            end_: end,
        };
        debug_assert!(result.start_ <= result.end_);
        result
    }

    /// Return true iff `other` is an address range fully contained by self.
    pub fn contains(&self, other: &Self) -> bool {
        self.start_ <= other.start_ && other.end_ <= self.end_
    }

    /// Note that we have p < self.end_ and not p <= self.end here.
    pub fn contains_ptr(&self, p: RemotePtr<Void>) -> bool {
        self.start_ <= p && p < self.end_
    }

    pub fn intersect(&self, other: &MemoryRange) -> MemoryRange {
        let s = max(self.start_, other.start_);
        let e = min(self.end_, other.end_);
        MemoryRange {
            start_: s,
            end_: max(s, e),
        }
    }

    pub fn intersects(&self, other: &MemoryRange) -> bool {
        let s = max(self.start_, other.start_);
        let e = min(self.end_, other.end_);
        s < e
    }

    pub fn start(&self) -> RemotePtr<Void> {
        self.start_
    }

    pub fn end(&self) -> RemotePtr<Void> {
        self.end_
    }

    pub fn len(&self) -> usize {
        self.end_ - self.start_
    }

    pub fn is_empty(&self) -> bool {
        self.start_ == self.end_
    }
}

impl Display for MemoryRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{}-{}", self.start_, self.end_)
    }
}

use crate::remote_ptr::{RemotePtr, Void};
use std::{
    cmp::{max, min},
    fmt::{Display, Formatter, Result},
};

/// A half-open range of tracee addresses. The end point is NOT included.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct MemoryRange {
    start_: RemotePtr<Void>,
    end_: RemotePtr<Void>,
}

impl Default for MemoryRange {
    fn default() -> Self {
        MemoryRange {
            start_: RemotePtr::null(),
            end_: RemotePtr::null(),
        }
    }
}

impl MemoryRange {
    pub fn new_range(addr: RemotePtr<Void>, num_bytes: usize) -> MemoryRange {
        // If the addition overflows, rust panics in debug mode, so there is
        // no need for a debug_assert!(start_ <= end_) here.
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

    /// Note that we have p < self.end_ and not p <= self.end_ here.
    pub fn contains_ptr(&self, p: RemotePtr<Void>) -> bool {
        self.start_ <= p && p < self.end_
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

    pub fn size(&self) -> usize {
        self.end_ - self.start_
    }
}

impl Display for MemoryRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{}-{}", self.start_, self.end_)
    }
}

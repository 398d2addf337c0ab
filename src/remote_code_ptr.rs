use crate::{kernel_abi::SupportedArch, remote_ptr::RemotePtr};
use std::{
    fmt::{Display, Formatter, Result},
    ops::{Add, Sub},
};

/// A pointer to code in a tracee's address space. Kept distinct from
/// `RemotePtr` so instruction addresses and data addresses can't be
/// accidentally mixed; arithmetic is always in bytes.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct RemoteCodePtr {
    ptr: usize,
}

impl Default for RemoteCodePtr {
    fn default() -> Self {
        RemoteCodePtr::null()
    }
}

impl RemoteCodePtr {
    pub fn null() -> RemoteCodePtr {
        RemoteCodePtr { ptr: 0 }
    }

    pub fn from_val(val: usize) -> RemoteCodePtr {
        RemoteCodePtr { ptr: val }
    }

    pub fn as_usize(&self) -> usize {
        self.ptr
    }

    pub fn is_null(&self) -> bool {
        self.ptr == 0
    }

    /// Breakpoint instructions are 1 byte on both supported architectures.
    pub fn decrement_by_bkpt_insn_length(self, _arch: SupportedArch) -> RemoteCodePtr {
        self - 1usize
    }

    pub fn increment_by_bkpt_insn_length(self, _arch: SupportedArch) -> RemoteCodePtr {
        self + 1usize
    }

    pub fn to_data_ptr<T>(&self) -> RemotePtr<T> {
        RemotePtr::<T>::new_from_val(self.as_usize())
    }
}

impl Display for RemoteCodePtr {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{:#x}", self.ptr)
    }
}

impl Add<usize> for RemoteCodePtr {
    type Output = Self;

    fn add(self, delta: usize) -> Self::Output {
        Self::from_val(self.as_usize() + delta)
    }
}

impl Sub<usize> for RemoteCodePtr {
    type Output = Self;

    fn sub(self, delta: usize) -> Self::Output {
        Self::from_val(self.as_usize() - delta)
    }
}

impl Sub<RemoteCodePtr> for RemoteCodePtr {
    type Output = isize;

    fn sub(self, rhs: RemoteCodePtr) -> Self::Output {
        self.as_usize() as isize - rhs.as_usize() as isize
    }
}

impl From<usize> for RemoteCodePtr {
    fn from(addr: usize) -> Self {
        RemoteCodePtr::from_val(addr)
    }
}

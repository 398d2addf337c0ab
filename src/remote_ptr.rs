use std::{
    cmp::Ordering,
    fmt::{Display, Formatter, Result},
    marker::PhantomData,
    ops::{Add, AddAssign, Sub, SubAssign},
};

/// Useful alias.
pub type Void = u8;

/// A pointer into a tracee's address space. Arithmetic is scaled by the
/// referent size, like a raw `*const T`, but nothing is ever dereferenced
/// locally; reads go through `Task::read_bytes_fallible`.
#[derive(Hash, Debug)]
/// Manually derive Copy, Clone due to quirks with PhantomData
pub struct RemotePtr<T> {
    ptr: usize,
    /// This struct does not "own" a `T`; it is a kind of pointer to `T`,
    /// hence `PhantomData<*const T>` rather than `PhantomData<T>`.
    phantom: PhantomData<*const T>,
}

impl<T> Clone for RemotePtr<T> {
    fn clone(&self) -> Self {
        RemotePtr {
            ptr: self.ptr,
            phantom: PhantomData,
        }
    }
}

impl<T> Copy for RemotePtr<T> {}

impl<T> Default for RemotePtr<T> {
    fn default() -> Self {
        RemotePtr::null()
    }
}

impl<T> RemotePtr<T> {
    pub fn null() -> RemotePtr<T> {
        RemotePtr {
            ptr: 0,
            phantom: PhantomData,
        }
    }

    pub fn new_from_val(val: usize) -> RemotePtr<T> {
        RemotePtr {
            ptr: val,
            phantom: PhantomData,
        }
    }

    pub fn as_usize(&self) -> usize {
        self.ptr
    }

    pub fn is_null(&self) -> bool {
        self.ptr == 0
    }
}

impl<T> Display for RemotePtr<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{:#x}", self.ptr)
    }
}

impl<T> Add<usize> for RemotePtr<T> {
    type Output = Self;

    fn add(self, delta: usize) -> Self::Output {
        // Overflow aborts in debug mode.
        Self::new_from_val(self.as_usize() + delta * std::mem::size_of::<T>())
    }
}

impl<T> Add<isize> for RemotePtr<T> {
    type Output = Self;

    fn add(self, delta: isize) -> Self::Output {
        if delta < 0 {
            return Sub::<usize>::sub(self, delta.abs() as usize);
        }
        Self::new_from_val(self.as_usize() + (delta as usize) * std::mem::size_of::<T>())
    }
}

impl<T> Sub<usize> for RemotePtr<T> {
    type Output = Self;

    fn sub(self, delta: usize) -> Self::Output {
        // Underflow aborts in debug mode.
        Self::new_from_val(self.as_usize() - delta * std::mem::size_of::<T>())
    }
}

/// Note that the other RemotePtr must have the SAME referent type.
impl<T> Sub<RemotePtr<T>> for RemotePtr<T> {
    type Output = usize;

    fn sub(self, rhs: RemotePtr<T>) -> Self::Output {
        // Underflow aborts in debug mode.
        let delta: usize = self.as_usize() - rhs.as_usize();
        delta / std::mem::size_of::<T>()
    }
}

impl<T> PartialOrd for RemotePtr<T> {
    fn partial_cmp(&self, other: &RemotePtr<T>) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for RemotePtr<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ptr.cmp(&other.ptr)
    }
}

impl<T> PartialEq for RemotePtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> Eq for RemotePtr<T> {}

impl<T> From<usize> for RemotePtr<T> {
    fn from(addr: usize) -> Self {
        RemotePtr::<T>::new_from_val(addr)
    }
}

impl<T> AddAssign<usize> for RemotePtr<T> {
    fn add_assign(&mut self, rhs: usize) {
        self.ptr = self.ptr + rhs * std::mem::size_of::<T>();
    }
}

impl<T> SubAssign<usize> for RemotePtr<T> {
    fn sub_assign(&mut self, rhs: usize) {
        self.ptr = self.ptr - rhs * std::mem::size_of::<T>();
    }
}

use std::{
    cmp::Ordering,
    fmt::{Display, Formatter, Result},
    marker::PhantomData,
    ops::{Add, AddAssign, Sub},
};

/// Useful alias.
pub type Void = u8;

/// An address in a tracee's address space. Never dereferenced locally.
#[derive(Hash, Debug)]
/// Manually derive Copy, Clone due to quirks with PhantomData
pub struct RemotePtr<T> {
    ptr: usize,
    /// This struct does not "own" a `T`, hence `PhantomData<*const T>`.
    phantom: PhantomData<*const T>,
}

impl<T> Clone for RemotePtr<T> {
    fn clone(&self) -> Self {
        *self
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
        RemotePtr::new_from_val(0)
    }

    pub fn new_from_val(val: usize) -> RemotePtr<T> {
        RemotePtr {
            ptr: val,
            phantom: PhantomData,
        }
    }

    pub fn is_null(&self) -> bool {
        self.ptr == 0
    }

    pub fn as_usize(&self) -> usize {
        self.ptr
    }

    pub fn cast<U>(r: RemotePtr<U>) -> RemotePtr<T> {
        RemotePtr::new_from_val(r.ptr)
    }

    pub fn referent_size(&self) -> usize {
        std::mem::size_of::<T>()
    }

    /// `None` if the address would wrap around the end of the address space.
    pub fn checked_add(self, delta: usize) -> Option<RemotePtr<T>> {
        delta
            .checked_mul(std::mem::size_of::<T>())
            .and_then(|bytes| self.ptr.checked_add(bytes))
            .map(RemotePtr::new_from_val)
    }
}

impl<T> Display for RemotePtr<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{:#x}", self.ptr)
    }
}

impl<T> PartialEq for RemotePtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> Eq for RemotePtr<T> {}

impl<T> PartialOrd for RemotePtr<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for RemotePtr<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ptr.cmp(&other.ptr)
    }
}

impl<T> Add<usize> for RemotePtr<T> {
    type Output = Self;

    fn add(self, delta: usize) -> Self::Output {
        RemotePtr::new_from_val(self.ptr + delta * std::mem::size_of::<T>())
    }
}

impl<T> AddAssign<usize> for RemotePtr<T> {
    fn add_assign(&mut self, rhs: usize) {
        self.ptr += rhs * std::mem::size_of::<T>();
    }
}

impl<T> Sub<usize> for RemotePtr<T> {
    type Output = Self;

    fn sub(self, delta: usize) -> Self::Output {
        RemotePtr::new_from_val(self.ptr - delta * std::mem::size_of::<T>())
    }
}

/// Distance in units of `T`.
impl<T> Sub<RemotePtr<T>> for RemotePtr<T> {
    type Output = usize;

    fn sub(self, rhs: RemotePtr<T>) -> Self::Output {
        (self.ptr - rhs.ptr) / std::mem::size_of::<T>()
    }
}

impl<T> From<usize> for RemotePtr<T> {
    fn from(addr: usize) -> Self {
        RemotePtr::new_from_val(addr)
    }
}

impl<T> From<RemotePtr<T>> for usize {
    fn from(p: RemotePtr<T>) -> Self {
        p.as_usize()
    }
}

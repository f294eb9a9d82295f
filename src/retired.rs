//! Retired records and the per-thread lists caching them until they can be
//! reclaimed.

use core::cmp;
use core::fmt;
use core::marker::PhantomData;
use core::mem;
use core::ptr::NonNull;

#[cfg(not(feature = "std"))]
use alloc::{boxed::Box, vec::Vec};

use crate::error::AllocError;

/// The pointer bit used as temporary mark by the in-place scan.
const MARK_BIT: usize = 0b1;

////////////////////////////////////////////////////////////////////////////////////////////////////
// Unlinked
////////////////////////////////////////////////////////////////////////////////////////////////////

/// An owned, heap allocated record that has been unlinked from a concurrent
/// data structure but may still be accessed by other threads.
///
/// An `Unlinked` can not be cloned and is consumed when it is retired, so the
/// same handle can not be retired twice.
pub struct Unlinked<T> {
    inner: NonNull<T>,
    _marker: PhantomData<Box<T>>,
}

unsafe impl<T: Send> Send for Unlinked<T> {}
unsafe impl<T: Sync> Sync for Unlinked<T> {}

/********** impl inherent *************************************************************************/

impl<T> Unlinked<T> {
    /// Creates a new `Unlinked` from a non-null pointer.
    ///
    /// # Safety
    ///
    /// The caller has to ensure that:
    ///
    /// - `ptr` was obtained from [`Box::into_raw`] (or is otherwise valid to be
    ///   passed to [`Box::from_raw`])
    /// - the record is no longer reachable from the data structure it was
    ///   removed from, so no thread can acquire a new reference to it
    /// - no other `Unlinked` for the same record exists
    #[inline]
    pub unsafe fn new_unchecked(ptr: NonNull<T>) -> Self {
        Self { inner: ptr, _marker: PhantomData }
    }

    /// Creates a new `Unlinked` from a raw pointer or returns [`None`] if it
    /// is null.
    ///
    /// # Safety
    ///
    /// The same caveats as with [`new_unchecked`][Unlinked::new_unchecked]
    /// apply.
    #[inline]
    pub unsafe fn from_raw(raw: *mut T) -> Option<Self> {
        NonNull::new(raw).map(|ptr| Self::new_unchecked(ptr))
    }

    /// Consumes the `unlinked` and returns the internal raw pointer without
    /// retiring it.
    #[inline]
    pub fn into_raw(unlinked: Self) -> *mut T {
        unlinked.inner.as_ptr()
    }

    /// Returns the internal raw pointer.
    #[inline]
    pub fn as_ptr(&self) -> *mut T {
        self.inner.as_ptr()
    }

    /// Dereferences the unlinked record.
    ///
    /// # Safety
    ///
    /// The record is still alive until it is retired, but other threads may
    /// hold shared references to it, so only shared access is possible.
    #[inline]
    pub unsafe fn deref(&self) -> &T {
        &*self.inner.as_ptr()
    }

    /// Converts the `unlinked` into a type-erased [`Retired`] record that is
    /// reclaimed by dropping it as a `Box<T>`.
    #[inline]
    pub(crate) fn into_retired(unlinked: Self) -> Retired {
        unsafe { Retired::new(unlinked.inner, drop_boxed::<T>) }
    }
}

/********** impl Debug & Pointer ******************************************************************/

impl<T> fmt::Debug for Unlinked<T> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Unlinked").field("ptr", &self.inner).finish()
    }
}

impl<T> fmt::Pointer for Unlinked<T> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Pointer::fmt(&self.inner, f)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// TaggedPtr
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A non-null untyped pointer, whose least significant bit can be used as a
/// mark if the pointee's address is at least 2-byte aligned.
#[derive(Copy, Clone, Eq, PartialEq)]
pub(crate) struct TaggedPtr(NonNull<()>);

/********** impl inherent *************************************************************************/

impl TaggedPtr {
    #[inline]
    fn new(ptr: NonNull<()>) -> Self {
        Self(ptr)
    }

    /// Returns the numeric value of the pointer including a potential mark.
    #[inline]
    pub fn address(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// Returns the numeric value of the pointer with the mark bit cleared.
    #[inline]
    pub fn unmarked_address(self) -> usize {
        self.address() & !MARK_BIT
    }

    /// Returns `true` if the mark bit is set.
    #[inline]
    pub fn is_marked(self) -> bool {
        self.address() & MARK_BIT != 0
    }

    /// Sets the mark bit.
    #[inline]
    pub fn mark(&mut self) {
        // setting a bit can never produce a null pointer
        self.0 = unsafe { NonNull::new_unchecked((self.address() | MARK_BIT) as *mut ()) };
    }

    /// Clears the mark bit.
    ///
    /// Must only be called on pointers that were marked by [`mark`][TaggedPtr::mark].
    #[inline]
    pub fn unmark(&mut self) {
        debug_assert!(self.is_marked());
        self.0 = unsafe { NonNull::new_unchecked(self.unmarked_address() as *mut ()) };
    }

    #[inline]
    fn as_ptr(self) -> *mut () {
        self.0.as_ptr()
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Retired
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A type-erased retired record and the function for reclaiming it.
///
/// The record itself is never dereferenced, only its address is compared with
/// the values of hazard pointers.
pub struct Retired {
    ptr: TaggedPtr,
    reclaim: unsafe fn(*mut ()),
}

/********** impl inherent *************************************************************************/

impl Retired {
    /// Creates a new [`Retired`] record from a non-null pointer and a function
    /// for reclaiming it.
    ///
    /// # Safety
    ///
    /// The caller has to ensure that:
    ///
    /// - `ptr` is no longer reachable by any thread that has not already
    ///   protected it with a hazard pointer
    /// - it is sound to call `reclaim` with `ptr` exactly once, at any later
    ///   time and from any thread
    /// - `reclaim` does not panic
    #[inline]
    pub unsafe fn new<T>(ptr: NonNull<T>, reclaim: unsafe fn(*mut T)) -> Self {
        // thin raw pointers are ABI compatible regardless of their pointee type
        let reclaim: unsafe fn(*mut ()) = mem::transmute::<unsafe fn(*mut T), _>(reclaim);
        Self { ptr: TaggedPtr::new(ptr.cast()), reclaim }
    }

    /// Returns the numeric representation of the retired record's memory
    /// address.
    #[inline]
    pub fn address(&self) -> usize {
        self.ptr.address()
    }

    /// Reclaims the retired record by calling its reclaim function.
    ///
    /// # Safety
    ///
    /// This method **must** not be called more than once or when some other
    /// thread still has some reference to the record.
    #[inline]
    pub unsafe fn reclaim(&mut self) {
        (self.reclaim)(self.ptr.as_ptr());
    }

    #[inline]
    pub(crate) fn tagged(&self) -> TaggedPtr {
        self.ptr
    }

    #[inline]
    pub(crate) fn tagged_mut(&mut self) -> &mut TaggedPtr {
        &mut self.ptr
    }
}

/********** impl cmp ******************************************************************************/

impl PartialEq for Retired {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.address() == other.address()
    }
}

impl Eq for Retired {}

impl PartialOrd for Retired {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Retired {
    #[inline]
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        self.address().cmp(&other.address())
    }
}

/********** impl Debug ****************************************************************************/

impl fmt::Debug for Retired {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Retired").field("address", &self.ptr.as_ptr()).finish()
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// RetiredList
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A fixed-capacity list of retired records owned by one thread record.
#[derive(Debug)]
pub(crate) struct RetiredList {
    entries: Vec<Retired>,
    capacity: usize,
}

/********** impl inherent *************************************************************************/

impl RetiredList {
    /// Allocates a new empty list that can hold up to `capacity` records.
    #[inline]
    pub fn try_with_capacity(capacity: usize) -> Result<Self, AllocError> {
        let mut entries = Vec::new();
        entries.try_reserve_exact(capacity).map_err(|_| AllocError)?;
        Ok(Self { entries, capacity })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends `retired` or returns it back, if the list is full.
    #[inline]
    pub fn push(&mut self, retired: Retired) -> Result<(), Retired> {
        if self.is_full() {
            return Err(retired);
        }

        self.entries.push(retired);
        Ok(())
    }

    /// Removes all records from the list without reclaiming them.
    #[inline]
    pub fn drain(&mut self) -> impl Iterator<Item = Retired> + '_ {
        self.entries.drain(..)
    }

    #[inline]
    pub fn iter(&self) -> core::slice::Iter<'_, Retired> {
        self.entries.iter()
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [Retired] {
        &mut self.entries
    }

    /// Keeps all records for which `keep` returns `true` in their original
    /// order and reclaims all others.
    ///
    /// Returns the number of reclaimed records.
    ///
    /// # Safety
    ///
    /// The caller has to ensure that no thread holds a reference to any record
    /// for which `keep` returns `false`.
    #[inline]
    pub unsafe fn reclaim_unless(&mut self, mut keep: impl FnMut(&mut Retired) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain_mut(|retired| {
            if keep(retired) {
                true
            } else {
                retired.reclaim();
                false
            }
        });

        before - self.entries.len()
    }

    /// Reclaims all records unconditionally.
    ///
    /// # Safety
    ///
    /// The caller has to ensure that no thread holds a reference to any record.
    #[inline]
    pub unsafe fn reclaim_all(&mut self) -> usize {
        self.reclaim_unless(|_| false)
    }
}

/// Reclaims a record that was allocated as a [`Box`].
unsafe fn drop_boxed<T>(ptr: *mut T) {
    mem::drop(Box::from_raw(ptr));
}

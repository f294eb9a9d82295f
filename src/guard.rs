//! RAII handles for the hazard pointers of the current thread.
//!
//! A [`Guard`] owns exactly one hazard pointer slot of its thread's record and
//! a [`GuardArray`] owns `N` of them. Slots are handed out from a per-thread
//! free list and are cleared and returned when the handle is dropped.

use core::cell::RefCell;
use core::fmt;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

#[cfg(not(feature = "std"))]
use alloc::vec::Vec;

use typenum::Unsigned;

use crate::error::{AllocError, GuardsExhausted};
use crate::hazard::{GuardSlot, GuardSlots};
use crate::pointer::{AtomicMarkedPtr, MarkedPtr};

////////////////////////////////////////////////////////////////////////////////////////////////////
// LocalGuards
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The free list of unallocated slot indices of one thread attachment.
#[derive(Debug)]
pub(crate) struct LocalGuards {
    free: RefCell<Vec<usize>>,
}

/********** impl inherent *************************************************************************/

impl LocalGuards {
    /// Creates a new free list containing all `count` slot indices.
    #[inline]
    pub fn try_new(count: usize) -> Result<Self, AllocError> {
        let mut free = Vec::new();
        free.try_reserve_exact(count).map_err(|_| AllocError)?;
        // slots are handed out in ascending order
        free.extend((0..count).rev());

        Ok(Self { free: RefCell::new(free) })
    }

    /// Returns the number of currently unallocated slots.
    #[inline]
    pub fn available(&self) -> usize {
        self.free.borrow().len()
    }

    #[inline]
    fn acquire(&self) -> Result<usize, GuardsExhausted> {
        self.free.borrow_mut().pop().ok_or(GuardsExhausted)
    }

    #[inline]
    fn acquire_array<const N: usize>(&self) -> Result<[usize; N], GuardsExhausted> {
        let mut free = self.free.borrow_mut();
        if free.len() < N {
            return Err(GuardsExhausted);
        }

        let mut indices = [0; N];
        for idx in indices.iter_mut() {
            *idx = free.pop().ok_or(GuardsExhausted)?;
        }

        Ok(indices)
    }

    #[inline]
    fn release(&self, idx: usize) {
        let mut free = self.free.borrow_mut();
        debug_assert!(!free.contains(&idx), "guard slot released twice");
        free.push(idx);
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Guard
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A handle for a single hazard pointer of the current thread.
///
/// Any record a guard protects is exempt from reclamation until the guard is
/// cleared, overwritten or dropped.
pub struct Guard<'h> {
    slots: &'h GuardSlots,
    idx: usize,
    local: &'h LocalGuards,
}

/********** impl inherent *************************************************************************/

impl<'h> Guard<'h> {
    #[inline]
    pub(crate) fn try_new(
        slots: &'h GuardSlots,
        local: &'h LocalGuards,
    ) -> Result<Self, GuardsExhausted> {
        let idx = local.acquire()?;
        Ok(Self { slots, idx, local })
    }

    /// Loads a pointer from `src` and protects it from reclamation.
    ///
    /// The pointer is published and `src` is re-read until both values agree,
    /// so the returned pointer (if non-null) is safe to dereference until this
    /// guard is modified or dropped, provided that records are only retired
    /// after they have been unlinked from `src`.
    #[inline]
    pub fn protect<T>(&mut self, src: &AtomicPtr<T>) -> *mut T {
        protect_with(self.slot(), src, |ptr| ptr as *const ())
    }

    /// Loads a pointer from `src` and protects the pointer derived from it by
    /// `project`, which is useful for intrusive data structures where the
    /// links point to a field inside the record that has to be protected.
    ///
    /// Returns the pointer as loaded from `src`. `project` is never called
    /// with a null pointer.
    #[inline]
    pub fn protect_with<T, U>(
        &mut self,
        src: &AtomicPtr<T>,
        project: impl Fn(*mut T) -> *const U,
    ) -> *mut T {
        protect_with(self.slot(), src, project)
    }

    /// Loads a marked pointer from `src` and protects it from reclamation.
    ///
    /// Only the address without the tag is published, but the full marked
    /// value is used for validating against `src`.
    #[inline]
    pub fn protect_marked<T, N: Unsigned>(
        &mut self,
        src: &AtomicMarkedPtr<T, N>,
    ) -> MarkedPtr<T, N> {
        protect_marked(self.slot(), src)
    }

    /// Publishes `ptr` without any validation.
    ///
    /// The caller is responsible for ensuring that the record has not been
    /// retired before it was published.
    #[inline]
    pub fn assign<T>(&mut self, ptr: *const T) {
        self.slot().set(ptr as *mut (), Ordering::Release);
    }

    /// Publishes the untagged address of `ptr` without any validation.
    #[inline]
    pub fn assign_marked<T, N: Unsigned>(&mut self, ptr: MarkedPtr<T, N>) {
        self.assign(ptr.decompose_ptr());
    }

    /// Stops protecting the currently protected record.
    #[inline]
    pub fn clear(&mut self) {
        self.slot().clear(Ordering::Release);
    }

    /// Returns the currently protected pointer or null.
    #[inline]
    pub fn get(&self) -> *mut () {
        self.slot()
            .protected(Ordering::Relaxed)
            .map_or(ptr::null_mut(), |protected| protected.into_inner().as_ptr())
    }

    /// Protects the same record that `other` protects.
    #[inline]
    pub fn copy_from(&mut self, other: &Guard<'_>) {
        self.slot().set(other.get(), Ordering::Release);
    }

    #[inline]
    fn slot(&self) -> &GuardSlot {
        self.slots.get(self.idx)
    }
}

/********** impl Debug ****************************************************************************/

impl fmt::Debug for Guard<'_> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Guard").field("slot", &self.idx).field("protected", &self.get()).finish()
    }
}

/********** impl Drop *****************************************************************************/

impl Drop for Guard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.slot().clear(Ordering::Release);
        self.local.release(self.idx);
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// GuardArray
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A handle for `N` hazard pointers of the current thread.
///
/// All operations take the index of the slot within the array and panic if
/// it is out of bounds.
pub struct GuardArray<'h, const N: usize> {
    slots: &'h GuardSlots,
    indices: [usize; N],
    local: &'h LocalGuards,
}

/********** impl inherent *************************************************************************/

impl<'h, const N: usize> GuardArray<'h, N> {
    #[inline]
    pub(crate) fn try_new(
        slots: &'h GuardSlots,
        local: &'h LocalGuards,
    ) -> Result<Self, GuardsExhausted> {
        let indices = local.acquire_array::<N>()?;
        Ok(Self { slots, indices, local })
    }

    /// Returns the number of hazard pointers in the array.
    #[inline]
    pub const fn len(&self) -> usize {
        N
    }

    /// Returns `true` if the array contains no hazard pointers.
    #[inline]
    pub const fn is_empty(&self) -> bool {
        N == 0
    }

    /// Loads a pointer from `src` and protects it in slot `idx`.
    ///
    /// See [`Guard::protect`].
    #[inline]
    pub fn protect<T>(&mut self, idx: usize, src: &AtomicPtr<T>) -> *mut T {
        protect_with(self.slot(idx), src, |ptr| ptr as *const ())
    }

    /// Loads a pointer from `src` and protects its projection in slot `idx`.
    ///
    /// See [`Guard::protect_with`].
    #[inline]
    pub fn protect_with<T, U>(
        &mut self,
        idx: usize,
        src: &AtomicPtr<T>,
        project: impl Fn(*mut T) -> *const U,
    ) -> *mut T {
        protect_with(self.slot(idx), src, project)
    }

    /// Loads a marked pointer from `src` and protects it in slot `idx`.
    ///
    /// See [`Guard::protect_marked`].
    #[inline]
    pub fn protect_marked<T, N2: Unsigned>(
        &mut self,
        idx: usize,
        src: &AtomicMarkedPtr<T, N2>,
    ) -> MarkedPtr<T, N2> {
        protect_marked(self.slot(idx), src)
    }

    /// Publishes `ptr` in slot `idx` without any validation.
    #[inline]
    pub fn assign<T>(&mut self, idx: usize, ptr: *const T) {
        self.slot(idx).set(ptr as *mut (), Ordering::Release);
    }

    /// Publishes the untagged address of `ptr` in slot `idx` without any
    /// validation.
    #[inline]
    pub fn assign_marked<T, N2: Unsigned>(&mut self, idx: usize, ptr: MarkedPtr<T, N2>) {
        self.assign(idx, ptr.decompose_ptr());
    }

    /// Clears slot `idx`.
    #[inline]
    pub fn clear(&mut self, idx: usize) {
        self.slot(idx).clear(Ordering::Release);
    }

    /// Clears all slots.
    #[inline]
    pub fn clear_all(&mut self) {
        for idx in 0..N {
            self.clear(idx);
        }
    }

    /// Returns the pointer protected in slot `idx` or null.
    #[inline]
    pub fn get(&self, idx: usize) -> *mut () {
        self.slot(idx)
            .protected(Ordering::Relaxed)
            .map_or(ptr::null_mut(), |protected| protected.into_inner().as_ptr())
    }

    /// Protects the record protected in slot `src` in slot `dst` as well.
    #[inline]
    pub fn copy(&mut self, dst: usize, src: usize) {
        let ptr = self.get(src);
        self.slot(dst).set(ptr, Ordering::Release);
    }

    /// Protects the record that `guard` protects in slot `idx`.
    #[inline]
    pub fn copy_from_guard(&mut self, idx: usize, guard: &Guard<'_>) {
        self.slot(idx).set(guard.get(), Ordering::Release);
    }

    #[inline]
    fn slot(&self, idx: usize) -> &GuardSlot {
        self.slots.get(self.indices[idx])
    }
}

/********** impl Debug ****************************************************************************/

impl<const N: usize> fmt::Debug for GuardArray<'_, N> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("GuardArray").field("slots", &&self.indices[..]).finish()
    }
}

/********** impl Drop *****************************************************************************/

impl<const N: usize> Drop for GuardArray<'_, N> {
    #[inline]
    fn drop(&mut self) {
        for &idx in self.indices.iter() {
            self.slots.get(idx).clear(Ordering::Release);
            self.local.release(idx);
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// helper functions
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Publishes the projection of the value loaded from `src` in `slot` until
/// the value of `src` is stable across the publication.
#[inline]
fn protect_with<T, U>(
    slot: &GuardSlot,
    src: &AtomicPtr<T>,
    project: impl Fn(*mut T) -> *const U,
) -> *mut T {
    let mut ptr = src.load(Ordering::Relaxed);
    loop {
        let hazard = if ptr.is_null() { ptr::null_mut() } else { project(ptr) as *mut () };
        // must not be reordered with the subsequent load
        slot.set(hazard, Ordering::SeqCst);

        let reloaded = src.load(Ordering::Acquire);
        if reloaded == ptr {
            return ptr;
        }

        ptr = reloaded;
    }
}

#[inline]
fn protect_marked<T, N: Unsigned>(
    slot: &GuardSlot,
    src: &AtomicMarkedPtr<T, N>,
) -> MarkedPtr<T, N> {
    let mut marked = src.load(Ordering::Relaxed);
    loop {
        slot.set(marked.decompose_ptr() as *mut (), Ordering::SeqCst);

        let reloaded = src.load(Ordering::Acquire);
        if reloaded == marked {
            return marked;
        }

        marked = reloaded;
    }
}

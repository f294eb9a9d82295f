//! Hazard pointer slots, i.e. pointers visible to all threads that are
//! protected from reclamation.
//!
//! Each thread record holds a fixed number of [`GuardSlot`]s. Only the thread
//! owning the record ever writes to its slots, whereas any thread may read
//! them while scanning for protected records.

use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, Ordering};

#[cfg(not(feature = "std"))]
use alloc::{boxed::Box, vec::Vec};

use crate::error::AllocError;

////////////////////////////////////////////////////////////////////////////////////////////////////
// GuardSlot
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A single hazard pointer.
///
/// A `null` value means the slot currently protects nothing.
#[derive(Debug, Default)]
pub struct GuardSlot {
    protected: AtomicPtr<()>,
}

/********** impl inherent *************************************************************************/

impl GuardSlot {
    /// Creates a new empty slot.
    #[inline]
    pub const fn new() -> Self {
        Self { protected: AtomicPtr::new(ptr::null_mut()) }
    }

    /// Gets the protected pointer, if there is one.
    #[inline]
    pub fn protected(&self, order: Ordering) -> Option<Protected> {
        NonNull::new(self.protected.load(order)).map(Protected)
    }

    /// Stores `ptr` in the slot, marking it as protected (or clearing the
    /// slot if `ptr` is null).
    #[inline]
    pub fn set(&self, ptr: *mut (), order: Ordering) {
        self.protected.store(ptr, order);
    }

    /// Clears the slot.
    #[inline]
    pub fn clear(&self, order: Ordering) {
        self.protected.store(ptr::null_mut(), order);
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// GuardSlots
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The fixed-size array of hazard pointers belonging to one thread record.
#[derive(Debug)]
pub(crate) struct GuardSlots(Box<[GuardSlot]>);

/********** impl inherent *************************************************************************/

impl GuardSlots {
    /// Allocates `count` empty slots.
    #[inline]
    pub fn try_new(count: usize) -> Result<Self, AllocError> {
        let mut slots = Vec::new();
        slots.try_reserve_exact(count).map_err(|_| AllocError)?;
        slots.extend((0..count).map(|_| GuardSlot::new()));

        Ok(Self(slots.into_boxed_slice()))
    }

    /// Returns the number of slots.
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns the slot at `idx`.
    #[inline]
    pub fn get(&self, idx: usize) -> &GuardSlot {
        &self.0[idx]
    }

    /// Returns an iterator over all slots.
    #[inline]
    pub fn iter(&self) -> core::slice::Iter<'_, GuardSlot> {
        self.0.iter()
    }

    /// Clears every slot.
    #[inline]
    pub fn clear_all(&self, order: Ordering) {
        for slot in self.iter() {
            slot.clear(order);
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Protected
////////////////////////////////////////////////////////////////////////////////////////////////////

/// An untyped pointer protected from reclamation, because it is stored within
/// a hazard pointer.
///
/// The type information is stripped as it is not needed in order to determine
/// whether a pointer is protected or not.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Protected(NonNull<()>);

/********** impl inherent *************************************************************************/

impl Protected {
    /// Gets the memory address of the protected pointer.
    #[inline]
    pub fn address(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// Gets the internal non-nullable pointer.
    #[inline]
    pub fn into_inner(self) -> NonNull<()> {
        self.0
    }
}

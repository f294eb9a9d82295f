//! The global registry of thread records.
//!
//! Records are prepended to a lock-free singly linked list and are never
//! unlinked or deallocated while the owning [`Smr`][crate::Smr] is alive.
//! Threads that detach only give up ownership of their record, which may then
//! be reused by the next thread that attaches.

use core::cell::UnsafeCell;
use core::iter::FusedIterator;
use core::num::NonZeroUsize;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

#[cfg(not(feature = "std"))]
use alloc::boxed::Box;

use log::{debug, warn};

use crate::align::CachePadded;
use crate::config::Config;
use crate::error::AllocError;
use crate::hazard::GuardSlots;
use crate::retired::RetiredList;

/// The value of a record's owner field, when it is not owned by any thread.
const NO_OWNER: usize = 0;

////////////////////////////////////////////////////////////////////////////////////////////////////
// OwnerId
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A token identifying one attachment of a thread to an `Smr` instance.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub(crate) struct OwnerId(NonZeroUsize);

impl OwnerId {
    #[inline]
    fn into_usize(self) -> usize {
        self.0.get()
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// ThreadRecord
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The shared state of one attached (or previously attached) thread.
#[derive(Debug)]
pub(crate) struct ThreadRecord {
    guards: GuardSlots,
    retired: UnsafeCell<RetiredList>,
    owner: AtomicUsize,
    /// Set once a helping thread has adopted the record's retired records.
    free: AtomicBool,
    next: AtomicPtr<ThreadRecord>,
}

// the retired list is only ever accessed by the thread currently owning the
// record, ownership transfer is synchronized through the `owner` field
unsafe impl Send for ThreadRecord {}
unsafe impl Sync for ThreadRecord {}

/********** impl inherent *************************************************************************/

impl ThreadRecord {
    #[inline]
    fn try_new(config: &Config, owner: OwnerId) -> Result<Box<Self>, AllocError> {
        let guards = GuardSlots::try_new(config.hazard_ptrs())?;
        let retired = RetiredList::try_with_capacity(config.retired_capacity())?;

        Ok(Box::new(Self {
            guards,
            retired: UnsafeCell::new(retired),
            owner: AtomicUsize::new(owner.into_usize()),
            free: AtomicBool::new(false),
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }

    /// Returns the record's hazard pointers.
    #[inline]
    pub fn guards(&self) -> &GuardSlots {
        &self.guards
    }

    /// Returns a mutable reference to the record's retired list.
    ///
    /// # Safety
    ///
    /// The caller must own the record (or have exclusive access to the
    /// registry) and must not create a second reference to the list while the
    /// returned one is alive.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn retired_mut(&self) -> &mut RetiredList {
        &mut *self.retired.get()
    }

    /// Returns `true` if the record is currently owned by any thread.
    #[inline]
    pub fn is_owned(&self) -> bool {
        self.owner.load(Ordering::Relaxed) != NO_OWNER
    }

    /// Returns `true` if the record is currently owned by `owner`.
    #[inline]
    pub fn is_owned_by(&self, owner: OwnerId) -> bool {
        self.owner.load(Ordering::Relaxed) == owner.into_usize()
    }

    /// Attempts to take ownership of an unowned record.
    #[inline]
    pub fn try_claim(&self, owner: OwnerId) -> bool {
        self.owner
            .compare_exchange(NO_OWNER, owner.into_usize(), Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Gives up ownership of the record.
    #[inline]
    pub fn release(&self) {
        self.owner.store(NO_OWNER, Ordering::Release);
    }

    /// Returns `true` if the record's retired records have been adopted by a
    /// helping thread since it was last released.
    #[inline]
    pub fn is_free(&self) -> bool {
        self.free.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_free(&self, free: bool) {
        self.free.store(free, Ordering::Release);
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Registry
////////////////////////////////////////////////////////////////////////////////////////////////////

/// An append-only lock-free list of all thread records of one instance.
#[derive(Debug)]
pub(crate) struct Registry {
    head: CachePadded<AtomicPtr<ThreadRecord>>,
    count: AtomicUsize,
    next_owner: AtomicUsize,
}

/********** impl inherent *************************************************************************/

impl Registry {
    /// Creates a new empty registry.
    #[inline]
    pub const fn new() -> Self {
        Self {
            head: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            count: AtomicUsize::new(0),
            next_owner: AtomicUsize::new(1),
        }
    }

    /// Returns the number of allocated thread records.
    #[inline]
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Creates a new unique owner token.
    #[inline]
    pub fn mint_owner(&self) -> OwnerId {
        let id = self.next_owner.fetch_add(1, Ordering::Relaxed);
        OwnerId(NonZeroUsize::new(id).unwrap_or_else(|| panic!("owner token overflow")))
    }

    /// Returns an iterator over all thread records.
    #[inline]
    pub fn iter(&self) -> Iter<'_> {
        Iter { curr: unsafe { self.head.load(Ordering::Acquire).as_ref() } }
    }

    /// Takes ownership of an unowned record or allocates and appends a new one
    /// if there is none.
    #[inline]
    pub fn acquire(&self, config: &Config, owner: OwnerId) -> Result<&ThreadRecord, AllocError> {
        for record in self.iter() {
            if record.try_claim(owner) {
                record.set_free(false);
                debug!("reusing thread record {:p}", record);
                return Ok(record);
            }
        }

        let record = Box::into_raw(ThreadRecord::try_new(config, owner)?);
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            unsafe { (*record).next.store(head, Ordering::Relaxed) };
            let res =
                self.head.compare_exchange_weak(head, record, Ordering::Release, Ordering::Relaxed);
            match res {
                Ok(_) => break,
                Err(actual) => head = actual,
            }
        }

        let count = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("allocated thread record {:p} ({} total)", record, count);
        if count > config.max_threads() {
            warn!(
                "number of thread records ({}) exceeds the configured maximum ({})",
                count,
                config.max_threads()
            );
        }

        Ok(unsafe { &*record })
    }
}

/********** impl Drop *****************************************************************************/

impl Drop for Registry {
    #[inline]
    fn drop(&mut self) {
        let mut curr = *self.head.get_mut();
        while !curr.is_null() {
            let record = unsafe { Box::from_raw(curr) };
            curr = record.next.load(Ordering::Relaxed);
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Iter
////////////////////////////////////////////////////////////////////////////////////////////////////

/// An iterator over all records of a [`Registry`].
#[derive(Debug)]
pub(crate) struct Iter<'a> {
    curr: Option<&'a ThreadRecord>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a ThreadRecord;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        self.curr.take().map(|record| {
            self.curr = unsafe { record.next.load(Ordering::Acquire).as_ref() };
            record
        })
    }
}

impl<'a> FusedIterator for Iter<'a> {}

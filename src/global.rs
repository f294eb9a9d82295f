//! A process-wide [`Smr`] instance with implicit thread-local attachment.
//!
//! The instance has to be created with [`construct`] before any thread can
//! [`attach_thread`]. Attached threads are detached automatically when they
//! exit, unless the instance they were attached to has been destructed in the
//! meantime.
//!
//! # Examples
//!
//! ```
//! use std::sync::atomic::{AtomicPtr, Ordering};
//!
//! use hpsmr::{global, Config, Unlinked};
//!
//! global::construct(Config::default());
//! global::attach_thread().unwrap();
//!
//! let src = AtomicPtr::new(Box::into_raw(Box::new(1)));
//! global::with_thread(|thread| {
//!     let mut guard = thread.guard().unwrap();
//!     let ptr = guard.protect(&src);
//!     assert_eq!(unsafe { *ptr }, 1);
//! })
//! .unwrap();
//!
//! let unlinked = src.swap(std::ptr::null_mut(), Ordering::AcqRel);
//! global::retire(unsafe { Unlinked::from_raw(unlinked).unwrap() }).unwrap();
//! global::detach_thread();
//! ```

use std::cell::RefCell;
use std::mem::ManuallyDrop;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use log::{debug, warn};

use crate::config::Config;
use crate::error::{Error, NotAttached, NotInitialized};
use crate::retired::Unlinked;
use crate::smr::{Smr, ThreadHandle};

static INSTANCE: AtomicPtr<Smr> = AtomicPtr::new(ptr::null_mut());
/// Incremented by every destruction, invalidating all existing attachments.
static GENERATION: AtomicUsize = AtomicUsize::new(0);

thread_local!(static LOCAL: RefCell<Option<LocalHandle>> = RefCell::new(None));

////////////////////////////////////////////////////////////////////////////////////////////////////
// LocalHandle
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The attachment of the current thread to the global instance of one
/// generation.
struct LocalHandle {
    generation: usize,
    handle: ManuallyDrop<ThreadHandle<'static>>,
}

impl LocalHandle {
    #[inline]
    fn is_current(&self) -> bool {
        !INSTANCE.load(Ordering::Acquire).is_null()
            && GENERATION.load(Ordering::Acquire) == self.generation
    }
}

impl Drop for LocalHandle {
    #[inline]
    fn drop(&mut self) {
        // the handle of a destructed instance refers to freed memory
        if self.is_current() {
            unsafe { ManuallyDrop::drop(&mut self.handle) };
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// instance management
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Creates the global instance, if it does not already exist.
///
/// Returns `true` if this call created the instance and `false` if it had
/// already been constructed before, in which case `config` is ignored.
pub fn construct(config: Config) -> bool {
    if !INSTANCE.load(Ordering::Acquire).is_null() {
        return false;
    }

    let smr = Box::into_raw(Box::new(Smr::new(config)));
    match INSTANCE.compare_exchange(ptr::null_mut(), smr, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => {
            debug!("constructed global reclamation instance ({:?})", config);
            true
        }
        Err(_) => {
            unsafe { drop(Box::from_raw(smr)) };
            false
        }
    }
}

/// Destroys the global instance and reclaims all records still retired.
///
/// If `force_detach_all` is `true`, all threads still attached are detached
/// first, otherwise their attachment is silently invalidated.
/// The attachment of the calling thread is always detached properly.
/// Does nothing if there is no instance.
///
/// # Safety
///
/// No other thread may use the instance (e.g. hold a guard or call any
/// function of this module) while or after it is destructed, until it is
/// constructed anew. Any guard still held by another thread becomes dangling.
pub unsafe fn destruct(force_detach_all: bool) {
    if INSTANCE.load(Ordering::Acquire).is_null() {
        return;
    }

    detach_thread();

    let smr = INSTANCE.swap(ptr::null_mut(), Ordering::AcqRel);
    if smr.is_null() {
        return;
    }

    GENERATION.fetch_add(1, Ordering::AcqRel);

    let mut smr = Box::from_raw(smr);
    if force_detach_all {
        smr.detach_all();
    } else if smr.attached_thread_count() > 0 {
        warn!("destructing global reclamation instance with threads still attached");
    }

    drop(smr);
    debug!("destructed global reclamation instance");
}

/// Returns a reference to the global instance.
///
/// # Errors
///
/// Fails, if the instance has not been constructed.
#[inline]
pub fn instance() -> Result<&'static Smr, NotInitialized> {
    unsafe { INSTANCE.load(Ordering::Acquire).as_ref() }.ok_or(NotInitialized)
}

/// Returns `true` if the global instance currently exists.
#[inline]
pub fn is_constructed() -> bool {
    !INSTANCE.load(Ordering::Acquire).is_null()
}

/// Checks whether an algorithm requiring `count` simultaneous hazard
/// pointers per thread can be used with the global instance.
#[inline]
pub fn check_available_guards(count: usize) -> Result<(), Error> {
    instance()?.check_available_guards(count)?;
    Ok(())
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// thread attachment
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Attaches the current thread to the global instance, if it is not already
/// attached.
///
/// # Errors
///
/// Fails, if the instance has not been constructed or a thread record can not
/// be allocated.
pub fn attach_thread() -> Result<(), Error> {
    LOCAL.try_with(|local| {
        let mut local = local.borrow_mut();
        if local.as_ref().map_or(false, LocalHandle::is_current) {
            return Ok(());
        }

        let generation = GENERATION.load(Ordering::Acquire);
        let handle = instance()?.attach()?;
        // replacing an outdated attachment does not touch its instance
        *local = Some(LocalHandle { generation, handle: ManuallyDrop::new(handle) });
        Ok(())
    })
    .unwrap_or(Err(Error::NotAttached))
}

/// Detaches the current thread from the global instance, if it is attached.
pub fn detach_thread() {
    // the borrow must end before the handle is dropped, since reclaim
    // functions may call back into this module
    let local = LOCAL.try_with(|local| local.borrow_mut().take()).ok().flatten();
    drop(local);
}

/// Returns `true` if the current thread is attached to the current global
/// instance.
#[inline]
pub fn is_attached() -> bool {
    LOCAL
        .try_with(|local| local.borrow().as_ref().map_or(false, LocalHandle::is_current))
        .unwrap_or(false)
}

/// Calls `f` with the current thread's handle.
///
/// `f` must not attach or detach the current thread.
///
/// # Errors
///
/// Fails without calling `f`, if the current thread is not attached.
#[inline]
pub fn with_thread<R>(f: impl FnOnce(&ThreadHandle<'static>) -> R) -> Result<R, NotAttached> {
    LOCAL
        .try_with(|local| match &*local.borrow() {
            Some(local) if local.is_current() => Ok(f(&*local.handle)),
            _ => Err(NotAttached),
        })
        .unwrap_or(Err(NotAttached))
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// forwarding functions
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Retires `unlinked` through the current thread's handle.
///
/// # Errors
///
/// Fails, if the current thread is not attached, in which case the record is
/// leaked.
#[inline]
pub fn retire<T: Send + 'static>(unlinked: Unlinked<T>) -> Result<(), NotAttached> {
    with_thread(|thread| thread.retire(unlinked))
}

/// Scans the current thread's retired list.
///
/// # Errors
///
/// Fails, if the current thread is not attached or the scan buffer can not be
/// allocated.
#[inline]
pub fn scan() -> Result<usize, Error> {
    Ok(with_thread(ThreadHandle::scan)??)
}

/// Scans the current thread's retired list and adopts the records of detached
/// threads.
///
/// # Errors
///
/// Fails, if the current thread is not attached.
#[inline]
pub fn force_dispose() -> Result<usize, NotAttached> {
    with_thread(ThreadHandle::force_dispose)
}

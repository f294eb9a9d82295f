//! The explicit reclamation context and the per-thread handles attached to it.

use core::cell::Cell;
use core::fmt;
use core::mem;
use core::ptr::NonNull;
use core::sync::atomic::Ordering;

use log::debug;

use crate::config::{Config, ScanMode};
use crate::error::{AllocError, GuardsExhausted, TooFewHazardPtrs};
use crate::guard::{Guard, GuardArray, LocalGuards};
use crate::registry::{OwnerId, Registry, ThreadRecord};
use crate::retired::{Retired, RetiredList, Unlinked};
use crate::scan;

////////////////////////////////////////////////////////////////////////////////////////////////////
// Smr
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A hazard pointer based memory reclamation context.
///
/// Threads have to [`attach`][Smr::attach] to an instance before they can
/// protect or retire records. Multiple independent instances may coexist,
/// records retired through one instance are only protected by guards of the
/// same instance.
///
/// Dropping an instance reclaims all records that are still retired.
pub struct Smr {
    config: Config,
    registry: Registry,
}

/********** impl inherent *************************************************************************/

impl Smr {
    /// Creates a new instance with the given `config`.
    #[inline]
    pub const fn new(config: Config) -> Self {
        Self { config, registry: Registry::new() }
    }

    /// Returns the configuration of the instance.
    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the number of hazard pointers per thread.
    #[inline]
    pub fn hazard_ptr_count(&self) -> usize {
        self.config.hazard_ptrs()
    }

    /// Returns the configured maximum number of attached threads.
    #[inline]
    pub fn max_thread_count(&self) -> usize {
        self.config.max_threads()
    }

    /// Returns the capacity of every thread's retired list.
    #[inline]
    pub fn max_retired_ptr_count(&self) -> usize {
        self.config.retired_capacity()
    }

    /// Returns the configured scan algorithm.
    #[inline]
    pub fn scan_mode(&self) -> ScanMode {
        self.config.mode()
    }

    /// Returns the number of thread records allocated so far.
    #[inline]
    pub fn thread_record_count(&self) -> usize {
        self.registry.len()
    }

    /// Returns the number of thread records currently owned by an attached
    /// thread.
    #[inline]
    pub fn attached_thread_count(&self) -> usize {
        self.registry.iter().filter(|record| record.is_owned()).count()
    }

    /// Attaches the calling thread, either reusing an unowned thread record or
    /// allocating a new one.
    ///
    /// # Errors
    ///
    /// Fails, if memory for a new record can not be allocated.
    #[inline]
    pub fn attach(&self) -> Result<ThreadHandle<'_>, AllocError> {
        let owner = self.registry.mint_owner();
        let record = self.registry.acquire(&self.config, owner)?;
        let local = match LocalGuards::try_new(record.guards().len()) {
            Ok(local) => local,
            Err(err) => {
                record.release();
                return Err(err);
            }
        };

        Ok(ThreadHandle { smr: self, record, owner, local, scanning: Cell::new(false) })
    }

    /// Checks whether an algorithm requiring `count` simultaneous hazard
    /// pointers per thread can be used with this instance.
    #[inline]
    pub fn check_available_guards(&self, count: usize) -> Result<(), TooFewHazardPtrs> {
        let available = self.config.hazard_ptrs();
        if count > available {
            Err(TooFewHazardPtrs { requested: count, available })
        } else {
            Ok(())
        }
    }

    /// Forcibly detaches all threads that are still attached, e.g. because
    /// their handles were leaked.
    ///
    /// Their guards are cleared and their retired lists scanned once, but no
    /// help scan runs. Records that are still protected by a guard of a record
    /// visited later remain retired, they are reclaimed when the instance is
    /// dropped unless a later help scan or attaching thread picks them up.
    pub fn detach_all(&mut self) {
        for record in self.registry.iter().filter(|record| record.is_owned()) {
            record.guards().clear_all(Ordering::Release);
            // exclusive access to the registry
            let retired = unsafe { record.retired_mut() };
            scan::scan(&self.registry, self.config.mode(), self.config.hazard_ptrs(), retired);
            record.release();
        }
    }
}

/********** impl Default **************************************************************************/

impl Default for Smr {
    #[inline]
    fn default() -> Self {
        Self::new(Config::default())
    }
}

/********** impl Debug ****************************************************************************/

impl fmt::Debug for Smr {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Smr")
            .field("config", &self.config)
            .field("thread_records", &self.registry.len())
            .finish()
    }
}

/********** impl Drop *****************************************************************************/

impl Drop for Smr {
    fn drop(&mut self) {
        self.detach_all();

        debug_assert!(
            self.registry.iter().all(|record| record
                .guards()
                .iter()
                .all(|slot| slot.protected(Ordering::Relaxed).is_none())),
            "hazard pointers still set while dropping the reclamation context"
        );

        let mut reclaimed = 0;
        for record in self.registry.iter() {
            reclaimed += unsafe { record.retired_mut().reclaim_all() };
        }

        debug!("dropped reclamation context, reclaimed {} remaining records", reclaimed);
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// ThreadHandle
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The attachment of a thread to an [`Smr`] instance, owning one thread
/// record.
///
/// A handle can be sent to another thread but not shared between threads.
/// Dropping it detaches the thread, after attempting to reclaim its own and
/// any abandoned retired records.
pub struct ThreadHandle<'s> {
    smr: &'s Smr,
    record: &'s ThreadRecord,
    owner: OwnerId,
    local: LocalGuards,
    scanning: Cell<bool>,
}

/********** impl inherent *************************************************************************/

impl<'s> ThreadHandle<'s> {
    /// Returns the instance the handle is attached to.
    #[inline]
    pub fn smr(&self) -> &'s Smr {
        self.smr
    }

    /// Allocates a single hazard pointer.
    ///
    /// # Errors
    ///
    /// Fails, if all of the thread's hazard pointers are in use.
    #[inline]
    pub fn guard(&self) -> Result<Guard<'_>, GuardsExhausted> {
        Guard::try_new(self.record.guards(), &self.local)
    }

    /// Allocates `N` hazard pointers at once.
    ///
    /// # Errors
    ///
    /// Fails without allocating any of them, if fewer than `N` are available.
    #[inline]
    pub fn guard_array<const N: usize>(&self) -> Result<GuardArray<'_, N>, GuardsExhausted> {
        GuardArray::try_new(self.record.guards(), &self.local)
    }

    /// Returns the number of hazard pointers not allocated to any guard.
    #[inline]
    pub fn available_guards(&self) -> usize {
        self.local.available()
    }

    /// Returns the number of records retired by this thread (or adopted from
    /// other threads) that are not yet reclaimed.
    #[inline]
    pub fn retired_count(&self) -> usize {
        unsafe { self.record.retired_mut() }.len()
    }

    /// Retires an unlinked record, which is dropped as a `Box<T>` once no
    /// hazard pointer protects it any longer.
    ///
    /// The record may be dropped by any thread attached to the same instance.
    ///
    /// # Panics
    ///
    /// Panics if called from within a reclaim function run by a scan of this
    /// handle, or if the retired list is full and none of its records can be
    /// reclaimed.
    #[inline]
    pub fn retire<T: Send + 'static>(&self, unlinked: Unlinked<T>) {
        self.retire_record(Unlinked::into_retired(unlinked));
    }

    /// Retires an unlinked record of a type that may contain non-`'static`
    /// references or may not be [`Send`].
    ///
    /// # Safety
    ///
    /// The record's [`Drop`] implementation is run at an arbitrary later time
    /// on an arbitrary thread and must not access any reference that may have
    /// expired by then.
    #[inline]
    pub unsafe fn retire_unchecked<T>(&self, unlinked: Unlinked<T>) {
        self.retire_record(Unlinked::into_retired(unlinked));
    }

    /// Retires a raw record with a custom reclaim function.
    ///
    /// # Safety
    ///
    /// The caller has to ensure that `ptr` has been unlinked, is retired only
    /// once, and that calling `reclaim` with it is sound at any later time
    /// and from any thread. `reclaim` must not panic.
    #[inline]
    pub unsafe fn retire_raw<T>(&self, ptr: NonNull<T>, reclaim: unsafe fn(*mut T)) {
        self.retire_record(Retired::new(ptr, reclaim));
    }

    /// Scans the thread's retired list and reclaims all records not protected
    /// by any hazard pointer.
    ///
    /// Returns the number of reclaimed records.
    ///
    /// # Errors
    ///
    /// Fails, if the classic scan's buffer can not be allocated.
    #[inline]
    pub fn scan(&self) -> Result<usize, AllocError> {
        let (smr, hazard_ptrs) = (self.smr, self.smr.config.hazard_ptrs());
        self.while_scanning(|retired| {
            scan::try_scan(&smr.registry, smr.config.mode(), hazard_ptrs, retired)
        })
    }

    /// Adopts the retired records of all threads that detached without
    /// being able to reclaim them and scans them.
    ///
    /// Returns the number of reclaimed records.
    #[inline]
    pub fn help_scan(&self) -> usize {
        let (smr, record, owner) = (self.smr, self.record, self.owner);
        self.while_scanning(|retired| {
            scan::help_scan(
                &smr.registry,
                smr.config.mode(),
                smr.config.hazard_ptrs(),
                record,
                owner,
                retired,
            )
        })
    }

    /// Reclaims as many records as possible by scanning the own retired list
    /// and then helping abandoned ones.
    #[inline]
    pub fn force_dispose(&self) -> usize {
        self.scan_internal() + self.help_scan()
    }

    /// Detaches the thread, equivalent to dropping the handle.
    #[inline]
    pub fn detach(self) {
        mem::drop(self);
    }

    #[inline]
    fn retire_record(&self, retired: Retired) {
        assert!(!self.scanning.get(), "retire called from within a reclaim function");

        if unsafe { self.record.retired_mut() }.is_full() {
            self.scan_internal();
        }

        let list = unsafe { self.record.retired_mut() };
        if list.push(retired).is_err() {
            panic!(
                "retired list capacity ({}) exhausted, all retired records are still protected",
                list.capacity()
            );
        }

        if list.is_full() {
            self.scan_internal();
        }
    }

    #[inline]
    fn scan_internal(&self) -> usize {
        let smr = self.smr;
        self.while_scanning(|retired| {
            scan::scan(&smr.registry, smr.config.mode(), smr.config.hazard_ptrs(), retired)
        })
    }

    /// Runs `f` with the thread's retired list and flags the handle as scanning
    /// in the meantime.
    #[inline]
    fn while_scanning<R>(&self, f: impl FnOnce(&mut RetiredList) -> R) -> R {
        assert!(!self.scanning.replace(true), "scan called from within a reclaim function");
        let res = f(unsafe { self.record.retired_mut() });
        self.scanning.set(false);
        res
    }
}

/********** impl Debug ****************************************************************************/

impl fmt::Debug for ThreadHandle<'_> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ThreadHandle")
            .field("record", &(self.record as *const ThreadRecord))
            .field("available_guards", &self.available_guards())
            .field("retired", &self.retired_count())
            .finish()
    }
}

/********** impl Drop *****************************************************************************/

impl Drop for ThreadHandle<'_> {
    #[inline]
    fn drop(&mut self) {
        if self.scanning.get() {
            // unwinding out of a reclaim function, leave the records for others
            self.record.guards().clear_all(Ordering::Release);
            self.record.release();
            return;
        }

        self.record.guards().clear_all(Ordering::Release);
        self.scan_internal();
        self.help_scan();
        self.record.release();
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::ptr::NonNull;
    use std::sync::atomic::{AtomicPtr, Ordering};

    use matches::assert_matches;

    use crate::config::{Config, ScanMode};
    use crate::error::{AllocError, GuardsExhausted, TooFewHazardPtrs};
    use crate::retired::Unlinked;

    use super::Smr;

    thread_local!(static DROPPED: Cell<usize> = Cell::new(0));

    struct DropCount(#[allow(dead_code)] u64);

    impl Drop for DropCount {
        fn drop(&mut self) {
            DROPPED.with(|dropped| dropped.set(dropped.get() + 1));
        }
    }

    fn dropped() -> usize {
        DROPPED.with(|dropped| dropped.get())
    }

    fn unlinked(value: u64) -> Unlinked<DropCount> {
        unsafe { Unlinked::from_raw(Box::into_raw(Box::new(DropCount(value)))).unwrap() }
    }

    fn small() -> Config {
        Config::new().hazard_ptr_count(2).max_thread_count(2).max_retired_ptr_count(8)
    }

    #[test]
    fn accessors() {
        let smr = Smr::new(small().scan_mode(ScanMode::Classic));
        assert_eq!(smr.hazard_ptr_count(), 2);
        assert_eq!(smr.max_thread_count(), 2);
        assert_eq!(smr.max_retired_ptr_count(), 8);
        assert_eq!(smr.scan_mode(), ScanMode::Classic);
        assert_eq!(smr.thread_record_count(), 0);

        assert_matches!(smr.check_available_guards(2), Ok(()));
        assert_matches!(
            smr.check_available_guards(3),
            Err(TooFewHazardPtrs { requested: 3, available: 2 })
        );
    }

    #[test]
    fn oversized_config_fails_attach() {
        let smr = Smr::new(Config::new().hazard_ptr_count(2).max_thread_count(usize::max_value()));
        assert_matches!(smr.attach(), Err(AllocError));
        assert_eq!(smr.thread_record_count(), 0);
    }

    #[test]
    fn guards_exhausted() {
        let smr = Smr::new(small());
        let handle = smr.attach().unwrap();
        assert_eq!(handle.available_guards(), 2);

        let array = handle.guard_array::<2>().unwrap();
        assert_matches!(handle.guard(), Err(GuardsExhausted));
        drop(array);

        let _guard = handle.guard().unwrap();
        assert_eq!(handle.available_guards(), 1);
        assert_matches!(handle.guard_array::<2>(), Err(GuardsExhausted));
    }

    #[test]
    fn retire_and_scan() {
        let smr = Smr::new(small());
        let handle = smr.attach().unwrap();

        let before = dropped();
        handle.retire(unlinked(1));
        handle.retire(unlinked(2));
        assert_eq!(handle.retired_count(), 2);
        assert_eq!(dropped(), before);

        assert_eq!(handle.scan(), Ok(2));
        assert_eq!(handle.retired_count(), 0);
        assert_eq!(dropped() - before, 2);
    }

    #[test]
    fn protected_survives_scan() {
        for &mode in &[ScanMode::Classic, ScanMode::Inplace] {
            let smr = Smr::new(small().scan_mode(mode));
            let handle = smr.attach().unwrap();

            let raw = Box::into_raw(Box::new(DropCount(1)));
            let src = AtomicPtr::new(raw);

            let mut guard = handle.guard().unwrap();
            assert_eq!(guard.protect(&src), raw);

            src.store(std::ptr::null_mut(), Ordering::Release);
            handle.retire(unsafe { Unlinked::from_raw(raw).unwrap() });

            let before = dropped();
            assert_eq!(handle.scan(), Ok(0));
            assert_eq!(dropped(), before);

            guard.clear();
            assert_eq!(handle.scan(), Ok(1));
            assert_eq!(dropped() - before, 1);
        }
    }

    #[test]
    fn full_list_triggers_scan() {
        let smr = Smr::new(small());
        let handle = smr.attach().unwrap();

        let before = dropped();
        for value in 0..8 {
            handle.retire(unlinked(value));
        }

        // the eighth retirement filled the list and triggered a scan
        assert_eq!(handle.retired_count(), 0);
        assert_eq!(dropped() - before, 8);
    }

    #[test]
    fn retire_raw() {
        thread_local!(static RAW: Cell<usize> = Cell::new(0));

        unsafe fn reclaim(ptr: *mut u32) {
            RAW.with(|raw| raw.set(raw.get() + 1));
            drop(Box::from_raw(ptr));
        }

        let smr = Smr::default();
        let handle = smr.attach().unwrap();
        let ptr = NonNull::from(Box::leak(Box::new(5u32)));
        unsafe { handle.retire_raw(ptr, reclaim) };
        assert_eq!(handle.force_dispose(), 1);
        assert_eq!(RAW.with(|raw| raw.get()), 1);
    }

    #[test]
    fn reuse_record_after_detach() {
        let smr = Smr::new(small());
        let first = smr.attach().unwrap();
        first.detach();
        assert_eq!(smr.thread_record_count(), 1);
        assert_eq!(smr.attached_thread_count(), 0);

        let second = smr.attach().unwrap();
        assert_eq!(smr.thread_record_count(), 1);
        let third = smr.attach().unwrap();
        assert_eq!(smr.thread_record_count(), 2);
        assert_eq!(smr.attached_thread_count(), 2);

        drop((second, third));
    }

    #[test]
    fn detach_all_leaves_records_for_drop() {
        let before = dropped();
        {
            let mut smr = Smr::new(small());
            // records are prepended, so the retiring record is visited first
            let protecting = smr.attach().unwrap();
            let retiring = smr.attach().unwrap();

            let raw = Box::into_raw(Box::new(DropCount(0)));
            let mut guard = protecting.guard().unwrap();
            guard.assign(raw);
            retiring.retire(unsafe { Unlinked::from_raw(raw).unwrap() });

            std::mem::forget(guard);
            std::mem::forget(protecting);
            std::mem::forget(retiring);

            smr.detach_all();
            assert_eq!(smr.attached_thread_count(), 0);
            assert_eq!(dropped(), before);
        }

        assert_eq!(dropped() - before, 1);
    }

    #[test]
    fn drop_reclaims_remaining() {
        let before = dropped();
        {
            let mut smr = Smr::new(small());
            let handle = smr.attach().unwrap();
            let raw = Box::into_raw(Box::new(DropCount(0)));
            let src = AtomicPtr::new(raw);
            let mut guard = handle.guard().unwrap();
            guard.protect(&src);
            handle.retire(unsafe { Unlinked::from_raw(raw).unwrap() });

            // the leaked handle keeps its guard and its retired record
            std::mem::forget(guard);
            std::mem::forget(handle);
            assert_eq!(dropped(), before);

            smr.detach_all();
        }

        assert_eq!(dropped() - before, 1);
    }
}

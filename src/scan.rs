//! The reclamation algorithms.
//!
//! Every scan first issues a sequentially consistent fence and then reads all
//! hazard pointers of all thread records with acquire loads. Any retired
//! record, whose address is not found among them, can no longer be reached by
//! any thread and is reclaimed. Retired records are never dereferenced.

use core::ptr;
use core::sync::atomic::{self, Ordering};

#[cfg(not(feature = "std"))]
use alloc::vec::Vec;

use log::{debug, trace, warn};

use crate::config::ScanMode;
use crate::error::AllocError;
use crate::registry::{OwnerId, Registry, ThreadRecord};
use crate::retired::RetiredList;

/// Runs the scan algorithm selected by `mode` and returns the number of
/// reclaimed records.
///
/// Fails only if the buffer for the classic scan can not be allocated.
#[inline]
pub(crate) fn try_scan(
    registry: &Registry,
    mode: ScanMode,
    hazard_ptrs: usize,
    retired: &mut RetiredList,
) -> Result<usize, AllocError> {
    if retired.is_empty() {
        return Ok(0);
    }

    match mode {
        ScanMode::Classic => classic_scan(registry, hazard_ptrs, retired),
        ScanMode::Inplace => match inplace_scan(registry, retired) {
            Some(reclaimed) => Ok(reclaimed),
            None => classic_scan(registry, hazard_ptrs, retired),
        },
    }
}

/// Runs the scan algorithm selected by `mode`, falling back to an
/// allocation-free linear scan if the classic scan's buffer can not be
/// allocated.
#[inline]
pub(crate) fn scan(
    registry: &Registry,
    mode: ScanMode,
    hazard_ptrs: usize,
    retired: &mut RetiredList,
) -> usize {
    try_scan(registry, mode, hazard_ptrs, retired).unwrap_or_else(|_| {
        warn!("failed to allocate scan buffer, falling back to linear scan");
        linear_scan(registry, retired)
    })
}

/// Collects all hazard pointers into a sorted buffer and reclaims every
/// retired record not found in it, preserving the order of the kept ones.
pub(crate) fn classic_scan(
    registry: &Registry,
    hazard_ptrs: usize,
    retired: &mut RetiredList,
) -> Result<usize, AllocError> {
    let mut protected = Vec::new();
    let expected = registry.len().saturating_mul(hazard_ptrs);
    protected.try_reserve_exact(expected).map_err(|_| AllocError)?;

    atomic::fence(Ordering::SeqCst);
    for record in registry.iter() {
        for slot in record.guards().iter() {
            if let Some(hazard) = slot.protected(Ordering::Acquire) {
                // records appended after the length was read
                if protected.len() == protected.capacity() {
                    protected.try_reserve(hazard_ptrs).map_err(|_| AllocError)?;
                }

                protected.push(hazard.address());
            }
        }
    }

    protected.sort_unstable();
    let reclaimed = unsafe {
        retired.reclaim_unless(|retired| protected.binary_search(&retired.address()).is_ok())
    };

    trace!("classic scan: reclaimed {}, kept {}", reclaimed, retired.len());
    Ok(reclaimed)
}

/// Sorts the retired records by address, marks every protected one in place
/// and reclaims all unmarked ones.
///
/// Returns [`None`] without modifying the list if any retired address has its
/// least significant bit set, since that bit is required for marking.
pub(crate) fn inplace_scan(registry: &Registry, retired: &mut RetiredList) -> Option<usize> {
    if retired.iter().any(|retired| retired.tagged().is_marked()) {
        debug!("retired record with odd address, falling back to classic scan");
        return None;
    }

    let entries = retired.as_mut_slice();
    entries.sort_unstable();
    debug_assert!(
        entries.windows(2).all(|pair| pair[0].address() != pair[1].address()),
        "the same record has been retired more than once"
    );

    atomic::fence(Ordering::SeqCst);
    for record in registry.iter() {
        for slot in record.guards().iter() {
            if let Some(hazard) = slot.protected(Ordering::Acquire) {
                let address = hazard.address();
                let found = entries
                    .binary_search_by(|retired| retired.tagged().unmarked_address().cmp(&address));
                if let Ok(idx) = found {
                    let tagged = entries[idx].tagged_mut();
                    if !tagged.is_marked() {
                        tagged.mark();
                    }
                }
            }
        }
    }

    let reclaimed = unsafe {
        retired.reclaim_unless(|retired| {
            let tagged = retired.tagged_mut();
            if tagged.is_marked() {
                tagged.unmark();
                true
            } else {
                false
            }
        })
    };

    trace!("in-place scan: reclaimed {}, kept {}", reclaimed, retired.len());
    Some(reclaimed)
}

/// Checks every retired record against every hazard pointer without any
/// auxiliary memory.
pub(crate) fn linear_scan(registry: &Registry, retired: &mut RetiredList) -> usize {
    atomic::fence(Ordering::SeqCst);
    let reclaimed = unsafe {
        retired.reclaim_unless(|retired| {
            let address = retired.address();
            registry.iter().any(|record| {
                record
                    .guards()
                    .iter()
                    .filter_map(|slot| slot.protected(Ordering::Acquire))
                    .any(|hazard| hazard.address() == address)
            })
        })
    };

    trace!("linear scan: reclaimed {}, kept {}", reclaimed, retired.len());
    reclaimed
}

/// Adopts the retired records of all abandoned thread records into `retired`,
/// the list of `own`, and scans it.
///
/// Returns the total number of records reclaimed by all scans.
///
/// # Panics
///
/// Panics if an adopted record does not fit into `retired` even after it has
/// been scanned, i.e. if more records are protected than its capacity.
pub(crate) fn help_scan(
    registry: &Registry,
    mode: ScanMode,
    hazard_ptrs: usize,
    own: &ThreadRecord,
    owner: OwnerId,
    retired: &mut RetiredList,
) -> usize {
    debug_assert!(own.is_owned_by(owner), "help scan by a thread not owning its record");

    let mut reclaimed = 0;
    for record in registry.iter() {
        if ptr::eq(record, own) || record.is_free() || !record.try_claim(owner) {
            continue;
        }

        let src = unsafe { record.retired_mut() };
        let adopted = src.len();
        for entry in src.drain() {
            if let Err(entry) = retired.push(entry) {
                reclaimed += scan(registry, mode, hazard_ptrs, retired);
                if retired.push(entry).is_err() {
                    panic!(
                        "retired list capacity ({}) exceeded while adopting records",
                        retired.capacity()
                    );
                }
            }
        }

        record.set_free(true);
        record.release();

        if adopted > 0 {
            debug!("adopted {} retired records from thread record {:p}", adopted, record);
        }
    }

    reclaimed + scan(registry, mode, hazard_ptrs, retired)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::ptr::{self, NonNull};
    use std::sync::atomic::Ordering;

    use crate::align::Aligned2;
    use crate::config::{Config, ScanMode};
    use crate::registry::Registry;
    use crate::retired::{Retired, RetiredList};

    thread_local!(static RECLAIMED: RefCell<Vec<usize>> = RefCell::new(Vec::new()));

    unsafe fn record_reclaim(ptr: *mut Aligned2<u8>) {
        RECLAIMED.with(|reclaimed| reclaimed.borrow_mut().push(ptr as usize));
        drop(Box::from_raw(ptr));
    }

    unsafe fn record_only(ptr: *mut u8) {
        RECLAIMED.with(|reclaimed| reclaimed.borrow_mut().push(ptr as usize));
    }

    fn take_reclaimed() -> Vec<usize> {
        RECLAIMED.with(|reclaimed| reclaimed.replace(Vec::new()))
    }

    fn alloc() -> NonNull<Aligned2<u8>> {
        NonNull::from(Box::leak(Box::new(Aligned2::new(0))))
    }

    fn fill(list: &mut RetiredList, ptrs: &[NonNull<Aligned2<u8>>]) {
        for &ptr in ptrs {
            list.push(unsafe { Retired::new(ptr, record_reclaim) }).unwrap();
        }
    }

    fn addresses(list: &RetiredList) -> Vec<usize> {
        list.iter().map(Retired::address).collect()
    }

    fn config() -> Config {
        Config::new().hazard_ptr_count(4).max_thread_count(2)
    }

    #[test]
    fn classic_keeps_protected_in_order() {
        let config = config();
        let registry = Registry::new();
        let owner = registry.mint_owner();
        let record = registry.acquire(&config, owner).unwrap();

        let ptrs: Vec<_> = (0..4).map(|_| alloc()).collect();
        let mut list = RetiredList::try_with_capacity(8).unwrap();
        fill(&mut list, &ptrs);

        record.guards().get(0).set(ptrs[3].as_ptr().cast(), Ordering::SeqCst);
        record.guards().get(1).set(ptrs[1].as_ptr().cast(), Ordering::SeqCst);

        take_reclaimed();
        let reclaimed = super::classic_scan(&registry, 4, &mut list).unwrap();
        assert_eq!(reclaimed, 2);
        assert_eq!(addresses(&list), vec![ptrs[1].as_ptr() as usize, ptrs[3].as_ptr() as usize]);

        let mut freed = take_reclaimed();
        freed.sort();
        let mut expected = vec![ptrs[0].as_ptr() as usize, ptrs[2].as_ptr() as usize];
        expected.sort();
        assert_eq!(freed, expected);

        record.guards().clear_all(Ordering::Release);
        assert_eq!(super::classic_scan(&registry, 4, &mut list).unwrap(), 2);
        assert!(list.is_empty());
    }

    #[test]
    fn inplace_keeps_protected() {
        let config = config();
        let registry = Registry::new();
        let owner = registry.mint_owner();
        let record = registry.acquire(&config, owner).unwrap();

        let ptrs: Vec<_> = (0..5).map(|_| alloc()).collect();
        let mut list = RetiredList::try_with_capacity(8).unwrap();
        fill(&mut list, &ptrs);

        record.guards().get(2).set(ptrs[0].as_ptr().cast(), Ordering::SeqCst);
        record.guards().get(3).set(ptrs[4].as_ptr().cast(), Ordering::SeqCst);

        take_reclaimed();
        assert_eq!(super::inplace_scan(&registry, &mut list), Some(3));
        assert_eq!(take_reclaimed().len(), 3);

        let mut kept = addresses(&list);
        kept.sort();
        let mut expected = vec![ptrs[0].as_ptr() as usize, ptrs[4].as_ptr() as usize];
        expected.sort();
        assert_eq!(kept, expected);
        // marks are cleared again
        assert!(list.iter().all(|retired| !retired.tagged().is_marked()));

        record.guards().clear_all(Ordering::Release);
        assert_eq!(super::inplace_scan(&registry, &mut list), Some(2));
        assert!(list.is_empty());
    }

    #[test]
    fn inplace_falls_back_on_odd_address() {
        static BYTES: [u8; 2] = [0; 2];

        let config = config();
        let registry = Registry::new();
        let owner = registry.mint_owner();
        let record = registry.acquire(&config, owner).unwrap();

        let odd = if BYTES.as_ptr() as usize % 2 == 1 { &BYTES[0] } else { &BYTES[1] };
        let odd = NonNull::from(odd);
        let even = alloc();

        let mut list = RetiredList::try_with_capacity(4).unwrap();
        list.push(unsafe { Retired::new(odd, record_only) }).unwrap();
        fill(&mut list, &[even]);

        assert_eq!(super::inplace_scan(&registry, &mut list), None);
        assert_eq!(list.len(), 2);

        record.guards().get(0).set(odd.as_ptr().cast(), Ordering::SeqCst);
        take_reclaimed();
        let reclaimed = super::try_scan(&registry, ScanMode::Inplace, 4, &mut list).unwrap();
        assert_eq!(reclaimed, 1);
        assert_eq!(take_reclaimed(), vec![even.as_ptr() as usize]);
        assert_eq!(addresses(&list), vec![odd.as_ptr() as usize]);

        record.guards().clear_all(Ordering::Release);
        assert_eq!(super::scan(&registry, ScanMode::Inplace, 4, &mut list), 1);
        assert_eq!(take_reclaimed(), vec![odd.as_ptr() as usize]);
    }

    #[test]
    fn linear_scan() {
        let config = config();
        let registry = Registry::new();
        let owner = registry.mint_owner();
        let record = registry.acquire(&config, owner).unwrap();

        let ptrs: Vec<_> = (0..3).map(|_| alloc()).collect();
        let mut list = RetiredList::try_with_capacity(4).unwrap();
        fill(&mut list, &ptrs);
        record.guards().get(0).set(ptrs[1].as_ptr().cast(), Ordering::SeqCst);

        assert_eq!(super::linear_scan(&registry, &mut list), 2);
        assert_eq!(addresses(&list), vec![ptrs[1].as_ptr() as usize]);

        record.guards().clear_all(Ordering::Release);
        assert_eq!(super::linear_scan(&registry, &mut list), 1);
    }

    #[test]
    fn help_scan_adopts_abandoned() {
        let config = config();
        let registry = Registry::new();
        let helper = registry.mint_owner();
        let own = registry.acquire(&config, helper).unwrap();

        let abandoned_owner = registry.mint_owner();
        let abandoned = registry.acquire(&config, abandoned_owner).unwrap();
        // protected by some third thread, acquired before the release so the
        // abandoned record is not reused for it
        let other_owner = registry.mint_owner();
        let other = registry.acquire(&config, other_owner).unwrap();
        assert!(!ptr::eq(other, abandoned));
        assert_eq!(registry.len(), 3);

        let ptrs: Vec<_> = (0..3).map(|_| alloc()).collect();
        fill(unsafe { abandoned.retired_mut() }, &ptrs);
        abandoned.release();
        other.guards().get(0).set(ptrs[2].as_ptr().cast(), Ordering::SeqCst);

        let retired = unsafe { own.retired_mut() };
        let reclaimed =
            super::help_scan(&registry, ScanMode::Inplace, 4, own, helper, &mut *retired);
        assert_eq!(reclaimed, 2);
        assert_eq!(addresses(retired), vec![ptrs[2].as_ptr() as usize]);

        assert!(unsafe { abandoned.retired_mut() }.is_empty());
        assert!(abandoned.is_free());
        assert!(!abandoned.is_owned());
        // owned records are left alone
        assert!(other.is_owned_by(other_owner));

        other.guards().clear_all(Ordering::Release);
        assert_eq!(super::scan(&registry, ScanMode::Classic, 4, retired), 1);
    }
}

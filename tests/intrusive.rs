//! Protecting records of an intrusive list, whose links point to an embedded
//! field rather than to the start of the record.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use memoffset::offset_of;

use hpsmr::{AtomicMarkedPtr, Config, MarkedPtr, Smr, Unlinked};
use hpsmr::typenum::U1;

static PROJECTED_DROPS: AtomicUsize = AtomicUsize::new(0);
static MARKED_DROPS: AtomicUsize = AtomicUsize::new(0);

#[derive(Default)]
struct Link {
    next: AtomicPtr<Link>,
}

#[repr(align(8))]
struct Entry {
    drops: &'static AtomicUsize,
    link: Link,
}

impl Drop for Entry {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::Relaxed);
    }
}

impl Entry {
    fn alloc(drops: &'static AtomicUsize) -> *mut Entry {
        Box::into_raw(Box::new(Entry { drops, link: Link::default() }))
    }

    fn link(entry: *mut Entry) -> *mut Link {
        unsafe { &mut (*entry).link as *mut Link }
    }

    fn from_link(link: *mut Link) -> *const Entry {
        (link as usize - offset_of!(Entry, link)) as *const Entry
    }
}

#[test]
fn protect_projected_record() {
    let smr = Smr::new(Config::new().hazard_ptr_count(2));
    let reader = smr.attach().unwrap();
    let writer = smr.attach().unwrap();

    let entry = Entry::alloc(&PROJECTED_DROPS);
    let head = AtomicPtr::new(Entry::link(entry));

    let mut guard = reader.guard().unwrap();
    let link = guard.protect_with(&head, Entry::from_link);
    assert_eq!(link, Entry::link(entry));
    assert_eq!(guard.get(), entry as *mut ());

    head.store(ptr::null_mut(), Ordering::Release);
    let before = PROJECTED_DROPS.load(Ordering::Relaxed);
    writer.retire(unsafe { Unlinked::from_raw(entry).unwrap() });

    assert_eq!(writer.scan(), Ok(0));
    assert_eq!(PROJECTED_DROPS.load(Ordering::Relaxed), before);

    // projection is skipped for null links
    assert!(guard.protect_with(&head, Entry::from_link).is_null());
    assert!(guard.get().is_null());

    assert_eq!(writer.scan(), Ok(1));
    assert_eq!(PROJECTED_DROPS.load(Ordering::Relaxed), before + 1);
}

#[test]
fn protect_marked_link() {
    let smr = Smr::new(Config::new().hazard_ptr_count(1));
    let reader = smr.attach().unwrap();
    let writer = smr.attach().unwrap();
    assert!(smr.check_available_guards(2).is_err());

    let entry = Entry::alloc(&MARKED_DROPS);
    // logically deleted, but not yet unlinked
    let head = AtomicMarkedPtr::<Entry, U1>::new(MarkedPtr::compose(entry, 1));

    let mut guard = reader.guard().unwrap();
    let marked = guard.protect_marked(&head);
    assert_eq!(marked.decompose(), (entry, 1));
    assert_eq!(guard.get(), entry as *mut ());

    head.store(MarkedPtr::null(), Ordering::Release);
    let before = MARKED_DROPS.load(Ordering::Relaxed);
    writer.retire(unsafe { Unlinked::from_raw(entry).unwrap() });
    assert_eq!(writer.scan(), Ok(0));

    drop(guard);
    assert_eq!(writer.scan(), Ok(1));
    assert_eq!(MARKED_DROPS.load(Ordering::Relaxed), before + 1);
}

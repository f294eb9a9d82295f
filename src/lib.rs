//! Hazard pointer based safe memory reclamation for lock-free data structures.
//!
//! Lock-free data structures can not immediately deallocate records they have
//! unlinked, since concurrent readers may still hold references to them. With
//! hazard pointers, every reader publishes the addresses of the records it is
//! about to access in one of its thread's hazard pointers (through a
//! [`Guard`]). Unlinked records are *retired* instead of deallocated and
//! cached in a per-thread list, which is periodically *scanned*: any retired
//! record whose address is not published by any thread is reclaimed.
//!
//! # Usage
//!
//! Threads attach to an explicit [`Smr`] context (or to the process-wide
//! instance in the `global` module), which gives them a [`ThreadHandle`] for
//! allocating guards and retiring records:
//!
//! ```
//! use std::sync::atomic::{AtomicPtr, Ordering};
//!
//! use hpsmr::{Config, Smr, Unlinked};
//!
//! let smr = Smr::new(Config::default());
//! let thread = smr.attach().unwrap();
//!
//! let shared = AtomicPtr::new(Box::into_raw(Box::new(1)));
//!
//! let mut guard = thread.guard().unwrap();
//! let protected = guard.protect(&shared);
//! // protected until the guard is cleared or dropped
//! assert_eq!(unsafe { *protected }, 1);
//!
//! let unlinked = shared.swap(Box::into_raw(Box::new(2)), Ordering::AcqRel);
//! thread.retire(unsafe { Unlinked::from_raw(unlinked).unwrap() });
//! assert_eq!(thread.scan(), Ok(0));
//!
//! drop(guard);
//! assert_eq!(thread.scan(), Ok(1));
//! # unsafe { drop(Box::from_raw(shared.into_inner())) };
//! ```
//!
//! # Features
//!
//! The `std` feature (enabled by default) provides the `global` module and
//! [`std::error::Error`] implementations for all error types. Without it, the
//! crate only depends on `core` and `alloc`.
//!
//! The default number of hazard pointers per thread (8) and the default
//! maximum number of threads (100) can be set at build time through the
//! `HPSMR_HAZARD_PTR_COUNT` and `HPSMR_MAX_THREAD_COUNT` environment
//! variables.

#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_docs)]

#[cfg(not(feature = "std"))]
extern crate alloc;

pub use typenum;

use cfg_if::cfg_if;

mod align;
mod config;
mod error;
mod guard;
mod hazard;
mod pointer;
mod registry;
mod retired;
mod scan;
mod smr;

pub use crate::config::{Config, ScanMode};
pub use crate::error::{
    AllocError, Error, GuardsExhausted, NotAttached, NotInitialized, TooFewHazardPtrs,
};
pub use crate::guard::{Guard, GuardArray};
pub use crate::pointer::{AtomicMarkedPtr, MarkedPtr};
pub use crate::retired::Unlinked;
pub use crate::smr::{Smr, ThreadHandle};

cfg_if! {
    if #[cfg(feature = "std")] {
        pub mod global;
    }
}

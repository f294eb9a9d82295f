//! Error types for recoverable failures.
//!
//! Violations of the reclamation invariants (e.g. retiring the same record
//! twice) are defects and are not represented here.

use core::fmt;

////////////////////////////////////////////////////////////////////////////////////////////////////
// TooFewHazardPtrs
////////////////////////////////////////////////////////////////////////////////////////////////////

/// An error type indicating that an algorithm requires more hazard pointers
/// per thread than the instance was configured with.
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TooFewHazardPtrs {
    /// The number of simultaneously required hazard pointers.
    pub requested: usize,
    /// The configured number of hazard pointers per thread.
    pub available: usize,
}

impl fmt::Display for TooFewHazardPtrs {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "too few hazard pointers (requested {}, configured {})",
            self.requested, self.available
        )
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// GuardsExhausted
////////////////////////////////////////////////////////////////////////////////////////////////////

/// An error type indicating that all guard slots of the current thread are
/// already in use.
#[derive(Copy, Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct GuardsExhausted;

impl fmt::Display for GuardsExhausted {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "all hazard pointers of the current thread are in use")
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// AllocError
////////////////////////////////////////////////////////////////////////////////////////////////////

/// An error type indicating that memory for a thread record or a scan buffer
/// could not be allocated.
#[derive(Copy, Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct AllocError;

impl fmt::Display for AllocError {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "memory allocation failed")
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// NotInitialized
////////////////////////////////////////////////////////////////////////////////////////////////////

/// An error type indicating that the global instance has not been constructed
/// (or has already been destructed).
#[derive(Copy, Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NotInitialized;

impl fmt::Display for NotInitialized {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "the global hazard pointer instance is not initialized")
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// NotAttached
////////////////////////////////////////////////////////////////////////////////////////////////////

/// An error type indicating that the current thread is not attached to the
/// global instance.
#[derive(Copy, Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NotAttached;

impl fmt::Display for NotAttached {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "the current thread is not attached")
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Error
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The union of all recoverable error conditions.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum Error {
    /// See [`TooFewHazardPtrs`].
    TooFewHazardPtrs(TooFewHazardPtrs),
    /// See [`GuardsExhausted`].
    GuardsExhausted,
    /// See [`AllocError`].
    Alloc,
    /// See [`NotInitialized`].
    NotInitialized,
    /// See [`NotAttached`].
    NotAttached,
}

impl fmt::Display for Error {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::TooFewHazardPtrs(ref err) => fmt::Display::fmt(err, f),
            Error::GuardsExhausted => fmt::Display::fmt(&GuardsExhausted, f),
            Error::Alloc => fmt::Display::fmt(&AllocError, f),
            Error::NotInitialized => fmt::Display::fmt(&NotInitialized, f),
            Error::NotAttached => fmt::Display::fmt(&NotAttached, f),
        }
    }
}

impl From<TooFewHazardPtrs> for Error {
    #[inline]
    fn from(err: TooFewHazardPtrs) -> Self {
        Error::TooFewHazardPtrs(err)
    }
}

impl From<GuardsExhausted> for Error {
    #[inline]
    fn from(_: GuardsExhausted) -> Self {
        Error::GuardsExhausted
    }
}

impl From<AllocError> for Error {
    #[inline]
    fn from(_: AllocError) -> Self {
        Error::Alloc
    }
}

impl From<NotInitialized> for Error {
    #[inline]
    fn from(_: NotInitialized) -> Self {
        Error::NotInitialized
    }
}

impl From<NotAttached> for Error {
    #[inline]
    fn from(_: NotAttached) -> Self {
        Error::NotAttached
    }
}

#[cfg(feature = "std")]
mod std_impls {
    use std::error;

    use super::*;

    impl error::Error for TooFewHazardPtrs {}
    impl error::Error for GuardsExhausted {}
    impl error::Error for AllocError {}
    impl error::Error for NotInitialized {}
    impl error::Error for NotAttached {}
    impl error::Error for Error {}
}

//! Construction parameters of an [`Smr`][crate::Smr] instance.
//!
//! All capacities are fixed for the lifetime of an instance. The defaults for
//! the hazard pointer count and the maximum thread count are determined at
//! build time and can be overridden with the `HPSMR_HAZARD_PTR_COUNT` and
//! `HPSMR_MAX_THREAD_COUNT` environment variables.

use core::fmt;

include!(concat!(env!("OUT_DIR"), "/build_constants.rs"));

////////////////////////////////////////////////////////////////////////////////////////////////////
// ScanMode
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The algorithm used for deciding which retired records can be reclaimed.
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ScanMode {
    /// Collects all hazard pointers into a temporary sorted buffer and checks
    /// each retired record against it.
    Classic,
    /// Sorts the retired records themselves and marks protected ones in place,
    /// without allocating.
    ///
    /// Requires the least significant bit of every retired address to be
    /// unset and falls back to [`Classic`][ScanMode::Classic] otherwise.
    Inplace,
}

/********** impl Default **************************************************************************/

impl Default for ScanMode {
    #[inline]
    fn default() -> Self {
        ScanMode::Inplace
    }
}

/********** impl Display **************************************************************************/

impl fmt::Display for ScanMode {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ScanMode::Classic => write!(f, "classic"),
            ScanMode::Inplace => write!(f, "inplace"),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Config
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The configuration of an [`Smr`][crate::Smr] instance.
///
/// A value of zero for any of the counts selects the respective default.
/// The retired record capacity is raised to twice the product of hazard
/// pointer count and maximum thread count, if the requested capacity is below
/// that product.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Config {
    hazard_ptr_count: usize,
    max_thread_count: usize,
    max_retired_ptr_count: usize,
    scan_mode: ScanMode,
}

/********** impl inherent *************************************************************************/

impl Config {
    /// The default number of hazard pointers per thread.
    pub const DEFAULT_HAZARD_PTR_COUNT: usize = DEFAULT_HAZARD_PTR_COUNT;
    /// The default maximum number of concurrently attached threads.
    pub const DEFAULT_MAX_THREAD_COUNT: usize = DEFAULT_MAX_THREAD_COUNT;

    /// Creates a new [`Config`] with all default values.
    #[inline]
    pub const fn new() -> Self {
        Self {
            hazard_ptr_count: DEFAULT_HAZARD_PTR_COUNT,
            max_thread_count: DEFAULT_MAX_THREAD_COUNT,
            max_retired_ptr_count: 0,
            scan_mode: ScanMode::Inplace,
        }
    }

    /// Sets the number of hazard pointers each thread can hold simultaneously.
    #[inline]
    pub fn hazard_ptr_count(mut self, count: usize) -> Self {
        self.hazard_ptr_count = if count == 0 { DEFAULT_HAZARD_PTR_COUNT } else { count };
        self
    }

    /// Sets the maximum number of threads expected to be attached at the same
    /// time.
    #[inline]
    pub fn max_thread_count(mut self, count: usize) -> Self {
        self.max_thread_count = if count == 0 { DEFAULT_MAX_THREAD_COUNT } else { count };
        self
    }

    /// Sets the requested capacity of each thread's retired record list.
    #[inline]
    pub fn max_retired_ptr_count(mut self, count: usize) -> Self {
        self.max_retired_ptr_count = count;
        self
    }

    /// Sets the scan algorithm.
    #[inline]
    pub fn scan_mode(mut self, mode: ScanMode) -> Self {
        self.scan_mode = mode;
        self
    }

    /// Returns the number of hazard pointers per thread.
    #[inline]
    pub fn hazard_ptrs(&self) -> usize {
        self.hazard_ptr_count
    }

    /// Returns the maximum number of concurrently attached threads.
    #[inline]
    pub fn max_threads(&self) -> usize {
        self.max_thread_count
    }

    /// Returns the effective capacity of each thread's retired record list.
    #[inline]
    pub fn retired_capacity(&self) -> usize {
        // saturates, an unreachable capacity fails the record allocation
        let min = self.hazard_ptr_count.saturating_mul(self.max_thread_count);
        if self.max_retired_ptr_count < min {
            min.saturating_mul(2)
        } else {
            self.max_retired_ptr_count
        }
    }

    /// Returns the configured scan algorithm.
    #[inline]
    pub fn mode(&self) -> ScanMode {
        self.scan_mode
    }
}

/********** impl Default **************************************************************************/

impl Default for Config {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, ScanMode};

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.hazard_ptrs(), Config::DEFAULT_HAZARD_PTR_COUNT);
        assert_eq!(config.max_threads(), Config::DEFAULT_MAX_THREAD_COUNT);
        assert_eq!(
            config.retired_capacity(),
            2 * Config::DEFAULT_HAZARD_PTR_COUNT * Config::DEFAULT_MAX_THREAD_COUNT
        );
        assert_eq!(config.mode(), ScanMode::Inplace);
    }

    #[test]
    fn zero_selects_default() {
        let config = Config::new().hazard_ptr_count(0).max_thread_count(0);
        assert_eq!(config, Config::default());
    }

    #[test]
    fn retired_capacity() {
        let config = Config::new().hazard_ptr_count(4).max_thread_count(10);
        assert_eq!(config.retired_capacity(), 80);

        let config = config.max_retired_ptr_count(39);
        assert_eq!(config.retired_capacity(), 80);

        let config = config.max_retired_ptr_count(40);
        assert_eq!(config.retired_capacity(), 40);

        let config = config.max_retired_ptr_count(1000);
        assert_eq!(config.retired_capacity(), 1000);
    }

    #[test]
    fn retired_capacity_saturates() {
        let config = Config::new().hazard_ptr_count(usize::max_value() / 2).max_thread_count(4);
        assert_eq!(config.retired_capacity(), usize::max_value());

        let config = Config::new().hazard_ptr_count(usize::max_value()).max_thread_count(1);
        assert_eq!(config.retired_capacity(), usize::max_value());
    }

    #[test]
    fn scan_mode_display() {
        assert_eq!(format!("{}", ScanMode::Classic), "classic");
        assert_eq!(format!("{}", ScanMode::Inplace), "inplace");
    }
}

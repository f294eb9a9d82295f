//! Raw pointers carrying a tag in their unused lower bits.
//!
//! Lock-free containers frequently store flags (e.g. a logical deletion mark)
//! in the links between their nodes. A hazard pointer must always hold the
//! *untagged* address of the node, so guards provide a dedicated
//! [`protect_marked`][crate::Guard::protect_marked] operation for loading from
//! an [`AtomicMarkedPtr`].

use core::cmp;
use core::fmt;
use core::marker::PhantomData;
use core::mem;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, Ordering};

use typenum::Unsigned;

////////////////////////////////////////////////////////////////////////////////////////////////////
// MarkedPtr
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A raw, unsafe pointer type like `*mut T` in which up to `N` of the pointer's
/// lower bits can be used to store additional information (the *tag*).
///
/// The upper bound for `N` is dictated by the alignment of `T`, e.g. a type
/// with an alignment of `8` can have up to `3` mark bits.
pub struct MarkedPtr<T, N> {
    inner: *mut T,
    _marker: PhantomData<N>,
}

/********** impl Clone & Copy *********************************************************************/

impl<T, N> Clone for MarkedPtr<T, N> {
    #[inline]
    fn clone(&self) -> Self {
        Self::new(self.inner)
    }
}

impl<T, N> Copy for MarkedPtr<T, N> {}

/********** impl inherent (const) *****************************************************************/

impl<T, N> MarkedPtr<T, N> {
    /// Creates an unmarked pointer.
    #[inline]
    pub const fn new(ptr: *mut T) -> Self {
        Self { inner: ptr, _marker: PhantomData }
    }

    /// Creates a new & unmarked `null` pointer.
    #[inline]
    pub const fn null() -> Self {
        Self::new(ptr::null_mut())
    }
}

/********** impl inherent *************************************************************************/

impl<T, N: Unsigned> MarkedPtr<T, N> {
    /// The number of available mark bits for this type.
    pub const MARK_BITS: usize = N::USIZE;
    /// The bitmask for the lower markable bits.
    pub const MARK_MASK: usize = mark_mask(N::USIZE);
    /// The bitmask for the higher pointer bits.
    pub const POINTER_MASK: usize = !Self::MARK_MASK;

    /// Composes a new marked pointer from a raw unmarked pointer and a tag
    /// value.
    ///
    /// Tag bits exceeding the mark bits are truncated.
    #[inline]
    pub fn compose(ptr: *mut T, tag: usize) -> Self {
        debug_assert!(
            lower_bits::<T>() >= N::USIZE,
            "type alignment is insufficient for the number of mark bits"
        );
        debug_assert_eq!(0, ptr as usize & Self::MARK_MASK, "pointer must be properly aligned");
        Self::new((ptr as usize | (tag & Self::MARK_MASK)) as *mut _)
    }

    /// Returns the numeric representation of the pointer with its tag.
    #[inline]
    pub fn into_usize(self) -> usize {
        self.inner as usize
    }

    /// Returns the inner pointer *as is*, meaning potential tags are not
    /// stripped.
    #[inline]
    pub fn into_ptr(self) -> *mut T {
        self.inner
    }

    /// Clears the tag of `self` and returns the same but untagged pointer.
    #[inline]
    pub fn clear_tag(self) -> Self {
        Self::new(self.decompose_ptr())
    }

    /// Clears the tag of `self` and replaces it with `tag`.
    #[inline]
    pub fn with_tag(self, tag: usize) -> Self {
        Self::compose(self.decompose_ptr(), tag)
    }

    /// Decomposes the marked pointer, returning the separated raw pointer and
    /// its tag.
    #[inline]
    pub fn decompose(self) -> (*mut T, usize) {
        (self.decompose_ptr(), self.decompose_tag())
    }

    /// Decomposes the marked pointer, returning only the separated raw pointer.
    #[inline]
    pub fn decompose_ptr(self) -> *mut T {
        (self.into_usize() & Self::POINTER_MASK) as *mut _
    }

    /// Decomposes the marked pointer, returning only the separated tag.
    #[inline]
    pub fn decompose_tag(self) -> usize {
        self.into_usize() & Self::MARK_MASK
    }

    /// Decomposes the marked pointer, returning the untagged pointer as a
    /// [`NonNull`] or [`None`] if it is null.
    #[inline]
    pub fn decompose_non_null(self) -> Option<NonNull<T>> {
        NonNull::new(self.decompose_ptr())
    }

    /// Decomposes the marked pointer, returning an optional reference and the
    /// separated tag.
    ///
    /// # Safety
    ///
    /// The pointer must either be null or point to a live value, which is
    /// typically ensured by protecting it with a [`Guard`][crate::Guard].
    /// The lifetime `'a` is chosen arbitrarily by the caller.
    #[inline]
    pub unsafe fn decompose_ref<'a>(self) -> (Option<&'a T>, usize) {
        let (ptr, tag) = self.decompose();
        (ptr.as_ref(), tag)
    }

    /// Decomposes the marked pointer, returning an optional reference and
    /// discarding the tag.
    ///
    /// # Safety
    ///
    /// The same caveats as with [`decompose_ref`][MarkedPtr::decompose_ref]
    /// apply for this method as well.
    #[inline]
    pub unsafe fn as_ref<'a>(self) -> Option<&'a T> {
        self.decompose_ptr().as_ref()
    }

    /// Returns true if the pointer is `null` (regardless of the tag).
    #[inline]
    pub fn is_null(self) -> bool {
        self.decompose_ptr().is_null()
    }
}

/********** impl Default **************************************************************************/

impl<T, N> Default for MarkedPtr<T, N> {
    #[inline]
    fn default() -> Self {
        Self::null()
    }
}

/********** impl Debug & Pointer ******************************************************************/

impl<T, N: Unsigned> fmt::Debug for MarkedPtr<T, N> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let (ptr, tag) = self.decompose();
        f.debug_struct("MarkedPtr").field("ptr", &ptr).field("tag", &tag).finish()
    }
}

impl<T, N: Unsigned> fmt::Pointer for MarkedPtr<T, N> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Pointer::fmt(&self.decompose_ptr(), f)
    }
}

/********** impl From *****************************************************************************/

impl<T, N> From<*mut T> for MarkedPtr<T, N> {
    #[inline]
    fn from(ptr: *mut T) -> Self {
        Self::new(ptr)
    }
}

impl<T, N> From<NonNull<T>> for MarkedPtr<T, N> {
    #[inline]
    fn from(ptr: NonNull<T>) -> Self {
        Self::new(ptr.as_ptr())
    }
}

impl<T, N: Unsigned> From<(*mut T, usize)> for MarkedPtr<T, N> {
    #[inline]
    fn from(pair: (*mut T, usize)) -> Self {
        let (ptr, tag) = pair;
        Self::compose(ptr, tag)
    }
}

/********** impl PartialEq & PartialOrd ***********************************************************/

impl<T, N> PartialEq for MarkedPtr<T, N> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.inner == other.inner
    }
}

impl<T, N> Eq for MarkedPtr<T, N> {}

impl<T, N> PartialOrd for MarkedPtr<T, N> {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        self.inner.partial_cmp(&other.inner)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// AtomicMarkedPtr
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A raw pointer type which can be safely shared between threads and which
/// can store additional information in its lower (unused) bits.
///
/// This type has the same in-memory representation as a `*mut T`. It is
/// mostly identical to [`AtomicPtr`], except that all of its methods involve
/// a [`MarkedPtr`] instead of `*mut T`.
pub struct AtomicMarkedPtr<T, N> {
    inner: AtomicPtr<T>,
    _marker: PhantomData<N>,
}

unsafe impl<T, N> Send for AtomicMarkedPtr<T, N> {}
unsafe impl<T, N> Sync for AtomicMarkedPtr<T, N> {}

/********** impl inherent (const) *****************************************************************/

impl<T, N> AtomicMarkedPtr<T, N> {
    /// Creates a new `AtomicMarkedPtr`.
    #[inline]
    pub const fn new(ptr: MarkedPtr<T, N>) -> Self {
        Self { inner: AtomicPtr::new(ptr.inner), _marker: PhantomData }
    }

    /// Creates a new & unmarked `null` pointer.
    #[inline]
    pub const fn null() -> Self {
        Self::new(MarkedPtr::null())
    }
}

/********** impl inherent *************************************************************************/

impl<T, N: Unsigned> AtomicMarkedPtr<T, N> {
    /// Consumes `self` and returns the inner [`MarkedPtr`].
    #[inline]
    pub fn into_inner(self) -> MarkedPtr<T, N> {
        MarkedPtr::new(self.inner.into_inner())
    }

    /// Loads a value from the pointer.
    ///
    /// # Panics
    ///
    /// Panics if `order` is [`Release`][Ordering::Release] or
    /// [`AcqRel`][Ordering::AcqRel].
    #[inline]
    pub fn load(&self, order: Ordering) -> MarkedPtr<T, N> {
        MarkedPtr::new(self.inner.load(order))
    }

    /// Stores a value into the pointer.
    ///
    /// # Panics
    ///
    /// Panics if `order` is [`Acquire`][Ordering::Acquire] or
    /// [`AcqRel`][Ordering::AcqRel].
    #[inline]
    pub fn store(&self, ptr: MarkedPtr<T, N>, order: Ordering) {
        self.inner.store(ptr.inner, order);
    }

    /// Stores a value into the pointer, returning the previous value.
    #[inline]
    pub fn swap(&self, ptr: MarkedPtr<T, N>, order: Ordering) -> MarkedPtr<T, N> {
        MarkedPtr::new(self.inner.swap(ptr.inner, order))
    }

    /// Stores `new` into the pointer if the current value is the same as
    /// `current` (including the tag).
    #[inline]
    pub fn compare_exchange(
        &self,
        current: MarkedPtr<T, N>,
        new: MarkedPtr<T, N>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<MarkedPtr<T, N>, MarkedPtr<T, N>> {
        self.inner
            .compare_exchange(current.inner, new.inner, success, failure)
            .map(MarkedPtr::new)
            .map_err(MarkedPtr::new)
    }

    /// Stores `new` into the pointer if the current value is the same as
    /// `current`, but is allowed to fail spuriously.
    #[inline]
    pub fn compare_exchange_weak(
        &self,
        current: MarkedPtr<T, N>,
        new: MarkedPtr<T, N>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<MarkedPtr<T, N>, MarkedPtr<T, N>> {
        self.inner
            .compare_exchange_weak(current.inner, new.inner, success, failure)
            .map(MarkedPtr::new)
            .map_err(MarkedPtr::new)
    }

    /// Sets the bits of `tag` in the current tag and returns the previous
    /// value.
    ///
    /// Bits of `tag` exceeding the mark bits are ignored, the pointer itself
    /// never changes.
    #[inline]
    pub fn fetch_or(&self, tag: usize, order: Ordering) -> MarkedPtr<T, N> {
        let tag = tag & MarkedPtr::<T, N>::MARK_MASK;
        let mut current = self.inner.load(Ordering::Relaxed);
        loop {
            let new = (current as usize | tag) as *mut T;
            match self.inner.compare_exchange_weak(current, new, order, load_ordering(order)) {
                Ok(prev) => return MarkedPtr::new(prev),
                Err(actual) => current = actual,
            }
        }
    }

    /// Clears all tag bits not set in `tag` and returns the previous value.
    ///
    /// The pointer itself never changes.
    #[inline]
    pub fn fetch_and(&self, tag: usize, order: Ordering) -> MarkedPtr<T, N> {
        let mask = tag | MarkedPtr::<T, N>::POINTER_MASK;
        let mut current = self.inner.load(Ordering::Relaxed);
        loop {
            let new = (current as usize & mask) as *mut T;
            match self.inner.compare_exchange_weak(current, new, order, load_ordering(order)) {
                Ok(prev) => return MarkedPtr::new(prev),
                Err(actual) => current = actual,
            }
        }
    }
}

/********** impl Default **************************************************************************/

impl<T, N> Default for AtomicMarkedPtr<T, N> {
    #[inline]
    fn default() -> Self {
        Self::null()
    }
}

/********** impl Debug ****************************************************************************/

impl<T, N: Unsigned> fmt::Debug for AtomicMarkedPtr<T, N> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let (ptr, tag) = self.load(Ordering::SeqCst).decompose();
        f.debug_struct("AtomicMarkedPtr").field("ptr", &ptr).field("tag", &tag).finish()
    }
}

/********** impl From *****************************************************************************/

impl<T, N> From<MarkedPtr<T, N>> for AtomicMarkedPtr<T, N> {
    #[inline]
    fn from(ptr: MarkedPtr<T, N>) -> Self {
        Self::new(ptr)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// helper functions
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Gets the number of unused (markable) lower bits in a pointer for type `T`.
#[inline]
const fn lower_bits<T>() -> usize {
    mem::align_of::<T>().trailing_zeros() as usize
}

/// Gets the bitmask for `mark_bits` lower bits.
#[inline]
const fn mark_mask(mark_bits: usize) -> usize {
    (1 << mark_bits) - 1
}

/// Derives the failure ordering of a compare-exchange from its success
/// ordering.
#[inline]
fn load_ordering(order: Ordering) -> Ordering {
    match order {
        Ordering::Release | Ordering::Relaxed => Ordering::Relaxed,
        Ordering::SeqCst => Ordering::SeqCst,
        _ => Ordering::Acquire,
    }
}

#[cfg(test)]
mod tests {
    use core::ptr;
    use core::sync::atomic::Ordering;

    use matches::assert_matches;
    use typenum::{U0, U1, U2, U3};

    use crate::align::{Aligned4, Aligned8};

    type MarkedPtr<T, N> = super::MarkedPtr<T, N>;
    type AtomicMarkedPtr<T, N> = super::AtomicMarkedPtr<T, N>;

    #[test]
    fn lower_bits() {
        assert_eq!(0, super::lower_bits::<u8>());
        assert_eq!(2, super::lower_bits::<Aligned4<u8>>());
        assert_eq!(3, super::lower_bits::<Aligned8<u8>>());
    }

    #[test]
    fn mark_mask() {
        assert_eq!(0b000, MarkedPtr::<Aligned8<u8>, U0>::MARK_MASK);
        assert_eq!(0b001, MarkedPtr::<Aligned8<u8>, U1>::MARK_MASK);
        assert_eq!(0b011, MarkedPtr::<Aligned8<u8>, U2>::MARK_MASK);
        assert_eq!(0b111, MarkedPtr::<Aligned8<u8>, U3>::MARK_MASK);
    }

    #[test]
    fn compose() {
        let reference = &mut Aligned4::new(0u8);
        let raw = reference as *mut Aligned4<u8>;
        let addr = raw as usize;

        let marked = MarkedPtr::<_, U2>::compose(raw, 0);
        assert_eq!(marked.into_usize(), addr);
        let marked = MarkedPtr::<_, U2>::compose(raw, 0b11);
        assert_eq!(marked.into_usize(), addr | 0b11);
        let marked = MarkedPtr::<_, U2>::compose(raw, 0b1111);
        assert_eq!(marked.into_usize(), addr | 0b11);
        assert_eq!(marked.decompose(), (raw, 0b11));
        assert_eq!(marked.clear_tag().into_ptr(), raw);
        assert_eq!(marked.with_tag(0b01).decompose_tag(), 0b01);
    }

    #[test]
    fn null() {
        let null = MarkedPtr::<Aligned8<u8>, U1>::null();
        assert!(null.is_null());
        assert_matches!(null.decompose_non_null(), None);

        let marked_null = MarkedPtr::<Aligned8<u8>, U1>::compose(ptr::null_mut(), 1);
        assert!(marked_null.is_null());
        assert_eq!(marked_null.decompose_tag(), 1);
        assert_matches!(unsafe { marked_null.decompose_ref() }, (None, 1));
    }

    #[test]
    fn decompose_ref() {
        let mut value = Aligned8::new(5i32);
        let marked = MarkedPtr::<_, U3>::compose(&mut value, 0b101);
        let (reference, tag) = unsafe { marked.decompose_ref() };
        assert_eq!(**reference.unwrap(), 5);
        assert_eq!(tag, 0b101);
        assert_eq!(**unsafe { marked.as_ref() }.unwrap(), 5);
    }

    #[test]
    fn atomic_load_store() {
        let mut a = Aligned8::new(1i32);
        let mut b = Aligned8::new(2i32);

        let atomic = AtomicMarkedPtr::<_, U2>::new(MarkedPtr::compose(&mut a, 0b01));
        assert_eq!(atomic.load(Ordering::Relaxed).decompose(), (&mut a as *mut _, 0b01));

        atomic.store(MarkedPtr::new(&mut b), Ordering::Relaxed);
        let prev = atomic.swap(MarkedPtr::compose(&mut a, 0b10), Ordering::Relaxed);
        assert_eq!(prev.decompose(), (&mut b as *mut _, 0));
        assert_eq!(atomic.into_inner().decompose(), (&mut a as *mut _, 0b10));
    }

    #[test]
    fn atomic_compare_exchange() {
        let mut a = Aligned8::new(1i32);
        let mut b = Aligned8::new(2i32);

        let current = MarkedPtr::<_, U1>::new(&mut a);
        let atomic = AtomicMarkedPtr::new(current);

        let res = atomic.compare_exchange(
            current.with_tag(1),
            MarkedPtr::new(&mut b),
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
        assert_eq!(res, Err(current));

        let res = atomic.compare_exchange(
            current,
            MarkedPtr::new(&mut b),
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
        assert_eq!(res, Ok(current));
        assert_eq!(atomic.load(Ordering::Relaxed).into_ptr(), &mut b as *mut _);
    }

    #[test]
    fn atomic_fetch_tag() {
        let mut value = Aligned8::new(1i32);
        let raw = &mut value as *mut Aligned8<i32>;
        let atomic = AtomicMarkedPtr::<_, U2>::new(MarkedPtr::new(raw));

        assert_eq!(atomic.fetch_or(0b01, Ordering::Relaxed).decompose(), (raw, 0));
        assert_eq!(atomic.fetch_or(0b110, Ordering::Relaxed).decompose(), (raw, 0b01));
        assert_eq!(atomic.load(Ordering::Relaxed).decompose(), (raw, 0b11));

        assert_eq!(atomic.fetch_and(0b10, Ordering::Relaxed).decompose(), (raw, 0b11));
        assert_eq!(atomic.load(Ordering::Relaxed).decompose(), (raw, 0b10));
    }
}

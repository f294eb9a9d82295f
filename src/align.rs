//! Thin wrapper types for over-aligning values.

use core::fmt;
use core::ops::{Deref, DerefMut};

#[cfg(test)]
pub(crate) type Aligned2<T> = Aligned<T, Alignment2>;
#[cfg(test)]
pub(crate) type Aligned4<T> = Aligned<T, Alignment4>;
#[cfg(test)]
pub(crate) type Aligned8<T> = Aligned<T, Alignment8>;

/// A value padded to a separate cache line, preventing false sharing between
/// frequently written shared fields.
pub(crate) type CachePadded<T> = Aligned<T, Alignment64>;

/// A value of type `T` aligned to (at least) the alignment of `A`.
#[derive(Copy, Clone, Default, Eq, Ord, PartialEq, PartialOrd)]
pub(crate) struct Aligned<T, A: Alignment> {
    inner: T,
    _align: A,
}

/********** impl inherent *************************************************************************/

impl<T, A: Alignment> Aligned<T, A> {
    /// Creates a new aligned value.
    #[inline]
    pub const fn new(inner: T) -> Self {
        Self { inner, _align: A::ZST }
    }
}

/********** impl Deref & DerefMut *****************************************************************/

impl<T, A: Alignment> Deref for Aligned<T, A> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<T, A: Alignment> DerefMut for Aligned<T, A> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

/********** impl Debug ****************************************************************************/

impl<T: fmt::Debug, A: Alignment> fmt::Debug for Aligned<T, A> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(&self.inner, f)
    }
}

/// A zero-sized type with a specific alignment.
pub(crate) trait Alignment: Copy + Default + Eq + Ord {
    /// The (only) value of the type.
    const ZST: Self;
}

macro_rules! impl_alignment {
    ( $( $id:ident => $align:expr ),+ ) => {
        $(
            #[derive(Copy, Clone, Default, Debug, Eq, Ord, PartialEq, PartialOrd)]
            #[repr(align($align))]
            pub(crate) struct $id;
            impl Alignment for $id {
                const ZST: Self = $id;
            }
        )*
    };
}

impl_alignment! {
    Alignment64 => 0x40
}

#[cfg(test)]
impl_alignment! {
    Alignment2 => 0x2,
    Alignment4 => 0x4,
    Alignment8 => 0x8
}

#[cfg(test)]
mod tests {
    use std::mem;

    use super::*;

    #[test]
    fn alignments() {
        assert_eq!(mem::align_of::<Aligned2<u8>>(), 2);
        assert_eq!(mem::align_of::<Aligned4<u8>>(), 4);
        assert_eq!(mem::align_of::<Aligned8<u8>>(), 8);
        assert_eq!(mem::align_of::<CachePadded<u8>>(), 64);
        assert_eq!(mem::size_of::<CachePadded<usize>>(), 64);
    }

    #[test]
    fn deref() {
        let mut aligned = Aligned8::new(1u32);
        *aligned += 1;
        assert_eq!(*aligned, 2);
    }
}

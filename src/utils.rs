//! Helper functions for the allocator that don't particularly belong to
//! any concrete module of the program.

/// It aligns `to_be_aligned` up to the next multiple of `aligment`, which
/// must be a power of two.
///
/// This is used to round block sizes to [`crate::block::ALIGNMENT`] and
/// chunk sizes to the chunk granularity, which itself is a multiple of the
/// computer's page size.
#[inline]
pub const fn align(to_be_aligned: usize, aligment: usize) -> usize {
    (to_be_aligned + aligment - 1) & !(aligment - 1)
}

/// Tells whether `value` is already a multiple of `aligment`.
#[inline]
pub const fn is_aligned(value: usize, aligment: usize) -> bool {
    value & (aligment - 1) == 0
}

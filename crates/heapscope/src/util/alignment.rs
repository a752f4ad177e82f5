//! Alignment Utilities
//!
//! Target addresses are `u64` regardless of host word size, and sizes
//! computed from remote data may be arbitrary, so the rounding helpers
//! report overflow instead of wrapping.

/// Alignment - utility for alignment operations on target addresses
pub struct Alignment;

impl Alignment {
    /// Align value up to boundary, `None` on overflow
    ///
    /// `alignment` must be a power of two.
    ///
    /// # Examples
    /// ```
    /// use heapscope::util::Alignment;
    ///
    /// assert_eq!(Alignment::align_up(100, 8), Some(104));
    /// assert_eq!(Alignment::align_up(64, 8), Some(64));
    /// assert_eq!(Alignment::align_up(u64::MAX, 8), None);
    /// ```
    #[inline]
    pub fn align_up(value: u64, alignment: u64) -> Option<u64> {
        let mask = alignment - 1;
        value.checked_add(mask).map(|v| v & !mask)
    }

    /// Align value down to boundary
    #[inline]
    pub fn align_down(value: u64, alignment: u64) -> u64 {
        value & !(alignment - 1)
    }

    /// Check if value is aligned
    #[inline]
    pub fn is_aligned(value: u64, alignment: u64) -> bool {
        value & (alignment - 1) == 0
    }
}

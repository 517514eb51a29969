//! Page arithmetic helpers

use crate::constants::PAGE_SIZE;

/// Round `value` up to a multiple of `align` (a power of two)
///
/// Returns `None` when the result does not fit in 32 bits.
pub fn align_up(value: u32, align: u32) -> Option<u32> {
    debug_assert!(align.is_power_of_two());
    let mask = align - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

/// Round `value` down to a multiple of `align` (a power of two)
pub fn align_down(value: u32, align: u32) -> u32 {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// Number of pages needed to hold `size` bytes (at least one)
pub fn pages_for(size: u32) -> u32 {
    size.div_ceil(PAGE_SIZE).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align() {
        assert_eq!(align_up(0, 0x1000), Some(0));
        assert_eq!(align_up(1, 0x1000), Some(0x1000));
        assert_eq!(align_up(0x1000, 0x1000), Some(0x1000));
        assert_eq!(align_up(u32::MAX, 0x1000), None);
        assert_eq!(align_down(0x1fff, 0x1000), 0x1000);
    }

    #[test]
    fn test_pages_for() {
        assert_eq!(pages_for(0), 1);
        assert_eq!(pages_for(1), 1);
        assert_eq!(pages_for(0x1000), 1);
        assert_eq!(pages_for(0x1001), 2);
        assert_eq!(pages_for(u32::MAX), 0x10_0000);
    }
}

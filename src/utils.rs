//! This file contains the address arithmetic shared by every allocation strategy.
//! None of these functions touch memory, they only work on addresses and sizes.

/// It aligns `to_be_aligned` using `alignment`, rounding up.
///
/// This is used to round region sizes up to a multiple of [`crate::kernel::page_size`]
/// and block sizes up to a multiple of the computer's word size. `alignment` must be
/// a power of two.
#[inline]
pub fn align(to_be_aligned: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (to_be_aligned + alignment - 1) & !(alignment - 1)
}

/// Returns `true` when `addr` is a multiple of `alignment`.
#[inline]
pub fn is_aligned(addr: usize, alignment: usize) -> bool {
    addr & (alignment - 1) == 0
}

/// Number of bytes `addr` has to move forward to become a multiple of `alignment`.
///
/// ```text
///   addr          addr + adjustment
///    |                  |
///    v                  v
/// ---+------------------+------------
///    |<-- adjustment -->| aligned
/// ```
#[inline]
pub fn align_forward_adjustment(addr: usize, alignment: usize) -> usize {
    let misalignment = addr & (alignment - 1);

    if misalignment == 0 { 0 } else { alignment - misalignment }
}

/// Same as [`align_forward_adjustment`], but the returned adjustment always leaves at
/// least `header_size` bytes between `addr` and the aligned address, so a header can
/// be written right before the pointer handed to the user.
///
/// ```text
/// addr                    addr + adjustment
///  |                             |
///  v                             v
///  +---------+-------------------+------------------
///  | padding |      header       |  user data ...
///  +---------+-------------------+------------------
/// ```
///
/// The adjustment stays a multiple of `alignment` away from the plain forward
/// adjustment, so the user pointer keeps its alignment.
#[inline]
pub fn align_forward_with_header(addr: usize, alignment: usize, header_size: usize) -> usize {
    let mut adjustment = align_forward_adjustment(addr, alignment);

    if adjustment < header_size {
        let needed = header_size - adjustment;
        adjustment += alignment * needed.div_ceil(alignment);
    }

    adjustment
}

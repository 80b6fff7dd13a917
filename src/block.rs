use std::{mem, ptr::NonNull};

use crate::list::Node;

/// A free block of the [`crate::FreelistAllocator`]. The node is written at the very
/// start of the free memory and its data is the size of the whole block in bytes,
/// node included.
///
/// ```text
/// +---------------------+ <------+
/// |        next         |        |
/// +---------------------+        | -> Node<usize>
/// |        size         |        |
/// +---------------------+ <------+
/// |                     |
/// |   Free (unused)     |
/// |        ...          |
/// +---------------------+
/// ```
pub(crate) type FreeBlock = Node<usize>;

/// Smallest piece of memory that can be tracked as a free block.
pub(crate) const FREE_BLOCK_SIZE: usize = mem::size_of::<FreeBlock>();

/// Header written right before every pointer handed out by the freelist allocator.
///
/// A used block looks like this:
///
/// ```text
///  block start                                 user pointer
///      |                                            |
///      v                                            v
///      +--------------------+-----------------------+----------------------+
///      |  padding (maybe)   |  AllocHeader          |   user data ...      |
///      |                    |  - size               |                      |
///      |                    |  - adjustment         |                      |
///      +--------------------+-----------------------+----------------------+
///      |<-------------- adjustment ---------------->|
///      |<----------------------------- size ---------------------------->|
/// ```
///
/// `adjustment` takes us from the user pointer back to the start of the block and
/// `size` tells how many bytes the block spans from there, so on free we know exactly
/// which range goes back to the free list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub(crate) struct AllocHeader {
    /// Bytes taken from the free list, padding and header included.
    pub size: usize,
    /// Distance from the start of the block to the user pointer.
    pub adjustment: usize,
}

/// Overhead introduced by [`AllocHeader`] in bytes.
pub(crate) const ALLOC_HEADER_SIZE: usize = mem::size_of::<AllocHeader>();

/// Every block address and size is a multiple of this, so nodes and headers written
/// inside blocks are always aligned.
pub(crate) const MIN_ALIGNMENT: usize = mem::align_of::<usize>();

impl AllocHeader {
    /// Location of the header belonging to `ptr`.
    ///
    /// **SAFETY**: `ptr` must have been returned by the freelist allocator.
    #[inline]
    pub unsafe fn of(ptr: NonNull<u8>) -> NonNull<AllocHeader> {
        unsafe { ptr.cast::<AllocHeader>().sub(1) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_fit_in_the_minimum_block() {
        assert_eq!(2 * mem::size_of::<usize>(), ALLOC_HEADER_SIZE);
        assert_eq!(ALLOC_HEADER_SIZE, FREE_BLOCK_SIZE);
        assert_eq!(0, ALLOC_HEADER_SIZE % MIN_ALIGNMENT);
        assert!(mem::align_of::<FreeBlock>() <= MIN_ALIGNMENT);
    }
}

use std::{alloc::Layout, ptr::NonNull};

use crate::{
    allocator::Allocator,
    config::LinearConfig,
    diagnostics::{Severity, advise},
    error::{AllocError, AllocResult},
    region::Region,
    utils::align_forward_adjustment,
};

/// Linear (bump) allocator.
///
/// Every allocation moves a cursor forward through one [`Region`]. Individual blocks
/// are never reclaimed, [`LinearAllocator::clear`] rewinds the cursor and invalidates
/// everything at once.
///
/// ```text
///  start                       cursor                        end
///    |                           |                            |
///    v                           v                            v
///    +-----+--+-------+---+------+----------------------------+
///    | A1  |  |  A2   |   |  A3  |           free             |
///    +-----+--+-------+---+------+----------------------------+
///          ^            ^
///          alignment padding
/// ```
///
/// When the cursor would pass the end of the committed memory the region is grown
/// in place by its current size (doubling), unless the allocator was built with a
/// fixed capacity, in which case the allocation fails instead. Because the region
/// grows in place, pointers handed out never move.
pub struct LinearAllocator {
    region: Region,
    /// Offset of the next free byte from the start of the region.
    cursor: usize,
    growable: bool,
    growth_count: usize,
}

impl LinearAllocator {
    /// Growable allocator with `size` bytes committed up front.
    pub fn new(size: usize) -> AllocResult<Self> {
        Self::with_config(LinearConfig::new(size))
    }

    /// Allocator that never grows past `capacity` bytes.
    pub fn fixed(capacity: usize) -> AllocResult<Self> {
        Self::with_config(LinearConfig::fixed(capacity))
    }

    pub fn with_config(config: LinearConfig) -> AllocResult<Self> {
        config.validate()?;

        Ok(Self {
            region: Region::reserve_and_commit(config.initial_size, config.reserve)?,
            cursor: 0,
            growable: config.growable,
            growth_count: 0,
        })
    }

    /// Bytes between the start of the region and the cursor, padding included.
    #[inline]
    pub fn used_bytes(&self) -> usize {
        self.cursor
    }

    #[inline]
    pub fn committed_bytes(&self) -> usize {
        self.region.committed()
    }

    #[inline]
    pub fn reserved_bytes(&self) -> usize {
        self.region.reserved()
    }

    /// How many times the region had to grow.
    #[inline]
    pub fn growth_count(&self) -> usize {
        self.growth_count
    }

    #[inline]
    pub fn is_growable(&self) -> bool {
        self.growable
    }

    fn grow_to(&mut self, needed: usize) -> AllocResult<()> {
        while needed > self.region.committed() {
            if !self.growable {
                return Err(AllocError::CapacityExceeded {
                    requested: needed - self.cursor,
                    available: self.region.committed() - self.cursor,
                });
            }

            let grown = self.region.grow(self.region.committed())?;
            self.growth_count += 1;

            advise!(
                Severity::Optimization,
                "linear allocator exhausted, grew by {} bytes to {} bytes",
                grown,
                self.region.committed()
            );
        }

        Ok(())
    }
}

impl Allocator for LinearAllocator {
    fn allocate(&mut self, layout: Layout) -> AllocResult<NonNull<u8>> {
        if layout.size() == 0 {
            return Err(AllocError::ZeroSized);
        }

        let current = self.region.start().as_ptr() as usize + self.cursor;
        let offset = self.cursor + align_forward_adjustment(current, layout.align());
        let new_cursor = offset
            .checked_add(layout.size())
            .ok_or(AllocError::CapacityExceeded {
                requested: layout.size(),
                available: self.region.reserved() - self.cursor,
            })?;

        self.grow_to(new_cursor)?;
        self.cursor = new_cursor;

        let ptr = unsafe { self.region.start().add(offset) };

        log::trace!(
            target: crate::diagnostics::LOG_TARGET,
            "linear alloc {} bytes (align {}) -> {:p}",
            layout.size(),
            layout.align(),
            ptr
        );

        Ok(ptr)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        advise!(
            Severity::Low,
            "linear allocator can't free {:p} on its own, memory is reclaimed by clear()",
            ptr
        );
    }

    fn clear(&mut self) {
        self.cursor = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::page_size;

    #[test]
    fn allocations_are_contiguous_and_aligned() {
        let mut allocator = LinearAllocator::new(page_size()).unwrap();

        let a = allocator.allocate(Layout::new::<u8>()).unwrap();
        let b = allocator.allocate(Layout::new::<u64>()).unwrap();
        let c = allocator.allocate(Layout::from_size_align(3, 64).unwrap()).unwrap();

        assert_eq!(allocator.region.start(), a);
        assert_eq!(8, b.as_ptr() as usize - a.as_ptr() as usize);
        assert_eq!(0, c.as_ptr() as usize % 64);
        assert_eq!(64 + 3, allocator.used_bytes());
    }

    #[test]
    fn clear_rewinds_without_growing() {
        let size = page_size() * 4;
        let mut allocator = LinearAllocator::new(size).unwrap();
        let layout = Layout::array::<u8>(size / 8).unwrap();

        let first: Vec<_> = (0..8).map(|_| allocator.allocate(layout).unwrap()).collect();
        assert_eq!(size, allocator.used_bytes());
        assert_eq!(0, allocator.growth_count());

        allocator.clear();
        assert_eq!(0, allocator.used_bytes());

        let second: Vec<_> = (0..8).map(|_| allocator.allocate(layout).unwrap()).collect();
        assert_eq!(first, second);
        assert_eq!(0, allocator.growth_count());
        assert_eq!(size, allocator.committed_bytes());
    }

    #[test]
    fn exhaustion_doubles_the_region_in_place() {
        let mut allocator = LinearAllocator::new(page_size()).unwrap();
        let start = allocator.region.start();

        let a = allocator.allocate(Layout::array::<u8>(page_size()).unwrap()).unwrap();
        let b = allocator.allocate(Layout::array::<u8>(page_size() * 2).unwrap()).unwrap();

        assert_eq!(start, a);
        assert_eq!(unsafe { start.add(page_size()) }, b);
        assert_eq!(page_size() * 4, allocator.committed_bytes());
        assert_eq!(2, allocator.growth_count());

        unsafe {
            b.add(page_size() * 2 - 1).write(0x5A);
            assert_eq!(0x5A, *b.as_ptr().add(page_size() * 2 - 1));
        }
    }

    #[test]
    fn fixed_capacity_refuses_to_grow() {
        let mut allocator = LinearAllocator::fixed(page_size()).unwrap();

        allocator.allocate(Layout::array::<u8>(page_size() - 8).unwrap()).unwrap();
        let err = allocator.allocate(Layout::array::<u8>(16).unwrap()).unwrap_err();

        assert_eq!(
            AllocError::CapacityExceeded {
                requested: 16,
                available: 8,
            },
            err
        );
        assert_eq!(page_size(), allocator.committed_bytes());
    }

    #[test]
    fn free_is_a_no_op() {
        let mut allocator = LinearAllocator::new(page_size()).unwrap();
        let a = allocator.allocate(Layout::new::<u64>()).unwrap();

        unsafe { allocator.deallocate(a) };

        let b = allocator.allocate(Layout::new::<u64>()).unwrap();
        assert_ne!(a, b);
        assert_eq!(16, allocator.used_bytes());
    }

    #[test]
    fn zero_sized_requests_are_rejected() {
        let mut allocator = LinearAllocator::new(page_size()).unwrap();

        assert_eq!(
            AllocError::ZeroSized,
            allocator.allocate(Layout::new::<()>()).unwrap_err()
        );
    }
}

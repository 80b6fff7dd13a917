use std::{alloc::Layout, ptr::NonNull};

use crate::{
    allocator::Allocator,
    block::{ALLOC_HEADER_SIZE, AllocHeader, FREE_BLOCK_SIZE, MIN_ALIGNMENT},
    config::FreelistConfig,
    diagnostics::{Severity, advise, fatal},
    error::{AllocError, AllocResult},
    list::{Link, List, Node},
    region::Region,
    utils::{align, align_forward_with_header},
};

/// General purpose allocator: first-fit over an address ordered list of free blocks,
/// with coalescing on free.
///
/// All the memory comes from one [`Region`]. Free blocks keep their metadata inside
/// the free memory itself (see [`crate::block::FreeBlock`]) and the list is always
/// sorted by address, which is what makes merging neighbours cheap:
///
/// ```text
///                                     Free List
///
///            +-----------------------------+      +------------------------------+
///            |                             |      |                              |
/// +----------|--------------------------+--|------|-------------------+----------|-----+
/// |       +--|---+                      | +|------|-+                 |      +---v--+  |
/// | used  | Free | used      used       | |  Free   | used            |      | Free |  |
/// |       +------+                      | +---------+                 |      +------+  |
/// +-------------------------------------+-------------------------------------------+--+
/// ```
///
/// Allocation picks the first block that fits (not the best one) and splits it when
/// what remains is big enough to be tracked on its own. Every handed out pointer is
/// preceded by an [`AllocHeader`]. Freeing merges the block with the free blocks right
/// before and after it when they touch, so no two free blocks are ever adjacent.
///
/// If no block fits, the region is grown in place (doubling) and the new memory goes
/// to the free list. Growth is a correctness fallback, frequent growth means the
/// region was sized too small or memory is fragmented.
pub struct FreelistAllocator {
    region: Region,
    free_list: List<usize>,
    /// Bytes currently handed out, padding and headers included.
    used: usize,
    growth_count: usize,
}

/// Free block chosen to serve an allocation.
struct Fit {
    prev: Link<usize>,
    block: NonNull<Node<usize>>,
    adjustment: usize,
    total: usize,
}

impl FreelistAllocator {
    /// Allocator over a region of `size` bytes.
    pub fn new(size: usize) -> AllocResult<Self> {
        Self::with_config(FreelistConfig::new(size))
    }

    pub fn with_config(config: FreelistConfig) -> AllocResult<Self> {
        config.validate()?;

        let mut allocator = Self {
            region: Region::reserve_and_commit(config.initial_size, config.reserve)?,
            free_list: List::new(),
            used: 0,
            growth_count: 0,
        };
        allocator.reset_free_list();

        Ok(allocator)
    }

    /// Single free block spanning the whole committed region.
    fn reset_free_list(&mut self) {
        self.free_list.clear();
        self.used = 0;

        // The region is page aligned and at least a page long.
        unsafe {
            self.free_list.push_front(self.region.committed(), self.region.start());
        }
    }

    #[inline]
    pub fn used_bytes(&self) -> usize {
        self.used
    }

    #[inline]
    pub fn committed_bytes(&self) -> usize {
        self.region.committed()
    }

    #[inline]
    pub fn reserved_bytes(&self) -> usize {
        self.region.reserved()
    }

    #[inline]
    pub fn growth_count(&self) -> usize {
        self.growth_count
    }

    #[inline]
    pub fn free_block_count(&self) -> usize {
        self.free_list.len()
    }

    pub fn free_bytes(&self) -> usize {
        self.free_list.iter().map(|node| unsafe { node.as_ref().data }).sum()
    }

    /// `(offset from region start, size)` of every free block, in address order.
    pub fn free_blocks(&self) -> Vec<(usize, usize)> {
        self.free_list
            .iter()
            .map(|node| (self.region.offset_of(node.cast()), unsafe { node.as_ref().data }))
            .collect()
    }

    /// Walks the free list and returns the first block that can hold `size` bytes
    /// aligned to `alignment` with the header in front of them.
    fn find_fit(&self, size: usize, alignment: usize) -> Option<Fit> {
        let mut prev = None;

        for block in &self.free_list {
            let block_size = unsafe { block.as_ref().data };
            let adjustment = align_forward_with_header(block.as_ptr() as usize, alignment, ALLOC_HEADER_SIZE);

            if let Some(total) = size.checked_add(adjustment) {
                if block_size >= total {
                    return Some(Fit {
                        prev,
                        block,
                        adjustment,
                        total,
                    });
                }
            }

            prev = Some(block);
        }

        None
    }

    /// Carves the allocation out of the chosen block and writes its header.
    ///
    /// **SAFETY**: `fit` must come from [`FreelistAllocator::find_fit`] with no list
    /// changes in between.
    unsafe fn carve(&mut self, fit: Fit) -> NonNull<u8> {
        let Fit {
            prev,
            block,
            adjustment,
            mut total,
        } = fit;

        unsafe {
            let block_size = block.as_ref().data;
            let remainder = block_size - total;

            self.free_list.remove_after(prev);

            if remainder < FREE_BLOCK_SIZE {
                // Too small to be tracked, the allocation keeps it.
                total = block_size;
            } else {
                let rest = block.cast::<u8>().add(total);
                self.free_list.insert_after(prev, remainder, rest);
            }

            let ptr = block.cast::<u8>().add(adjustment);
            AllocHeader::of(ptr).write(AllocHeader { size: total, adjustment });
            self.used += total;

            ptr
        }
    }

    /// Commits more memory so that a block of at least `needed` bytes becomes free.
    fn grow(&mut self, needed: usize) -> AllocResult<()> {
        let mut additional = self.region.committed();
        while additional < needed {
            additional = additional.checked_mul(2).ok_or(AllocError::ReservationExceeded {
                requested: usize::MAX,
                reserved: self.region.reserved(),
            })?;
        }

        let old_end = self.region.end();
        let grown = self.region.grow(additional)?;
        self.growth_count += 1;

        advise!(
            Severity::Optimization,
            "freelist allocator exhausted, grew by {} bytes to {} bytes; this is a fragmentation risk",
            grown,
            self.region.committed()
        );

        // Merges with a free block ending at the old end of the region, if any.
        unsafe { self.release_block(old_end, grown) };

        Ok(())
    }

    /// `(address, size)` of the free block containing `addr`, if any.
    fn free_block_covering(&self, addr: usize) -> Option<(usize, usize)> {
        self.free_list
            .iter()
            .map(|node| (node.as_ptr() as usize, unsafe { node.as_ref().data }))
            .take_while(|(start, _)| *start <= addr)
            .find(|(start, size)| addr < start + size)
    }

    /// Puts `start..start + size` back on the free list, keeping the list sorted and
    /// merging with the neighbouring free blocks when they touch.
    ///
    /// **SAFETY**: the range must lie in the committed region and not be in use.
    unsafe fn release_block(&mut self, start: NonNull<u8>, size: usize) {
        let addr = start.as_ptr() as usize;
        let end = addr + size;

        // Find the insertion point: `prev` < addr <= `next`.
        let mut prev: Link<usize> = None;
        let mut next = self.free_list.first();

        while let Some(node) = next {
            if node.as_ptr() as usize >= addr {
                break;
            }
            prev = Some(node);
            next = unsafe { node.as_ref().next };
        }

        let prev_end = prev.map(|node| node.as_ptr() as usize + unsafe { node.as_ref().data });
        let next_start = next.map(|node| node.as_ptr() as usize);

        if prev_end.is_some_and(|prev_end| prev_end > addr) || next_start.is_some_and(|next_start| next_start < end) {
            fatal!(
                "double free: block {:#x}..{:#x} overlaps a block that is already free",
                addr,
                end
            );
        }

        let merges_prev = prev_end == Some(addr);
        let merges_next = next_start == Some(end);

        unsafe {
            match (prev, next) {
                (Some(mut prev), Some(next)) if merges_prev && merges_next => {
                    prev.as_mut().data += size + next.as_ref().data;
                    self.free_list.remove_after(Some(prev));
                }
                (Some(mut prev), _) if merges_prev => {
                    prev.as_mut().data += size;
                }
                (_, Some(next)) if merges_next => {
                    let next_size = next.as_ref().data;
                    self.free_list.remove_after(prev);
                    self.free_list.insert_after(prev, size + next_size, start);
                }
                _ => {
                    self.free_list.insert_after(prev, size, start);
                }
            }
        }
    }
}

impl Allocator for FreelistAllocator {
    fn allocate(&mut self, layout: Layout) -> AllocResult<NonNull<u8>> {
        if layout.size() == 0 {
            return Err(AllocError::ZeroSized);
        }

        // Keeps every block address and size a multiple of the word size.
        let alignment = layout.align().max(MIN_ALIGNMENT);
        let size = align(layout.size(), MIN_ALIGNMENT);

        let fit = loop {
            if let Some(fit) = self.find_fit(size, alignment) {
                break fit;
            }

            // Worst case the header and padding take `alignment + header` bytes.
            let needed = size
                .checked_add(alignment + ALLOC_HEADER_SIZE)
                .ok_or(AllocError::CapacityExceeded {
                    requested: layout.size(),
                    available: self.free_bytes(),
                })?;
            self.grow(needed)?;
        };

        let ptr = unsafe { self.carve(fit) };

        log::trace!(
            target: crate::diagnostics::LOG_TARGET,
            "freelist alloc {} bytes (align {}) -> {:p}",
            layout.size(),
            layout.align(),
            ptr
        );

        Ok(ptr)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        // Once freed, the header may have been overwritten by a free block node, so it
        // can't be trusted before checking the block is still in use.
        let header_addr = (ptr.as_ptr() as usize).wrapping_sub(ALLOC_HEADER_SIZE);
        if let Some((start, size)) = self.free_block_covering(header_addr) {
            fatal!(
                "double free: {:p} lies in the free block {:#x}..{:#x}",
                ptr,
                start,
                start + size
            );
        }

        let header = unsafe { AllocHeader::of(ptr).read() };

        if header.adjustment < ALLOC_HEADER_SIZE || header.adjustment > header.size {
            fatal!("corrupted allocation header in front of {:p}: {:?}", ptr, header);
        }

        let start = unsafe { ptr.sub(header.adjustment) };
        if !self.region.contains(start) || self.region.offset_of(start) + header.size > self.region.committed() {
            fatal!("{:p} was not allocated by this freelist allocator", ptr);
        }

        unsafe { self.release_block(start, header.size) };
        self.used -= header.size;

        log::trace!(
            target: crate::diagnostics::LOG_TARGET,
            "freelist free {:p} ({} bytes back)",
            ptr,
            header.size
        );
    }

    /// Rebuilds the free list as one block over the whole committed region. Valid in
    /// any state, every outstanding pointer becomes dangling.
    fn clear(&mut self) {
        self.reset_free_list();
    }
}

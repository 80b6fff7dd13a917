use std::{alloc::Layout, marker::PhantomData, ptr::NonNull};

use crate::error::AllocResult;

/// Capability shared by every allocation strategy.
///
/// Strategies are flat types that own their memory. Code that only needs to allocate
/// should not care which strategy sits behind it, so it receives an
/// [`AllocatorHandle`] instead (see [`Allocator::handle`]).
pub trait Allocator {
    /// Returns a block of at least `layout.size()` bytes aligned to `layout.align()`.
    ///
    /// Zero-sized layouts are rejected with [`crate::AllocError::ZeroSized`].
    fn allocate(&mut self, layout: Layout) -> AllocResult<NonNull<u8>>;

    /// Gives the block at `ptr` back to the allocator.
    ///
    /// # Safety
    /// `ptr` must have been returned by [`Allocator::allocate`] on this same allocator
    /// and must not have been freed (or invalidated by [`Allocator::clear`]) since.
    unsafe fn deallocate(&mut self, ptr: NonNull<u8>);

    /// Invalidates every allocation at once and returns the allocator to the state it
    /// had right after construction (committed memory is kept).
    fn clear(&mut self);

    /// Type-erased handle borrowing this allocator.
    fn handle(&mut self) -> AllocatorHandle<'_>
    where
        Self: Sized,
    {
        AllocatorHandle::new(self)
    }
}

type AllocateFn = unsafe fn(NonNull<()>, Layout) -> AllocResult<NonNull<u8>>;
type DeallocateFn = unsafe fn(NonNull<()>, NonNull<u8>);
type ClearFn = unsafe fn(NonNull<()>);

/// Non-owning, strategy agnostic handle to an [`Allocator`].
///
/// It is an opaque context pointer paired with the dispatch functions of the concrete
/// strategy, so containers and the typed helpers in [`crate::typed`] are written once
/// and work with any strategy. Handles are `Copy`: several containers can share one
/// allocator. The lifetime `'a` keeps the strategy mutably borrowed, so no handle
/// can outlive it and the owner can't touch it while handles are around.
///
/// Handles are neither `Send` nor `Sync`; allocators are single threaded.
#[derive(Clone, Copy)]
pub struct AllocatorHandle<'a> {
    context: NonNull<()>,
    allocate: AllocateFn,
    deallocate: DeallocateFn,
    clear: ClearFn,
    marker: PhantomData<&'a mut ()>,
}

unsafe fn allocate_with<A: Allocator>(context: NonNull<()>, layout: Layout) -> AllocResult<NonNull<u8>> {
    unsafe { context.cast::<A>().as_mut().allocate(layout) }
}

unsafe fn deallocate_with<A: Allocator>(context: NonNull<()>, ptr: NonNull<u8>) {
    unsafe { context.cast::<A>().as_mut().deallocate(ptr) }
}

unsafe fn clear_with<A: Allocator>(context: NonNull<()>) {
    unsafe { context.cast::<A>().as_mut().clear() }
}

impl<'a> AllocatorHandle<'a> {
    pub fn new<A: Allocator>(allocator: &'a mut A) -> Self {
        Self {
            context: NonNull::from(allocator).cast(),
            allocate: allocate_with::<A>,
            deallocate: deallocate_with::<A>,
            clear: clear_with::<A>,
            marker: PhantomData,
        }
    }

    /// See [`Allocator::allocate`].
    #[inline]
    pub fn allocate(&self, layout: Layout) -> AllocResult<NonNull<u8>> {
        // The borrow held by the handle keeps the context alive and exclusive.
        unsafe { (self.allocate)(self.context, layout) }
    }

    /// See [`Allocator::deallocate`].
    ///
    /// # Safety
    /// Same contract as [`Allocator::deallocate`].
    #[inline]
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        unsafe { (self.deallocate)(self.context, ptr) }
    }

    /// See [`Allocator::clear`].
    #[inline]
    pub fn clear(&self) {
        unsafe { (self.clear)(self.context) }
    }

    /// Address of the allocator behind the handle. Two handles with the same id talk
    /// to the same allocator.
    #[inline]
    pub fn id(&self) -> usize {
        self.context.as_ptr() as usize
    }
}

impl std::fmt::Debug for AllocatorHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocatorHandle")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FreelistAllocator, LinearAllocator, PowAllocator};

    fn fill_and_check(handle: AllocatorHandle<'_>) {
        let layout = Layout::array::<u32>(16).unwrap();
        let block = handle.allocate(layout).unwrap().cast::<u32>();

        unsafe {
            for i in 0..16 {
                block.add(i).write(i as u32 * 3);
            }
            for i in 0..16 {
                assert_eq!(i as u32 * 3, block.add(i).read());
            }
            handle.deallocate(block.cast());
        }
    }

    #[test]
    fn one_consumer_works_with_every_strategy() {
        let mut linear = LinearAllocator::new(64 * 1024).unwrap();
        let mut freelist = FreelistAllocator::new(64 * 1024).unwrap();
        let mut pow = PowAllocator::new().unwrap();

        fill_and_check(linear.handle());
        fill_and_check(freelist.handle());
        fill_and_check(pow.handle());
    }

    #[test]
    fn copies_share_the_same_allocator() {
        let mut freelist = FreelistAllocator::new(64 * 1024).unwrap();
        let handle = freelist.handle();
        let copy = handle;

        assert_eq!(handle.id(), copy.id());

        let block = handle.allocate(Layout::new::<u64>()).unwrap();
        unsafe { copy.deallocate(block) };
        copy.clear();

        assert_eq!(0, freelist.used_bytes());
    }
}

use std::alloc::Layout;

use memarena::{Allocator, CheckedArena, FreelistAllocator, LinearAllocator, PowAllocator, page_size};
use proptest::prelude::*;

/// Requests as `(size, log2 of the alignment)`.
fn requests() -> impl Strategy<Value = Vec<(usize, u32)>> {
    prop::collection::vec((1usize..4096, 0u32..=10), 1..64)
}

/// Every pointer is aligned as asked and the blocks never overlap.
fn check<A: Allocator>(allocator: &mut A, requests: &[(usize, u32)]) -> Result<(), TestCaseError> {
    let mut spans = Vec::with_capacity(requests.len());

    for &(size, shift) in requests {
        let layout = Layout::from_size_align(size, 1 << shift).unwrap();
        let ptr = allocator.allocate(layout).unwrap();
        let start = ptr.as_ptr() as usize;

        prop_assert_eq!(0, start % layout.align());
        unsafe { ptr.write_bytes(0xA5, size) };

        spans.push((start, start + size));
    }

    spans.sort_unstable();
    for pair in spans.windows(2) {
        prop_assert!(pair[0].1 <= pair[1].0, "{:?} overlaps {:?}", pair[0], pair[1]);
    }

    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn linear_allocations_are_aligned(requests in requests()) {
        let mut allocator = LinearAllocator::new(page_size() * 64).unwrap();
        check(&mut allocator, &requests)?;
    }

    #[test]
    fn freelist_allocations_are_aligned(requests in requests()) {
        let mut allocator = FreelistAllocator::new(page_size() * 64).unwrap();
        check(&mut allocator, &requests)?;
    }

    #[test]
    fn pow_allocations_are_aligned(requests in requests()) {
        let mut allocator = PowAllocator::new().unwrap();
        check(&mut allocator, &requests)?;
    }

    #[test]
    fn checked_arena_allocations_are_aligned(requests in requests()) {
        let mut arena = CheckedArena::new(FreelistAllocator::new(page_size() * 64).unwrap());
        check(&mut arena, &requests)?;
        arena.clear();
        prop_assert!(arena.close().is_empty());
    }
}

use std::{alloc::Layout, mem, ptr::NonNull};

use crate::{
    allocator::Allocator,
    config::{PowConfig, ReserveHint},
    diagnostics::{Severity, advise, fatal},
    error::{AllocError, AllocResult},
    list::List,
    region::Region,
    utils::{align, align_forward_with_header},
};

/// Header written right before every pointer handed out by the [`PowAllocator`].
///
/// The size of the slot is implied by its class, so only a back reference to the class
/// is needed, plus the distance back to the start of the slot.
///
/// ```text
///  slot start                    user pointer
///      |                              |
///      v                              v
///      +----------+-------------------+-----------------------+-------+
///      | padding  | class | adjustment|  user data ...        |       |
///      +----------+-------------------+-----------------------+-------+
///      |<------- adjustment --------->|
///      |<------------------------- slot size ------------------------>|
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
struct SlotHeader {
    /// Index of the owning class in the class table.
    class: usize,
    adjustment: usize,
}

const SLOT_HEADER_SIZE: usize = mem::size_of::<SlotHeader>();

/// Written over `adjustment` when a slot is freed. The free list link only ever
/// overlaps `class`, so the tag survives until the slot is handed out again.
const FREED_SLOT: usize = usize::MAX;

impl SlotHeader {
    #[inline]
    unsafe fn of(ptr: NonNull<u8>) -> NonNull<SlotHeader> {
        unsafe { ptr.cast::<SlotHeader>().sub(1) }
    }
}

/// One power-of-two size class. Free slots form an intrusive list whose nodes carry
/// no data: the slot size is the same for the whole class.
struct SizeClass {
    slot_size: usize,
    /// Bytes committed for this class across all its regions.
    full_size: usize,
    /// The first region is reserved at construction. More are added only when its
    /// reservation runs out.
    regions: Vec<Region>,
    free_slots: List<()>,
    live: usize,
}

/// Snapshot of a size class, see [`PowAllocator::classes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeClassInfo {
    pub slot_size: usize,
    pub full_size: usize,
    pub free_slots: usize,
    pub live: usize,
    pub regions: usize,
}

impl SizeClass {
    fn new(slot_size: usize, initial_size: usize, reserve: ReserveHint) -> AllocResult<Self> {
        // Whole slots only, so growth right after the committed range stays slot aligned.
        let region = Region::reserve_and_commit(align(initial_size.max(slot_size), slot_size), reserve)?;

        let mut class = Self {
            slot_size,
            full_size: region.committed(),
            regions: Vec::new(),
            free_slots: List::new(),
            live: 0,
        };
        unsafe { class.thread_slots(region.start(), region.committed()) };
        class.regions.push(region);

        Ok(class)
    }

    /// Splits `start..start + len` into slots and pushes them on the free list, lowest
    /// address first in the list.
    ///
    /// **SAFETY**: the range must be committed memory owned by this class and unused.
    unsafe fn thread_slots(&mut self, start: NonNull<u8>, len: usize) {
        let count = len / self.slot_size;

        for i in (0..count).rev() {
            unsafe { self.free_slots.push_front((), start.add(i * self.slot_size)) };
        }
    }

    /// Commits `full_size` more bytes for this class (doubling it). The current region
    /// is grown in place while its reservation allows, a new one is reserved otherwise.
    fn grow(&mut self, reserve: ReserveHint) -> AllocResult<usize> {
        let additional = self.full_size;

        let (start, grown) = match self.regions.last_mut() {
            Some(region) => {
                let start = region.end();
                match region.grow(additional) {
                    Ok(grown) => (Some(start), grown),
                    Err(AllocError::ReservationExceeded { .. }) => (None, 0),
                    Err(err) => return Err(err),
                }
            }
            None => (None, 0),
        };

        let (start, grown) = match start {
            Some(start) => (start, grown),
            None => {
                let region = Region::reserve_and_commit(additional, reserve)?;
                let fresh = (region.start(), region.committed());
                self.regions.push(region);
                fresh
            }
        };

        unsafe { self.thread_slots(start, grown) };
        self.full_size += grown;

        Ok(grown)
    }

    /// Whether `slot` is the start of one of this class's slots.
    fn owns(&self, slot: NonNull<u8>) -> bool {
        self.regions
            .iter()
            .any(|region| region.contains(slot) && region.offset_of(slot) % self.slot_size == 0)
    }

    fn info(&self) -> SizeClassInfo {
        SizeClassInfo {
            slot_size: self.slot_size,
            full_size: self.full_size,
            free_slots: self.free_slots.len(),
            live: self.live,
            regions: self.regions.len(),
        }
    }
}

/// Segregated free list allocator with power-of-two size classes.
///
/// Every class owns its own virtual memory, pre-split into equally sized slots:
///
/// ```text
///  class 0 (32 B)    +----+----+----+----+----+----+----+----+----+----+
///                    |free|used|free|free|used|free|free|free|free|free| ...
///                    +----+----+----+----+----+----+----+----+----+----+
///  class 1 (64 B)    +---------+---------+---------+---------+
///                    |  used   |  free   |  free   |  free   | ...
///                    +---------+---------+---------+---------+
///  ...
///  class 11 (64 KiB) +-------------------------------------------------+
///                    |                      free                       |
///                    +-------------------------------------------------+
/// ```
///
/// Allocation scans the (small, fixed) class table for the smallest class whose slot
/// is bigger than the request plus its header and pops a slot off that class's free
/// list. Freeing pushes the slot back. Both are O(1) in the number of live blocks and
/// never search a list, at the cost of rounding every request up to a power of two.
///
/// A class that runs out of slots commits as many bytes again as it already has.
pub struct PowAllocator {
    classes: Vec<SizeClass>,
    reserve: ReserveHint,
    growth_count: usize,
}

impl PowAllocator {
    /// Allocator with the default 12 classes from 32 bytes to 64 KiB.
    pub fn new() -> AllocResult<Self> {
        Self::with_config(PowConfig::default())
    }

    pub fn with_config(config: PowConfig) -> AllocResult<Self> {
        config.validate()?;

        let classes = (0..config.class_count)
            .map(|index| {
                SizeClass::new(
                    config.min_slot_size << index,
                    config.initial_class_size,
                    config.reserve,
                )
            })
            .collect::<AllocResult<Vec<_>>>()?;

        Ok(Self {
            classes,
            reserve: config.reserve,
            growth_count: 0,
        })
    }

    /// Index of the class serving `size` bytes aligned to `align`.
    ///
    /// Slots start at addresses aligned to at least the header size, so the padding in
    /// front of the user pointer never exceeds `max(header, align)`.
    pub fn class_for(&self, size: usize, align: usize) -> Option<usize> {
        let needed = size.checked_add(align.max(SLOT_HEADER_SIZE))?;

        self.classes.iter().position(|class| class.slot_size > needed)
    }

    /// Class that served the live allocation at `ptr`.
    ///
    /// # Safety
    /// `ptr` must be a live allocation of this allocator.
    pub unsafe fn size_class_of(&self, ptr: NonNull<u8>) -> usize {
        unsafe { SlotHeader::of(ptr).read() }.class
    }

    pub fn classes(&self) -> Vec<SizeClassInfo> {
        self.classes.iter().map(SizeClass::info).collect()
    }

    #[inline]
    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    pub fn committed_bytes(&self) -> usize {
        self.classes.iter().map(|class| class.full_size).sum()
    }

    pub fn reserved_bytes(&self) -> usize {
        self.classes
            .iter()
            .flat_map(|class| class.regions.iter())
            .map(Region::reserved)
            .sum()
    }

    #[inline]
    pub fn growth_count(&self) -> usize {
        self.growth_count
    }

    fn largest_slot(&self) -> usize {
        self.classes.last().map_or(0, |class| class.slot_size)
    }
}

impl Allocator for PowAllocator {
    fn allocate(&mut self, layout: Layout) -> AllocResult<NonNull<u8>> {
        if layout.size() == 0 {
            return Err(AllocError::ZeroSized);
        }

        let index = self
            .class_for(layout.size(), layout.align())
            .ok_or(AllocError::NoSizeClass {
                size: layout.size(),
                align: layout.align(),
                largest: self.largest_slot(),
            })?;

        let reserve = self.reserve;
        let class = &mut self.classes[index];

        if class.free_slots.is_empty() {
            let grown = class.grow(reserve)?;
            self.growth_count += 1;

            advise!(
                Severity::Optimization,
                "size class {} ({} byte slots) exhausted, grew by {} bytes to {} bytes",
                index,
                class.slot_size,
                grown,
                class.full_size
            );
        }

        let Some(slot) = class.free_slots.pop_front() else {
            return Err(AllocError::CapacityExceeded {
                requested: layout.size(),
                available: 0,
            });
        };

        let slot = slot.cast::<u8>();
        let adjustment = align_forward_with_header(slot.as_ptr() as usize, layout.align(), SLOT_HEADER_SIZE);
        debug_assert!(adjustment + layout.size() <= class.slot_size);

        let ptr = unsafe { slot.add(adjustment) };
        unsafe {
            SlotHeader::of(ptr).write(SlotHeader {
                class: index,
                adjustment,
            })
        };
        class.live += 1;

        log::trace!(
            target: crate::diagnostics::LOG_TARGET,
            "pow alloc {} bytes (align {}) -> {:p} from class {}",
            layout.size(),
            layout.align(),
            ptr,
            index
        );

        Ok(ptr)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        let header = unsafe { SlotHeader::of(ptr).read() };

        if header.adjustment == FREED_SLOT {
            fatal!("double free: {:p} is already back in its size class", ptr);
        }

        let Some(class) = self.classes.get_mut(header.class) else {
            fatal!("corrupted slot header in front of {:p}: {:?}", ptr, header);
        };

        if header.adjustment < SLOT_HEADER_SIZE || header.adjustment >= class.slot_size {
            fatal!("corrupted slot header in front of {:p}: {:?}", ptr, header);
        }

        let slot = unsafe { ptr.sub(header.adjustment) };
        if !class.owns(slot) {
            fatal!("{:p} was not allocated from size class {}", ptr, header.class);
        }

        unsafe {
            SlotHeader::of(ptr).write(SlotHeader {
                class: header.class,
                adjustment: FREED_SLOT,
            });
            class.free_slots.push_front((), slot);
        }
        class.live -= 1;

        log::trace!(
            target: crate::diagnostics::LOG_TARGET,
            "pow free {:p} back to class {}",
            ptr,
            header.class
        );
    }

    /// Every class goes back to having all its committed slots free.
    fn clear(&mut self) {
        for class in &mut self.classes {
            class.free_slots.clear();
            class.live = 0;

            let chunks: Vec<_> = class
                .regions
                .iter()
                .map(|region| (region.start(), region.committed()))
                .collect();

            for (start, len) in chunks.into_iter().rev() {
                unsafe { class.thread_slots(start, len) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{allocation_granularity, page_size};
    use rand::{Rng, RngCore, SeedableRng, rngs::StdRng};

    fn small() -> PowAllocator {
        PowAllocator::with_config(PowConfig::default().with_initial_class_size(page_size())).unwrap()
    }

    #[test]
    fn classes_double_from_32_bytes() {
        let allocator = PowAllocator::new().unwrap();
        let slots: Vec<_> = allocator.classes().iter().map(|class| class.slot_size).collect();

        assert_eq!(12, slots.len());
        assert_eq!(32, slots[0]);
        for pair in slots.windows(2) {
            assert_eq!(pair[0] * 2, pair[1]);
        }
        assert_eq!(64 * 1024, slots[11]);
    }

    #[test]
    fn smallest_fitting_class_is_used() {
        let mut allocator = small();

        for size in [1, 15, 16, 17, 47, 48, 100, 1000, 4000, 30000] {
            let ptr = allocator.allocate(Layout::from_size_align(size, 8).unwrap()).unwrap();
            let class = unsafe { allocator.size_class_of(ptr) };
            let slot = allocator.classes()[class].slot_size;

            assert!(slot > size + SLOT_HEADER_SIZE);
            if class > 0 {
                assert!(allocator.classes()[class - 1].slot_size <= size + SLOT_HEADER_SIZE);
            }

            unsafe { allocator.deallocate(ptr) };
        }
    }

    #[test]
    fn freed_slot_is_reused_first() {
        let mut allocator = small();
        let layout = Layout::new::<[u8; 40]>();

        let a = allocator.allocate(layout).unwrap();
        let b = allocator.allocate(layout).unwrap();
        assert_eq!(64, b.as_ptr() as usize - a.as_ptr() as usize);

        unsafe { allocator.deallocate(a) };
        assert_eq!(a, allocator.allocate(layout).unwrap());
    }

    #[test]
    fn alignment_is_honoured() {
        let mut allocator = small();

        for shift in 0..11 {
            let align = 1 << shift;
            let ptr = allocator.allocate(Layout::from_size_align(24, align).unwrap()).unwrap();
            assert_eq!(0, ptr.as_ptr() as usize % align);
        }
    }

    #[test]
    fn exhausted_class_grows() {
        let mut allocator = small();
        let layout = Layout::new::<[u8; 100]>();
        let index = allocator.class_for(100, 1).unwrap();
        let slots = page_size() / allocator.classes()[index].slot_size;

        let ptrs: Vec<_> = (0..slots * 3).map(|_| allocator.allocate(layout).unwrap()).collect();

        let info = allocator.classes()[index];
        assert_eq!(slots * 3, info.live);
        assert_eq!(page_size() * 4, info.full_size);
        assert_eq!(2, allocator.growth_count());

        for ptr in ptrs {
            unsafe { allocator.deallocate(ptr) };
        }
        assert_eq!(slots * 4, allocator.classes()[index].free_slots);
    }

    #[test]
    fn class_gets_a_new_region_once_its_reservation_is_used_up() {
        let config = PowConfig::default()
            .with_initial_class_size(allocation_granularity())
            .with_reserve(ReserveHint::Exact);
        let mut allocator = PowAllocator::with_config(config).unwrap();
        let layout = Layout::new::<[u8; 4000]>();
        let index = allocator.class_for(4000, 1).unwrap();
        let before = allocator.classes()[index].regions;

        // Every slot committed so far, then one more.
        let slots = allocator.classes()[index].free_slots;
        let ptrs: Vec<_> = (0..slots + 1).map(|_| allocator.allocate(layout).unwrap()).collect();

        assert!(allocator.classes()[index].regions > before);
        for ptr in ptrs {
            unsafe { allocator.deallocate(ptr) };
        }
        assert_eq!(0, allocator.classes()[index].live);
    }

    #[test]
    fn live_blocks_never_alias() {
        let mut allocator = small();
        let mut rng = StdRng::seed_from_u64(11);

        let blocks: Vec<(NonNull<u64>, usize, u64)> = (0..2000)
            .map(|_| {
                let len = rng.gen_range(1..64);
                let value = rng.next_u64();
                let ptr = allocator.allocate(Layout::array::<u64>(len).unwrap()).unwrap().cast::<u64>();
                for i in 0..len {
                    unsafe { ptr.add(i).write(value) };
                }
                (ptr, len, value)
            })
            .collect();

        for (ptr, len, value) in &blocks {
            for i in 0..*len {
                assert_eq!(*value, unsafe { ptr.add(i).read() });
            }
        }

        for (ptr, _, _) in blocks {
            unsafe { allocator.deallocate(ptr.cast()) };
        }
        assert!(allocator.classes().iter().all(|class| class.live == 0));
    }

    #[test]
    fn clear_refills_every_class() {
        let mut allocator = small();
        let first = allocator.allocate(Layout::new::<u64>()).unwrap();
        for _ in 0..500 {
            allocator.allocate(Layout::new::<[u8; 200]>()).unwrap();
        }

        allocator.clear();

        for class in allocator.classes() {
            assert_eq!(0, class.live);
            assert_eq!(class.full_size / class.slot_size, class.free_slots);
        }
        assert_eq!(first, allocator.allocate(Layout::new::<u64>()).unwrap());
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_is_fatal() {
        let mut allocator = small();
        let layout = Layout::new::<u64>();

        // Use up the whole class so the freed slot's link is null.
        let slots = allocator.classes()[0].free_slots;
        let ptrs: Vec<_> = (0..slots).map(|_| allocator.allocate(layout).unwrap()).collect();
        assert!(allocator.classes[0].free_slots.is_empty());

        unsafe {
            allocator.deallocate(ptrs[5]);
            allocator.deallocate(ptrs[5]);
        }
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_of_an_over_aligned_block_is_fatal() {
        let mut allocator = small();
        let ptr = allocator.allocate(Layout::from_size_align(8, 128).unwrap()).unwrap();

        unsafe {
            allocator.deallocate(ptr);
            allocator.deallocate(ptr);
        }
    }

    #[test]
    fn reused_slot_gets_a_fresh_header() {
        let mut allocator = small();
        let layout = Layout::new::<u64>();

        let a = allocator.allocate(layout).unwrap();
        let b = allocator.allocate(layout).unwrap();
        unsafe { allocator.deallocate(a) };

        let c = allocator.allocate(layout).unwrap();
        let d = allocator.allocate(layout).unwrap();
        assert_eq!(a, c);
        assert!(d != b && d != c);

        unsafe {
            assert_eq!(0, allocator.size_class_of(c));
            allocator.deallocate(c);
            allocator.deallocate(b);
            allocator.deallocate(d);
        }
        assert_eq!(0, allocator.classes()[0].live);
    }

    #[test]
    fn oversized_requests_are_rejected() {
        let mut allocator = small();

        let err = allocator.allocate(Layout::array::<u8>(64 * 1024).unwrap()).unwrap_err();
        assert!(matches!(err, AllocError::NoSizeClass { largest: 65536, .. }));
    }
}

use crate::{
    allocator::{Allocator, AllocatorHandle},
    arena::CheckedArena,
    config::MemoryConfig,
    debug::LeakReport,
    diagnostics::{Severity, advise},
    error::AllocResult,
    freelist::FreelistAllocator,
    linear::LinearAllocator,
    pow::PowAllocator,
};

/// The allocators an application runs on, owned in one place.
///
/// - `heap`: general purpose memory, wrapped in a [`CheckedArena`] so overruns and
///   leaks are caught.
/// - `scratch`: per-frame or per-task memory, reset all at once with
///   [`MemoryContext::reset_scratch`].
/// - `small_objects`: many small allocations of similar size.
///
/// The context is an ordinary value. Pass it (or the [`ContextHandles`] it hands out)
/// to whoever needs memory, and call [`MemoryContext::shutdown`] at the end to find out
/// what leaked.
pub struct MemoryContext {
    heap: CheckedArena<FreelistAllocator>,
    scratch: LinearAllocator,
    small_objects: PowAllocator,
}

/// Handles to every allocator of a [`MemoryContext`], borrowed together.
#[derive(Debug, Clone, Copy)]
pub struct ContextHandles<'a> {
    pub heap: AllocatorHandle<'a>,
    pub scratch: AllocatorHandle<'a>,
    pub small_objects: AllocatorHandle<'a>,
}

impl MemoryContext {
    pub fn new(config: MemoryConfig) -> AllocResult<Self> {
        config.validate()?;

        let heap = CheckedArena::new(FreelistAllocator::with_config(config.heap)?);
        if heap.is_checked() && !cfg!(debug_assertions) {
            advise!(
                Severity::Low,
                "debug allocator used outside a debug build"
            );
        }

        log::debug!(
            target: crate::diagnostics::LOG_TARGET,
            "memory context up: heap {} bytes, scratch {} bytes, {} small object classes",
            config.heap.initial_size,
            config.scratch.initial_size,
            config.small_objects.class_count
        );

        Ok(Self {
            heap,
            scratch: LinearAllocator::with_config(config.scratch)?,
            small_objects: PowAllocator::with_config(config.small_objects)?,
        })
    }

    pub fn handles(&mut self) -> ContextHandles<'_> {
        ContextHandles {
            heap: self.heap.handle(),
            scratch: self.scratch.handle(),
            small_objects: self.small_objects.handle(),
        }
    }

    pub fn heap(&self) -> &CheckedArena<FreelistAllocator> {
        &self.heap
    }

    pub fn scratch(&self) -> &LinearAllocator {
        &self.scratch
    }

    pub fn small_objects(&self) -> &PowAllocator {
        &self.small_objects
    }

    /// Invalidates everything allocated from scratch memory.
    pub fn reset_scratch(&mut self) {
        self.scratch.clear();
    }

    /// Tears every allocator down and reports what was still alive on the heap.
    pub fn shutdown(self) -> LeakReport {
        let Self { heap, .. } = self;

        heap.close()
    }
}

#[cfg(test)]
mod tests {
    use std::alloc::Layout;

    use super::*;
    use crate::{
        config::{FreelistConfig, LinearConfig},
        kernel::page_size,
        typed,
    };

    fn small_config() -> MemoryConfig {
        MemoryConfig {
            heap: FreelistConfig::new(page_size() * 4),
            scratch: LinearConfig::new(page_size()),
            ..MemoryConfig::default()
        }
    }

    #[test]
    fn handles_reach_their_own_allocator() {
        let mut context = MemoryContext::new(small_config()).unwrap();
        let handles = context.handles();

        let number = typed::new(handles.heap, 42u64).unwrap();
        let frame = typed::new_array::<u32>(handles.scratch, 64).unwrap();
        assert_eq!(0, frame.as_ptr() as usize % 4);
        let node = typed::new(handles.small_objects, [0u8; 24]).unwrap();

        assert_ne!(handles.heap.id(), handles.scratch.id());
        assert_ne!(handles.scratch.id(), handles.small_objects.id());

        unsafe {
            assert_eq!(42, number.read());
            typed::free(handles.heap, number);
            typed::free(handles.small_objects, node);
        }

        assert_eq!(0, context.heap().live_allocations());
        assert_eq!(64 * 4, context.scratch().used_bytes());
        assert!(context.shutdown().is_empty());
    }

    #[test]
    fn reset_scratch_reuses_the_same_memory() {
        let mut context = MemoryContext::new(small_config()).unwrap();
        let layout = Layout::array::<u8>(256).unwrap();

        let first = context.handles().scratch.allocate(layout).unwrap();
        context.reset_scratch();
        let second = context.handles().scratch.allocate(layout).unwrap();

        assert_eq!(first, second);
        assert_eq!(256, context.scratch().used_bytes());
    }

    #[test]
    fn shutdown_reports_heap_leaks() {
        let mut context = MemoryContext::new(small_config()).unwrap();

        let leaked = context.handles().heap.allocate(Layout::array::<u8>(100).unwrap()).unwrap();
        context.handles().scratch.allocate(Layout::new::<u64>()).unwrap();

        let report = context.shutdown();
        assert_eq!(vec![(leaked.as_ptr() as usize, 100)], report.leaks);
        assert_eq!(100, report.total_bytes());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = MemoryConfig {
            scratch: LinearConfig::new(0),
            ..small_config()
        };

        assert!(MemoryContext::new(config).is_err());
    }
}

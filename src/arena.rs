use std::{alloc::Layout, ptr::NonNull};

use crate::{
    allocator::Allocator,
    debug::{BoundsChecker, GUARD_SIZE, LeakReport, LeakTracker},
    diagnostics::{LOG_TARGET, Severity, advise, fatal},
    error::AllocResult,
};

/// Hook for synchronising access to an [`Arena`].
///
/// Every arena operation runs between `enter` and `leave`. Only [`SingleThreaded`]
/// exists: arenas are not meant to be shared between threads.
pub trait ThreadPolicy: Default {
    #[inline]
    fn enter(&self) {}

    #[inline]
    fn leave(&self) {}
}

/// No synchronisation at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleThreaded;

impl ThreadPolicy for SingleThreaded {}

/// Bookkeeping an [`Arena`] wraps around every call to its strategy.
pub trait Instrumentation: Default {
    fn allocate<S: Allocator>(&mut self, strategy: &mut S, layout: Layout) -> AllocResult<NonNull<u8>>;

    /// # Safety
    /// Same contract as [`Allocator::deallocate`].
    unsafe fn deallocate<S: Allocator>(&mut self, strategy: &mut S, ptr: NonNull<u8>);

    /// Forgets every allocation, the strategy is cleared separately.
    fn clear(&mut self);

    fn live_allocations(&self) -> usize;

    fn leak_report(&self) -> LeakReport;

    /// Final checks when the arena goes away.
    fn teardown(&mut self) -> LeakReport;
}

/// Picks the [`Instrumentation`] of an arena from its `DEBUG` flag.
pub struct DebugFlag<const DEBUG: bool>;

pub trait SelectInstrumentation {
    type Instruments: Instrumentation;
}

impl SelectInstrumentation for DebugFlag<true> {
    type Instruments = Guarded;
}

impl SelectInstrumentation for DebugFlag<false> {
    type Instruments = Unguarded;
}

/// Guard words around every allocation plus the set of live allocations.
///
/// Each request is inflated by two guard words (plus whatever padding keeps the user
/// pointer aligned). The strategy's block looks like this:
///
/// ```text
///    +-----------+-------+--------------------------+-------+
///    |  padding  | GUARD |       user bytes         | GUARD |
///    +-----------+-------+--------------------------+-------+
///                        ^
///                        returned pointer
/// ```
///
/// Both guards are checked when the block is freed, and a damaged guard is fatal.
/// Dropping it checks the guards still in place and reports leaks.
#[derive(Debug, Default)]
pub struct Guarded {
    bounds: BoundsChecker,
    leaks: LeakTracker,
}

impl Instrumentation for Guarded {
    fn allocate<S: Allocator>(&mut self, strategy: &mut S, layout: Layout) -> AllocResult<NonNull<u8>> {
        // A multiple of the alignment, so the user pointer stays aligned.
        let front_padding = layout.align().max(GUARD_SIZE);
        let inflated = layout
            .size()
            .checked_add(front_padding + GUARD_SIZE)
            .map(|size| Layout::from_size_align(size, layout.align()));

        match inflated {
            Some(Ok(inflated)) if layout.size() > 0 => strategy.allocate(inflated).map(|block| unsafe {
                let user = block.add(front_padding);
                self.bounds.stamp(user, layout.size(), front_padding);
                self.leaks.track(user, layout.size());
                user
            }),
            Some(Err(err)) => Err(err.into()),
            // Zero-sized or overflowing, the strategy reports it.
            _ => strategy.allocate(layout),
        }
    }

    unsafe fn deallocate<S: Allocator>(&mut self, strategy: &mut S, ptr: NonNull<u8>) {
        let front_padding = self.bounds.release(ptr);
        self.leaks.untrack(ptr);

        unsafe { strategy.deallocate(ptr.sub(front_padding)) };
    }

    fn clear(&mut self) {
        self.bounds.clear();
        self.leaks.clear();
    }

    fn live_allocations(&self) -> usize {
        self.bounds.len()
    }

    fn leak_report(&self) -> LeakReport {
        self.leaks.report()
    }

    /// Runs once: the trackers are empty afterwards.
    fn teardown(&mut self) -> LeakReport {
        let damaged = self.bounds.sweep();
        self.bounds.clear();

        let report = self.leaks.report();
        self.leaks.clear();

        if !report.is_empty() {
            for (addr, size) in &report.leaks {
                log::warn!(target: LOG_TARGET, "leaked {:#x}: {} bytes", addr, size);
            }
            advise!(
                Severity::High,
                "memory leak: {} allocations ({} bytes) still alive at arena teardown",
                report.len(),
                report.total_bytes()
            );
        }

        // Unwinding already, a second panic would abort.
        if let Some((addr, side)) = damaged.first() {
            if !std::thread::panicking() {
                fatal!("buffer overwritten at the {} of allocation {:#x}", side, addr);
            }
        }

        report
    }
}

impl Drop for Guarded {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Forwards straight to the strategy. Zero-sized, and nothing runs on drop.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unguarded;

impl Instrumentation for Unguarded {
    #[inline]
    fn allocate<S: Allocator>(&mut self, strategy: &mut S, layout: Layout) -> AllocResult<NonNull<u8>> {
        strategy.allocate(layout)
    }

    #[inline]
    unsafe fn deallocate<S: Allocator>(&mut self, strategy: &mut S, ptr: NonNull<u8>) {
        unsafe { strategy.deallocate(ptr) }
    }

    fn clear(&mut self) {}

    fn live_allocations(&self) -> usize {
        0
    }

    fn leak_report(&self) -> LeakReport {
        LeakReport::default()
    }

    fn teardown(&mut self) -> LeakReport {
        LeakReport::default()
    }
}

/// Arena with guard words and leak tracking.
pub type CheckedArena<S> = Arena<S, SingleThreaded, true>;

/// Arena that forwards straight to its strategy.
pub type UncheckedArena<S> = Arena<S, SingleThreaded, false>;

/// Wraps an allocation strategy and, when `DEBUG` is on, instruments every allocation
/// (see [`Guarded`]).
///
/// When the arena goes away every allocation still alive is reported as a leak, see
/// [`Arena::close`]. With `DEBUG` off the arena is a plain pass-through and is exactly
/// as big as its strategy.
pub struct Arena<S: Allocator, P: ThreadPolicy = SingleThreaded, const DEBUG: bool = true>
where
    DebugFlag<DEBUG>: SelectInstrumentation,
{
    // Dropped before the strategy, its final sweep still reads the guards.
    instruments: <DebugFlag<DEBUG> as SelectInstrumentation>::Instruments,
    strategy: S,
    policy: P,
}

impl<S: Allocator, P: ThreadPolicy, const DEBUG: bool> Arena<S, P, DEBUG>
where
    DebugFlag<DEBUG>: SelectInstrumentation,
{
    pub fn new(strategy: S) -> Self {
        Self {
            instruments: Default::default(),
            strategy,
            policy: P::default(),
        }
    }

    #[inline]
    pub const fn is_checked(&self) -> bool {
        DEBUG
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    /// Number of allocations currently alive. Always 0 for unchecked arenas.
    pub fn live_allocations(&self) -> usize {
        self.instruments.live_allocations()
    }

    /// Allocations alive right now.
    pub fn leak_report(&self) -> LeakReport {
        self.instruments.leak_report()
    }

    /// Tears the arena down and returns what leaked.
    pub fn close(mut self) -> LeakReport {
        self.instruments.teardown()
    }
}

impl<S: Allocator, P: ThreadPolicy, const DEBUG: bool> Allocator for Arena<S, P, DEBUG>
where
    DebugFlag<DEBUG>: SelectInstrumentation,
{
    fn allocate(&mut self, layout: Layout) -> AllocResult<NonNull<u8>> {
        self.policy.enter();
        let result = self.instruments.allocate(&mut self.strategy, layout);
        self.policy.leave();

        result
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        self.policy.enter();
        unsafe { self.instruments.deallocate(&mut self.strategy, ptr) };
        self.policy.leave();
    }

    fn clear(&mut self) {
        self.policy.enter();
        self.strategy.clear();
        self.instruments.clear();
        self.policy.leave();
    }
}

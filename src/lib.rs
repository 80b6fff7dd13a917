//! Region backed memory allocators.
//!
//! Memory is reserved from the OS in large [`Region`]s and committed page by page as
//! it is needed. Three strategies carve regions up:
//!
//! - [`LinearAllocator`]: bump allocation, freed all at once.
//! - [`FreelistAllocator`]: general purpose first-fit allocation with coalescing.
//! - [`PowAllocator`]: segregated power-of-two size classes for small objects.
//!
//! Any strategy can be wrapped in an [`Arena`] which, in its checked flavour, surrounds
//! every allocation with guard words and reports leaks when it goes away. Code that
//! just needs memory takes an [`AllocatorHandle`] and uses the helpers in [`typed`].
//! [`MemoryContext`] bundles one of each strategy for an application.
//!
//! Nothing here installs a logger. Diagnostics go through the [`log`] facade under the
//! `memarena` target.

pub mod allocator;
pub mod arena;
mod block;
pub mod config;
pub mod context;
pub mod debug;
pub mod diagnostics;
pub mod error;
pub mod freelist;
mod kernel;
pub mod linear;
mod list;
pub mod pow;
pub mod region;
pub mod typed;
pub mod utils;

pub use allocator::{Allocator, AllocatorHandle};
pub use arena::{
    Arena, CheckedArena, DebugFlag, Guarded, Instrumentation, SelectInstrumentation, SingleThreaded, ThreadPolicy,
    UncheckedArena, Unguarded,
};
pub use config::{FreelistConfig, LinearConfig, MemoryConfig, PowConfig, ReserveHint};
pub use context::{ContextHandles, MemoryContext};
pub use debug::{GuardSide, LeakReport};
pub use diagnostics::Severity;
pub use error::{AllocError, AllocResult};
pub use freelist::FreelistAllocator;
pub use linear::LinearAllocator;
pub use pow::{PowAllocator, SizeClassInfo};
pub use region::Region;

/// Size of a virtual memory page on this machine.
pub fn page_size() -> usize {
    kernel::page_size()
}

/// Granularity at which address space is reserved (the page size on Unix, usually
/// 64 KiB on Windows).
pub fn allocation_granularity() -> usize {
    kernel::allocation_granularity()
}

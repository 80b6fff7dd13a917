//! Bookkeeping behind a checked [`crate::Arena`]: guard words around every allocation
//! and the set of allocations still alive.

use std::{collections::HashMap, fmt, mem, ptr::NonNull};

use crate::diagnostics::fatal;

/// Sentinel written right before and right after the user bytes of every allocation.
pub const GUARD_PATTERN: u64 = 0xFDFD_FDFD_FDFD_FDFD;

/// Width of one guard word.
pub const GUARD_SIZE: usize = mem::size_of::<u64>();

/// Which end of an allocation a guard protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardSide {
    Front,
    Back,
}

impl fmt::Display for GuardSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardSide::Front => write!(f, "front"),
            GuardSide::Back => write!(f, "back"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct GuardPair {
    front: NonNull<u8>,
    back: NonNull<u8>,
    /// Bytes between the block returned by the strategy and the user pointer.
    front_padding: usize,
}

impl GuardPair {
    /// First side whose sentinel no longer matches.
    fn damaged_side(&self) -> Option<GuardSide> {
        // The back guard follows the user bytes and may be unaligned.
        unsafe {
            if self.front.cast::<u64>().read_unaligned() != GUARD_PATTERN {
                Some(GuardSide::Front)
            } else if self.back.cast::<u64>().read_unaligned() != GUARD_PATTERN {
                Some(GuardSide::Back)
            } else {
                None
            }
        }
    }
}

/// Maps the front guard of every live allocation to its back guard.
///
/// ```text
///  block from strategy
///    |
///    v
///    +-----------+-------+--------------------------+-------+
///    |  padding  | GUARD |       user bytes         | GUARD |
///    +-----------+-------+--------------------------+-------+
///    |<-- front padding->|^                         ^
///                         user pointer              back guard
/// ```
#[derive(Debug, Default)]
pub(crate) struct BoundsChecker {
    guards: HashMap<usize, GuardPair>,
}

impl BoundsChecker {
    /// Writes both guards around `size` bytes at `user` and records them.
    ///
    /// **SAFETY**: the `GUARD_SIZE` bytes before `user` and after `user + size` must be
    /// writable and belong to the same allocation.
    pub unsafe fn stamp(&mut self, user: NonNull<u8>, size: usize, front_padding: usize) {
        unsafe {
            let front = user.sub(GUARD_SIZE);
            let back = user.add(size);

            front.cast::<u64>().write_unaligned(GUARD_PATTERN);
            back.cast::<u64>().write_unaligned(GUARD_PATTERN);

            self.guards.insert(
                front.as_ptr() as usize,
                GuardPair {
                    front,
                    back,
                    front_padding,
                },
            );
        }
    }

    /// Verifies and forgets the guards of `user`, returning its front padding.
    ///
    /// Fatal if `user` is unknown or if either guard was overwritten.
    pub fn release(&mut self, user: NonNull<u8>) -> usize {
        let front = user.as_ptr() as usize - GUARD_SIZE;

        let Some(pair) = self.guards.remove(&front) else {
            fatal!(
                "freeing {:p}, which is not a live allocation of this arena (double free or foreign pointer)",
                user
            );
        };

        if let Some(side) = pair.damaged_side() {
            fatal!("buffer overwritten at the {} of allocation {:p}", side, user);
        }

        pair.front_padding
    }

    /// Every tracked allocation whose guards are damaged, as `(user pointer, side)`.
    pub fn sweep(&self) -> Vec<(usize, GuardSide)> {
        let mut damaged: Vec<_> = self
            .guards
            .iter()
            .filter_map(|(front, pair)| pair.damaged_side().map(|side| (front + GUARD_SIZE, side)))
            .collect();
        damaged.sort_unstable_by_key(|(addr, _)| *addr);

        damaged
    }

    pub fn len(&self) -> usize {
        self.guards.len()
    }

    pub fn clear(&mut self) {
        self.guards.clear();
    }
}

/// Live allocations by address, with their sizes.
#[derive(Debug, Default)]
pub(crate) struct LeakTracker {
    live: HashMap<usize, usize>,
}

impl LeakTracker {
    pub fn track(&mut self, user: NonNull<u8>, size: usize) {
        self.live.insert(user.as_ptr() as usize, size);
    }

    pub fn untrack(&mut self, user: NonNull<u8>) -> Option<usize> {
        self.live.remove(&(user.as_ptr() as usize))
    }

    pub fn report(&self) -> LeakReport {
        let mut leaks: Vec<_> = self.live.iter().map(|(addr, size)| (*addr, *size)).collect();
        leaks.sort_unstable();

        LeakReport { leaks }
    }

    pub fn clear(&mut self) {
        self.live.clear();
    }
}

/// Allocations that were still alive when an arena was torn down.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeakReport {
    /// `(address, size)` pairs sorted by address.
    pub leaks: Vec<(usize, usize)>,
}

impl LeakReport {
    pub fn is_empty(&self) -> bool {
        self.leaks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.leaks.len()
    }

    pub fn total_bytes(&self) -> usize {
        self.leaks.iter().map(|(_, size)| size).sum()
    }
}

impl fmt::Display for LeakReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} leaked allocations ({} bytes):", self.len(), self.total_bytes())?;
        for (addr, size) in &self.leaks {
            writeln!(f, "  {:#x}: {} bytes", addr, size)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer() -> (Vec<u64>, NonNull<u8>) {
        let mut words = vec![0u64; 8];
        let base = NonNull::new(words.as_mut_ptr()).unwrap().cast::<u8>();
        (words, base)
    }

    #[test]
    fn intact_guards_release_cleanly() {
        let (_words, base) = buffer();
        let mut bounds = BoundsChecker::default();

        unsafe {
            let user = base.add(GUARD_SIZE);
            bounds.stamp(user, 13, GUARD_SIZE);

            assert!(bounds.sweep().is_empty());
            assert_eq!(GUARD_SIZE, bounds.release(user));
        }
        assert_eq!(0, bounds.len());
    }

    #[test]
    fn sweep_finds_damaged_guards() {
        let (_words, base) = buffer();
        let mut bounds = BoundsChecker::default();

        unsafe {
            let user = base.add(GUARD_SIZE);
            bounds.stamp(user, 16, GUARD_SIZE);
            user.add(16).write(0);

            assert_eq!(vec![(user.as_ptr() as usize, GuardSide::Back)], bounds.sweep());
        }
    }

    #[test]
    #[should_panic(expected = "buffer overwritten at the front")]
    fn underrun_is_fatal() {
        let (_words, base) = buffer();
        let mut bounds = BoundsChecker::default();

        unsafe {
            let user = base.add(GUARD_SIZE);
            bounds.stamp(user, 8, GUARD_SIZE);
            user.sub(1).write(0);
            bounds.release(user);
        }
    }

    #[test]
    fn leak_report_is_sorted_and_summed() {
        let (_words, base) = buffer();
        let mut leaks = LeakTracker::default();

        unsafe {
            leaks.track(base.add(32), 5);
            leaks.track(base, 7);
            leaks.track(base.add(16), 9);
        }
        assert_eq!(Some(9), leaks.untrack(unsafe { base.add(16) }));

        let report = leaks.report();
        let start = base.as_ptr() as usize;

        assert_eq!(vec![(start, 7), (start + 32, 5)], report.leaks);
        assert_eq!(12, report.total_bytes());
        assert!(report.to_string().starts_with("2 leaked allocations (12 bytes)"));
    }
}

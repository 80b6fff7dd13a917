use std::ptr::NonNull;

use crate::{
    config::ReserveHint,
    diagnostics::fatal,
    error::{AllocError, AllocResult},
    kernel::{allocation_granularity, commit_memory, page_size, release_memory, reserve_memory},
    utils::align,
};

/// A contiguous range of virtual memory obtained from the kernel.
///
/// Regions follow a reserve then commit model. On creation we reserve a big chunk of
/// address space (which costs nothing) but only commit the part we need right now.
/// Growing a region commits more pages right after the committed ones, so memory
/// handed out from the region never moves.
///
/// ```text
///  start                    start + committed                 start + reserved
///    |                             |                                 |
///    v                             v                                 v
///    +-----------------------------+---------------------------------+
///    |   committed (read-write)    |  reserved only (no access)      |
///    +-----------------------------+---------------------------------+
///                                  ------- grow() moves this ------->
/// ```
///
/// The whole reservation is given back to the kernel when the region is dropped.
#[derive(Debug)]
pub struct Region {
    /// Start of the reservation, always aligned to the allocation granularity.
    start: NonNull<u8>,
    /// Bytes currently backed by memory.
    committed: usize,
    /// Bytes of address space owned by this region.
    reserved: usize,
}

impl Region {
    /// Reserves address space for `size` bytes times the `hint` multiplier and commits
    /// `size` bytes (rounded up to the page size) of it.
    pub fn reserve_and_commit(size: usize, hint: ReserveHint) -> AllocResult<Self> {
        if size == 0 {
            return Err(AllocError::ZeroSized);
        }

        let committed = align(size, page_size());
        let reserved = committed
            .checked_mul(hint.multiplier())
            .map(|reserved| align(reserved, allocation_granularity()))
            .ok_or(AllocError::ReservationExceeded {
                requested: committed,
                reserved: usize::MAX,
            })?;

        unsafe {
            let start = reserve_memory(reserved)?;

            if let Err(err) = commit_memory(start, committed) {
                // Nothing points into the reservation yet.
                let _ = release_memory(start, reserved);
                return Err(err);
            }

            log::trace!(
                target: crate::diagnostics::LOG_TARGET,
                "region {:p}: committed {} bytes, reserved {} bytes",
                start,
                committed,
                reserved
            );

            Ok(Self {
                start,
                committed,
                reserved,
            })
        }
    }

    /// Commits `additional` more bytes (rounded up to the page size) right after the
    /// committed range and returns how many bytes were actually committed.
    ///
    /// Fails with [`AllocError::ReservationExceeded`] if the reservation is too small,
    /// in which case the region is left untouched.
    pub fn grow(&mut self, additional: usize) -> AllocResult<usize> {
        let additional = align(additional, page_size());
        let requested = self
            .committed
            .checked_add(additional)
            .filter(|requested| *requested <= self.reserved)
            .ok_or(AllocError::ReservationExceeded {
                requested: self.committed.saturating_add(additional),
                reserved: self.reserved,
            })?;

        unsafe { commit_memory(self.end(), additional)? };
        self.committed = requested;

        log::trace!(
            target: crate::diagnostics::LOG_TARGET,
            "region {:p}: grew by {} bytes to {} of {} reserved",
            self.start,
            additional,
            self.committed,
            self.reserved
        );

        Ok(additional)
    }

    #[inline]
    pub fn start(&self) -> NonNull<u8> {
        self.start
    }

    /// One past the last committed byte.
    #[inline]
    pub fn end(&self) -> NonNull<u8> {
        unsafe { self.start.add(self.committed) }
    }

    #[inline]
    pub fn committed(&self) -> usize {
        self.committed
    }

    #[inline]
    pub fn reserved(&self) -> usize {
        self.reserved
    }

    /// Whether `addr` lies inside the committed range.
    #[inline]
    pub fn contains(&self, addr: NonNull<u8>) -> bool {
        let start = self.start.as_ptr() as usize;
        let addr = addr.as_ptr() as usize;

        addr >= start && addr < start + self.committed
    }

    /// Offset of `addr` from the start of the region.
    #[inline]
    pub(crate) fn offset_of(&self, addr: NonNull<u8>) -> usize {
        addr.as_ptr() as usize - self.start.as_ptr() as usize
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if let Err(err) = unsafe { release_memory(self.start, self.reserved) } {
            fatal!("failed to release region {:p}: {}", self.start, err);
        }
    }
}

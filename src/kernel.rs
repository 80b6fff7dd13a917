use std::{ptr::NonNull, sync::OnceLock};

use crate::error::{AllocError, AllocResult};

/// Virtual memory page size of the computer. This is usually 4096.
/// We can't know it at compile time, so it is queried once and cached.
static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

/// Minimum size and alignment of a reservation. Equal to the page size on unix,
/// 64 KiB on windows.
static ALLOCATION_GRANULARITY: OnceLock<usize> = OnceLock::new();

/// Marker type the platform specific implementations hang from.
pub(crate) struct Kernel;

/// This trait provides an abstraction to handle low level memory operations
/// and syscalls. The regions built on top of it only know about the reserve then
/// commit model, not about the concrete APIs offered by each kernel.
trait PlatformMemory {
    /// Reserves `len` bytes of address space without backing them with memory.
    /// Returns None if the underlying syscall fails.
    unsafe fn reserve(len: usize) -> Option<NonNull<u8>>;

    /// Backs `len` bytes starting at `addr` (inside a reservation) with read-write memory.
    unsafe fn commit(addr: NonNull<u8>, len: usize) -> bool;

    /// Returns a whole reservation of size `len` starting from `addr` back to the kernel.
    unsafe fn release(addr: NonNull<u8>, len: usize) -> bool;

    /// Returns the virtual memory page size of the computer in bytes.
    fn page_size() -> usize;

    /// Returns the granularity reservations are rounded to.
    fn allocation_granularity() -> usize;
}

/// Wrapper to get the computer's page size.
#[inline]
pub(crate) fn page_size() -> usize {
    *PAGE_SIZE.get_or_init(Kernel::page_size)
}

/// Wrapper to get the reservation granularity. Never smaller than [`page_size`].
#[inline]
pub(crate) fn allocation_granularity() -> usize {
    *ALLOCATION_GRANULARITY.get_or_init(|| Kernel::allocation_granularity().max(page_size()))
}

/// Wrapper to use [`PlatformMemory::reserve`].
pub(crate) unsafe fn reserve_memory(len: usize) -> AllocResult<NonNull<u8>> {
    unsafe { Kernel::reserve(len) }.ok_or_else(|| os_error("reservation", len))
}

/// Wrapper to use [`PlatformMemory::commit`].
///
/// **SAFETY**: `addr..addr + len` must lie inside a live reservation.
pub(crate) unsafe fn commit_memory(addr: NonNull<u8>, len: usize) -> AllocResult<()> {
    if unsafe { Kernel::commit(addr, len) } {
        Ok(())
    } else {
        Err(os_error("commit", len))
    }
}

/// Wrapper to use [`PlatformMemory::release`].
///
/// **SAFETY**: `addr` and `len` must describe a whole reservation made by [`reserve_memory`]
/// and nothing may point into it afterwards.
pub(crate) unsafe fn release_memory(addr: NonNull<u8>, len: usize) -> AllocResult<()> {
    if unsafe { Kernel::release(addr, len) } {
        Ok(())
    } else {
        Err(os_error("release", len))
    }
}

fn os_error(operation: &'static str, size: usize) -> AllocError {
    AllocError::Os {
        operation,
        size,
        reason: std::io::Error::last_os_error().to_string(),
    }
}

#[cfg(unix)]
mod unix {
    use super::{Kernel, PlatformMemory};

    use libc::{mmap, mprotect, munmap, off_t, size_t};

    use std::{
        os::raw::{c_int, c_void},
        ptr::NonNull,
    };

    impl PlatformMemory for Kernel {
        unsafe fn reserve(len: usize) -> Option<NonNull<u8>> {
            // mmap parameters.
            const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
            // No access until committed.
            const PROT: c_int = libc::PROT_NONE;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
            const FD: c_int = -1;
            const OFFSET: off_t = 0;

            unsafe {
                let addr = mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET);

                match addr {
                    libc::MAP_FAILED => None,
                    addr => NonNull::new(addr.cast::<u8>()),
                }
            }
        }

        unsafe fn commit(addr: NonNull<u8>, len: usize) -> bool {
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;

            unsafe { mprotect(addr.as_ptr().cast::<c_void>(), len as size_t, PROT) == 0 }
        }

        unsafe fn release(addr: NonNull<u8>, len: usize) -> bool {
            unsafe { munmap(addr.as_ptr().cast::<c_void>(), len as size_t) == 0 }
        }

        fn page_size() -> usize {
            unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
        }

        fn allocation_granularity() -> usize {
            Self::page_size()
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::{mem::MaybeUninit, os::raw::c_void, ptr::NonNull};

    use crate::kernel::{Kernel, PlatformMemory};

    use windows::Win32::System::{Memory, SystemInformation};

    fn system_info() -> SystemInformation::SYSTEM_INFO {
        unsafe {
            let mut system_info = MaybeUninit::uninit();
            SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

            system_info.assume_init()
        }
    }

    impl PlatformMemory for Kernel {
        unsafe fn reserve(len: usize) -> Option<NonNull<u8>> {
            unsafe {
                let addr = Memory::VirtualAlloc(None, len, Memory::MEM_RESERVE, Memory::PAGE_NOACCESS);

                NonNull::new(addr.cast())
            }
        }

        unsafe fn commit(addr: NonNull<u8>, len: usize) -> bool {
            unsafe {
                let committed = Memory::VirtualAlloc(
                    Some(addr.as_ptr() as *const c_void),
                    len,
                    Memory::MEM_COMMIT,
                    Memory::PAGE_READWRITE,
                );

                !committed.is_null()
            }
        }

        unsafe fn release(addr: NonNull<u8>, _len: usize) -> bool {
            unsafe { Memory::VirtualFree(addr.as_ptr() as *mut c_void, 0, Memory::MEM_RELEASE).is_ok() }
        }

        fn page_size() -> usize {
            system_info().dwPageSize as usize
        }

        fn allocation_granularity() -> usize {
            system_info().dwAllocationGranularity as usize
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_a_power_of_two() {
        assert!(page_size().is_power_of_two());
        assert!(allocation_granularity() >= page_size());
        assert_eq!(0, allocation_granularity() % page_size());
    }

    #[test]
    fn committed_memory_is_writable() {
        let len = allocation_granularity() * 4;

        unsafe {
            let addr = reserve_memory(len).unwrap();
            commit_memory(addr, page_size()).unwrap();

            addr.as_ptr().write(0xAB);
            addr.as_ptr().add(page_size() - 1).write(0xCD);
            assert_eq!(0xAB, *addr.as_ptr());
            assert_eq!(0xCD, *addr.as_ptr().add(page_size() - 1));

            release_memory(addr, len).unwrap();
        }
    }
}

//! Typed helpers on top of an [`AllocatorHandle`].
//!
//! [`new`] and [`free`] handle single values. [`new_array`] and [`free_array`] handle
//! arrays. Arrays of types with drop glue carry their length in an [`ArrayHeader`]
//! placed right before the first element, so [`free_array`] knows how many elements
//! to drop:
//!
//! ```text
//!    +---------+--------+------+------+-----+------+
//!    | padding | length |  T0  |  T1  | ... | Tn-1 |
//!    +---------+--------+------+------+-----+------+
//!                       ^
//!                       returned pointer
//! ```
//!
//! Arrays of plain data get exactly `len * size_of::<T>()` bytes and no header.
//!
//! A pointer from [`new`] must go back through [`free`], and one from [`new_array`]
//! through [`free_array`]. Mixing them is undefined behaviour since the header may
//! or may not be there.

use std::{
    alloc::Layout,
    mem,
    ptr::{self, NonNull},
};

use crate::{allocator::AllocatorHandle, error::AllocResult, utils::align};

/// Length prefix of arrays whose elements need dropping.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayHeader {
    pub length: usize,
}

impl ArrayHeader {
    /// **SAFETY**: `data` must come from [`new_array`] with a header, i.e. `T` needs drop.
    unsafe fn of<T>(data: NonNull<T>) -> NonNull<ArrayHeader> {
        unsafe { data.cast::<ArrayHeader>().sub(1) }
    }
}

/// Distance from the start of the block to the first element when there is a header.
///
/// The header ends right where the data begins, any extra space needed to align the
/// data goes in front of it.
fn header_offset<T>() -> usize {
    align(mem::size_of::<ArrayHeader>(), mem::align_of::<T>())
}

fn has_header<T>() -> bool {
    mem::needs_drop::<T>()
}

/// Layout of the whole block backing `len` elements, plus the offset of the data.
fn array_layout<T>(len: usize) -> AllocResult<(Layout, usize)> {
    let data = Layout::array::<T>(len)?;

    let (offset, align) = if has_header::<T>() {
        (header_offset::<T>(), data.align().max(mem::align_of::<ArrayHeader>()))
    } else {
        (0, data.align())
    };

    // Allocators refuse empty blocks, so empty arrays still take one byte.
    let layout = Layout::from_size_align((offset + data.size()).max(1), align)?;

    Ok((layout, offset))
}

/// Moves `value` into a fresh block from `allocator`.
pub fn new<T>(allocator: AllocatorHandle<'_>, value: T) -> AllocResult<NonNull<T>> {
    let layout = Layout::from_size_align(mem::size_of::<T>().max(1), mem::align_of::<T>())?;
    let ptr = allocator.allocate(layout)?.cast::<T>();

    unsafe { ptr.write(value) };

    Ok(ptr)
}

/// Drops the value at `ptr` and returns its block to `allocator`.
///
/// # Safety
/// `ptr` must come from [`new`] with the same allocator and must not be used again.
pub unsafe fn free<T>(allocator: AllocatorHandle<'_>, ptr: NonNull<T>) {
    unsafe {
        ptr.drop_in_place();
        allocator.deallocate(ptr.cast());
    }
}

/// Array of `len` default values.
pub fn new_array<T: Default>(allocator: AllocatorHandle<'_>, len: usize) -> AllocResult<NonNull<T>> {
    new_array_with(allocator, len, |_| T::default())
}

/// Array of `len` elements where element `i` is `init(i)`.
///
/// If `init` panics the elements built so far are dropped and the block is freed.
pub fn new_array_with<T, F>(allocator: AllocatorHandle<'_>, len: usize, mut init: F) -> AllocResult<NonNull<T>>
where
    F: FnMut(usize) -> T,
{
    let (layout, offset) = array_layout::<T>(len)?;
    let block = allocator.allocate(layout)?;
    let data = unsafe { block.add(offset) }.cast::<T>();

    let mut guard = PartialArray {
        allocator,
        block,
        data,
        initialized: 0,
    };

    for index in 0..len {
        unsafe { data.add(index).write(init(index)) };
        guard.initialized += 1;
    }
    mem::forget(guard);

    if has_header::<T>() {
        unsafe { ArrayHeader::of(data).write(ArrayHeader { length: len }) };
    }

    Ok(data)
}

/// Drops every element of the array at `ptr` and returns its block to `allocator`.
///
/// # Safety
/// `ptr` must come from [`new_array`] or [`new_array_with`] with the same allocator and
/// must not be used again.
pub unsafe fn free_array<T>(allocator: AllocatorHandle<'_>, ptr: NonNull<T>) {
    unsafe {
        if has_header::<T>() {
            let length = ArrayHeader::of(ptr).read().length;
            ptr::drop_in_place(NonNull::slice_from_raw_parts(ptr, length).as_ptr());
            allocator.deallocate(ptr.cast::<u8>().sub(header_offset::<T>()));
        } else {
            allocator.deallocate(ptr.cast());
        }
    }
}

/// Length stored in front of the array at `ptr`, `None` for plain data arrays which
/// carry no header.
///
/// # Safety
/// `ptr` must be a live array from [`new_array`] or [`new_array_with`].
pub unsafe fn array_len<T>(ptr: NonNull<T>) -> Option<usize> {
    has_header::<T>().then(|| unsafe { ArrayHeader::of(ptr).read().length })
}

/// Cleans up a half built array when an initializer panics.
struct PartialArray<'a, T> {
    allocator: AllocatorHandle<'a>,
    block: NonNull<u8>,
    data: NonNull<T>,
    initialized: usize,
}

impl<T> Drop for PartialArray<'_, T> {
    fn drop(&mut self) {
        unsafe {
            ptr::drop_in_place(NonNull::slice_from_raw_parts(self.data, self.initialized).as_ptr());
            self.allocator.deallocate(self.block);
        }
    }
}

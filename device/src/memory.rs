//! Untyped and typed views of device memory.
//!
//! A view is an opaque base address plus a length. It never owns the
//! allocation behind it: that stays with whichever [`crate::Allocator`]
//! produced the region, and the view is only ever dereferenced by the
//! execution engine that understands the address space.

use std::fmt;
use std::marker::PhantomData;

use snafu::ensure;

use crate::error::{OutOfBoundsSnafu, Result};

/// Opaque region of device memory.
///
/// Freely copyable; copying a view does not duplicate or retain the
/// underlying allocation. The null view (`ptr == null`, `size == 0`) is the
/// default and marks "no memory".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceMemory {
    ptr: *mut u8,
    size: usize,
}

// SAFETY: a view is an address value. Nothing dereferences it safely; the
// engine that does is responsible for synchronizing access.
unsafe impl Send for DeviceMemory {}
unsafe impl Sync for DeviceMemory {}

impl Default for DeviceMemory {
    fn default() -> Self {
        Self::null()
    }
}

impl DeviceMemory {
    /// View over `size` bytes starting at `ptr`.
    pub const fn new(ptr: *mut u8, size: usize) -> Self {
        Self { ptr, size }
    }

    /// The empty view.
    pub const fn null() -> Self {
        Self { ptr: std::ptr::null_mut(), size: 0 }
    }

    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    /// Length of the region in bytes.
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Opaque base address.
    pub const fn opaque(&self) -> *mut u8 {
        self.ptr
    }

    /// Base address as a pointer-sized integer, the form a packed launch
    /// slot stores.
    pub fn addr(&self) -> usize {
        self.ptr as usize
    }

    /// Sub-view of `size` bytes starting `offset` bytes into this region.
    pub fn byte_slice(&self, offset: usize, size: usize) -> Result<DeviceMemory> {
        ensure!(
            offset.checked_add(size).is_some_and(|end| end <= self.size),
            OutOfBoundsSnafu { offset, size, region_size: self.size }
        );
        Ok(Self::new(self.ptr.wrapping_add(offset), size))
    }
}

/// Typed view over a [`DeviceMemory`] region.
///
/// Adds an element type for counting and for the typed packing path; the
/// region itself stays opaque and unowned.
pub struct DeviceSlice<T> {
    mem: DeviceMemory,
    _element: PhantomData<fn() -> T>,
}

// Derives would demand `T: Clone`/`T: Copy`; the view is copyable for any T.
impl<T> Clone for DeviceSlice<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for DeviceSlice<T> {}

impl<T> fmt::Debug for DeviceSlice<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSlice")
            .field("memory", &self.mem)
            .field("element_count", &self.element_count())
            .finish()
    }
}

impl<T> DeviceSlice<T> {
    /// Reinterpret an untyped region as elements of `T`. Trailing bytes that
    /// do not fill a whole element are ignored by [`Self::element_count`].
    pub const fn from_memory(mem: DeviceMemory) -> Self {
        Self { mem, _element: PhantomData }
    }

    pub fn is_null(&self) -> bool {
        self.mem.is_null()
    }

    pub const fn element_count(&self) -> usize {
        match size_of::<T>() {
            0 => 0,
            elem => self.mem.size() / elem,
        }
    }

    pub const fn size(&self) -> usize {
        self.mem.size()
    }

    pub const fn opaque(&self) -> *mut u8 {
        self.mem.opaque()
    }

    /// The untyped view this slice wraps.
    pub const fn memory(&self) -> DeviceMemory {
        self.mem
    }
}

impl<T> From<DeviceSlice<T>> for DeviceMemory {
    fn from(slice: DeviceSlice<T>) -> Self {
        slice.mem
    }
}

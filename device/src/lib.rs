//! Device memory views and allocation for potok.
//!
//! Memory is consumed everywhere as opaque views: an address plus a length
//! whose ownership stays with the allocator that produced it. [`Allocator`]
//! is the seam a real device engine implements; [`HostAllocator`] is the
//! system-memory reference implementation the in-process engine and the
//! tests run on.

pub mod allocator;
pub mod error;
pub mod memory;


pub use allocator::{Allocator, CachingAllocator, DeviceAllocation, HOST_ALLOC_ALIGN, HostAllocator};
pub use error::*;
pub use memory::{DeviceMemory, DeviceSlice};

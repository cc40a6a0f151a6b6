//! Allocation seam behind the memory views.

use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use snafu::{OptionExt, ensure};

use crate::error::{AllocationFailedSnafu, Result};
use crate::memory::{DeviceMemory, DeviceSlice};

/// Alignment of every block handed out by [`HostAllocator`]. Covers the
/// widest packed argument slot.
pub const HOST_ALLOC_ALIGN: usize = 16;

pub trait Allocator: Send + Sync + std::fmt::Debug {
    /// Allocate `size` bytes of zero-initialized device-visible memory.
    fn allocate(&self, size: usize) -> Result<DeviceMemory>;

    /// Return a region previously obtained from [`Allocator::allocate`].
    /// Must be the exact region, not a sub-view.
    fn deallocate(&self, mem: DeviceMemory);

    fn name(&self) -> &str;
}

/// Reference allocator backed by system memory.
#[derive(Debug, Clone, Default)]
pub struct HostAllocator;

impl HostAllocator {
    fn layout(size: usize) -> Option<Layout> {
        // Zero-sized requests still get a distinct, properly aligned address.
        Layout::from_size_align(size.max(1), HOST_ALLOC_ALIGN).ok()
    }
}

impl Allocator for HostAllocator {
    fn allocate(&self, size: usize) -> Result<DeviceMemory> {
        let layout = Self::layout(size).context(AllocationFailedSnafu { size })?;
        // SAFETY: `layout` has non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        ensure!(!ptr.is_null(), AllocationFailedSnafu { size });
        Ok(DeviceMemory::new(ptr, size))
    }

    fn deallocate(&self, mem: DeviceMemory) {
        if mem.is_null() {
            return;
        }
        let layout = Self::layout(mem.size()).expect("layout was valid at allocation");
        // SAFETY: `mem` came from `allocate` with this exact layout.
        unsafe { alloc::dealloc(mem.opaque(), layout) };
    }

    fn name(&self) -> &str {
        "host"
    }
}

/// Caching wrapper that recycles freed blocks by exact size.
#[derive(Debug)]
pub struct CachingAllocator {
    inner: Arc<dyn Allocator>,
    cache: Mutex<HashMap<usize, Vec<DeviceMemory>>>,
    max_blocks_per_size: usize,
    name: String,
}

impl CachingAllocator {
    pub fn new(inner: Arc<dyn Allocator>) -> Self {
        Self::with_capacity(inner, 32)
    }

    pub fn with_capacity(inner: Arc<dyn Allocator>, max_blocks_per_size: usize) -> Self {
        let name = format!("caching-{}", inner.name());
        Self { inner, cache: Mutex::new(HashMap::new()), max_blocks_per_size, name }
    }

    /// Release every cached block back to the inner allocator.
    pub fn trim(&self) {
        let mut cache = self.cache.lock().unwrap();
        for (_, blocks) in cache.drain() {
            for block in blocks {
                self.inner.deallocate(block);
            }
        }
    }
}

impl Allocator for CachingAllocator {
    fn allocate(&self, size: usize) -> Result<DeviceMemory> {
        {
            let mut cache = self.cache.lock().unwrap();
            if let Some(blocks) = cache.get_mut(&size)
                && let Some(block) = blocks.pop()
            {
                if blocks.is_empty() {
                    cache.remove(&size);
                }
                // Recycled blocks keep the all-zero contract.
                // SAFETY: the block is cached, so nothing else references it.
                unsafe { std::ptr::write_bytes(block.opaque(), 0, block.size()) };
                return Ok(block);
            }
        } // Drop lock before allocating

        match self.inner.allocate(size) {
            Ok(block) => Ok(block),
            Err(e) => {
                // Under memory pressure, return cached blocks and retry once.
                self.trim();
                self.inner.allocate(size).map_err(|_| e)
            }
        }
    }

    fn deallocate(&self, mem: DeviceMemory) {
        if mem.is_null() {
            return;
        }
        let mut cache = self.cache.lock().unwrap();
        let blocks = cache.entry(mem.size()).or_default();
        if blocks.len() < self.max_blocks_per_size {
            blocks.push(mem);
        } else {
            self.inner.deallocate(mem);
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for CachingAllocator {
    fn drop(&mut self) {
        self.trim();
    }
}

/// Owning allocation: a region plus the allocator that produced it, freed
/// on drop. Views handed out by [`Self::memory`] must not outlive it.
#[derive(Debug)]
pub struct DeviceAllocation {
    mem: DeviceMemory,
    allocator: Arc<dyn Allocator>,
}

impl DeviceAllocation {
    pub fn new(allocator: &Arc<dyn Allocator>, size: usize) -> Result<Self> {
        let mem = allocator.allocate(size)?;
        Ok(Self { mem, allocator: Arc::clone(allocator) })
    }

    pub fn memory(&self) -> DeviceMemory {
        self.mem
    }

    pub fn typed<T>(&self) -> DeviceSlice<T> {
        DeviceSlice::from_memory(self.mem)
    }

    pub fn size(&self) -> usize {
        self.mem.size()
    }
}

impl Drop for DeviceAllocation {
    fn drop(&mut self) {
        self.allocator.deallocate(self.mem);
    }
}

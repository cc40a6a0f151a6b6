use std::sync::Arc;

use test_case::test_case;

use crate::allocator::{Allocator, CachingAllocator, DeviceAllocation, HOST_ALLOC_ALIGN, HostAllocator};

fn host() -> Arc<dyn Allocator> {
    Arc::new(HostAllocator)
}

#[test_case(1; "single_byte")]
#[test_case(24; "unaligned_tail")]
#[test_case(256; "power_of_two")]
#[test_case(4096; "page_sized")]
fn test_host_allocations_are_zeroed_and_aligned(size: usize) {
    let allocator = host();
    let mem = allocator.allocate(size).unwrap();

    assert_eq!(mem.size(), size);
    assert_eq!(mem.addr() % HOST_ALLOC_ALIGN, 0);
    let bytes = unsafe { std::slice::from_raw_parts(mem.opaque(), mem.size()) };
    assert!(bytes.iter().all(|b| *b == 0));

    allocator.deallocate(mem);
}

#[test]
fn test_zero_sized_allocation() {
    let allocator = host();
    let mem = allocator.allocate(0).unwrap();

    assert!(!mem.is_null());
    assert_eq!(mem.size(), 0);

    allocator.deallocate(mem);
}

#[test]
fn test_caching_allocator_recycles_blocks() {
    let caching = CachingAllocator::new(host());

    let first = caching.allocate(1024).unwrap();
    let first_addr = first.addr();
    caching.deallocate(first);

    // Same size comes straight out of the cache.
    let second = caching.allocate(1024).unwrap();
    assert_eq!(second.addr(), first_addr);
    caching.deallocate(second);
}

#[test]
fn test_recycled_blocks_are_rezeroed() {
    let caching = CachingAllocator::new(host());

    let block = caching.allocate(64).unwrap();
    unsafe { std::ptr::write_bytes(block.opaque(), 0xAB, block.size()) };
    caching.deallocate(block);

    let recycled = caching.allocate(64).unwrap();
    let bytes = unsafe { std::slice::from_raw_parts(recycled.opaque(), recycled.size()) };
    assert!(bytes.iter().all(|b| *b == 0));
    caching.deallocate(recycled);
}

#[test]
fn test_trim_survives_reallocation() {
    let caching = CachingAllocator::new(host());

    let block = caching.allocate(128).unwrap();
    caching.deallocate(block);
    caching.trim();

    let fresh = caching.allocate(128).unwrap();
    assert_eq!(fresh.size(), 128);
    caching.deallocate(fresh);
}

#[test]
fn test_device_allocation_frees_on_drop() {
    let caching: Arc<dyn Allocator> = Arc::new(CachingAllocator::new(host()));

    let addr = {
        let alloc = DeviceAllocation::new(&caching, 512).unwrap();
        alloc.memory().addr()
    };

    // The dropped guard returned its block to the cache.
    let reused = caching.allocate(512).unwrap();
    assert_eq!(reused.addr(), addr);
    caching.deallocate(reused);
}

#[test]
fn test_typed_allocation_view() {
    let allocator = host();
    let alloc = DeviceAllocation::new(&allocator, 16).unwrap();

    let ints = alloc.typed::<i32>();
    assert_eq!(ints.element_count(), 4);
    assert_eq!(ints.memory(), alloc.memory());
}

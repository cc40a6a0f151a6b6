use potok_device::DeviceMemory;
use test_case::test_case;

use crate::args::{
    KernelArg, KernelArgsBuilder, MAX_PACKED_ARGS, pack_arg_list, pack_kernel_args,
    pack_kernel_args_for,
};
use crate::error::ErrorKind;
use crate::executor::Executor;
use crate::kernel::KernelMetadata;
use crate::test::kernels;

// Packing never dereferences device handles, so fabricated addresses are
// fine here.
fn fake_memory(addr: usize, size: usize) -> DeviceMemory {
    DeviceMemory::new(addr as *mut u8, size)
}

#[test_case(0, 4; "empty list uses the smallest tier")]
#[test_case(4, 4; "four fill the smallest tier")]
#[test_case(5, 8; "five spill into eight")]
#[test_case(8, 8; "eight")]
#[test_case(9, 16; "nine")]
#[test_case(16, 16; "sixteen")]
#[test_case(17, 32; "seventeen")]
#[test_case(32, 32; "thirty two")]
#[test_case(33, 64; "thirty three")]
#[test_case(64, 64; "sixty four")]
#[test_case(65, 256; "sixty five jumps to two fifty six")]
#[test_case(256, 256; "two fifty six")]
#[test_case(257, 512; "two fifty seven")]
#[test_case(512, 512; "five twelve")]
#[test_case(513, 1024; "five thirteen")]
#[test_case(1024, 1024; "largest tier")]
fn test_tier_selection(count: usize, capacity: usize) {
    let args: Vec<DeviceMemory> = (0..count).map(|i| fake_memory(0x1000 + i * 16, 16)).collect();
    let packed = pack_kernel_args(&args, 0).unwrap();
    assert_eq!(packed.storage_capacity(), capacity);
    assert_eq!(packed.argument_count(), count);
}

#[test]
fn test_over_the_hard_cap_fails() {
    let args = vec![fake_memory(0x1000, 4); MAX_PACKED_ARGS + 1];
    let error = pack_kernel_args(&args, 0).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn test_packed_slots_hold_the_device_addresses() {
    let args = [fake_memory(0xA000, 64), fake_memory(0xB000, 64), fake_memory(0xC000, 64)];
    let packed = pack_kernel_args(&args, 0).unwrap();
    let addresses = packed.packed_addresses().unwrap();
    assert_eq!(addresses.len(), 3);
    for (slot, mem) in addresses.iter().zip(&args) {
        let value = unsafe { std::ptr::read(slot.cast::<u64>()) };
        assert_eq!(value, mem.addr() as u64);
    }
}

#[test]
fn test_addresses_survive_moving_the_handle() {
    let packed = pack_kernel_args(&[fake_memory(0xA000, 64)], 0).unwrap();
    let before = packed.packed_addresses().unwrap().to_vec();
    // Moving the handle moves the Arc, never the packed storage.
    let moved = Box::new(packed);
    let after = moved.packed_addresses().unwrap().to_vec();
    assert_eq!(before, after);
    let value = unsafe { std::ptr::read(after[0].cast::<u64>()) };
    assert_eq!(value, 0xA000);
}

#[test]
fn test_each_argument_gets_its_own_slot() {
    let args: Vec<DeviceMemory> = (0..8).map(|i| fake_memory(0x1000 + i, 1)).collect();
    let packed = pack_kernel_args(&args, 0).unwrap();
    let addresses = packed.packed_addresses().unwrap();
    let mut sorted = addresses.to_vec();
    sorted.sort();
    sorted.dedup();
    assert_eq!(sorted.len(), addresses.len());
}

#[test]
fn test_shared_memory_adds_a_synthetic_argument() {
    let args = [fake_memory(0xA000, 64)];
    let without = pack_kernel_args(&args, 0).unwrap();
    let with = pack_kernel_args(&args, 256).unwrap();
    assert_eq!(without.argument_count(), 1);
    assert_eq!(with.argument_count(), 2);
    assert_eq!(with.shared_memory_bytes(), 256);
    // The synthetic slot has no address entry of its own.
    assert_eq!(with.packed_addresses().unwrap().len(), 1);
}

#[test]
fn test_metadata_flavor_takes_shared_bytes_from_the_kernel() {
    let executor = Executor::new();
    let mut kernel = executor.load_kernel(&kernels::add_spec()).unwrap();
    let mut metadata = KernelMetadata::default();
    metadata.set_shared_memory_bytes(512);
    kernel.set_metadata(metadata);

    let args = [fake_memory(0xA000, 64), fake_memory(0xB000, 64), fake_memory(0xC000, 64)];
    let packed = pack_kernel_args_for(&kernel, &args).unwrap();
    assert_eq!(packed.shared_memory_bytes(), 512);
    assert_eq!(packed.argument_count(), 4);
}

#[test]
fn test_pod_at_the_slot_boundary_packs() {
    let mut builder = KernelArgsBuilder::new();
    builder.add_pod(u64::MAX).unwrap();
    builder.add_pod(1u8).unwrap();
    let packed = builder.pack().unwrap();
    assert_eq!(packed.argument_count(), 2);
    let addresses = packed.packed_addresses().unwrap();
    let wide = unsafe { std::ptr::read(addresses[0].cast::<u64>()) };
    let narrow = unsafe { std::ptr::read(addresses[1].cast::<u8>()) };
    assert_eq!(wide, u64::MAX);
    assert_eq!(narrow, 1);
}

#[test]
fn test_oversized_pod_is_rejected() {
    #[derive(Clone, Copy)]
    struct Wide {
        _a: u64,
        _b: u64,
    }
    let mut builder = KernelArgsBuilder::new();
    let error = builder.add_pod(Wide { _a: 0, _b: 0 }).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::InvalidArgument);
    assert_eq!(builder.staged_count(), 0);
}

#[test]
fn test_overaligned_pod_is_rejected() {
    #[derive(Clone, Copy)]
    #[repr(align(32))]
    struct Overaligned(u8);
    let mut builder = KernelArgsBuilder::new();
    let error = builder.add_pod(Overaligned(0)).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn test_builder_mixes_device_and_pod_arguments() {
    let mut builder = KernelArgsBuilder::new();
    builder.add_device_memory(fake_memory(0xA000, 64));
    builder.add_pod(7i32).unwrap();
    builder.add_shared_bytes(128).add_shared_bytes(64);
    let packed = builder.pack().unwrap();
    assert_eq!(packed.argument_count(), 3);
    assert_eq!(packed.shared_memory_bytes(), 192);
    let addresses = packed.packed_addresses().unwrap();
    let device = unsafe { std::ptr::read(addresses[0].cast::<u64>()) };
    let pod = unsafe { std::ptr::read(addresses[1].cast::<i32>()) };
    assert_eq!(device, 0xA000);
    assert_eq!(pod, 7);
}

#[test]
fn test_typed_tuple_packs_at_natural_layout() {
    let packed = pack_arg_list((fake_memory(0xA000, 64), 5i32, 2.5f64), 0);
    assert_eq!(packed.argument_count(), 3);
    assert_eq!(packed.storage_capacity(), 3);
    let addresses = packed.packed_addresses().unwrap();
    unsafe {
        assert_eq!(std::ptr::read(addresses[0].cast::<u64>()), 0xA000);
        assert_eq!(std::ptr::read(addresses[1].cast::<i32>()), 5);
        assert_eq!(std::ptr::read(addresses[2].cast::<f64>()), 2.5);
    }
}

#[test]
fn test_typed_path_accepts_arguments_wider_than_a_slot() {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    struct Ptrs3 {
        a: u64,
        b: u64,
        c: u64,
    }
    impl KernelArg for Ptrs3 {
        type Stored = Ptrs3;

        fn store(&self) -> Ptrs3 {
            *self
        }
    }

    let value = Ptrs3 { a: 1, b: 2, c: 3 };
    let packed = pack_arg_list((value,), 0);
    let addresses = packed.packed_addresses().unwrap();
    let read = unsafe { std::ptr::read(addresses[0].cast::<Ptrs3>()) };
    assert_eq!(read, value);
}

#[test]
fn test_empty_tuple_packs_no_arguments() {
    let packed = pack_arg_list((), 0);
    assert_eq!(packed.argument_count(), 0);
    assert!(packed.packed_addresses().unwrap().is_empty());
}

use std::time::Instant;

use potok_device::DeviceSlice;

use crate::dims::{BlockDim, ThreadDim};
use crate::error::{Error, ErrorKind};
use crate::executor::Executor;
use crate::test::kernels::{self, STORE_DELAY};

fn read_u32(executor: &Executor, mem: potok_device::DeviceMemory, len: usize) -> Vec<u32> {
    let mut stream = executor.create_stream().unwrap();
    let mut bytes = vec![0u8; len * 4];
    stream.memcpy_dtoh(&mut bytes, mem).unwrap();
    bytes.chunks_exact(4).map(|c| u32::from_ne_bytes(c.try_into().unwrap())).collect()
}

#[test]
fn test_memset32_fills_whole_words() {
    let executor = Executor::new();
    let mut stream = executor.create_stream().unwrap();
    let alloc = executor.allocate_array::<u32>(8).unwrap();

    stream.memset32(alloc.memory(), 0xDEAD_BEEF, 32).unwrap();
    stream.synchronize().unwrap();
    assert_eq!(read_u32(&executor, alloc.memory(), 8), vec![0xDEAD_BEEF; 8]);
}

#[test]
fn test_memset32_rejects_unaligned_lengths() {
    let executor = Executor::new();
    let mut stream = executor.create_stream().unwrap();
    let alloc = executor.allocate_array::<u32>(8).unwrap();

    let error = stream.memset32(alloc.memory(), 0, 6).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn test_memset32_rejects_out_of_range_lengths() {
    let executor = Executor::new();
    let mut stream = executor.create_stream().unwrap();
    let alloc = executor.allocate_array::<u32>(8).unwrap();

    let error = stream.memset32(alloc.memory(), 0, 64).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn test_mem_zero_clears_the_allocation() {
    let executor = Executor::new();
    let mut stream = executor.create_stream().unwrap();
    let alloc = executor.allocate_array::<u32>(4).unwrap();

    stream.memcpy_htod(alloc.memory(), &[0xFF; 16]).unwrap();
    stream.mem_zero(alloc.memory()).unwrap();
    stream.synchronize().unwrap();
    assert_eq!(read_u32(&executor, alloc.memory(), 4), vec![0; 4]);
}

#[test]
fn test_host_copies_drain_queued_work_first() {
    let executor = Executor::new();
    let mut stream = executor.create_stream().unwrap();
    let alloc = executor.allocate_array::<u32>(4).unwrap();

    stream.memset32(alloc.memory(), 7, 16).unwrap();
    // No explicit synchronize: the copy itself waits for the memset.
    let mut bytes = [0u8; 16];
    stream.memcpy_dtoh(&mut bytes, alloc.memory()).unwrap();
    assert_eq!(u32::from_ne_bytes(bytes[..4].try_into().unwrap()), 7);
}

#[test]
fn test_immediate_launches_run_without_a_command_buffer() {
    let executor = Executor::new();
    let mut stream = executor.create_stream().unwrap();
    let kernel = executor
        .load_typed::<(DeviceSlice<i32>, DeviceSlice<i32>, DeviceSlice<i32>)>(&kernels::add_spec())
        .unwrap();

    let a = executor.allocate_array::<i32>(4).unwrap();
    let b = executor.allocate_array::<i32>(4).unwrap();
    let c = executor.allocate_array::<i32>(4).unwrap();
    let ones: Vec<u8> = std::iter::repeat_n(1i32.to_ne_bytes(), 4).flatten().collect();
    let twos: Vec<u8> = std::iter::repeat_n(2i32.to_ne_bytes(), 4).flatten().collect();
    stream.memcpy_htod(a.memory(), &ones).unwrap();
    stream.memcpy_htod(b.memory(), &twos).unwrap();

    stream
        .launch(&kernel, ThreadDim::x(4), BlockDim::x(1), (a.typed(), b.typed(), c.typed()))
        .unwrap();
    stream.synchronize().unwrap();

    let mut out = [0u8; 16];
    stream.memcpy_dtoh(&mut out, c.memory()).unwrap();
    assert!(out.chunks_exact(4).all(|c| i32::from_ne_bytes(c.try_into().unwrap()) == 3));
}

#[test]
fn test_failures_surface_at_synchronize_and_stay_sticky() {
    let executor = Executor::new();
    let mut stream = executor.create_stream().unwrap();
    let failing = executor.load_typed::<()>(&kernels::failing_spec()).unwrap();

    // The launch itself is accepted; the failure is asynchronous.
    stream.launch(&failing, ThreadDim::x(1), BlockDim::x(1), ()).unwrap();

    let error = stream.synchronize().unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Backend);
    assert!(matches!(error, Error::Execution { .. }));

    // Sticky: the same failure is reported again.
    let error = stream.synchronize().unwrap_err();
    assert!(matches!(error, Error::Execution { .. }));
}

#[test]
fn test_work_after_a_failure_still_runs() {
    let executor = Executor::new();
    let mut stream = executor.create_stream().unwrap();
    let failing = executor.load_typed::<()>(&kernels::failing_spec()).unwrap();
    let alloc = executor.allocate_array::<u32>(2).unwrap();

    stream.launch(&failing, ThreadDim::x(1), BlockDim::x(1), ()).unwrap();
    stream.memset32(alloc.memory(), 9, 8).unwrap();
    assert!(stream.synchronize().is_err());
    assert_eq!(read_u32(&executor, alloc.memory(), 2), vec![9; 2]);
}

#[test]
fn test_host_copies_wait_for_delayed_kernels() {
    let executor = Executor::new();
    let mut stream = executor.create_stream().unwrap();
    let kernel = executor
        .load_typed::<(DeviceSlice<u32>,)>(&kernels::delayed_store_spec())
        .unwrap();
    let flag = executor.allocate_array::<u32>(1).unwrap();

    let started = Instant::now();
    stream.launch(&kernel, ThreadDim::x(1), BlockDim::x(1), (flag.typed(),)).unwrap();
    let mut out = [0u8; 4];
    stream.memcpy_dtoh(&mut out, flag.memory()).unwrap();

    assert!(started.elapsed() >= STORE_DELAY);
    assert_eq!(u32::from_ne_bytes(out), 1);
}

#[test]
fn test_stream_launch_checks_the_packed_argument_count() {
    let executor = Executor::new();
    let mut stream = executor.create_stream().unwrap();
    let kernel = executor.load_kernel(&kernels::add_spec()).unwrap();
    let a = executor.allocate_array::<i32>(2).unwrap();

    let args = crate::args::pack_kernel_args(&[a.memory()], 0).unwrap();
    let error =
        stream.launch_packed(&kernel, ThreadDim::x(2), BlockDim::x(1), args).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::InvalidArgument);
}

//! Command graphs over an in-process execution engine.
//!
//! Models the record-once, submit-many execution style of GPU graph APIs:
//! kernel launches are recorded into a [`CommandBuffer`], frozen into an
//! executable snapshot, submitted to a [`Stream`] any number of times, and
//! re-parameterized in place through the update cycle.
//!
//! # Argument packing
//!
//! The `args` module packs kernel arguments into address-stable sets, either
//! dynamically (tiered fixed-size slots) or through compile-time typed
//! tuples. Packed sets are immutable and shared, so in-flight work never
//! observes a partially updated argument list.
//!
//! # Reference engine
//!
//! The `executor` module runs everything in-process: kernels are host
//! routines and device memory is allocator-backed host memory, which keeps
//! the whole contract exercisable without a device.

pub mod args;
pub mod command_buffer;
pub mod dims;
pub mod error;
pub mod executor;
pub mod kernel;
pub mod stream;


pub use args::{
    KernelArg, KernelArgList, KernelArgs, KernelArgsBuilder, KernelArgsKind, MAX_PACKED_ARGS,
    POD_ARG_MAX_ALIGN, POD_ARG_SLOT_BYTES, pack_arg_list, pack_kernel_args, pack_kernel_args_for,
    pack_typed_args,
};
pub use command_buffer::{CommandBuffer, Mode, NodeKind, State};
pub use dims::{BlockDim, ThreadDim};
pub use error::{Error, ErrorKind, Result};
pub use executor::Executor;
pub use kernel::{
    CacheConfig, HostKernelFn, Kernel, KernelCall, KernelLoaderSpec, KernelMetadata, TypedKernel,
};
pub use stream::Stream;

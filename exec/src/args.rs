//! Kernel-argument packing.
//!
//! A launch hands the engine one address per argument; each address points
//! at a slot holding either an opaque device address or a POD value. Two
//! packing paths produce that layout:
//!
//! - the dynamic path ([`pack_kernel_args`], [`KernelArgsBuilder`]) stores
//!   every argument in a fixed 8-byte slot and picks the smallest capacity
//!   tier that fits the list;
//! - the typed path ([`pack_typed_args`]) stores the argument tuple at its
//!   natural layout and checks the signature at compile time.
//!
//! Both produce an [`Arc<dyn KernelArgs>`] whose slot addresses point into
//! the object's own storage. The concrete types stay private and are built
//! inside their final allocation, so the addresses remain valid for the
//! object's entire lifetime.

use std::ffi::c_void;
use std::fmt;
use std::sync::Arc;

use potok_device::{DeviceMemory, DeviceSlice};
use smallvec::SmallVec;
use snafu::ensure;

use crate::error::{
    ArgumentCountMismatchSnafu, OversizedPodArgumentSnafu, Result, TooManyArgumentsSnafu,
};
use crate::kernel::{Kernel, TypedKernel};

/// Hard cap on packed arguments, the largest capacity tier.
pub const MAX_PACKED_ARGS: usize = 1024;

/// Byte size of one argument slot in the dynamic packer.
pub const POD_ARG_SLOT_BYTES: usize = 8;

/// Alignment ceiling for POD arguments in the dynamic packer.
pub const POD_ARG_MAX_ALIGN: usize = 16;

/// Storage kinds a packed argument set can take. A closed set: launch paths
/// match on it instead of downcasting.
pub enum KernelArgsKind<'a> {
    /// ABI-ready array of per-argument slot addresses.
    PackedArray(&'a [*const c_void]),
}

/// Read-only view of a packed argument set, as consumed by launches.
pub trait KernelArgs: fmt::Debug + Send + Sync {
    /// Number of arguments, counting the synthetic shared-memory slot when
    /// [`Self::shared_memory_bytes`] is non-zero.
    fn argument_count(&self) -> usize;

    /// Total dynamic shared memory requested for the launch.
    fn shared_memory_bytes(&self) -> u64;

    /// Capacity of the backing storage. For tiered storage this is the
    /// selected tier; typed storage is exact-fit.
    fn storage_capacity(&self) -> usize;

    fn kind(&self) -> KernelArgsKind<'_>;
}

impl dyn KernelArgs {
    /// Addresses of the explicit argument slots, if this set is stored as a
    /// packed array.
    pub fn packed_addresses(&self) -> Option<&[*const c_void]> {
        match self.kind() {
            KernelArgsKind::PackedArray(addresses) => Some(addresses),
        }
    }
}

/// Launch-time check that a packed set matches the kernel's declared
/// parameter count, counting the synthetic shared-memory slot.
pub(crate) fn check_argument_count(kernel: &Kernel, args: &dyn KernelArgs) -> Result<()> {
    let expected = kernel.arity() + (args.shared_memory_bytes() > 0) as usize;
    let provided = args.argument_count();
    ensure!(
        provided == expected,
        ArgumentCountMismatchSnafu { name: kernel.name(), expected, provided }
    );
    Ok(())
}

/// One slot of dynamic packed storage, aligned for any POD the packer
/// accepts.
#[derive(Clone, Copy)]
#[repr(C, align(16))]
struct ArgSlot([u8; POD_ARG_SLOT_BYTES]);

impl ArgSlot {
    const ZERO: ArgSlot = ArgSlot([0; POD_ARG_SLOT_BYTES]);
}

const _: () = assert!(align_of::<ArgSlot>() == POD_ARG_MAX_ALIGN);

/// Slot bytes staged for dynamic packing, before a tier is chosen.
#[derive(Clone, Copy, Debug)]
struct StagedArg {
    bytes: [u8; POD_ARG_SLOT_BYTES],
}

impl StagedArg {
    /// Device arguments pack as their opaque address.
    fn device(mem: &DeviceMemory) -> Self {
        Self { bytes: (mem.addr() as u64).to_ne_bytes() }
    }

    fn pod<T: Copy>(value: &T) -> Result<Self> {
        ensure!(
            size_of::<T>() <= POD_ARG_SLOT_BYTES && align_of::<T>() <= POD_ARG_MAX_ALIGN,
            OversizedPodArgumentSnafu { size: size_of::<T>(), align: align_of::<T>() }
        );
        let mut bytes = [0u8; POD_ARG_SLOT_BYTES];
        // SAFETY: the value fits the slot; both sides are plain bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(
                std::ptr::from_ref(value).cast::<u8>(),
                bytes.as_mut_ptr(),
                size_of::<T>(),
            );
        }
        Ok(Self { bytes })
    }
}

/// Dynamic packed storage with a fixed capacity tier.
struct PackedArray<const CAP: usize> {
    slots: [ArgSlot; CAP],
    addresses: [*const c_void; CAP],
    len: usize,
    shared_memory_bytes: u64,
}

// SAFETY: `addresses` only ever points into `slots` of the same object,
// and the object is immutable once published; dereferencing happens on the
// engine side under its own ordering.
unsafe impl<const CAP: usize> Send for PackedArray<CAP> {}
unsafe impl<const CAP: usize> Sync for PackedArray<CAP> {}

impl<const CAP: usize> PackedArray<CAP> {
    fn empty(shared_memory_bytes: u64) -> Self {
        Self {
            slots: [ArgSlot::ZERO; CAP],
            addresses: [std::ptr::null(); CAP],
            len: 0,
            shared_memory_bytes,
        }
    }

    fn seal(staged: &[StagedArg], shared_memory_bytes: u64) -> Arc<dyn KernelArgs> {
        debug_assert!(staged.len() <= CAP);
        let mut packed = Arc::new(Self::empty(shared_memory_bytes));
        let this = Arc::get_mut(&mut packed).expect("freshly created Arc is uniquely owned");
        for (slot, arg) in this.slots.iter_mut().zip(staged) {
            slot.0 = arg.bytes;
        }
        this.len = staged.len();
        // Addresses are captured only now, after the storage reached its
        // final heap location. The object is immutable from here on.
        for i in 0..this.len {
            this.addresses[i] = this.slots[i].0.as_ptr().cast();
        }
        packed
    }
}

impl<const CAP: usize> fmt::Debug for PackedArray<CAP> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackedArray")
            .field("capacity", &CAP)
            .field("len", &self.len)
            .field("shared_memory_bytes", &self.shared_memory_bytes)
            .finish()
    }
}

impl<const CAP: usize> KernelArgs for PackedArray<CAP> {
    fn argument_count(&self) -> usize {
        self.len + (self.shared_memory_bytes > 0) as usize
    }

    fn shared_memory_bytes(&self) -> u64 {
        self.shared_memory_bytes
    }

    fn storage_capacity(&self) -> usize {
        CAP
    }

    fn kind(&self) -> KernelArgsKind<'_> {
        KernelArgsKind::PackedArray(&self.addresses[..self.len])
    }
}

/// Pick the smallest tier that fits and seal the staged slots into it.
fn seal_staged(staged: &[StagedArg], shared_memory_bytes: u64) -> Result<Arc<dyn KernelArgs>> {
    Ok(match staged.len() {
        0..=4 => PackedArray::<4>::seal(staged, shared_memory_bytes),
        5..=8 => PackedArray::<8>::seal(staged, shared_memory_bytes),
        9..=16 => PackedArray::<16>::seal(staged, shared_memory_bytes),
        17..=32 => PackedArray::<32>::seal(staged, shared_memory_bytes),
        33..=64 => PackedArray::<64>::seal(staged, shared_memory_bytes),
        65..=256 => PackedArray::<256>::seal(staged, shared_memory_bytes),
        257..=512 => PackedArray::<512>::seal(staged, shared_memory_bytes),
        513..=1024 => PackedArray::<1024>::seal(staged, shared_memory_bytes),
        count => return TooManyArgumentsSnafu { count, limit: MAX_PACKED_ARGS }.fail(),
    })
}

/// Pack a list of device-memory arguments with an explicit shared-memory
/// request.
pub fn pack_kernel_args(
    args: &[DeviceMemory],
    shared_memory_bytes: u64,
) -> Result<Arc<dyn KernelArgs>> {
    let staged: SmallVec<[StagedArg; 8]> = args.iter().map(StagedArg::device).collect();
    seal_staged(&staged, shared_memory_bytes)
}

/// Pack a list of device-memory arguments, taking the shared-memory amount
/// from the kernel's metadata (zero when unset).
pub fn pack_kernel_args_for(kernel: &Kernel, args: &[DeviceMemory]) -> Result<Arc<dyn KernelArgs>> {
    pack_kernel_args(args, kernel.metadata().shared_memory_bytes().unwrap_or(0))
}

/// Incremental dynamic packing for mixed device/POD argument lists.
#[derive(Debug, Default)]
pub struct KernelArgsBuilder {
    staged: SmallVec<[StagedArg; 8]>,
    shared_memory_bytes: u64,
}

impl KernelArgsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device_memory(&mut self, mem: DeviceMemory) -> &mut Self {
        self.staged.push(StagedArg::device(&mem));
        self
    }

    /// Stage a POD value. Fails when the value exceeds
    /// [`POD_ARG_SLOT_BYTES`] or [`POD_ARG_MAX_ALIGN`].
    pub fn add_pod<T: Copy>(&mut self, value: T) -> Result<&mut Self> {
        self.staged.push(StagedArg::pod(&value)?);
        Ok(self)
    }

    /// Accumulate dynamic shared memory for the launch.
    pub fn add_shared_bytes(&mut self, bytes: u64) -> &mut Self {
        self.shared_memory_bytes += bytes;
        self
    }

    /// Number of explicit arguments staged so far.
    pub fn staged_count(&self) -> usize {
        self.staged.len()
    }

    pub fn pack(&self) -> Result<Arc<dyn KernelArgs>> {
        seal_staged(&self.staged, self.shared_memory_bytes)
    }
}

/// Packing rule for one typed kernel argument.
///
/// `Stored` is the exact bit pattern placed in the argument slot: device
/// views normalize to their opaque address as a `u64`, POD values store
/// themselves. Raw host pointers deliberately have no impl; passing one is
/// a compile error.
pub trait KernelArg {
    type Stored: Copy + Send + Sync + 'static;

    fn store(&self) -> Self::Stored;
}

impl KernelArg for DeviceMemory {
    type Stored = u64;

    fn store(&self) -> u64 {
        self.addr() as u64
    }
}

impl KernelArg for &DeviceMemory {
    type Stored = u64;

    fn store(&self) -> u64 {
        self.addr() as u64
    }
}

impl<T> KernelArg for DeviceSlice<T> {
    type Stored = u64;

    fn store(&self) -> u64 {
        self.memory().addr() as u64
    }
}

impl<T> KernelArg for &DeviceSlice<T> {
    type Stored = u64;

    fn store(&self) -> u64 {
        self.memory().addr() as u64
    }
}

macro_rules! impl_pod_kernel_arg {
    ($($ty:ty),* $(,)?) => {
        $(
            impl KernelArg for $ty {
                type Stored = $ty;

                fn store(&self) -> $ty {
                    *self
                }
            }
        )*
    };
}

impl_pod_kernel_arg!(bool, i8, i16, i32, i64, isize, u8, u16, u32, u64, usize, f32, f64);

/// Tuple of kernel arguments for the typed packing path.
///
/// Implemented for tuples up to 16 elements. `ARITY` is checked against the
/// loader spec when a [`TypedKernel`] is loaded.
pub trait KernelArgList {
    const ARITY: usize;

    /// Storage layout of the packed tuple.
    type Stored: Copy + Send + Sync + 'static;

    fn store(&self) -> Self::Stored;

    /// Push the address of every stored argument, in declaration order.
    fn capture_addresses(stored: &Self::Stored, out: &mut SmallVec<[*const c_void; 8]>);
}

macro_rules! impl_kernel_arg_list {
    ($arity:literal; $($idx:tt $arg:ident),*) => {
        impl<$($arg: KernelArg),*> KernelArgList for ($($arg,)*) {
            const ARITY: usize = $arity;

            type Stored = ($($arg::Stored,)*);

            fn store(&self) -> Self::Stored {
                ($(self.$idx.store(),)*)
            }

            fn capture_addresses(
                #[allow(unused_variables)] stored: &Self::Stored,
                #[allow(unused_variables)] out: &mut SmallVec<[*const c_void; 8]>,
            ) {
                $(out.push(std::ptr::from_ref(&stored.$idx).cast());)*
            }
        }
    };
}

impl_kernel_arg_list!(0;);
impl_kernel_arg_list!(1; 0 A0);
impl_kernel_arg_list!(2; 0 A0, 1 A1);
impl_kernel_arg_list!(3; 0 A0, 1 A1, 2 A2);
impl_kernel_arg_list!(4; 0 A0, 1 A1, 2 A2, 3 A3);
impl_kernel_arg_list!(5; 0 A0, 1 A1, 2 A2, 3 A3, 4 A4);
impl_kernel_arg_list!(6; 0 A0, 1 A1, 2 A2, 3 A3, 4 A4, 5 A5);
impl_kernel_arg_list!(7; 0 A0, 1 A1, 2 A2, 3 A3, 4 A4, 5 A5, 6 A6);
impl_kernel_arg_list!(8; 0 A0, 1 A1, 2 A2, 3 A3, 4 A4, 5 A5, 6 A6, 7 A7);
impl_kernel_arg_list!(9; 0 A0, 1 A1, 2 A2, 3 A3, 4 A4, 5 A5, 6 A6, 7 A7, 8 A8);
impl_kernel_arg_list!(10; 0 A0, 1 A1, 2 A2, 3 A3, 4 A4, 5 A5, 6 A6, 7 A7, 8 A8, 9 A9);
impl_kernel_arg_list!(11; 0 A0, 1 A1, 2 A2, 3 A3, 4 A4, 5 A5, 6 A6, 7 A7, 8 A8, 9 A9, 10 A10);
impl_kernel_arg_list!(12; 0 A0, 1 A1, 2 A2, 3 A3, 4 A4, 5 A5, 6 A6, 7 A7, 8 A8, 9 A9, 10 A10, 11 A11);
impl_kernel_arg_list!(13; 0 A0, 1 A1, 2 A2, 3 A3, 4 A4, 5 A5, 6 A6, 7 A7, 8 A8, 9 A9, 10 A10, 11 A11, 12 A12);
impl_kernel_arg_list!(14; 0 A0, 1 A1, 2 A2, 3 A3, 4 A4, 5 A5, 6 A6, 7 A7, 8 A8, 9 A9, 10 A10, 11 A11, 12 A12, 13 A13);
impl_kernel_arg_list!(15; 0 A0, 1 A1, 2 A2, 3 A3, 4 A4, 5 A5, 6 A6, 7 A7, 8 A8, 9 A9, 10 A10, 11 A11, 12 A12, 13 A13, 14 A14);
impl_kernel_arg_list!(16; 0 A0, 1 A1, 2 A2, 3 A3, 4 A4, 5 A5, 6 A6, 7 A7, 8 A8, 9 A9, 10 A10, 11 A11, 12 A12, 13 A13, 14 A14, 15 A15);

/// Typed packed storage: the stored tuple plus its captured field
/// addresses.
struct PackedTuple<S> {
    storage: S,
    addresses: SmallVec<[*const c_void; 8]>,
    shared_memory_bytes: u64,
}

// SAFETY: `addresses` only points into `storage` of the same object, which
// is immutable once published; `S` itself is Send + Sync by bound.
unsafe impl<S: Send + Sync> Send for PackedTuple<S> {}
unsafe impl<S: Send + Sync> Sync for PackedTuple<S> {}

impl<S> fmt::Debug for PackedTuple<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackedTuple")
            .field("len", &self.addresses.len())
            .field("shared_memory_bytes", &self.shared_memory_bytes)
            .finish()
    }
}

impl<S: Copy + Send + Sync + 'static> KernelArgs for PackedTuple<S> {
    fn argument_count(&self) -> usize {
        self.addresses.len() + (self.shared_memory_bytes > 0) as usize
    }

    fn shared_memory_bytes(&self) -> u64 {
        self.shared_memory_bytes
    }

    fn storage_capacity(&self) -> usize {
        self.addresses.len()
    }

    fn kind(&self) -> KernelArgsKind<'_> {
        KernelArgsKind::PackedArray(&self.addresses)
    }
}

/// Pack a typed argument tuple for `kernel`. Signature compatibility is the
/// function signature itself; shared memory comes from the kernel's
/// metadata (zero when unset).
pub fn pack_typed_args<A: KernelArgList>(kernel: &TypedKernel<A>, args: A) -> Arc<dyn KernelArgs> {
    pack_arg_list(args, kernel.metadata().shared_memory_bytes().unwrap_or(0))
}

/// Pack a typed argument tuple with an explicit shared-memory request.
pub fn pack_arg_list<A: KernelArgList>(args: A, shared_memory_bytes: u64) -> Arc<dyn KernelArgs> {
    let mut packed = Arc::new(PackedTuple {
        storage: args.store(),
        addresses: SmallVec::new(),
        shared_memory_bytes,
    });
    let this = Arc::get_mut(&mut packed).expect("freshly created Arc is uniquely owned");
    // Same discipline as the dynamic path: capture addresses only once the
    // storage sits in its final allocation.
    A::capture_addresses(&this.storage, &mut this.addresses);
    packed
}

//! Kernel handles, loader specs, and the in-process kernel ABI.
//!
//! A [`Kernel`] is a thin handle: a shared reference to the loaded routine
//! plus locally cached metadata. Handles are cheap to clone; dropping the
//! last one releases the loaded code. [`TypedKernel`] carries the argument
//! signature in its type so launches are checked at compile time.

use std::borrow::Cow;
use std::ffi::c_void;
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::Arc;

use crate::dims::{BlockDim, ThreadDim};
use crate::error::Result;

/// Advisory preference for the device's L1/shared-memory split. Recorded on
/// the handle and forwarded at launch; never load-bearing for recording or
/// packing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CacheConfig {
    #[default]
    NoPreference,
    PreferShared,
    PreferL1,
    PreferEqual,
}

/// Optional resource facts about a loaded kernel. Engines that know them
/// fill them in; packing consults `shared_memory_bytes` when the caller
/// does not pass an explicit amount.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KernelMetadata {
    registers_per_thread: Option<u32>,
    shared_memory_bytes: Option<u64>,
}

impl KernelMetadata {
    pub fn registers_per_thread(&self) -> Option<u32> {
        self.registers_per_thread
    }

    pub fn set_registers_per_thread(&mut self, registers: u32) {
        self.registers_per_thread = Some(registers);
    }

    pub fn shared_memory_bytes(&self) -> Option<u64> {
        self.shared_memory_bytes
    }

    pub fn set_shared_memory_bytes(&mut self, bytes: u64) {
        self.shared_memory_bytes = Some(bytes);
    }
}

/// One kernel invocation as the in-process engine dispatches it.
#[derive(Debug)]
pub struct KernelCall<'a> {
    pub threads: ThreadDim,
    pub blocks: BlockDim,
    pub shared_memory_bytes: u64,
    /// Addresses of the packed argument slots, in declaration order.
    pub args: &'a [*const c_void],
}

impl KernelCall<'_> {
    /// Read the `index`-th parameter as a POD value.
    ///
    /// # Safety
    ///
    /// The parameter at `index` must have been packed as a `T`.
    pub unsafe fn arg<T: Copy>(&self, index: usize) -> T {
        // SAFETY: the slot holds a properly aligned T by the packing contract.
        unsafe { std::ptr::read(self.args[index].cast()) }
    }

    /// Read the `index`-th parameter as a device address.
    ///
    /// # Safety
    ///
    /// The parameter at `index` must have been packed from a device-memory
    /// view whose region outlives the launch.
    pub unsafe fn device_ptr<T>(&self, index: usize) -> *mut T {
        // Device addresses always pack as 64-bit values.
        unsafe { self.arg::<u64>(index) as usize as *mut T }
    }
}

/// Routine form the in-process engine executes: called once per launch with
/// the full geometry and the packed argument addresses.
///
/// # Safety
///
/// Implementations dereference the packed slots, so the caller must hand
/// them an argument set packed for this routine's signature.
pub type HostKernelFn = unsafe fn(&KernelCall<'_>) -> Result<()>;

/// Loaded code plus identity, shared between handle clones.
#[derive(Debug)]
struct LoadedRoutine {
    name: String,
    demangled_name: String,
    arity: usize,
    routine: HostKernelFn,
}

/// Handle to a loaded kernel.
///
/// Thread-compatible: accessors take `&self`, mutation of the locally
/// cached metadata and cache preference takes `&mut self`, so concurrent
/// writers are a compile error rather than a data race.
#[derive(Clone, Debug)]
pub struct Kernel {
    loaded: Arc<LoadedRoutine>,
    metadata: KernelMetadata,
    cache_config: CacheConfig,
}

impl Kernel {
    pub(crate) fn from_parts(
        name: impl Into<String>,
        demangled_name: impl Into<String>,
        arity: usize,
        routine: HostKernelFn,
    ) -> Self {
        let loaded = LoadedRoutine {
            name: name.into(),
            demangled_name: demangled_name.into(),
            arity,
            routine,
        };
        Self {
            loaded: Arc::new(loaded),
            metadata: KernelMetadata::default(),
            cache_config: CacheConfig::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.loaded.name
    }

    /// Human-readable name; equals [`Self::name`] unless the loader spec
    /// supplied an explicit demangled form.
    pub fn demangled_name(&self) -> &str {
        &self.loaded.demangled_name
    }

    /// Number of parameters the kernel expects, not counting shared memory.
    pub fn arity(&self) -> usize {
        self.loaded.arity
    }

    pub fn metadata(&self) -> KernelMetadata {
        self.metadata
    }

    pub fn set_metadata(&mut self, metadata: KernelMetadata) {
        self.metadata = metadata;
    }

    pub fn cache_config(&self) -> CacheConfig {
        self.cache_config
    }

    pub fn set_cache_config(&mut self, config: CacheConfig) {
        self.cache_config = config;
    }

    pub(crate) fn routine(&self) -> HostKernelFn {
        self.loaded.routine
    }
}

/// Kernel handle whose argument signature is carried in the type.
///
/// Obtained from [`crate::Executor::load_typed`]; launching one takes the
/// argument tuple `A` by value, so a wrong argument list fails to compile.
pub struct TypedKernel<A> {
    kernel: Kernel,
    _signature: PhantomData<fn(A)>,
}

impl<A> Clone for TypedKernel<A> {
    fn clone(&self) -> Self {
        Self { kernel: self.kernel.clone(), _signature: PhantomData }
    }
}

impl<A> fmt::Debug for TypedKernel<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedKernel").field("kernel", &self.kernel).finish()
    }
}

impl<A> TypedKernel<A> {
    pub(crate) fn new(kernel: Kernel) -> Self {
        Self { kernel, _signature: PhantomData }
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }
}

impl<A> Deref for TypedKernel<A> {
    type Target = Kernel;

    fn deref(&self) -> &Kernel {
        &self.kernel
    }
}

/// Where a kernel's code lives.
#[derive(Clone, Debug)]
pub(crate) enum KernelPayload {
    /// Routine linked into the current process.
    InProcess(HostKernelFn),
    /// PTX text for engines that consume it.
    PtxText(Cow<'static, str>),
}

/// Description of a kernel for an engine to load: identity, declared arity,
/// and the code payload.
#[derive(Clone, Debug)]
pub struct KernelLoaderSpec {
    name: String,
    demangled_name: Option<String>,
    arity: usize,
    payload: KernelPayload,
}

impl KernelLoaderSpec {
    /// Spec for a routine linked into the current process.
    pub fn in_process(name: impl Into<String>, arity: usize, routine: HostKernelFn) -> Self {
        Self {
            name: name.into(),
            demangled_name: None,
            arity,
            payload: KernelPayload::InProcess(routine),
        }
    }

    /// Spec for PTX text. The in-process engine rejects it at load time;
    /// it exists for engines that consume device code.
    pub fn ptx_in_memory(
        name: impl Into<String>,
        arity: usize,
        ptx: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            name: name.into(),
            demangled_name: None,
            arity,
            payload: KernelPayload::PtxText(ptx.into()),
        }
    }

    pub fn with_demangled_name(mut self, demangled: impl Into<String>) -> Self {
        self.demangled_name = Some(demangled.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    pub(crate) fn demangled(&self) -> &str {
        self.demangled_name.as_deref().unwrap_or(&self.name)
    }

    pub(crate) fn payload(&self) -> &KernelPayload {
        &self.payload
    }
}

//! The in-process reference engine.
//!
//! Loads host-compiled kernel routines, owns the device allocator, creates
//! streams, and turns recorded node lists into executable graph snapshots.

use std::sync::Arc;

use potok_device::{Allocator, DeviceAllocation, HostAllocator};
use snafu::{ResultExt, ensure};
use tracing::debug;

use crate::args::{KernelArgList, KernelArgs, KernelArgsKind};
use crate::command_buffer::{CommandBuffer, Mode, Node, State};
use crate::dims::{BlockDim, ThreadDim};
use crate::error::{
    ArityMismatchSnafu, DeviceSnafu, ModeMismatchSnafu, NotFinalizedSnafu, Result,
    UnsupportedKernelPayloadSnafu,
};
use crate::kernel::{Kernel, KernelCall, KernelLoaderSpec, KernelPayload, TypedKernel};
use crate::stream::Stream;

/// The engine behind streams and command buffers.
///
/// "Device" memory is host memory behind the [`Allocator`] seam and
/// kernels are host routines, which keeps the full command-graph contract
/// testable in-process.
#[derive(Debug)]
pub struct Executor {
    allocator: Arc<dyn Allocator>,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor {
    /// Engine over the plain host allocator.
    pub fn new() -> Self {
        Self::with_allocator(Arc::new(HostAllocator))
    }

    pub fn with_allocator(allocator: Arc<dyn Allocator>) -> Self {
        Self { allocator }
    }

    /// Engine identifier, for logs and diagnostics.
    pub fn platform(&self) -> &'static str {
        "host"
    }

    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.allocator
    }

    /// Load a kernel from a loader spec.
    pub fn load_kernel(&self, spec: &KernelLoaderSpec) -> Result<Kernel> {
        match spec.payload() {
            KernelPayload::InProcess(routine) => {
                debug!(name = spec.name(), arity = spec.arity(), "loaded in-process kernel");
                Ok(Kernel::from_parts(spec.name(), spec.demangled(), spec.arity(), *routine))
            }
            KernelPayload::PtxText(_) => {
                UnsupportedKernelPayloadSnafu { name: spec.name(), format: "PTX" }.fail()
            }
        }
    }

    /// Load a kernel with a compile-time argument signature. The spec's
    /// declared arity must match the signature's.
    pub fn load_typed<A: KernelArgList>(&self, spec: &KernelLoaderSpec) -> Result<TypedKernel<A>> {
        ensure!(
            spec.arity() == A::ARITY,
            ArityMismatchSnafu { name: spec.name(), declared: spec.arity(), type_arity: A::ARITY }
        );
        Ok(TypedKernel::new(self.load_kernel(spec)?))
    }

    /// Allocate zero-initialized device memory for `len` elements of `T`.
    pub fn allocate_array<T>(&self, len: usize) -> Result<DeviceAllocation> {
        let size = len.saturating_mul(size_of::<T>());
        DeviceAllocation::new(&self.allocator, size).context(DeviceSnafu)
    }

    pub fn create_stream(&self) -> Result<Stream> {
        Stream::device()
    }

    /// Enqueue a finalized primary buffer's executable on `stream`.
    ///
    /// Returns as soon as the work is queued; completion is observed
    /// through [`Stream::synchronize`]. The enqueued snapshot stays alive
    /// independently of later updates to the buffer, so re-recording while
    /// a submission is in flight is safe.
    pub fn submit(&self, stream: &mut Stream, buffer: &CommandBuffer) -> Result<()> {
        ensure!(
            buffer.mode() == Mode::Primary,
            ModeMismatchSnafu { expected: Mode::Primary, actual: buffer.mode() }
        );
        ensure!(
            buffer.state() == State::Finalized,
            NotFinalizedSnafu { state: buffer.state() }
        );
        let graph = buffer
            .executable()
            .expect("finalized buffer always holds an executable")
            .clone();
        stream.enqueue_graph(graph)
    }

    /// Snapshot a node list into an executable graph.
    pub(crate) fn instantiate(&self, nodes: &[Node]) -> Result<Arc<GraphExec>> {
        debug!(nodes = nodes.len(), "instantiated command graph");
        Ok(Arc::new(GraphExec { nodes: nodes.to_vec() }))
    }
}

/// Executable snapshot of a recorded graph. Immutable; shared between the
/// owning buffer and any in-flight stream submissions.
#[derive(Debug)]
pub(crate) struct GraphExec {
    nodes: Vec<Node>,
}

impl GraphExec {
    /// Run every node in recorded order on the calling thread, stopping at
    /// the first failure.
    pub(crate) fn run(&self) -> Result<()> {
        for node in &self.nodes {
            match node {
                Node::Launch(launch) => dispatch_launch(
                    &launch.kernel,
                    launch.threads,
                    launch.blocks,
                    launch.args.as_ref(),
                )?,
                Node::ChildGraph(child) => child.graph.run()?,
            }
        }
        Ok(())
    }
}

/// Invoke one host kernel routine with the packed-argument ABI.
pub(crate) fn dispatch_launch(
    kernel: &Kernel,
    threads: ThreadDim,
    blocks: BlockDim,
    args: &dyn KernelArgs,
) -> Result<()> {
    let KernelArgsKind::PackedArray(addresses) = args.kind();
    let call = KernelCall {
        threads,
        blocks,
        shared_memory_bytes: args.shared_memory_bytes(),
        args: addresses,
    };
    // SAFETY: launch paths validated the set against the kernel's
    // signature, and the slot addresses stay valid while `args` is
    // borrowed.
    unsafe { (kernel.routine())(&call) }
}

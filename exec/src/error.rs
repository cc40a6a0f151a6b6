//! Error types for the command-graph layer.

use snafu::Snafu;

use crate::command_buffer::{Mode, NodeKind, State};

/// Result type for command-graph operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Coarse failure class, mirroring the status codes the contract is stated
/// in terms of. Obtained through [`Error::kind`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The caller passed something unusable.
    InvalidArgument,
    /// The operation is legal, but not in the object's current state.
    FailedPrecondition,
    /// An update diverged from the finalized graph topology.
    StructuralMismatch,
    /// The engine rejected or failed the work.
    Backend,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Argument list does not fit the largest packing tier.
    #[snafu(display("cannot pack {count} kernel arguments; the limit is {limit}"))]
    TooManyArguments { count: usize, limit: usize },

    /// POD argument does not fit the fixed dynamic-packing slot.
    #[snafu(display("POD argument of {size} bytes (alignment {align}) exceeds the packing slot"))]
    OversizedPodArgument { size: usize, align: usize },

    #[snafu(display("expected a {expected:?}-mode command buffer, got {actual:?}"))]
    ModeMismatch { expected: Mode, actual: Mode },

    /// Typed signature disagrees with the loader spec.
    #[snafu(display("kernel '{name}' declares {declared} parameters, the typed signature has {type_arity}"))]
    ArityMismatch { name: String, declared: usize, type_arity: usize },

    /// Packed argument set does not cover the kernel's parameter list.
    #[snafu(display("kernel '{name}' takes {expected} arguments, {provided} were packed"))]
    ArgumentCountMismatch { name: String, expected: usize, provided: usize },

    #[snafu(display("memset32 length {len} is not a multiple of 4"))]
    UnalignedMemset { len: usize },

    /// Node append or overwrite outside of the recording states.
    #[snafu(display("command buffer is {state:?}; recording requires Created or Updating"))]
    NotRecording { state: State },

    #[snafu(display("command buffer is {state:?}; the operation requires Finalized"))]
    NotFinalized { state: State },

    #[snafu(display("command buffer is already finalized"))]
    AlreadyFinalized,

    #[snafu(display("cannot finalize an empty command buffer"))]
    EmptyCommandBuffer,

    /// A nested buffer must be finalized before it can be embedded.
    #[snafu(display("nested command buffer is {state:?}; embedding requires Finalized"))]
    UnfinalizedNested { state: State },

    /// Data-transfer operations have no node representation.
    #[snafu(display("{op} is not supported while capturing a trace"))]
    CaptureUnsupported { op: &'static str },

    /// Update replayed a different number of nodes than were recorded.
    #[snafu(display("update replayed {actual} nodes; the finalized graph has {expected}"))]
    NodeCountMismatch { expected: usize, actual: usize },

    /// Update replayed a different node kind at some position.
    #[snafu(display(
        "update issued a {actual:?} node at position {index}; the finalized graph has a {expected:?} node there"
    ))]
    NodeKindMismatch { index: usize, expected: NodeKind, actual: NodeKind },

    /// The engine cannot load this kernel payload format.
    #[snafu(display("kernel '{name}': the in-process engine cannot load {format} payloads"))]
    UnsupportedKernelPayload { name: String, format: &'static str },

    /// Device-side failure surfaced through stream synchronization.
    #[snafu(display("execution failed: {reason}"))]
    Execution { reason: String },

    #[snafu(display("stream worker is shut down"))]
    StreamClosed,

    #[snafu(display("failed to start stream worker: {source}"))]
    StreamSpawn { source: std::io::Error },

    /// Device-layer error.
    #[snafu(display("device error: {source}"))]
    Device { source: potok_device::Error },
}

impl Error {
    /// The contract class this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        use Error::*;
        match self {
            TooManyArguments { .. }
            | OversizedPodArgument { .. }
            | ModeMismatch { .. }
            | ArityMismatch { .. }
            | ArgumentCountMismatch { .. }
            | UnalignedMemset { .. } => ErrorKind::InvalidArgument,

            NotRecording { .. }
            | NotFinalized { .. }
            | AlreadyFinalized
            | EmptyCommandBuffer
            | UnfinalizedNested { .. }
            | CaptureUnsupported { .. } => ErrorKind::FailedPrecondition,

            NodeCountMismatch { .. } | NodeKindMismatch { .. } => ErrorKind::StructuralMismatch,

            UnsupportedKernelPayload { .. } | Execution { .. } | StreamClosed
            | StreamSpawn { .. } => ErrorKind::Backend,

            Device { source } => match source {
                potok_device::Error::OutOfBounds { .. }
                | potok_device::Error::SizeMismatch { .. } => ErrorKind::InvalidArgument,
                potok_device::Error::AllocationFailed { .. } => ErrorKind::Backend,
            },
        }
    }
}

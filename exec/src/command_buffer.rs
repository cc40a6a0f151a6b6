//! Recordable, updatable command graphs.
//!
//! A command buffer collects kernel launches (and nested graphs) into a
//! node list, then freezes it into an executable snapshot. Recording
//! happens once; afterwards the buffer can be re-submitted cheaply, and
//! node parameters can be swapped through the update cycle without
//! rebuilding the topology.

use std::sync::Arc;

use snafu::ensure;
use tracing::debug;

use crate::args::{KernelArgList, KernelArgs, check_argument_count, pack_typed_args};
use crate::dims::{BlockDim, ThreadDim};
use crate::error::{
    AlreadyFinalizedSnafu, EmptyCommandBufferSnafu, ModeMismatchSnafu, NodeCountMismatchSnafu,
    NodeKindMismatchSnafu, NotFinalizedSnafu, NotRecordingSnafu, Result, UnfinalizedNestedSnafu,
};
use crate::executor::{Executor, GraphExec};
use crate::kernel::{Kernel, TypedKernel};
use crate::stream::Stream;

/// Whether a buffer can be submitted on its own or only embedded into
/// another buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Primary,
    Nested,
}

/// Lifecycle state. `Created` and `Updating` accept recording calls,
/// `Finalized` accepts submission and [`CommandBuffer::update`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Created,
    Finalized,
    Updating,
}

/// Kind of a recorded node. Updates must replay the same kind at every
/// position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Launch,
    ChildGraph,
}

#[derive(Clone, Debug)]
pub(crate) struct LaunchNode {
    pub(crate) kernel: Kernel,
    pub(crate) threads: ThreadDim,
    pub(crate) blocks: BlockDim,
    pub(crate) args: Arc<dyn KernelArgs>,
}

#[derive(Clone, Debug)]
pub(crate) struct ChildNode {
    pub(crate) graph: Arc<GraphExec>,
}

/// One recorded command. The node list is the graph, in recorded order.
#[derive(Clone, Debug)]
pub(crate) enum Node {
    Launch(LaunchNode),
    ChildGraph(ChildNode),
}

impl Node {
    pub(crate) fn kind(&self) -> NodeKind {
        match self {
            Node::Launch(_) => NodeKind::Launch,
            Node::ChildGraph(_) => NodeKind::ChildGraph,
        }
    }
}

/// First structural divergence seen during an update, kept so that
/// `finalize` fails even when the offending call's error was ignored.
#[derive(Clone, Copy, Debug)]
enum DivergenceKind {
    CountOverflow { attempted: usize },
    KindMismatch { index: usize, expected: NodeKind, actual: NodeKind },
}

/// A recordable command graph bound to an executor.
///
/// Single-writer: all mutators take `&mut self`, so concurrent mutation is
/// a compile error. Reads may be shared freely.
#[derive(Debug)]
pub struct CommandBuffer {
    executor: Arc<Executor>,
    mode: Mode,
    state: State,
    nodes: Vec<Node>,
    cursor: usize,
    divergence: Option<DivergenceKind>,
    executable: Option<Arc<GraphExec>>,
}

impl CommandBuffer {
    /// Create an empty buffer in the `Created` state.
    pub fn create(executor: Arc<Executor>, mode: Mode) -> Result<Self> {
        Ok(Self {
            executor,
            mode,
            state: State::Created,
            nodes: Vec::new(),
            cursor: 0,
            divergence: None,
            executable: None,
        })
    }

    /// Build a buffer by capturing the launches `f` issues on a recording
    /// stream, then finalize it. `f`'s error propagates; capturing nothing
    /// fails like finalizing an empty buffer.
    pub fn trace(
        executor: Arc<Executor>,
        mode: Mode,
        f: impl FnOnce(&mut Stream) -> Result<()>,
    ) -> Result<Self> {
        let mut stream = Stream::capture();
        f(&mut stream)?;
        let nodes = stream.take_captured_nodes();
        debug!(nodes = nodes.len(), "trace capture complete");
        let mut buffer = Self::create(executor, mode)?;
        buffer.nodes = nodes;
        buffer.finalize()?;
        Ok(buffer)
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Number of recorded nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn executable(&self) -> Option<&Arc<GraphExec>> {
        self.executable.as_ref()
    }

    /// Record a typed kernel launch.
    pub fn launch<A: KernelArgList>(
        &mut self,
        kernel: &TypedKernel<A>,
        threads: ThreadDim,
        blocks: BlockDim,
        args: A,
    ) -> Result<()> {
        let args = pack_typed_args(kernel, args);
        self.launch_packed(kernel.kernel(), threads, blocks, args)
    }

    /// Record a kernel launch with pre-packed arguments.
    pub fn launch_packed(
        &mut self,
        kernel: &Kernel,
        threads: ThreadDim,
        blocks: BlockDim,
        args: Arc<dyn KernelArgs>,
    ) -> Result<()> {
        check_argument_count(kernel, args.as_ref())?;
        self.record(Node::Launch(LaunchNode { kernel: kernel.clone(), threads, blocks, args }))
    }

    /// Embed a finalized nested buffer as a single node.
    ///
    /// Embedding snapshots the nested buffer's executable: later updates to
    /// the nested buffer do not reach back into this one.
    pub fn add_nested_command_buffer(&mut self, nested: &CommandBuffer) -> Result<()> {
        ensure!(
            nested.mode == Mode::Nested,
            ModeMismatchSnafu { expected: Mode::Nested, actual: nested.mode }
        );
        ensure!(nested.state == State::Finalized, UnfinalizedNestedSnafu { state: nested.state });
        let graph = nested
            .executable
            .as_ref()
            .expect("finalized buffer always holds an executable")
            .clone();
        self.record(Node::ChildGraph(ChildNode { graph }))
    }

    /// Instantiate the recorded graph and move to `Finalized`.
    pub fn finalize(&mut self) -> Result<()> {
        match self.state {
            State::Created => {
                ensure!(!self.nodes.is_empty(), EmptyCommandBufferSnafu);
                self.executable = Some(self.executor.instantiate(&self.nodes)?);
            }
            State::Updating => {
                if let Some(divergence) = self.divergence {
                    return match divergence {
                        DivergenceKind::CountOverflow { attempted } => NodeCountMismatchSnafu {
                            expected: self.nodes.len(),
                            actual: attempted,
                        }
                        .fail(),
                        DivergenceKind::KindMismatch { index, expected, actual } => {
                            NodeKindMismatchSnafu { index, expected, actual }.fail()
                        }
                    };
                }
                ensure!(
                    self.cursor == self.nodes.len(),
                    NodeCountMismatchSnafu { expected: self.nodes.len(), actual: self.cursor }
                );
                self.executable = Some(self.executor.instantiate(&self.nodes)?);
            }
            State::Finalized => return AlreadyFinalizedSnafu.fail(),
        }
        debug!(from = ?self.state, nodes = self.nodes.len(), "command buffer finalized");
        self.state = State::Finalized;
        Ok(())
    }

    /// Reopen a finalized buffer for parameter updates.
    ///
    /// The topology is frozen: the replay must issue the same number of
    /// nodes with the same kinds, in order. In-flight submissions keep the
    /// previous executable alive, so updating never invalidates them.
    pub fn update(&mut self) -> Result<()> {
        ensure!(self.state == State::Finalized, NotFinalizedSnafu { state: self.state });
        self.state = State::Updating;
        self.cursor = 0;
        self.divergence = None;
        debug!(nodes = self.nodes.len(), "command buffer reopened for update");
        Ok(())
    }

    fn record(&mut self, node: Node) -> Result<()> {
        match self.state {
            State::Created => {
                self.nodes.push(node);
                Ok(())
            }
            State::Updating => self.overwrite(node),
            State::Finalized => NotRecordingSnafu { state: self.state }.fail(),
        }
    }

    /// Replay one recording call against the frozen topology.
    fn overwrite(&mut self, node: Node) -> Result<()> {
        if self.cursor >= self.nodes.len() {
            self.cursor += 1;
            match &mut self.divergence {
                // Keep counting extra calls so the finalize error reports
                // the full replayed length.
                Some(DivergenceKind::CountOverflow { attempted }) => *attempted = self.cursor,
                None => {
                    self.divergence = Some(DivergenceKind::CountOverflow { attempted: self.cursor });
                }
                Some(DivergenceKind::KindMismatch { .. }) => {}
            }
            return NodeCountMismatchSnafu { expected: self.nodes.len(), actual: self.cursor }
                .fail();
        }
        let expected = self.nodes[self.cursor].kind();
        let actual = node.kind();
        if expected != actual {
            if self.divergence.is_none() {
                self.divergence =
                    Some(DivergenceKind::KindMismatch { index: self.cursor, expected, actual });
            }
            return NodeKindMismatchSnafu { index: self.cursor, expected, actual }.fail();
        }
        self.nodes[self.cursor] = node;
        self.cursor += 1;
        Ok(())
    }
}

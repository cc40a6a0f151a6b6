//! Streams: asynchronous FIFO work queues and trace capture.
//!
//! A device stream runs its operations on a dedicated worker thread in
//! submission order; [`Stream::synchronize`] is the completion edge and
//! surfaces the first asynchronous failure. A capture stream records
//! launches as command-buffer nodes instead of executing them.
//!
//! Device handles are opaque addresses, not borrows: memory reached by
//! queued work must stay allocated until `synchronize` returns.

use std::sync::Arc;
use std::sync::mpsc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use potok_device::DeviceMemory;
use snafu::{ResultExt, ensure};
use tracing::debug;

use crate::args::{KernelArgList, KernelArgs, check_argument_count, pack_typed_args};
use crate::command_buffer::{LaunchNode, Node};
use crate::dims::{BlockDim, ThreadDim};
use crate::error::{
    CaptureUnsupportedSnafu, DeviceSnafu, ExecutionSnafu, Result, StreamClosedSnafu,
    StreamSpawnSnafu, UnalignedMemsetSnafu,
};
use crate::executor::{GraphExec, dispatch_launch};
use crate::kernel::{Kernel, TypedKernel};

/// An ordered execution context.
///
/// Single-writer: enqueueing takes `&mut self`; `synchronize` is a read
/// and may be shared.
#[derive(Debug)]
pub struct Stream {
    imp: StreamImp,
}

#[derive(Debug)]
enum StreamImp {
    Device(DeviceQueue),
    Capture(CaptureSink),
}

impl Stream {
    pub(crate) fn device() -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let shared = Arc::new(QueueShared::default());
        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("potok-stream".into())
            .spawn(move || worker_loop(rx, worker_shared))
            .context(StreamSpawnSnafu)?;
        Ok(Self {
            imp: StreamImp::Device(DeviceQueue { tx: Some(tx), worker: Some(worker), shared }),
        })
    }

    pub(crate) fn capture() -> Self {
        Self { imp: StreamImp::Capture(CaptureSink::default()) }
    }

    /// True when this stream records nodes instead of executing work.
    pub fn is_capturing(&self) -> bool {
        matches!(self.imp, StreamImp::Capture(_))
    }

    /// Launch a typed kernel asynchronously.
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

    /// Launch a kernel with pre-packed arguments asynchronously.
    pub fn launch_packed(
        &mut self,
        kernel: &Kernel,
        threads: ThreadDim,
        blocks: BlockDim,
        args: Arc<dyn KernelArgs>,
    ) -> Result<()> {
        check_argument_count(kernel, args.as_ref())?;
        let node = LaunchNode { kernel: kernel.clone(), threads, blocks, args };
        match &mut self.imp {
            StreamImp::Device(queue) => queue.push(StreamOp::Launch(node)),
            StreamImp::Capture(sink) => {
                sink.nodes.push(Node::Launch(node));
                Ok(())
            }
        }
    }

    /// Fill `len` bytes of `dst` with a repeating 32-bit pattern,
    /// asynchronously. `len` must be a multiple of 4 and lie within `dst`.
    pub fn memset32(&mut self, dst: DeviceMemory, pattern: u32, len: usize) -> Result<()> {
        ensure!(len % 4 == 0, UnalignedMemsetSnafu { len });
        let view = dst.byte_slice(0, len).context(DeviceSnafu)?;
        match &mut self.imp {
            StreamImp::Device(queue) => queue.push(StreamOp::Memset32 { dst: view, pattern }),
            StreamImp::Capture(_) => CaptureUnsupportedSnafu { op: "memset32" }.fail(),
        }
    }

    /// Zero all of `dst`, asynchronously.
    pub fn mem_zero(&mut self, dst: DeviceMemory) -> Result<()> {
        match &mut self.imp {
            StreamImp::Device(queue) => queue.push(StreamOp::MemZero { dst }),
            StreamImp::Capture(_) => CaptureUnsupportedSnafu { op: "mem_zero" }.fail(),
        }
    }

    /// Copy host bytes into device memory.
    ///
    /// Pageable-host semantics: the queue is drained first and the copy
    /// completes before returning, so it cannot overtake earlier work.
    pub fn memcpy_htod(&mut self, dst: DeviceMemory, src: &[u8]) -> Result<()> {
        match &mut self.imp {
            StreamImp::Device(queue) => {
                let view = dst.byte_slice(0, src.len()).context(DeviceSnafu)?;
                queue.synchronize()?;
                // SAFETY: the view was bounds-checked against the handle
                // and the queue is idle, so nothing races the range.
                unsafe {
                    std::ptr::copy_nonoverlapping(src.as_ptr(), view.opaque(), src.len());
                }
                Ok(())
            }
            StreamImp::Capture(_) => CaptureUnsupportedSnafu { op: "memcpy_htod" }.fail(),
        }
    }

    /// Copy device memory out to host bytes. Completes before returning,
    /// after draining the queue.
    pub fn memcpy_dtoh(&mut self, dst: &mut [u8], src: DeviceMemory) -> Result<()> {
        match &mut self.imp {
            StreamImp::Device(queue) => {
                let view = src.byte_slice(0, dst.len()).context(DeviceSnafu)?;
                queue.synchronize()?;
                // SAFETY: bounds-checked view, idle queue, disjoint host
                // destination.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        view.opaque().cast_const(),
                        dst.as_mut_ptr(),
                        dst.len(),
                    );
                }
                Ok(())
            }
            StreamImp::Capture(_) => CaptureUnsupportedSnafu { op: "memcpy_dtoh" }.fail(),
        }
    }

    /// Wait until every queued operation has completed.
    ///
    /// The first asynchronous failure is surfaced here and is sticky:
    /// later calls report it again.
    pub fn synchronize(&self) -> Result<()> {
        match &self.imp {
            StreamImp::Device(queue) => queue.synchronize(),
            // Nothing executes during capture, so there is nothing to wait
            // for.
            StreamImp::Capture(_) => Ok(()),
        }
    }

    pub(crate) fn enqueue_graph(&mut self, graph: Arc<GraphExec>) -> Result<()> {
        match &mut self.imp {
            StreamImp::Device(queue) => queue.push(StreamOp::Graph(graph)),
            StreamImp::Capture(_) => CaptureUnsupportedSnafu { op: "graph submission" }.fail(),
        }
    }

    pub(crate) fn take_captured_nodes(&mut self) -> Vec<Node> {
        match &mut self.imp {
            StreamImp::Capture(sink) => std::mem::take(&mut sink.nodes),
            StreamImp::Device(_) => {
                unreachable!("captured nodes are only taken from capture streams")
            }
        }
    }
}

#[derive(Debug, Default)]
struct CaptureSink {
    nodes: Vec<Node>,
}

#[derive(Debug)]
struct DeviceQueue {
    tx: Option<mpsc::Sender<StreamOp>>,
    worker: Option<JoinHandle<()>>,
    shared: Arc<QueueShared>,
}

impl DeviceQueue {
    fn push(&self, op: StreamOp) -> Result<()> {
        let Some(tx) = self.tx.as_ref() else {
            return StreamClosedSnafu.fail();
        };
        self.shared.progress.lock().submitted += 1;
        if tx.send(op).is_err() {
            self.shared.progress.lock().submitted -= 1;
            return StreamClosedSnafu.fail();
        }
        Ok(())
    }

    fn synchronize(&self) -> Result<()> {
        let mut progress = self.shared.progress.lock();
        while progress.completed < progress.submitted {
            self.shared.advanced.wait(&mut progress);
        }
        drop(progress);
        let failure = self.shared.failure.lock();
        match failure.as_ref() {
            Some(reason) => ExecutionSnafu { reason: reason.clone() }.fail(),
            None => Ok(()),
        }
    }
}

impl Drop for DeviceQueue {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain what was queued and
        // exit.
        self.tx = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Completion fence between the API side and the worker.
#[derive(Debug, Default)]
struct QueueShared {
    progress: Mutex<Progress>,
    advanced: Condvar,
    failure: Mutex<Option<String>>,
}

#[derive(Debug, Default)]
struct Progress {
    submitted: u64,
    completed: u64,
}

enum StreamOp {
    Launch(LaunchNode),
    Graph(Arc<GraphExec>),
    Memset32 { dst: DeviceMemory, pattern: u32 },
    MemZero { dst: DeviceMemory },
}

impl StreamOp {
    fn name(&self) -> &'static str {
        match self {
            StreamOp::Launch(_) => "launch",
            StreamOp::Graph(_) => "graph",
            StreamOp::Memset32 { .. } => "memset32",
            StreamOp::MemZero { .. } => "mem_zero",
        }
    }

    fn execute(&self) -> Result<()> {
        match self {
            StreamOp::Launch(node) => {
                dispatch_launch(&node.kernel, node.threads, node.blocks, node.args.as_ref())
            }
            StreamOp::Graph(graph) => graph.run(),
            StreamOp::Memset32 { dst, pattern } => {
                let words = dst.size() / 4;
                let base = dst.opaque().cast::<u32>();
                for i in 0..words {
                    // Sub-views of an allocation may not be 4-aligned.
                    // SAFETY: the range was bounds-checked at enqueue time
                    // and the caller keeps the allocation alive.
                    unsafe { base.add(i).write_unaligned(*pattern) };
                }
                Ok(())
            }
            StreamOp::MemZero { dst } => {
                // SAFETY: the handle covers exactly its allocation range,
                // which the caller keeps alive.
                unsafe { std::ptr::write_bytes(dst.opaque(), 0, dst.size()) };
                Ok(())
            }
        }
    }
}

fn worker_loop(rx: mpsc::Receiver<StreamOp>, shared: Arc<QueueShared>) {
    while let Ok(op) = rx.recv() {
        debug!(op = op.name(), "dispatching stream op");
        if let Err(error) = op.execute() {
            debug!(%error, "stream op failed");
            let mut failure = shared.failure.lock();
            if failure.is_none() {
                *failure = Some(error.to_string());
            }
        }
        let mut progress = shared.progress.lock();
        progress.completed += 1;
        shared.advanced.notify_all();
    }
}

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, Thread};
use std::time::Duration;

use once_cell::sync::OnceCell;
use tracing::{debug, trace};

use super::stream::Stream;
use super::stream_type::StreamType;
use crate::{VmError, VmResult};

/// A worker grouping one or more streams of the same stream type.
pub struct ThreadCtx {
    id: usize,
    stream_type: Arc<dyn StreamType>,
    streams: Vec<Arc<Stream>>,
    worker: OnceCell<Thread>,
}

impl ThreadCtx {
    pub(crate) fn new(id: usize, stream_type: Arc<dyn StreamType>) -> Self {
        Self {
            id,
            stream_type,
            streams: Vec::new(),
            worker: OnceCell::new(),
        }
    }

    pub(crate) fn add_stream(&mut self, stream: Arc<Stream>) {
        self.streams.push(stream);
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn stream_type(&self) -> &Arc<dyn StreamType> {
        &self.stream_type
    }

    pub fn streams(&self) -> &[Arc<Stream>] {
        &self.streams
    }

    /// Computes everything queued on the owned streams and returns how many
    /// instructions were handed to the stream type.
    pub fn run_once(&self) -> usize {
        self.streams.iter().map(|stream| stream.dispatch_pending()).sum()
    }

    /// Wakes the worker thread, if one runs this context.
    pub(crate) fn notify(&self) {
        if let Some(thread) = self.worker.get() {
            thread.unpark();
        }
    }
}

impl fmt::Debug for ThreadCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadCtx")
            .field("id", &self.id)
            .field("stream_type", &self.stream_type.name())
            .field(
                "streams",
                &self.streams.iter().map(|stream| stream.id()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// One worker thread per thread context, stopped and joined on drop.
#[derive(Debug)]
pub(crate) struct WorkerPool {
    shutdown: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn spawn(thread_ctxs: &[Arc<ThreadCtx>], idle_park: Duration) -> VmResult<Self> {
        let mut pool = Self {
            shutdown: Arc::new(AtomicBool::new(false)),
            handles: Vec::with_capacity(thread_ctxs.len()),
        };
        for ctx in thread_ctxs {
            let worker_ctx = ctx.clone();
            let shutdown = pool.shutdown.clone();
            let handle = thread::Builder::new()
                .name(format!("streamvm-{}-{}", ctx.stream_type.name(), ctx.id))
                .spawn(move || worker_loop(worker_ctx, shutdown, idle_park))
                .map_err(|err| VmError::Configuration(format!("cannot spawn worker {}: {err}", ctx.id)))?;
            let _ = ctx.worker.set(handle.thread().clone());
            pool.handles.push(handle);
        }
        debug!(workers = pool.handles.len(), "worker pool started");
        Ok(pool)
    }

    pub(crate) fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for handle in &self.handles {
            handle.thread().unpark();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(ctx: Arc<ThreadCtx>, shutdown: Arc<AtomicBool>, idle_park: Duration) {
    trace!(thread_ctx = ctx.id, "worker started");
    while !shutdown.load(Ordering::SeqCst) {
        if ctx.run_once() == 0 {
            thread::park_timeout(idle_park);
        }
    }
    trace!(thread_ctx = ctx.id, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::device::{Device, StreamRole};
    use crate::vm::stream_type::StreamTypeTable;

    fn host_ctx(streams: usize) -> ThreadCtx {
        let table = StreamTypeTable::builtin();
        let stream_type = table.resolve(StreamRole::Host, Device::cpu(0).kind).expect("host");
        let mut ctx = ThreadCtx::new(0, stream_type);
        for id in 0..streams {
            let mut stream = Stream::new(id);
            stream.init(0, Device::cpu(0), StreamRole::Host, &table).expect("init");
            ctx.add_stream(Arc::new(stream));
        }
        ctx
    }

    #[test]
    fn idle_context_runs_nothing() {
        let ctx = host_ctx(2);
        assert_eq!(ctx.run_once(), 0);
        assert_eq!(ctx.streams().len(), 2);
    }

    #[test]
    fn pool_starts_and_stops_workers() {
        let ctx = Arc::new(host_ctx(1));
        let mut pool = WorkerPool::spawn(&[ctx.clone()], Duration::from_micros(50)).expect("spawn");
        ctx.notify();
        pool.shutdown();
        assert!(pool.handles.is_empty());
    }
}

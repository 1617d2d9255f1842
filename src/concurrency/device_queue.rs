use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, trace};

use super::channel::MpmcQueue;

type Launch = Box<dyn FnOnce() + Send + 'static>;

const IDLE_PARK: Duration = Duration::from_millis(1);

/// Launch engine standing in for an accelerator's hardware queue.
///
/// Launches run one at a time, in launch order, on a dedicated thread. `launch`
/// never waits for the work to finish; completion must be observed through
/// whatever the launched closure records.
pub struct DeviceQueue {
    name: String,
    launches: MpmcQueue<Launch>,
    outstanding: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl DeviceQueue {
    pub fn new(name: impl Into<String>) -> std::io::Result<Self> {
        let name = name.into();
        let launches: MpmcQueue<Launch> = MpmcQueue::new();
        let outstanding = Arc::new(AtomicUsize::new(0));
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = {
            let launches = launches.clone();
            let outstanding = outstanding.clone();
            let shutdown = shutdown.clone();
            thread::Builder::new()
                .name(name.clone())
                .spawn(move || engine_loop(launches, outstanding, shutdown))?
        };
        debug!(queue = %name, "device queue started");
        Ok(Self {
            name,
            launches,
            outstanding,
            shutdown,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueues `work` behind every earlier launch and returns immediately.
    pub fn launch<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        self.launches.push(Box::new(work));
        if let Some(handle) = &self.handle {
            handle.thread().unpark();
        }
    }

    /// Number of launches that have not finished executing yet.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for DeviceQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceQueue")
            .field("name", &self.name)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

impl Drop for DeviceQueue {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
        debug!(queue = %self.name, "device queue stopped");
    }
}

fn engine_loop(
    launches: MpmcQueue<Launch>,
    outstanding: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        if let Some(work) = launches.pop() {
            work();
            outstanding.fetch_sub(1, Ordering::SeqCst);
            continue;
        }
        // Outstanding launches drain before the engine exits.
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        trace!("device queue idle");
        thread::park_timeout(IDLE_PARK);
    }
}

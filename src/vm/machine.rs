//! The virtual machine: topology construction, submission and the
//! cooperative or dedicated scheduling loop.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, Thread};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, info, instrument};

use super::device::{Device, DeviceKind, StreamRole};
use super::instruction::{InstructionHandle, InstructionId, InstructionMsg, InstructionOutcome, InstructionState};
use super::kernel::{KernelContext, KernelError, KernelRegistry};
use super::resource::{ResourceDesc, StreamDesc};
use super::scheduler::{Intake, LoopState, Scheduler, SchedulerStats, Submission};
use super::stream::Stream;
use super::stream_type::{StreamType, StreamTypeTable};
use super::thread_ctx::{ThreadCtx, WorkerPool};
use crate::concurrency::MpmcQueue;
use crate::config::{ExecutionMode, VmConfig};
use crate::object::{LogicalObjectId, ObjectInfo};
use crate::{VmError, VmResult};

/// Streams and thread contexts of the local machine, fixed at construction.
pub(crate) struct Topology {
    pub stream_descs: Vec<StreamDesc>,
    pub streams: Vec<Arc<Stream>>,
    /// Owning thread context of each stream.
    pub stream_ctx: Vec<usize>,
    pub thread_ctxs: Vec<Arc<ThreadCtx>>,
    lanes: HashMap<(StreamRole, Device), Vec<usize>>,
}

impl Topology {
    pub(crate) fn build(resource: &ResourceDesc, machine_id: i64, table: &StreamTypeTable) -> VmResult<Self> {
        resource.validate()?;
        if machine_id < 0 || machine_id as usize >= resource.machine_num {
            return Err(VmError::Configuration(format!(
                "machine_id {machine_id} outside 0..{}",
                resource.machine_num
            )));
        }
        let mut topology = Self {
            stream_descs: Vec::new(),
            streams: Vec::new(),
            stream_ctx: Vec::new(),
            thread_ctxs: Vec::new(),
            lanes: HashMap::new(),
        };
        for device in &resource.devices {
            for &role in &device.roles {
                let stream_type = table.resolve(role, device.kind)?;
                let desc = stream_type.make_stream_desc(role, device, resource, machine_id)?;
                topology.add_streams(&desc, device.count, &stream_type, table)?;
                topology.stream_descs.push(desc);
            }
        }
        Ok(topology)
    }

    fn add_streams(
        &mut self,
        desc: &StreamDesc,
        device_count: usize,
        stream_type: &Arc<dyn StreamType>,
        table: &StreamTypeTable,
    ) -> VmResult<()> {
        let per_device = (desc.num_streams_per_machine / device_count.max(1)).max(1);
        let per_thread = desc.num_streams_per_thread.max(1);
        let first_stream = self.streams.len();
        for chunk in 0..desc.num_threads() {
            let ctx_id = self.thread_ctxs.len();
            let mut ctx = ThreadCtx::new(ctx_id, stream_type.clone());
            let first = chunk * per_thread;
            let last = (first + per_thread).min(desc.num_streams_per_machine);
            for local in first..last {
                let device = Device::new(desc.device_kind, (local / per_device) as i64);
                let stream_id = self.streams.len();
                let mut stream = Stream::new(stream_id);
                stream.init(ctx_id, device, desc.role, table)?;
                let stream = Arc::new(stream);
                self.lanes.entry((desc.role, device)).or_default().push(stream_id);
                self.stream_ctx.push(ctx_id);
                ctx.add_stream(stream.clone());
                self.streams.push(stream);
            }
            self.thread_ctxs.push(Arc::new(ctx));
        }
        // Types with fewer streams than devices (the helper) serve every
        // device of their kind from the streams they have.
        let built: Vec<usize> = (first_stream..self.streams.len()).collect();
        for index in 0..device_count {
            let device = Device::new(desc.device_kind, index as i64);
            if !self.lanes.contains_key(&(desc.role, device)) && !built.is_empty() {
                let shared = built[index * built.len() / device_count];
                self.lanes.insert((desc.role, device), vec![shared]);
            }
        }
        Ok(())
    }

    /// Stream index serving `(role, device)`; `lane` picks among several.
    pub(crate) fn resolve_stream(&self, role: StreamRole, device: Device, lane: usize) -> VmResult<usize> {
        self.lanes
            .get(&(role, device))
            .filter(|streams| !streams.is_empty())
            .map(|streams| streams[lane % streams.len()])
            .ok_or(VmError::NoSuchStream { role, device })
    }
}

struct Shared {
    config: VmConfig,
    kernels: KernelRegistry,
    topology: Topology,
    submissions: MpmcQueue<Submission>,
    scheduler: Mutex<Scheduler>,
    next_id: AtomicU64,
    intake: Arc<Intake>,
    shutdown: AtomicBool,
    workers_stopped: AtomicBool,
    scheduler_thread: OnceCell<Thread>,
}

impl Shared {
    fn inline(&self) -> bool {
        self.config.execution == ExecutionMode::Inline || self.workers_stopped.load(Ordering::SeqCst)
    }

    fn schedule_once(&self) -> LoopState {
        let (state, deferred) = {
            let mut scheduler = self.scheduler.lock();
            let state = scheduler.run_pass(&self.topology, &self.submissions, self.inline());
            (state, scheduler.take_deferred())
        };
        for (callback, id, outcome) in deferred {
            callback(id, &outcome);
        }
        state
    }
}

fn scheduler_loop(shared: Arc<Shared>) {
    let idle = shared.config.scheduler.idle_park();
    debug!("scheduler thread started");
    while !shared.shutdown.load(Ordering::SeqCst) {
        match shared.schedule_once() {
            LoopState::Idle => thread::park_timeout(idle),
            LoopState::Pending => thread::yield_now(),
        }
    }
    debug!("scheduler thread stopped");
}

/// Builder for a [`VirtualMachine`] with custom kernels or stream types.
#[derive(Debug)]
pub struct VmBuilder {
    config: VmConfig,
    kernels: KernelRegistry,
    stream_types: StreamTypeTable,
}

impl Default for VmBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl VmBuilder {
    pub fn new() -> Self {
        Self {
            config: VmConfig::default(),
            kernels: KernelRegistry::with_builtins(),
            stream_types: StreamTypeTable::builtin(),
        }
    }

    pub fn config(mut self, config: VmConfig) -> Self {
        self.config = config;
        self
    }

    pub fn register_kernel<F>(mut self, opcode: impl Into<String>, kernel: F) -> Self
    where
        F: Fn(&mut KernelContext<'_>) -> Result<(), KernelError> + Send + Sync + 'static,
    {
        self.kernels.register(opcode, kernel);
        self
    }

    /// Adds or overrides the stream type used for `(role, kind)`.
    pub fn register_stream_type(mut self, role: StreamRole, kind: DeviceKind, stream_type: Arc<dyn StreamType>) -> Self {
        self.stream_types.register(role, kind, stream_type);
        self
    }

    /// Validates the configuration, binds every stream and starts the
    /// worker and scheduler threads. Nothing is left running on error.
    #[instrument(skip_all)]
    pub fn build(self) -> VmResult<VirtualMachine> {
        let Self {
            config,
            kernels,
            stream_types,
        } = self;
        config.validate()?;
        let topology = Topology::build(&config.resource, config.machine_id, &stream_types)?;
        info!(
            machine_id = config.machine_id,
            streams = topology.streams.len(),
            thread_ctxs = topology.thread_ctxs.len(),
            execution = ?config.execution,
            dedicated_scheduler = config.scheduler.dedicated_thread,
            "virtual machine constructed"
        );
        for desc in &topology.stream_descs {
            debug!(
                role = %desc.role,
                device = %desc.device_kind,
                stream_type = %desc.stream_type,
                streams = desc.num_streams_per_machine,
                per_thread = desc.num_streams_per_thread,
                "stream desc"
            );
        }

        let scheduler = Scheduler::new(config.scheduler.admission_batch);
        let shared = Arc::new(Shared {
            intake: scheduler.intake(),
            scheduler: Mutex::new(scheduler),
            config,
            kernels,
            topology,
            submissions: MpmcQueue::new(),
            next_id: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            workers_stopped: AtomicBool::new(false),
            scheduler_thread: OnceCell::new(),
        });

        let workers = match shared.config.execution {
            ExecutionMode::Threaded => Some(WorkerPool::spawn(
                &shared.topology.thread_ctxs,
                shared.config.scheduler.idle_park(),
            )?),
            ExecutionMode::Inline => None,
        };
        let scheduler_thread = if shared.config.scheduler.dedicated_thread {
            let loop_shared = shared.clone();
            let handle = thread::Builder::new()
                .name("streamvm-scheduler".into())
                .spawn(move || scheduler_loop(loop_shared))
                .map_err(|err| VmError::Configuration(format!("cannot spawn scheduler thread: {err}")))?;
            let _ = shared.scheduler_thread.set(handle.thread().clone());
            Some(handle)
        } else {
            None
        };

        Ok(VirtualMachine {
            shared,
            workers: Mutex::new(workers),
            scheduler_thread: Mutex::new(scheduler_thread),
        })
    }
}

/// Instruction-execution virtual machine.
///
/// `submit` never takes the scheduler lock. Unless the configuration asks for
/// a dedicated scheduler thread, callers drive scheduling through
/// [`schedule_once`](Self::schedule_once), [`run_loop`](Self::run_loop),
/// [`wait`](Self::wait) or [`wait_all`](Self::wait_all). Completion callbacks
/// run on whichever thread ran the pass, after the scheduler is unlocked.
pub struct VirtualMachine {
    shared: Arc<Shared>,
    workers: Mutex<Option<WorkerPool>>,
    scheduler_thread: Mutex<Option<JoinHandle<()>>>,
}

impl VirtualMachine {
    pub fn new(config: VmConfig) -> VmResult<Self> {
        VmBuilder::new().config(config).build()
    }

    pub fn builder() -> VmBuilder {
        VmBuilder::new()
    }

    pub fn config(&self) -> &VmConfig {
        &self.shared.config
    }

    pub fn kernels(&self) -> &KernelRegistry {
        &self.shared.kernels
    }

    /// Validates and queues one instruction.
    #[instrument(skip_all)]
    pub fn submit(&self, msg: InstructionMsg) -> VmResult<InstructionHandle> {
        let submission = self.prepare(msg)?;
        let handle = submission.handle.clone();
        self.enqueue(submission);
        Ok(handle)
    }

    /// Queues every instruction, or none if any fails validation.
    #[instrument(skip_all)]
    pub fn submit_batch(&self, msgs: Vec<InstructionMsg>) -> VmResult<Vec<InstructionHandle>> {
        let submissions = msgs
            .into_iter()
            .map(|msg| self.prepare(msg))
            .collect::<VmResult<Vec<_>>>()?;
        let handles = submissions.iter().map(|submission| submission.handle.clone()).collect();
        for submission in submissions {
            self.enqueue(submission);
        }
        Ok(handles)
    }

    fn prepare(&self, msg: InstructionMsg) -> VmResult<Submission> {
        if self.shared.shutdown.load(Ordering::SeqCst) {
            return Err(VmError::ShutDown);
        }
        let kernel = self
            .shared
            .kernels
            .get(msg.opcode())
            .ok_or_else(|| VmError::UnknownOpcode(msg.opcode().to_string()))?;
        let device = msg.device();
        let stream = self
            .shared
            .topology
            .resolve_stream(msg.role(), device, msg.lane_index())?;
        let id = InstructionId::new(self.shared.next_id.fetch_add(1, Ordering::SeqCst));
        let (opcode, operands, attrs, callback) = msg.into_parts();
        Ok(Submission {
            handle: InstructionHandle::new(id),
            stream,
            device,
            kernel,
            opcode,
            operands,
            attrs,
            callback,
        })
    }

    fn enqueue(&self, submission: Submission) {
        debug!(instruction = %submission.handle.id(), opcode = %submission.opcode, stream = submission.stream, "instruction submitted");
        self.shared.intake.push(&self.shared.submissions, submission);
        if let Some(thread) = self.shared.scheduler_thread.get() {
            thread.unpark();
        }
    }

    /// Cancels an instruction that has not been dispatched yet.
    #[instrument(skip_all)]
    pub fn cancel(&self, handle: &InstructionHandle) -> VmResult<()> {
        let id = handle.id();
        if handle.is_retired() {
            return Err(VmError::NotCancellable {
                id,
                state: InstructionState::Retired,
            });
        }
        let (result, deferred) = {
            let mut scheduler = self.shared.scheduler.lock();
            scheduler.drain_submissions(&self.shared.submissions);
            let result = scheduler.cancel(id);
            (result, scheduler.take_deferred())
        };
        for (callback, id, outcome) in deferred {
            callback(id, &outcome);
        }
        match result {
            Err(VmError::UnknownInstruction(_)) if handle.is_retired() => Err(VmError::NotCancellable {
                id,
                state: InstructionState::Retired,
            }),
            other => other,
        }
    }

    /// Runs one scheduling pass.
    pub fn schedule_once(&self) -> LoopState {
        self.shared.schedule_once()
    }

    /// Runs up to `max_passes` passes, stopping early once idle.
    pub fn run_loop(&self, max_passes: usize) -> LoopState {
        let mut state = LoopState::Idle;
        for _ in 0..max_passes {
            state = self.schedule_once();
            if state == LoopState::Idle {
                break;
            }
            thread::yield_now();
        }
        state
    }

    /// Drives scheduling until `handle` retires.
    pub fn wait(&self, handle: &InstructionHandle) -> InstructionOutcome {
        loop {
            if let Some(outcome) = handle.outcome() {
                return outcome;
            }
            self.schedule_once();
            thread::yield_now();
        }
    }

    /// Drives scheduling until nothing is queued or in flight.
    #[instrument(skip_all)]
    pub fn wait_all(&self) {
        while self.schedule_once() == LoopState::Pending {
            thread::yield_now();
        }
    }

    /// Creates an object holding `bytes`, with one caller hold.
    pub fn create_object(&self, id: LogicalObjectId, bytes: Vec<u8>) -> VmResult<()> {
        self.shared.scheduler.lock().objects_mut().create(id, bytes)
    }

    /// Snapshot of an object's bytes. Wait on pending writers first for a
    /// consistent view.
    pub fn read_object(&self, id: LogicalObjectId) -> VmResult<Vec<u8>> {
        let buffer = self
            .shared
            .scheduler
            .lock()
            .objects()
            .buffer(id)
            .ok_or(VmError::UnknownObject(id))?;
        let bytes = buffer.read().clone();
        Ok(bytes)
    }

    pub fn object_info(&self, id: LogicalObjectId) -> Option<ObjectInfo> {
        self.shared.scheduler.lock().objects().info(id)
    }

    /// Places a caller hold that keeps the object alive past retirement.
    pub fn retain_object(&self, id: LogicalObjectId) -> VmResult<()> {
        self.shared.scheduler.lock().objects_mut().retain(id)
    }

    /// Drops a caller hold. Returns whether the object was destroyed.
    pub fn release_object(&self, id: LogicalObjectId) -> VmResult<bool> {
        self.shared.scheduler.lock().objects_mut().unhold(id)
    }

    pub fn object_count(&self) -> usize {
        self.shared.scheduler.lock().objects().len()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.shared.scheduler.lock().stats()
    }

    /// Admitted, unretired instructions and their states, oldest first.
    pub fn live_instructions(&self) -> Vec<(InstructionId, InstructionState)> {
        self.shared.scheduler.lock().live_instructions()
    }

    pub fn stream_descs(&self) -> &[StreamDesc] {
        &self.shared.topology.stream_descs
    }

    pub fn streams(&self) -> &[Arc<Stream>] {
        &self.shared.topology.streams
    }

    pub fn thread_ctxs(&self) -> &[Arc<ThreadCtx>] {
        &self.shared.topology.thread_ctxs
    }

    /// The stream an instruction targeting `(role, device, lane)` runs on.
    pub fn stream_for(&self, role: StreamRole, device: Device, lane: usize) -> VmResult<&Arc<Stream>> {
        let index = self.shared.topology.resolve_stream(role, device, lane)?;
        Ok(&self.shared.topology.streams[index])
    }

    /// Stops the scheduler thread and workers and rejects further submissions.
    /// Work already admitted can still be drained with [`wait_all`](Self::wait_all),
    /// which then runs every thread context inline.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.scheduler_thread.lock().take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
        if let Some(mut workers) = self.workers.lock().take() {
            workers.shutdown();
        }
        self.shared.workers_stopped.store(true, Ordering::SeqCst);
        info!(stats = ?self.stats(), "virtual machine stopped");
    }
}

impl fmt::Debug for VirtualMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualMachine")
            .field("machine_id", &self.shared.config.machine_id)
            .field("execution", &self.shared.config.execution)
            .field("streams", &self.shared.topology.streams.len())
            .field("thread_ctxs", &self.shared.topology.thread_ctxs.len())
            .finish()
    }
}

impl Drop for VirtualMachine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::resource::DeviceResource;

    fn cuda_resource() -> ResourceDesc {
        ResourceDesc::new([
            DeviceResource::new(DeviceKind::Cpu, 1, [StreamRole::Host, StreamRole::Compute]),
            DeviceResource::new(DeviceKind::Cuda, 2, [StreamRole::Compute, StreamRole::Copy, StreamRole::Helper])
                .with_streams_per_thread(2),
        ])
    }

    #[test]
    fn topology_groups_streams_into_thread_contexts() {
        let topology = Topology::build(&cuda_resource(), 0, &StreamTypeTable::builtin()).expect("topology");
        // host, cpu compute, 2 cuda compute, 2 cuda copy, 1 helper
        assert_eq!(topology.streams.len(), 7);
        assert_eq!(topology.stream_descs.len(), 5);
        // cuda compute and copy each share one thread context for both devices
        assert_eq!(topology.thread_ctxs.len(), 5);
        let compute_1 = topology
            .resolve_stream(StreamRole::Compute, Device::cuda(1), 0)
            .expect("cuda:1 compute");
        assert_eq!(topology.streams[compute_1].device_id(), Ok(1));
        assert_eq!(
            topology.resolve_stream(StreamRole::Copy, Device::cpu(0), 0),
            Err(VmError::NoSuchStream {
                role: StreamRole::Copy,
                device: Device::cpu(0),
            })
        );
    }

    #[test]
    fn single_helper_stream_serves_every_device_of_its_kind() {
        let topology = Topology::build(&cuda_resource(), 0, &StreamTypeTable::builtin()).expect("topology");
        let helpers: Vec<_> = (0..2)
            .map(|index| topology.resolve_stream(StreamRole::Helper, Device::cuda(index), 0))
            .collect::<VmResult<_>>()
            .expect("helper lanes");
        assert_eq!(helpers[0], helpers[1]);
        let helper_streams = topology
            .streams
            .iter()
            .filter(|stream| stream.stream_type().name() == "device_helper")
            .count();
        assert_eq!(helper_streams, 1);
        assert!(topology.resolve_stream(StreamRole::Helper, Device::cuda(2), 0).is_err());
    }

    #[test]
    fn lanes_wrap_around_streams_of_a_device() {
        let resource = ResourceDesc::new([DeviceResource::new(DeviceKind::Cpu, 1, [StreamRole::Compute])
            .with_streams_per_device(3)]);
        let topology = Topology::build(&resource, 0, &StreamTypeTable::builtin()).expect("topology");
        let lanes: Vec<_> = (0..4)
            .map(|lane| topology.resolve_stream(StreamRole::Compute, Device::cpu(0), lane))
            .collect::<VmResult<_>>()
            .expect("lanes");
        assert_eq!(lanes, vec![0, 1, 2, 0]);
    }

    #[test]
    fn machine_id_out_of_range_is_rejected() {
        let err = Topology::build(&ResourceDesc::host_only(), 2, &StreamTypeTable::builtin())
            .err()
            .expect("out of range");
        assert!(matches!(err, VmError::Configuration(_)));
    }

    #[test]
    fn submissions_after_shutdown_are_refused() {
        let vm = VirtualMachine::new(VmConfig::default().with_execution(ExecutionMode::Inline)).expect("vm");
        vm.shutdown();
        assert_eq!(
            vm.submit(InstructionMsg::new("malloc")).unwrap_err(),
            VmError::ShutDown
        );
    }
}

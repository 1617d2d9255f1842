use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_deque::{Injector, Steal};
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::device::{Device, StreamRole};
use super::instruction::{InstructionHandle, InstructionPacket, InstructionState};
use super::kernel::KernelError;
use super::stream_type::{DeviceCtx, StreamType, StreamTypeTable};
use crate::{VmError, VmResult};

#[derive(Debug, Clone, Copy)]
struct Placement {
    thread_ctx: usize,
    device: Device,
    role: StreamRole,
}

/// An instruction whose status the stream type reported as done. The status
/// buffer has already been deleted.
#[derive(Debug)]
pub(crate) struct Finished {
    pub handle: InstructionHandle,
    pub failure: Option<KernelError>,
}

/// One ordered execution lane bound to a device and a role.
///
/// The scheduler pushes dispatched packets onto the lock-free pending queue;
/// the owning thread context pops them, calls `compute` and parks them on the
/// running queue, where the scheduler polls them until they are done.
pub struct Stream {
    id: usize,
    placement: Option<Placement>,
    stream_type: Option<Arc<dyn StreamType>>,
    device_ctx: Option<Box<dyn DeviceCtx>>,
    initialized: bool,
    pending: Injector<InstructionPacket>,
    pending_len: AtomicUsize,
    running: Mutex<VecDeque<InstructionPacket>>,
}

impl Stream {
    /// An unbound stream. Call [`Stream::init`] before use.
    pub fn new(id: usize) -> Self {
        Self {
            id,
            placement: None,
            stream_type: None,
            device_ctx: None,
            initialized: false,
            pending: Injector::new(),
            pending_len: AtomicUsize::new(0),
            running: Mutex::new(VecDeque::new()),
        }
    }

    /// Binds the stream: thread context, device and role first, then the
    /// stream type for `(role, device.kind)`, then the device context.
    pub fn init(
        &mut self,
        thread_ctx: usize,
        device: Device,
        role: StreamRole,
        table: &StreamTypeTable,
    ) -> VmResult<()> {
        if self.placement.is_some() {
            lifecycle_violation!("stream {} initialized twice", self.id);
        }
        self.placement = Some(Placement {
            thread_ctx,
            device,
            role,
        });
        let stream_type = table.resolve(role, device.kind)?;
        self.stream_type = Some(stream_type.clone());
        self.device_ctx = stream_type.init_device_ctx(self)?;
        self.initialized = true;
        debug!(stream = self.id, %device, %role, stream_type = stream_type.name(), "stream bound");
        Ok(())
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn placement(&self) -> VmResult<Placement> {
        self.placement
            .ok_or_else(|| VmError::InvalidState(format!("stream {} is not bound", self.id)))
    }

    pub fn device(&self) -> VmResult<Device> {
        self.placement().map(|placement| placement.device)
    }

    pub fn device_id(&self) -> VmResult<i64> {
        self.placement().map(|placement| placement.device.id)
    }

    pub fn role(&self) -> VmResult<StreamRole> {
        self.placement().map(|placement| placement.role)
    }

    pub fn thread_ctx_id(&self) -> VmResult<usize> {
        self.placement().map(|placement| placement.thread_ctx)
    }

    pub fn stream_type(&self) -> &Arc<dyn StreamType> {
        match (&self.stream_type, self.initialized) {
            (Some(stream_type), true) => stream_type,
            _ => lifecycle_violation!("stream {} type read before init", self.id),
        }
    }

    /// `None` for stream types without a device context.
    pub fn device_ctx(&self) -> Option<&dyn DeviceCtx> {
        if !self.initialized {
            lifecycle_violation!("stream {} device context read before init", self.id);
        }
        self.device_ctx.as_deref()
    }

    /// Queues a packet whose status buffer is already live.
    pub(crate) fn enqueue(&self, packet: InstructionPacket) {
        self.pending_len.fetch_add(1, Ordering::SeqCst);
        self.pending.push(packet);
    }

    /// Computes every queued packet in FIFO order. Only the owning thread
    /// context calls this, so launch order matches dispatch order.
    pub(crate) fn dispatch_pending(&self) -> usize {
        let stream_type = self.stream_type();
        let mut dispatched = 0;
        loop {
            match self.pending.steal() {
                Steal::Success(mut packet) => {
                    self.pending_len.fetch_sub(1, Ordering::SeqCst);
                    packet.handle().set_state(InstructionState::Running);
                    stream_type.compute(self, &mut packet);
                    self.running.lock().push_back(packet);
                    dispatched += 1;
                }
                Steal::Retry => continue,
                Steal::Empty => break,
            }
        }
        if dispatched > 0 {
            trace!(stream = self.id, dispatched, "stream computed");
        }
        dispatched
    }

    /// Removes finished packets from the running queue, deleting their status
    /// buffers. Unfinished packets keep their order.
    pub(crate) fn collect_finished(&self) -> Vec<Finished> {
        let stream_type = self.stream_type();
        let mut running = self.running.lock();
        if running.is_empty() {
            return Vec::new();
        }
        let mut finished = Vec::new();
        let mut still_running = VecDeque::with_capacity(running.len());
        while let Some(mut packet) = running.pop_front() {
            if !stream_type.query_instruction_status_done(self, packet.status()) {
                still_running.push_back(packet);
                continue;
            }
            let failure = stream_type.query_instruction_failure(self, packet.status());
            stream_type.delete_instruction_status(self, packet.status_mut());
            finished.push(Finished {
                handle: packet.handle().clone(),
                failure,
            });
        }
        *running = still_running;
        finished
    }

    pub fn pending_len(&self) -> usize {
        self.pending_len.load(Ordering::SeqCst)
    }

    pub fn running_len(&self) -> usize {
        self.running.lock().len()
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("placement", &self.placement)
            .field("stream_type", &self.stream_type.as_ref().map(|ty| ty.name()))
            .field("pending", &self.pending_len())
            .field("running", &self.running_len())
            .finish()
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        let Some(stream_type) = self.stream_type.clone() else {
            return;
        };
        if !self.initialized {
            return;
        }
        // Queued and running packets still own live status buffers.
        let mut discarded = 0;
        loop {
            match self.pending.steal() {
                Steal::Success(mut packet) => {
                    stream_type.delete_instruction_status(self, packet.status_mut());
                    discarded += 1;
                }
                Steal::Retry => continue,
                Steal::Empty => break,
            }
        }
        let running: Vec<_> = self.running.get_mut().drain(..).collect();
        for mut packet in running {
            stream_type.delete_instruction_status(self, packet.status_mut());
            discarded += 1;
        }
        if discarded > 0 {
            debug!(stream = self.id, discarded, "stream dropped unfinished instructions");
        }
    }
}

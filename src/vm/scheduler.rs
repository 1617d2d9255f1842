//! Dependency resolution and the instruction lifecycle.
//!
//! The scheduler runs in passes. Each pass admits a bounded batch of
//! submissions, computes their dependency edges against the live accessors of
//! every operand object, dispatches ready instructions to their streams in
//! admission order, polls the streams for finished work and retires it. No
//! pass ever blocks on a device: completion is only ever observed by polling.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, trace, warn};

use super::device::Device;
use super::instruction::{
    normalize_operands, CompletionCallback, InstructionHandle, InstructionId, InstructionOutcome,
    InstructionPacket, InstructionState, Operand,
};
use super::kernel::{BoundOperand, Kernel};
use super::machine::Topology;
use crate::concurrency::MpmcQueue;
use crate::memory::{Arena, ArenaHandle};
use crate::object::{LogicalObjectId, ObjectRegistry, PendingRefs};
use crate::{VmError, VmResult};

/// Result of one scheduling pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Work is queued, admitted or in flight.
    Pending,
    Idle,
}

/// Counters describing everything the scheduler has seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub submitted: u64,
    pub admitted: u64,
    pub dispatched: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub rejected: u64,
    /// Submitted but not yet retired.
    pub in_flight: u64,
    pub live_objects: usize,
    pub objects_created: u64,
    pub objects_destroyed: u64,
}

impl SchedulerStats {
    pub fn retired(&self) -> u64 {
        self.completed + self.failed + self.cancelled + self.rejected
    }
}

/// A validated instruction waiting for admission.
pub(crate) struct Submission {
    pub handle: InstructionHandle,
    pub stream: usize,
    pub device: Device,
    pub kernel: Arc<dyn Kernel>,
    pub opcode: String,
    pub operands: Vec<Operand>,
    pub attrs: Value,
    pub callback: Option<CompletionCallback>,
}

impl Submission {
    /// Distinct objects the instruction names.
    pub(crate) fn objects(&self) -> Vec<LogicalObjectId> {
        normalize_operands(&self.operands)
            .iter()
            .map(|operand| operand.object)
            .collect()
    }
}

/// Submitter-side bookkeeping, updated without the scheduler lock.
#[derive(Debug)]
pub(crate) struct Intake {
    submitted: AtomicU64,
    pending: Arc<PendingRefs>,
}

impl Intake {
    /// Queues `submission` after recording a pending reference on every object
    /// it names, so no retirement destroys them before it is admitted.
    pub(crate) fn push(&self, queue: &MpmcQueue<Submission>, submission: Submission) {
        self.pending.add(&submission.objects());
        self.submitted.fetch_add(1, Ordering::SeqCst);
        queue.push(submission);
    }

    pub(crate) fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::SeqCst)
    }
}

/// Callback owed to a retired instruction, run once the scheduler is unlocked.
pub(crate) type Deferred = (CompletionCallback, InstructionId, InstructionOutcome);

type RecordHandle = ArenaHandle<Record>;

struct Record {
    handle: InstructionHandle,
    seq: u64,
    state: InstructionState,
    stream: usize,
    /// Held until dispatch; the stream owns the packet afterwards.
    packet: Option<InstructionPacket>,
    objects: Vec<LogicalObjectId>,
    /// Live instructions this one waits for.
    upstreams: Vec<RecordHandle>,
    dependents: Vec<RecordHandle>,
    callback: Option<CompletionCallback>,
}

/// Live accessors of one object, oldest first.
#[derive(Default)]
struct AccessRecord {
    accessors: Vec<(RecordHandle, bool)>,
}

pub(crate) struct Scheduler {
    records: Arena<Record>,
    by_id: HashMap<InstructionId, RecordHandle>,
    ready: BTreeMap<u64, RecordHandle>,
    access: HashMap<LogicalObjectId, AccessRecord>,
    objects: ObjectRegistry,
    intake: Arc<Intake>,
    next_seq: u64,
    admission_batch: usize,
    stats: SchedulerStats,
    deferred: Vec<Deferred>,
}

fn push_unique(handles: &mut Vec<RecordHandle>, handle: RecordHandle) -> bool {
    if handles.contains(&handle) {
        false
    } else {
        handles.push(handle);
        true
    }
}

impl Scheduler {
    pub(crate) fn new(admission_batch: usize) -> Self {
        let objects = ObjectRegistry::new();
        let intake = Arc::new(Intake {
            submitted: AtomicU64::new(0),
            pending: objects.pending_refs(),
        });
        Self {
            records: Arena::new(),
            by_id: HashMap::new(),
            ready: BTreeMap::new(),
            access: HashMap::new(),
            objects,
            intake,
            next_seq: 0,
            admission_batch: admission_batch.max(1),
            stats: SchedulerStats::default(),
            deferred: Vec::new(),
        }
    }

    pub(crate) fn intake(&self) -> Arc<Intake> {
        self.intake.clone()
    }

    pub(crate) fn objects(&self) -> &ObjectRegistry {
        &self.objects
    }

    pub(crate) fn objects_mut(&mut self) -> &mut ObjectRegistry {
        &mut self.objects
    }

    /// Admitted instructions that have not retired.
    pub(crate) fn live(&self) -> usize {
        self.records.len()
    }

    /// Unretired instructions in admission order.
    pub(crate) fn live_instructions(&self) -> Vec<(InstructionId, InstructionState)> {
        let mut live: Vec<_> = self
            .records
            .iter()
            .map(|(_, record)| (record.seq, record.handle.id(), record.handle.state()))
            .collect();
        live.sort_unstable_by_key(|(seq, _, _)| *seq);
        live.into_iter().map(|(_, id, state)| (id, state)).collect()
    }

    pub(crate) fn stats(&self) -> SchedulerStats {
        let submitted = self.intake.submitted();
        SchedulerStats {
            submitted,
            in_flight: submitted.saturating_sub(self.stats.retired()),
            live_objects: self.objects.len(),
            objects_created: self.objects.created(),
            objects_destroyed: self.objects.destroyed(),
            ..self.stats
        }
    }

    pub(crate) fn take_deferred(&mut self) -> Vec<Deferred> {
        std::mem::take(&mut self.deferred)
    }

    /// One scheduling pass. `inline` runs every thread context's dispatch
    /// step on the calling thread; otherwise their workers are woken.
    pub(crate) fn run_pass(
        &mut self,
        topology: &Topology,
        submissions: &MpmcQueue<Submission>,
        inline: bool,
    ) -> LoopState {
        for submission in submissions.pop_batch(self.admission_batch) {
            self.admit(submission);
        }
        self.dispatch_ready(topology, !inline);
        if inline {
            for ctx in &topology.thread_ctxs {
                ctx.run_once();
            }
        }
        let retired = self.poll(topology);
        if retired > 0 {
            self.dispatch_ready(topology, !inline);
        }
        trace!(live = self.records.len(), retired, "scheduling pass");
        if self.records.is_empty() && submissions.is_empty() {
            LoopState::Idle
        } else {
            LoopState::Pending
        }
    }

    /// Admits everything submitted so far, ignoring the batch bound.
    pub(crate) fn drain_submissions(&mut self, submissions: &MpmcQueue<Submission>) {
        while let Some(submission) = submissions.pop() {
            self.admit(submission);
        }
    }

    pub(crate) fn admit(&mut self, submission: Submission) {
        let Submission {
            handle,
            stream,
            device,
            kernel,
            opcode,
            operands,
            attrs,
            callback,
        } = submission;
        let id = handle.id();
        let operands = normalize_operands(&operands);
        let objects: Vec<LogicalObjectId> = operands.iter().map(|operand| operand.object).collect();

        // Reads need an existing object or an admitted writer, which will
        // already have created it.
        if let Some(missing) = operands
            .iter()
            .find(|operand| !operand.access.is_write() && !self.objects.contains(operand.object))
        {
            warn!(instruction = %id, object = %missing.object, "read of unknown object rejected");
            self.objects.settle_pending(&objects);
            self.stats.rejected += 1;
            self.publish(handle, callback, InstructionOutcome::Rejected(VmError::UnknownObject(missing.object)));
            return;
        }

        let mut bound = Vec::with_capacity(operands.len());
        for operand in &operands {
            let buffer = if operand.access.is_write() {
                self.objects.acquire_or_create(operand.object)
            } else {
                match self.objects.acquire(operand.object) {
                    Some(buffer) => buffer,
                    None => lifecycle_violation!("object {} vanished during admission", operand.object),
                }
            };
            bound.push(BoundOperand::new(operand.object, operand.access, buffer));
        }
        self.objects.settle_pending(&objects);

        let seq = self.next_seq;
        self.next_seq += 1;
        let packet = InstructionPacket::new(
            handle.clone(),
            Arc::from(opcode),
            kernel,
            Arc::from(bound),
            Arc::new(attrs),
            device,
        );
        let record = self.records.allocate(Record {
            handle: handle.clone(),
            seq,
            state: InstructionState::Pending,
            stream,
            packet: Some(packet),
            objects,
            upstreams: Vec::new(),
            dependents: Vec::new(),
            callback,
        });

        // A writer waits for the last live writer and every live reader after
        // it; a reader waits for the last live writer only.
        let mut upstreams = Vec::new();
        for operand in &operands {
            let is_write = operand.access.is_write();
            let entry = self.access.entry(operand.object).or_default();
            let last_writer = entry.accessors.iter().rposition(|(_, writes)| *writes);
            if is_write {
                for (accessor, _) in &entry.accessors[last_writer.unwrap_or(0)..] {
                    push_unique(&mut upstreams, *accessor);
                }
            } else if let Some(position) = last_writer {
                push_unique(&mut upstreams, entry.accessors[position].0);
            }
            entry.accessors.push((record, is_write));
        }
        for upstream in &upstreams {
            if let Some(upstream) = self.records.get_mut(*upstream) {
                upstream.dependents.push(record);
            }
        }

        let ready = upstreams.is_empty();
        let dependencies = upstreams.len();
        if let Some(admitted) = self.records.get_mut(record) {
            admitted.upstreams = upstreams;
            if ready {
                admitted.state = InstructionState::Ready;
            }
        }
        self.by_id.insert(id, record);
        self.stats.admitted += 1;
        if ready {
            handle.set_state(InstructionState::Ready);
            self.ready.insert(seq, record);
        }
        debug!(instruction = %id, seq, dependencies, "instruction admitted");
    }

    /// Hands ready instructions to their streams in admission order.
    fn dispatch_ready(&mut self, topology: &Topology, notify: bool) {
        let mut woken: Vec<usize> = Vec::new();
        while let Some((_, handle)) = self.ready.pop_first() {
            let Some(record) = self.records.get_mut(handle) else {
                continue;
            };
            let Some(mut packet) = record.packet.take() else {
                lifecycle_violation!("instruction {} dispatched twice", record.handle.id());
            };
            let stream = &topology.streams[record.stream];
            stream.stream_type().init_instruction_status(stream, packet.status_mut());
            record.state = InstructionState::Dispatched;
            record.handle.set_state(InstructionState::Dispatched);
            trace!(instruction = %record.handle.id(), stream = stream.id(), "instruction dispatched");
            stream.enqueue(packet);
            self.stats.dispatched += 1;

            let ctx = topology.stream_ctx[record.stream];
            if notify && !woken.contains(&ctx) {
                woken.push(ctx);
                topology.thread_ctxs[ctx].notify();
            }
        }
    }

    fn poll(&mut self, topology: &Topology) -> usize {
        let mut retired = 0;
        for stream in &topology.streams {
            for finished in stream.collect_finished() {
                let id = finished.handle.id();
                let Some(&record) = self.by_id.get(&id) else {
                    lifecycle_violation!("finished instruction {id} has no record");
                };
                let (state, outcome) = match finished.failure {
                    None => {
                        self.stats.completed += 1;
                        (InstructionState::Done, InstructionOutcome::Completed)
                    }
                    Some(err) => {
                        warn!(instruction = %id, error = %err, "instruction failed");
                        self.stats.failed += 1;
                        (InstructionState::Failed, InstructionOutcome::Failed(err))
                    }
                };
                if let Some(finished_record) = self.records.get_mut(record) {
                    finished_record.state = state;
                }
                finished.handle.set_state(state);
                self.retire(record, outcome);
                retired += 1;
            }
        }
        retired
    }

    /// Cancels a pending or ready instruction. Its live upstreams pass to its
    /// dependents so the remaining instructions keep their relative order.
    pub(crate) fn cancel(&mut self, id: InstructionId) -> VmResult<()> {
        let record_handle = *self.by_id.get(&id).ok_or(VmError::UnknownInstruction(id))?;
        let record = self
            .records
            .get(record_handle)
            .ok_or(VmError::UnknownInstruction(id))?;
        if !record.state.is_cancellable() {
            return Err(VmError::NotCancellable {
                id,
                state: record.handle.state(),
            });
        }
        let upstreams = record.upstreams.clone();
        let dependents = record.dependents.clone();
        let (state, seq) = (record.state, record.seq);

        for &dependent in &dependents {
            for &upstream in &upstreams {
                let added = match self.records.get_mut(dependent) {
                    Some(record) => push_unique(&mut record.upstreams, upstream),
                    None => false,
                };
                if added {
                    if let Some(record) = self.records.get_mut(upstream) {
                        record.dependents.push(dependent);
                    }
                }
            }
        }
        if state == InstructionState::Ready {
            self.ready.remove(&seq);
        }
        self.stats.cancelled += 1;
        debug!(instruction = %id, %state, "instruction cancelled");
        self.retire(record_handle, InstructionOutcome::Cancelled);
        Ok(())
    }

    fn retire(&mut self, handle: RecordHandle, outcome: InstructionOutcome) {
        let Some(record) = self.records.remove(handle) else {
            lifecycle_violation!("instruction retired twice");
        };
        let id = record.handle.id();
        self.by_id.remove(&id);

        for &dependent in &record.dependents {
            if let Some(waiting) = self.records.get_mut(dependent) {
                waiting.upstreams.retain(|upstream| *upstream != handle);
                if waiting.upstreams.is_empty() && waiting.state == InstructionState::Pending {
                    waiting.state = InstructionState::Ready;
                    waiting.handle.set_state(InstructionState::Ready);
                    self.ready.insert(waiting.seq, dependent);
                }
            }
        }
        for &upstream in &record.upstreams {
            if let Some(upstream) = self.records.get_mut(upstream) {
                upstream.dependents.retain(|dependent| *dependent != handle);
            }
        }
        for object in &record.objects {
            let unused = match self.access.get_mut(object) {
                Some(entry) => {
                    entry.accessors.retain(|(accessor, _)| *accessor != handle);
                    entry.accessors.is_empty()
                }
                None => false,
            };
            if unused {
                self.access.remove(object);
            }
            if self.objects.release(*object) {
                debug!(object = %object, "object destroyed");
            }
        }

        debug!(instruction = %id, outcome = ?outcome, "instruction retired");
        self.publish(record.handle, record.callback, outcome);
    }

    fn publish(
        &mut self,
        handle: InstructionHandle,
        callback: Option<CompletionCallback>,
        outcome: InstructionOutcome,
    ) {
        handle.finish(outcome.clone());
        if let Some(callback) = callback {
            self.deferred.push((callback, handle.id(), outcome));
        }
    }
}

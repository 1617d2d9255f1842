use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::device::{Device, StreamRole};
use super::kernel::{self, BoundOperand, Kernel, KernelContext, KernelError};
use super::status::StatusBuffer;
use crate::object::LogicalObjectId;
use crate::VmError;

/// Identifier assigned to an instruction when it is submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstructionId(u64);

impl InstructionId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstructionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperandAccess {
    Read,
    Write,
    ReadWrite,
}

impl OperandAccess {
    pub fn is_write(&self) -> bool {
        matches!(self, OperandAccess::Write | OperandAccess::ReadWrite)
    }

    /// Combined access of two operands naming the same object.
    pub fn merge(self, other: OperandAccess) -> OperandAccess {
        if self == other {
            self
        } else {
            OperandAccess::ReadWrite
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Operand {
    pub object: LogicalObjectId,
    pub access: OperandAccess,
}

impl Operand {
    pub fn read(object: LogicalObjectId) -> Self {
        Self {
            object,
            access: OperandAccess::Read,
        }
    }

    pub fn write(object: LogicalObjectId) -> Self {
        Self {
            object,
            access: OperandAccess::Write,
        }
    }

    pub fn read_write(object: LogicalObjectId) -> Self {
        Self {
            object,
            access: OperandAccess::ReadWrite,
        }
    }
}

/// Merges operands naming the same object, keeping first-appearance order.
pub(crate) fn normalize_operands(operands: &[Operand]) -> Vec<Operand> {
    let mut merged: Vec<Operand> = Vec::with_capacity(operands.len());
    for operand in operands {
        match merged.iter_mut().find(|seen| seen.object == operand.object) {
            Some(seen) => seen.access = seen.access.merge(operand.access),
            None => merged.push(*operand),
        }
    }
    merged
}

/// Lifecycle of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum InstructionState {
    /// Submitted; dependencies outstanding.
    Pending = 0,
    Ready,
    /// Queued on its stream.
    Dispatched,
    /// Handed to the stream type's compute.
    Running,
    Done,
    Failed,
    Retired,
}

impl InstructionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => InstructionState::Pending,
            1 => InstructionState::Ready,
            2 => InstructionState::Dispatched,
            3 => InstructionState::Running,
            4 => InstructionState::Done,
            5 => InstructionState::Failed,
            _ => InstructionState::Retired,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstructionState::Pending => "pending",
            InstructionState::Ready => "ready",
            InstructionState::Dispatched => "dispatched",
            InstructionState::Running => "running",
            InstructionState::Done => "done",
            InstructionState::Failed => "failed",
            InstructionState::Retired => "retired",
        }
    }

    pub fn is_cancellable(&self) -> bool {
        matches!(self, InstructionState::Pending | InstructionState::Ready)
    }
}

impl fmt::Display for InstructionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a retired instruction ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstructionOutcome {
    Completed,
    /// The kernel reported a failure.
    Failed(KernelError),
    /// Admission refused the instruction; its kernel never ran.
    Rejected(VmError),
    Cancelled,
}

impl InstructionOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, InstructionOutcome::Completed)
    }
}

/// Invoked once, on the scheduling thread, when an instruction retires.
pub type CompletionCallback = Box<dyn FnOnce(InstructionId, &InstructionOutcome) + Send + 'static>;

/// An instruction as a caller submits it.
pub struct InstructionMsg {
    opcode: String,
    operands: Vec<Operand>,
    attrs: Value,
    role: StreamRole,
    device: Device,
    lane: usize,
    callback: Option<CompletionCallback>,
}

impl InstructionMsg {
    /// Targets the compute stream of `cpu:0` until told otherwise.
    pub fn new(opcode: impl Into<String>) -> Self {
        Self {
            opcode: opcode.into(),
            operands: Vec::new(),
            attrs: Value::Null,
            role: StreamRole::Compute,
            device: Device::cpu(0),
            lane: 0,
            callback: None,
        }
    }

    pub fn operand(mut self, operand: Operand) -> Self {
        self.operands.push(operand);
        self
    }

    pub fn read(self, object: LogicalObjectId) -> Self {
        self.operand(Operand::read(object))
    }

    pub fn write(self, object: LogicalObjectId) -> Self {
        self.operand(Operand::write(object))
    }

    pub fn read_write(self, object: LogicalObjectId) -> Self {
        self.operand(Operand::read_write(object))
    }

    /// Opaque attribute payload handed to the kernel.
    pub fn attrs(mut self, attrs: Value) -> Self {
        self.attrs = attrs;
        self
    }

    pub fn on_stream(mut self, role: StreamRole, device: Device) -> Self {
        self.role = role;
        self.device = device;
        self
    }

    /// Selects among several streams bound to the same device and role.
    pub fn lane(mut self, lane: usize) -> Self {
        self.lane = lane;
        self
    }

    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(InstructionId, &InstructionOutcome) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    pub fn opcode(&self) -> &str {
        &self.opcode
    }

    pub fn operands(&self) -> &[Operand] {
        &self.operands
    }

    pub fn role(&self) -> StreamRole {
        self.role
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn lane_index(&self) -> usize {
        self.lane
    }

    pub(crate) fn into_parts(self) -> (String, Vec<Operand>, Value, Option<CompletionCallback>) {
        (self.opcode, self.operands, self.attrs, self.callback)
    }
}

impl fmt::Debug for InstructionMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstructionMsg")
            .field("opcode", &self.opcode)
            .field("operands", &self.operands)
            .field("role", &self.role)
            .field("device", &self.device)
            .field("lane", &self.lane)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

#[derive(Debug)]
struct Completion {
    state: AtomicU8,
    outcome: Mutex<Option<InstructionOutcome>>,
}

/// Caller-side view of a submitted instruction.
#[derive(Debug, Clone)]
pub struct InstructionHandle {
    id: InstructionId,
    completion: Arc<Completion>,
}

impl InstructionHandle {
    pub(crate) fn new(id: InstructionId) -> Self {
        Self {
            id,
            completion: Arc::new(Completion {
                state: AtomicU8::new(InstructionState::Pending as u8),
                outcome: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> InstructionId {
        self.id
    }

    pub fn state(&self) -> InstructionState {
        InstructionState::from_u8(self.completion.state.load(Ordering::SeqCst))
    }

    pub fn is_retired(&self) -> bool {
        self.state() == InstructionState::Retired
    }

    /// Available once the instruction has retired.
    pub fn outcome(&self) -> Option<InstructionOutcome> {
        if !self.is_retired() {
            return None;
        }
        self.completion.outcome.lock().clone()
    }

    /// Spins until the instruction retires or `timeout` elapses. Something else
    /// must be driving the scheduler, e.g. its dedicated thread.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<InstructionOutcome> {
        let start = Instant::now();
        while !self.is_retired() {
            if start.elapsed() >= timeout {
                return None;
            }
            std::thread::yield_now();
        }
        self.outcome()
    }

    pub(crate) fn set_state(&self, state: InstructionState) {
        self.completion.state.store(state as u8, Ordering::SeqCst);
    }

    pub(crate) fn finish(&self, outcome: InstructionOutcome) {
        *self.completion.outcome.lock() = Some(outcome);
        self.set_state(InstructionState::Retired);
    }
}

/// Everything a stream needs to execute one dispatched instruction. Stream
/// queues own packets by value; the scheduler keeps the bookkeeping record.
pub struct InstructionPacket {
    handle: InstructionHandle,
    opcode: Arc<str>,
    kernel: Arc<dyn Kernel>,
    operands: Arc<[BoundOperand]>,
    attrs: Arc<Value>,
    device: Device,
    status: StatusBuffer,
}

impl InstructionPacket {
    pub(crate) fn new(
        handle: InstructionHandle,
        opcode: Arc<str>,
        kernel: Arc<dyn Kernel>,
        operands: Arc<[BoundOperand]>,
        attrs: Arc<Value>,
        device: Device,
    ) -> Self {
        Self {
            handle,
            opcode,
            kernel,
            operands,
            attrs,
            device,
            status: StatusBuffer::new(),
        }
    }

    pub fn id(&self) -> InstructionId {
        self.handle.id()
    }

    pub fn opcode(&self) -> &str {
        &self.opcode
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn operands(&self) -> &[BoundOperand] {
        &self.operands
    }

    pub fn status(&self) -> &StatusBuffer {
        &self.status
    }

    pub fn status_mut(&mut self) -> &mut StatusBuffer {
        &mut self.status
    }

    /// Runs the kernel on the calling thread.
    pub fn execute(&self) -> Result<(), KernelError> {
        let mut ctx = KernelContext::new(&self.opcode, self.device, &self.operands, &self.attrs);
        kernel::invoke(self.kernel.as_ref(), &mut ctx)
    }

    /// Owned copy of the kernel invocation, for launching on another thread.
    pub fn detach(&self) -> DetachedKernel {
        DetachedKernel {
            opcode: self.opcode.clone(),
            kernel: self.kernel.clone(),
            operands: self.operands.clone(),
            attrs: self.attrs.clone(),
            device: self.device,
        }
    }

    pub(crate) fn handle(&self) -> &InstructionHandle {
        &self.handle
    }
}

impl fmt::Debug for InstructionPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstructionPacket")
            .field("id", &self.id())
            .field("opcode", &self.opcode)
            .field("device", &self.device)
            .field("status", &self.status.phase())
            .finish()
    }
}

/// Kernel invocation detached from its packet.
pub struct DetachedKernel {
    opcode: Arc<str>,
    kernel: Arc<dyn Kernel>,
    operands: Arc<[BoundOperand]>,
    attrs: Arc<Value>,
    device: Device,
}

impl DetachedKernel {
    pub fn run(self) -> Result<(), KernelError> {
        let mut ctx = KernelContext::new(&self.opcode, self.device, &self.operands, &self.attrs);
        kernel::invoke(self.kernel.as_ref(), &mut ctx)
    }
}

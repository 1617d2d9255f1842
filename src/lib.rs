#![forbid(unsafe_code)]

//! StreamVM – an instruction-execution virtual machine for heterogeneous streams.
//!
//! Instructions name an opcode, a target stream and the objects they read and
//! write. The virtual machine orders conflicting accesses, hands each ready
//! instruction to its stream and retires it once the stream reports it done:
//!
//! * [`vm::stream_type`] – per-backend behaviour (host, device helper, cuda
//!   compute and copy) selected by `(role, device kind)`.
//! * [`vm::stream`] and [`vm::thread_ctx`] – ordered execution lanes and the
//!   workers that drain them.
//! * [`vm::scheduler`] – dependency resolution, dispatch, completion polling
//!   and object release.
//! * [`VirtualMachine`] – the embeddable front end tying them together.
//!
//! Accelerator streams run on emulated device queues: every launch executes on
//! a dedicated thread per stream and completion is observed by polling an
//! event, never by blocking the dispatching thread.

/// Logs and panics on a misuse of a lifecycle-managed resource (status buffers,
/// streams, object references). These are programming errors, never recoverable.
macro_rules! lifecycle_violation {
    ($($arg:tt)*) => {{
        let message = format!($($arg)*);
        tracing::error!(%message, "lifecycle violation");
        panic!("lifecycle violation: {message}")
    }};
}

pub mod concurrency;
pub mod config;
pub mod logging;
pub mod memory;
pub mod object;
pub mod vm;

use thiserror::Error;

pub use config::{ExecutionMode, SchedulerConfig, VmConfig};
pub use object::{LogicalObjectId, ObjectBuffer, ObjectInfo};
pub use vm::{
    Device, DeviceKind, DeviceResource, InstructionHandle, InstructionId, InstructionMsg,
    InstructionOutcome, InstructionState, KernelContext, KernelError, LoopState, Operand,
    OperandAccess, ResourceDesc, SchedulerStats, StreamDesc, StreamRole, VirtualMachine, VmBuilder,
};

/// Result type used across StreamVM.
pub type VmResult<T> = std::result::Result<T, VmError>;

/// Errors surfaced by the virtual machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VmError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("no stream type registered for role {role} on {device_kind} devices")]
    UnknownStreamType {
        role: StreamRole,
        device_kind: DeviceKind,
    },
    #[error("no {role} stream bound to {device}")]
    NoSuchStream { role: StreamRole, device: Device },
    #[error("unknown opcode `{0}`")]
    UnknownOpcode(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("instruction {id} is {state} and can no longer be cancelled")]
    NotCancellable { id: InstructionId, state: InstructionState },
    #[error("unknown instruction {0}")]
    UnknownInstruction(InstructionId),
    #[error("unknown object {0}")]
    UnknownObject(LogicalObjectId),
    #[error("object {0} already exists")]
    ObjectExists(LogicalObjectId),
    #[error("virtual machine is shut down")]
    ShutDown,
}

//! Streams, stream types and the scheduler that drives them.

pub mod device;
pub mod instruction;
pub mod kernel;
pub mod machine;
pub mod resource;
pub mod scheduler;
pub mod status;
pub mod stream;
pub mod stream_type;
pub mod thread_ctx;

pub use device::{Device, DeviceKind, StreamRole};
pub use instruction::{
    CompletionCallback, InstructionHandle, InstructionId, InstructionMsg, InstructionOutcome,
    InstructionPacket, InstructionState, Operand, OperandAccess,
};
pub use kernel::{builtin, Kernel, KernelContext, KernelError, KernelRegistry};
pub use machine::{VirtualMachine, VmBuilder};
pub use resource::{DeviceResource, ResourceDesc, StreamDesc};
pub use scheduler::{LoopState, SchedulerStats};
pub use status::{CompletionEvent, StatusBuffer, StatusPayload, StatusPhase};
pub use stream::Stream;
pub use stream_type::{
    CudaComputeStreamType, CudaCopyStreamType, DeviceCtx, DeviceHelperStreamType, EmulatedDeviceCtx,
    HostStreamType, StreamType, StreamTypeTable,
};
pub use thread_ctx::ThreadCtx;

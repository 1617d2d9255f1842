use tracing::trace;

use super::{per_device_stream_desc, DeviceCtx, StreamType};
use crate::vm::device::StreamRole;
use crate::vm::instruction::InstructionPacket;
use crate::vm::kernel::KernelError;
use crate::vm::resource::{DeviceResource, ResourceDesc, StreamDesc};
use crate::vm::status::{StatusBuffer, StatusPayload};
use crate::vm::stream::Stream;
use crate::VmResult;

/// Runs kernels in-line on the worker thread that owns the stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostStreamType;

impl StreamType for HostStreamType {
    fn name(&self) -> &'static str {
        "host"
    }

    fn device_tag(&self) -> &'static str {
        "cpu"
    }

    fn init_device_ctx(&self, _stream: &Stream) -> VmResult<Option<Box<dyn DeviceCtx>>> {
        Ok(None)
    }

    fn init_instruction_status(&self, _stream: &Stream, status: &mut StatusBuffer) {
        init_sync_status(status);
    }

    fn delete_instruction_status(&self, _stream: &Stream, status: &mut StatusBuffer) {
        delete_sync_status(status);
    }

    fn query_instruction_status_done(&self, _stream: &Stream, status: &StatusBuffer) -> bool {
        query_sync_done(status)
    }

    fn query_instruction_failure(&self, _stream: &Stream, status: &StatusBuffer) -> Option<KernelError> {
        query_sync_failure(status)
    }

    fn compute(&self, stream: &Stream, instruction: &mut InstructionPacket) {
        trace!(stream = stream.id(), instruction = %instruction.id(), opcode = instruction.opcode(), "host compute");
        compute_sync(instruction);
    }

    fn make_stream_desc(
        &self,
        role: StreamRole,
        device: &DeviceResource,
        resource: &ResourceDesc,
        this_machine_id: i64,
    ) -> VmResult<StreamDesc> {
        per_device_stream_desc(self, role, device, resource, this_machine_id)
    }
}

// Synchronous status handling shared by the stream types that execute on the
// calling thread.

pub(super) fn init_sync_status(status: &mut StatusBuffer) {
    status.init(StatusPayload::Host {
        done: false,
        failure: None,
    });
}

pub(super) fn delete_sync_status(status: &mut StatusBuffer) {
    if let StatusPayload::Device(_) = status.delete() {
        lifecycle_violation!("synchronous stream released a device status");
    }
}

pub(super) fn query_sync_done(status: &StatusBuffer) -> bool {
    match status.payload() {
        StatusPayload::Host { done, .. } => *done,
        StatusPayload::Device(_) => lifecycle_violation!("synchronous stream queried a device status"),
    }
}

pub(super) fn query_sync_failure(status: &StatusBuffer) -> Option<KernelError> {
    match status.payload() {
        StatusPayload::Host { failure, .. } => failure.clone(),
        StatusPayload::Device(_) => lifecycle_violation!("synchronous stream queried a device status"),
    }
}

pub(super) fn compute_sync(instruction: &mut InstructionPacket) {
    let result = instruction.execute();
    match instruction.status_mut().payload_mut() {
        StatusPayload::Host { done, failure } => {
            *failure = result.err();
            *done = true;
        }
        StatusPayload::Device(_) => lifecycle_violation!("synchronous stream computed into a device status"),
    }
}

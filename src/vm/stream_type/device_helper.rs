use tracing::trace;

use super::host::{compute_sync, delete_sync_status, init_sync_status, query_sync_done, query_sync_failure};
use super::{DeviceCtx, StreamType};
use crate::vm::device::StreamRole;
use crate::vm::instruction::InstructionPacket;
use crate::vm::kernel::KernelError;
use crate::vm::resource::{DeviceResource, ResourceDesc, StreamDesc};
use crate::vm::status::StatusBuffer;
use crate::vm::stream::Stream;
use crate::VmResult;

/// Control-plane stream colocated with a device. Runs on the host and owns no
/// device context; each machine gets exactly one.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeviceHelperStreamType;

impl StreamType for DeviceHelperStreamType {
    fn name(&self) -> &'static str {
        "device_helper"
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
        trace!(stream = stream.id(), instruction = %instruction.id(), opcode = instruction.opcode(), "helper compute");
        compute_sync(instruction);
    }

    fn make_stream_desc(
        &self,
        role: StreamRole,
        device: &DeviceResource,
        resource: &ResourceDesc,
        this_machine_id: i64,
    ) -> VmResult<StreamDesc> {
        Ok(StreamDesc {
            role,
            device_kind: device.kind,
            stream_type: self.name().to_string(),
            device_tag: self.device_tag().to_string(),
            num_machines: resource.machine_num,
            num_streams_per_machine: 1,
            num_streams_per_thread: 1,
            start_global_device_id: this_machine_id,
        })
    }
}

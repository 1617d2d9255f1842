//! Stream types: the per-backend behaviour behind every stream.
//!
//! A stream type decides how a stream's device context is created, how an
//! instruction's status buffer is allocated, queried and released, and how the
//! instruction is executed. Host types execute in-line; device types launch
//! asynchronously and report completion through a non-blocking query.
//!
//! Stream types are looked up by `(role, device kind)` in a [`StreamTypeTable`]
//! when a stream is initialized, never by inspecting a stream at run time.

pub mod cuda;
pub mod device_helper;
pub mod host;

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use once_cell::sync::Lazy;

use super::device::{DeviceKind, StreamRole};
use super::instruction::InstructionPacket;
use super::kernel::KernelError;
use super::resource::{DeviceResource, ResourceDesc, StreamDesc};
use super::status::StatusBuffer;
use super::stream::Stream;
use crate::{VmError, VmResult};

pub use cuda::{CudaComputeStreamType, CudaCopyStreamType, EmulatedDeviceCtx};
pub use device_helper::DeviceHelperStreamType;
pub use host::HostStreamType;

/// Backend state owned exclusively by one stream.
pub trait DeviceCtx: Send + Sync + fmt::Debug {
    fn as_any(&self) -> &dyn Any;
}

/// Capability interface implemented by every stream backend.
pub trait StreamType: Send + Sync + fmt::Debug {
    /// Variant name used in logs and topology dumps.
    fn name(&self) -> &'static str;

    /// Stable backend identifier ("cpu", "cuda").
    fn device_tag(&self) -> &'static str;

    /// Builds the stream's device context. Called exactly once per stream,
    /// after the stream's thread context, device and role are fixed.
    fn init_device_ctx(&self, stream: &Stream) -> VmResult<Option<Box<dyn DeviceCtx>>>;

    fn init_instruction_status(&self, stream: &Stream, status: &mut StatusBuffer);

    fn delete_instruction_status(&self, stream: &Stream, status: &mut StatusBuffer);

    /// Non-blocking and idempotent. Never true before the instruction's side
    /// effects are visible to later readers.
    fn query_instruction_status_done(&self, stream: &Stream, status: &StatusBuffer) -> bool;

    /// Failure recorded for a finished instruction, if any.
    fn query_instruction_failure(&self, stream: &Stream, status: &StatusBuffer) -> Option<KernelError>;

    /// Executes (host) or launches (device) one instruction.
    fn compute(&self, stream: &Stream, instruction: &mut InstructionPacket);

    fn make_stream_desc(
        &self,
        role: StreamRole,
        device: &DeviceResource,
        resource: &ResourceDesc,
        this_machine_id: i64,
    ) -> VmResult<StreamDesc>;
}

/// One stream per device lane, spread over threads as the resource asks.
pub(crate) fn per_device_stream_desc(
    stream_type: &dyn StreamType,
    role: StreamRole,
    device: &DeviceResource,
    resource: &ResourceDesc,
    this_machine_id: i64,
) -> VmResult<StreamDesc> {
    let per_machine = device.count.checked_mul(device.streams_per_device).ok_or_else(|| {
        VmError::Configuration(format!("{} stream count overflows", device.kind))
    })?;
    let start_global_device_id = i64::try_from(per_machine)
        .ok()
        .and_then(|per_machine| this_machine_id.checked_mul(per_machine))
        .ok_or_else(|| VmError::Configuration(format!("{} global device ids overflow", device.kind)))?;
    Ok(StreamDesc {
        role,
        device_kind: device.kind,
        stream_type: stream_type.name().to_string(),
        device_tag: stream_type.device_tag().to_string(),
        num_machines: resource.machine_num,
        num_streams_per_machine: per_machine,
        num_streams_per_thread: device.streams_per_thread,
        start_global_device_id,
    })
}

static BUILTIN: Lazy<StreamTypeTable> = Lazy::new(|| {
    let host: Arc<dyn StreamType> = Arc::new(HostStreamType);
    let helper: Arc<dyn StreamType> = Arc::new(DeviceHelperStreamType);
    let mut table = StreamTypeTable::empty();
    table.register(StreamRole::Host, DeviceKind::Cpu, host.clone());
    table.register(StreamRole::Compute, DeviceKind::Cpu, host);
    table.register(StreamRole::Helper, DeviceKind::Cpu, helper.clone());
    table.register(StreamRole::Helper, DeviceKind::Cuda, helper);
    table.register(StreamRole::Compute, DeviceKind::Cuda, Arc::new(CudaComputeStreamType));
    table.register(StreamRole::Copy, DeviceKind::Cuda, Arc::new(CudaCopyStreamType));
    table
});

/// `(role, device kind)` → stream type lookup table.
#[derive(Debug, Clone)]
pub struct StreamTypeTable {
    entries: HashMap<(StreamRole, DeviceKind), Arc<dyn StreamType>>,
}

impl Default for StreamTypeTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl StreamTypeTable {
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Host, helper and accelerator stream types.
    pub fn builtin() -> Self {
        BUILTIN.clone()
    }

    /// Registers or replaces the stream type for a pairing.
    pub fn register(&mut self, role: StreamRole, kind: DeviceKind, stream_type: Arc<dyn StreamType>) {
        self.entries.insert((role, kind), stream_type);
    }

    pub fn resolve(&self, role: StreamRole, kind: DeviceKind) -> VmResult<Arc<dyn StreamType>> {
        self.entries
            .get(&(role, kind))
            .cloned()
            .ok_or(VmError::UnknownStreamType {
                role,
                device_kind: kind,
            })
    }

    /// Registered pairings in a stable order.
    pub fn pairings(&self) -> Vec<(StreamRole, DeviceKind)> {
        let mut pairs: Vec<_> = self.entries.keys().copied().collect();
        pairs.sort();
        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_table_resolves_known_pairings() {
        let table = StreamTypeTable::builtin();
        let cases = [
            (StreamRole::Host, DeviceKind::Cpu, "host", "cpu"),
            (StreamRole::Compute, DeviceKind::Cpu, "host", "cpu"),
            (StreamRole::Helper, DeviceKind::Cpu, "device_helper", "cpu"),
            (StreamRole::Helper, DeviceKind::Cuda, "device_helper", "cpu"),
            (StreamRole::Compute, DeviceKind::Cuda, "cuda_compute", "cuda"),
            (StreamRole::Copy, DeviceKind::Cuda, "cuda_copy", "cuda"),
        ];
        for (role, kind, name, tag) in cases {
            let stream_type = table.resolve(role, kind).expect("registered");
            assert_eq!(stream_type.name(), name);
            assert_eq!(stream_type.device_tag(), tag);
        }
        assert_eq!(table.pairings().len(), cases.len());
    }

    #[test]
    fn unknown_pairings_are_configuration_errors() {
        let table = StreamTypeTable::builtin();
        assert_eq!(
            table.resolve(StreamRole::Copy, DeviceKind::Cpu).unwrap_err(),
            VmError::UnknownStreamType {
                role: StreamRole::Copy,
                device_kind: DeviceKind::Cpu,
            }
        );
        assert!(table.resolve(StreamRole::Host, DeviceKind::Cuda).is_err());
    }

    #[test]
    fn oversized_descs_fail_instead_of_overflowing() {
        let device = DeviceResource::new(DeviceKind::Cpu, usize::MAX / 2 + 1, [StreamRole::Compute])
            .with_streams_per_device(2);
        let resource = ResourceDesc::new([device.clone()]);
        let err = per_device_stream_desc(&HostStreamType, StreamRole::Compute, &device, &resource, 0).unwrap_err();
        assert!(matches!(err, VmError::Configuration(_)), "{err:?}");

        let wide = DeviceResource::new(DeviceKind::Cpu, 1 << 40, [StreamRole::Compute]);
        let resource = ResourceDesc::new([wide.clone()]);
        let err = per_device_stream_desc(&HostStreamType, StreamRole::Compute, &wide, &resource, 1 << 30).unwrap_err();
        assert!(matches!(err, VmError::Configuration(_)), "{err:?}");
    }

    #[test]
    fn registrations_override_builtins() {
        let mut table = StreamTypeTable::builtin();
        table.register(StreamRole::Copy, DeviceKind::Cpu, Arc::new(HostStreamType));
        assert_eq!(
            table
                .resolve(StreamRole::Copy, DeviceKind::Cpu)
                .map(|stream_type| stream_type.name()),
            Ok("host")
        );
    }
}

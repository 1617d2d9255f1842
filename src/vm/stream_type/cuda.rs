//! Accelerator stream types.
//!
//! Each stream owns a [`DeviceQueue`] that plays the part of the device's
//! hardware queue. `compute` launches the kernel and returns immediately; the
//! launched work records a [`CompletionEvent`] the scheduler later polls.

use std::any::Any;
use std::sync::Arc;

use tracing::{debug, trace};

use super::{per_device_stream_desc, DeviceCtx, StreamType};
use crate::concurrency::DeviceQueue;
use crate::vm::device::{Device, DeviceKind, StreamRole};
use crate::vm::instruction::InstructionPacket;
use crate::vm::kernel::KernelError;
use crate::vm::resource::{DeviceResource, ResourceDesc, StreamDesc};
use crate::vm::status::{CompletionEvent, StatusBuffer, StatusPayload};
use crate::vm::stream::Stream;
use crate::{VmError, VmResult};

/// Device context of an accelerator stream.
#[derive(Debug)]
pub struct EmulatedDeviceCtx {
    device: Device,
    engine: DeviceQueue,
}

impl EmulatedDeviceCtx {
    pub fn device(&self) -> Device {
        self.device
    }

    pub fn queue_name(&self) -> &str {
        self.engine.name()
    }
}

impl DeviceCtx for EmulatedDeviceCtx {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Kernel execution on an accelerator.
#[derive(Debug, Default, Clone, Copy)]
pub struct CudaComputeStreamType;

/// Host/device transfers on an accelerator, overlapping with compute.
#[derive(Debug, Default, Clone, Copy)]
pub struct CudaCopyStreamType;

macro_rules! async_stream_type {
    ($ty:ty, $name:literal, $engine:literal) => {
        impl StreamType for $ty {
            fn name(&self) -> &'static str {
                $name
            }

            fn device_tag(&self) -> &'static str {
                "cuda"
            }

            fn init_device_ctx(&self, stream: &Stream) -> VmResult<Option<Box<dyn DeviceCtx>>> {
                init_async_ctx($engine, stream)
            }

            fn init_instruction_status(&self, _stream: &Stream, status: &mut StatusBuffer) {
                status.init(StatusPayload::Device(Arc::new(CompletionEvent::new())));
            }

            fn delete_instruction_status(&self, _stream: &Stream, status: &mut StatusBuffer) {
                if let StatusPayload::Host { .. } = status.delete() {
                    lifecycle_violation!("{} stream released a host status", $name);
                }
            }

            fn query_instruction_status_done(&self, _stream: &Stream, status: &StatusBuffer) -> bool {
                completion_event(status).is_recorded()
            }

            fn query_instruction_failure(&self, _stream: &Stream, status: &StatusBuffer) -> Option<KernelError> {
                completion_event(status).failure()
            }

            fn compute(&self, stream: &Stream, instruction: &mut InstructionPacket) {
                launch_async(stream, instruction);
            }

            fn make_stream_desc(
                &self,
                role: StreamRole,
                device: &DeviceResource,
                resource: &ResourceDesc,
                this_machine_id: i64,
            ) -> VmResult<StreamDesc> {
                if device.kind != DeviceKind::Cuda {
                    return Err(VmError::Configuration(format!(
                        "{} streams need cuda devices, got {}",
                        $name, device.kind
                    )));
                }
                per_device_stream_desc(self, role, device, resource, this_machine_id)
            }
        }
    };
}

async_stream_type!(CudaComputeStreamType, "cuda_compute", "compute");
async_stream_type!(CudaCopyStreamType, "cuda_copy", "copy");

fn init_async_ctx(engine: &str, stream: &Stream) -> VmResult<Option<Box<dyn DeviceCtx>>> {
    let device = stream.device()?;
    if device.kind != DeviceKind::Cuda {
        return Err(VmError::Configuration(format!(
            "{engine} stream {} bound to non-cuda device {device}",
            stream.id()
        )));
    }
    let queue_name = format!("{device}-{engine}-{}", stream.id());
    let engine = DeviceQueue::new(queue_name)
        .map_err(|err| VmError::Configuration(format!("cannot start device queue: {err}")))?;
    debug!(stream = stream.id(), %device, queue = engine.name(), "device context ready");
    Ok(Some(Box::new(EmulatedDeviceCtx { device, engine })))
}

fn completion_event(status: &StatusBuffer) -> &Arc<CompletionEvent> {
    match status.payload() {
        StatusPayload::Device(event) => event,
        StatusPayload::Host { .. } => lifecycle_violation!("device stream queried a host status"),
    }
}

fn launch_async(stream: &Stream, instruction: &mut InstructionPacket) {
    let event = completion_event(instruction.status()).clone();
    let ctx = stream
        .device_ctx()
        .and_then(|ctx| ctx.as_any().downcast_ref::<EmulatedDeviceCtx>());
    let Some(ctx) = ctx else {
        event.record(Err(KernelError::new(
            instruction.opcode(),
            format!("stream {} has no device context", stream.id()),
        )));
        return;
    };
    trace!(stream = stream.id(), instruction = %instruction.id(), queue = ctx.queue_name(), "device launch");
    let work = instruction.detach();
    ctx.engine.launch(move || event.record(work.run()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::instruction::{InstructionHandle, InstructionId};
    use crate::vm::kernel::{Kernel, KernelContext};
    use crate::vm::stream_type::StreamTypeTable;
    use parking_lot::Mutex;
    use serde_json::Value;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    #[test]
    fn compute_returns_before_the_device_finishes() {
        let mut stream = Stream::new(0);
        stream
            .init(0, Device::cuda(0), StreamRole::Compute, &StreamTypeTable::builtin())
            .expect("init");
        let stream_type = stream.stream_type().clone();

        let (release, gate) = mpsc::channel::<()>();
        let gate = Mutex::new(gate);
        let kernel: Arc<dyn Kernel> = Arc::new(move |_ctx: &mut KernelContext<'_>| -> Result<(), KernelError> {
            let _ = gate.lock().recv_timeout(Duration::from_secs(5));
            Ok(())
        });
        let mut packet = InstructionPacket::new(
            InstructionHandle::new(InstructionId::new(0)),
            Arc::from("gated"),
            kernel,
            Arc::from(Vec::new()),
            Arc::new(Value::Null),
            Device::cuda(0),
        );
        stream_type.init_instruction_status(&stream, packet.status_mut());
        stream_type.compute(&stream, &mut packet);
        assert!(!stream_type.query_instruction_status_done(&stream, packet.status()));

        release.send(()).expect("release");
        let start = Instant::now();
        while !stream_type.query_instruction_status_done(&stream, packet.status()) {
            assert!(start.elapsed() < Duration::from_secs(5), "device never finished");
            std::thread::yield_now();
        }
        assert!(stream_type.query_instruction_status_done(&stream, packet.status()));
        assert!(stream_type.query_instruction_failure(&stream, packet.status()).is_none());
        stream_type.delete_instruction_status(&stream, packet.status_mut());
    }

    #[test]
    fn cuda_stream_desc_rejects_cpu_devices() {
        let cpu = DeviceResource::new(DeviceKind::Cpu, 1, [StreamRole::Compute]);
        let resource = ResourceDesc::new([cpu.clone()]);
        let err = CudaComputeStreamType
            .make_stream_desc(StreamRole::Compute, &cpu, &resource, 0)
            .expect_err("cpu rejected");
        assert!(matches!(err, VmError::Configuration(_)));
    }

    #[test]
    fn copy_stream_desc_scales_with_devices() {
        let cuda = DeviceResource::new(DeviceKind::Cuda, 2, [StreamRole::Copy]).with_streams_per_device(2);
        let resource = ResourceDesc::new([cuda.clone()]);
        let desc = CudaCopyStreamType
            .make_stream_desc(StreamRole::Copy, &cuda, &resource, 0)
            .expect("desc");
        assert_eq!(desc.stream_type, "cuda_copy");
        assert_eq!(desc.device_tag, "cuda");
        assert_eq!(desc.num_streams_per_machine, 4);
    }
}

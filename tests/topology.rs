//===================================================
// StreamVM Topology
//===================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Stream construction from resource descriptions
// Objective: Check stream descs, bindings and configuration failures
//===================================================

use std::sync::Arc;

use streamvm::vm::stream_type::HostStreamType;
use streamvm::{
    Device, DeviceKind, DeviceResource, ExecutionMode, ResourceDesc, StreamRole, VirtualMachine, VmConfig, VmError,
};

fn config(resource: ResourceDesc) -> VmConfig {
    VmConfig::default()
        .with_execution(ExecutionMode::Inline)
        .with_resource(resource)
}

#[test]
fn builds_one_stream_per_device_lane() {
    let resource = ResourceDesc::new([
        DeviceResource::new(DeviceKind::Cpu, 1, [StreamRole::Host, StreamRole::Helper]),
        DeviceResource::new(DeviceKind::Cuda, 2, [StreamRole::Compute, StreamRole::Copy])
            .with_streams_per_device(2)
            .with_streams_per_thread(2),
    ])
    .with_machine_num(2);
    let vm = VirtualMachine::new(VmConfig {
        machine_id: 1,
        ..config(resource)
    })
    .expect("vm");

    let descs = vm.stream_descs();
    assert_eq!(descs.len(), 4);
    let compute = descs
        .iter()
        .find(|desc| desc.role == StreamRole::Compute)
        .expect("compute desc");
    assert_eq!(compute.stream_type, "cuda_compute");
    assert_eq!(compute.num_streams_per_machine, 4);
    assert_eq!(compute.num_threads(), 2);
    assert_eq!(compute.start_global_device_id, 4);
    let helper = descs
        .iter()
        .find(|desc| desc.role == StreamRole::Helper)
        .expect("helper desc");
    assert_eq!(helper.num_streams_per_machine, 1);
    assert_eq!(helper.start_global_device_id, 1);

    // host + helper + 4 compute + 4 copy
    assert_eq!(vm.streams().len(), 10);
    assert_eq!(vm.thread_ctxs().len(), 6);
    let second_gpu_lanes: Vec<_> = (0..2)
        .map(|lane| vm.stream_for(StreamRole::Copy, Device::cuda(1), lane).expect("copy lane").id())
        .collect();
    assert_eq!(second_gpu_lanes.len(), 2);
    assert_ne!(second_gpu_lanes[0], second_gpu_lanes[1]);
    for stream in vm.streams() {
        assert!(stream.is_initialized());
        let device = stream.device().expect("bound");
        assert_eq!(stream.device_id(), Ok(device.id));
        let expected_tag = if device.kind == DeviceKind::Cuda { "cuda" } else { "cpu" };
        assert_eq!(stream.stream_type().device_tag(), expected_tag);
    }
    for ctx in vm.thread_ctxs() {
        let names: Vec<_> = ctx.streams().iter().map(|stream| stream.stream_type().name()).collect();
        assert!(names.iter().all(|name| *name == ctx.stream_type().name()));
    }
}

#[test]
fn unknown_role_pairing_aborts_construction() {
    let resource = ResourceDesc::new([DeviceResource::new(DeviceKind::Cpu, 1, [StreamRole::Compute, StreamRole::Copy])]);
    assert_eq!(
        VirtualMachine::new(config(resource)).err(),
        Some(VmError::UnknownStreamType {
            role: StreamRole::Copy,
            device_kind: DeviceKind::Cpu,
        })
    );
}

#[test]
fn malformed_resources_are_configuration_errors() {
    let cases = [
        ResourceDesc::new(Vec::<DeviceResource>::new()),
        ResourceDesc::host_only().with_machine_num(0),
        ResourceDesc::new([DeviceResource::new(DeviceKind::Cuda, 0, [StreamRole::Compute])]),
        ResourceDesc::new([DeviceResource::new(DeviceKind::Cpu, 1, [StreamRole::Host, StreamRole::Host])]),
        ResourceDesc::new([
            DeviceResource::new(DeviceKind::Cpu, usize::MAX / 2 + 1, [StreamRole::Compute]).with_streams_per_device(2)
        ]),
        ResourceDesc::new([
            DeviceResource::new(DeviceKind::Cpu, 1, [StreamRole::Host, StreamRole::Helper]),
            DeviceResource::new(DeviceKind::Cuda, 1, [StreamRole::Compute, StreamRole::Helper]),
        ]),
    ];
    for resource in cases {
        let err = VirtualMachine::new(config(resource.clone())).err();
        assert!(matches!(err, Some(VmError::Configuration(_))), "{resource:?} gave {err:?}");
    }

    let out_of_range = VmConfig {
        machine_id: 3,
        ..config(ResourceDesc::host_only().with_machine_num(2))
    };
    assert!(matches!(VirtualMachine::new(out_of_range), Err(VmError::Configuration(_))));
}

#[test]
fn helper_stream_is_shared_by_every_device_of_its_kind() {
    let resource = ResourceDesc::new([
        DeviceResource::new(DeviceKind::Cpu, 1, [StreamRole::Host]),
        DeviceResource::new(DeviceKind::Cuda, 2, [StreamRole::Compute, StreamRole::Helper]),
    ]);
    let vm = VirtualMachine::new(config(resource)).expect("vm");
    let first = vm.stream_for(StreamRole::Helper, Device::cuda(0), 0).expect("cuda:0 helper");
    let second = vm.stream_for(StreamRole::Helper, Device::cuda(1), 0).expect("cuda:1 helper");
    assert_eq!(first.id(), second.id());
    let helpers = vm
        .streams()
        .iter()
        .filter(|stream| stream.stream_type().name() == "device_helper")
        .count();
    assert_eq!(helpers, 1);
}

#[test]
fn registered_stream_types_extend_the_table() {
    let resource = ResourceDesc::new([DeviceResource::new(DeviceKind::Cpu, 1, [StreamRole::Copy])]);
    let vm = VirtualMachine::builder()
        .config(config(resource))
        .register_stream_type(StreamRole::Copy, DeviceKind::Cpu, Arc::new(HostStreamType))
        .build()
        .expect("vm");
    let stream = vm.stream_for(StreamRole::Copy, Device::cpu(0), 0).expect("copy stream");
    assert_eq!(stream.stream_type().name(), "host");
    assert!(stream.device_ctx().is_none());
}

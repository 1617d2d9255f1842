use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use serde_json::json;
use streamvm::vm::builtin;
use streamvm::{
    Device, DeviceKind, DeviceResource, ExecutionMode, InstructionMsg, LogicalObjectId, ResourceDesc, StreamRole,
    VirtualMachine, VmConfig,
};

fn chain(len: u64) -> Vec<InstructionMsg> {
    let mut batch = vec![InstructionMsg::new(builtin::MALLOC)
        .write(LogicalObjectId::local(0))
        .attrs(json!({ "size": 256 }))];
    for step in 0..len {
        let source = LogicalObjectId::local(step);
        let target = LogicalObjectId::local(step + 1);
        batch.push(
            InstructionMsg::new(builtin::FILL)
                .write(source)
                .attrs(json!({ "value": step % 256 })),
        );
        batch.push(InstructionMsg::new(builtin::COPY).read(source).write(target));
    }
    batch
}

fn host_vm(execution: ExecutionMode) -> VirtualMachine {
    let resource = ResourceDesc::new([DeviceResource::new(
        DeviceKind::Cpu,
        1,
        [StreamRole::Host, StreamRole::Compute],
    )]);
    VirtualMachine::new(VmConfig::default().with_execution(execution).with_resource(resource)).expect("vm")
}

fn bench_dependency_chain(c: &mut Criterion) {
    let vm = host_vm(ExecutionMode::Inline);
    c.bench_function("chain_inline_64", |b| {
        b.iter_batched(
            || chain(64),
            |batch| {
                vm.submit_batch(batch).expect("submit");
                vm.wait_all();
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_threaded_fan_out(c: &mut Criterion) {
    let vm = host_vm(ExecutionMode::Threaded);
    c.bench_function("fan_out_threaded_128", |b| {
        b.iter_batched(
            || {
                (0..128u64)
                    .map(|n| {
                        InstructionMsg::new(builtin::FILL)
                            .write(LogicalObjectId::local(1_000 + n))
                            .attrs(json!({ "value": n % 256, "size": 64 }))
                            .on_stream(StreamRole::Compute, Device::cpu(0))
                    })
                    .collect::<Vec<_>>()
            },
            |batch| {
                vm.submit_batch(batch).expect("submit");
                vm.wait_all();
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_dependency_chain, bench_threaded_fan_out);
criterion_main!(benches);

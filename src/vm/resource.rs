use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::device::{DeviceKind, StreamRole};
use crate::{VmError, VmResult};

/// Declarative description of the devices available to every machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDesc {
    #[serde(default = "default_machine_num")]
    pub machine_num: usize,
    #[serde(default, rename = "device")]
    pub devices: Vec<DeviceResource>,
}

/// One device family and the stream roles it exposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceResource {
    pub kind: DeviceKind,
    /// Devices of this kind on each machine.
    pub count: usize,
    pub roles: Vec<StreamRole>,
    #[serde(default = "default_one")]
    pub streams_per_device: usize,
    /// Streams of one role that share a worker thread.
    #[serde(default = "default_one")]
    pub streams_per_thread: usize,
}

/// Upper bound on `machine_num`.
pub const MAX_MACHINES: usize = 1 << 16;
/// Upper bound on the devices of one kind on a machine.
pub const MAX_DEVICES_PER_KIND: usize = 1 << 10;
/// Upper bound on `streams_per_device` and `streams_per_thread`.
pub const MAX_STREAMS_PER_DEVICE: usize = 1 << 8;

fn default_machine_num() -> usize {
    1
}

fn default_one() -> usize {
    1
}

impl DeviceResource {
    pub fn new(kind: DeviceKind, count: usize, roles: impl IntoIterator<Item = StreamRole>) -> Self {
        Self {
            kind,
            count,
            roles: roles.into_iter().collect(),
            streams_per_device: 1,
            streams_per_thread: 1,
        }
    }

    pub fn with_streams_per_device(mut self, streams: usize) -> Self {
        self.streams_per_device = streams;
        self
    }

    pub fn with_streams_per_thread(mut self, streams: usize) -> Self {
        self.streams_per_thread = streams;
        self
    }
}

impl Default for ResourceDesc {
    fn default() -> Self {
        Self::host_only()
    }
}

impl ResourceDesc {
    pub fn new(devices: impl IntoIterator<Item = DeviceResource>) -> Self {
        Self {
            machine_num: 1,
            devices: devices.into_iter().collect(),
        }
    }

    /// A single cpu device exposing host, compute and helper streams.
    pub fn host_only() -> Self {
        Self::new([DeviceResource::new(
            DeviceKind::Cpu,
            1,
            [StreamRole::Host, StreamRole::Compute, StreamRole::Helper],
        )])
    }

    pub fn with_machine_num(mut self, machine_num: usize) -> Self {
        self.machine_num = machine_num;
        self
    }

    pub fn device(&self, kind: DeviceKind) -> Option<&DeviceResource> {
        self.devices.iter().find(|device| device.kind == kind)
    }

    pub fn validate(&self) -> VmResult<()> {
        if self.machine_num == 0 {
            return Err(VmError::Configuration("machine_num must be at least 1".into()));
        }
        if self.machine_num > MAX_MACHINES {
            return Err(VmError::Configuration(format!(
                "machine_num {} exceeds {MAX_MACHINES}",
                self.machine_num
            )));
        }
        if self.devices.is_empty() {
            return Err(VmError::Configuration("resource lists no devices".into()));
        }
        let helpers = self
            .devices
            .iter()
            .filter(|device| device.roles.contains(&StreamRole::Helper))
            .count();
        if helpers > 1 {
            return Err(VmError::Configuration(
                "only one device kind may declare the helper role".into(),
            ));
        }
        let mut kinds = HashSet::new();
        for device in &self.devices {
            if !kinds.insert(device.kind) {
                return Err(VmError::Configuration(format!(
                    "device kind {} listed more than once",
                    device.kind
                )));
            }
            if device.count == 0 {
                return Err(VmError::Configuration(format!(
                    "{} device count must be at least 1",
                    device.kind
                )));
            }
            if device.count > MAX_DEVICES_PER_KIND {
                return Err(VmError::Configuration(format!(
                    "{} device count {} exceeds {MAX_DEVICES_PER_KIND}",
                    device.kind, device.count
                )));
            }
            if device.roles.is_empty() {
                return Err(VmError::Configuration(format!(
                    "{} devices declare no stream roles",
                    device.kind
                )));
            }
            let unique: HashSet<_> = device.roles.iter().collect();
            if unique.len() != device.roles.len() {
                return Err(VmError::Configuration(format!(
                    "{} devices repeat a stream role",
                    device.kind
                )));
            }
            if device.streams_per_device == 0 || device.streams_per_thread == 0 {
                return Err(VmError::Configuration(format!(
                    "{} stream counts must be at least 1",
                    device.kind
                )));
            }
            if device.streams_per_device > MAX_STREAMS_PER_DEVICE || device.streams_per_thread > MAX_STREAMS_PER_DEVICE {
                return Err(VmError::Configuration(format!(
                    "{} stream counts exceed {MAX_STREAMS_PER_DEVICE}",
                    device.kind
                )));
            }
        }
        Ok(())
    }
}

/// Static configuration of the streams one stream type contributes on a machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamDesc {
    pub role: StreamRole,
    pub device_kind: DeviceKind,
    pub stream_type: String,
    pub device_tag: String,
    pub num_machines: usize,
    pub num_streams_per_machine: usize,
    pub num_streams_per_thread: usize,
    pub start_global_device_id: i64,
}

impl StreamDesc {
    /// Number of worker threads the streams are spread across.
    pub fn num_threads(&self) -> usize {
        let per_thread = self.num_streams_per_thread.max(1);
        self.num_streams_per_machine.div_ceil(per_thread)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_only_is_valid() {
        assert!(ResourceDesc::host_only().validate().is_ok());
    }

    #[test]
    fn rejects_malformed_descriptions() {
        let zero_machines = ResourceDesc::host_only().with_machine_num(0);
        assert!(zero_machines.validate().is_err());

        let duplicate = ResourceDesc::new([
            DeviceResource::new(DeviceKind::Cpu, 1, [StreamRole::Host]),
            DeviceResource::new(DeviceKind::Cpu, 2, [StreamRole::Helper]),
        ]);
        assert!(matches!(duplicate.validate(), Err(VmError::Configuration(_))));

        let no_roles = ResourceDesc::new([DeviceResource::new(
            DeviceKind::Cuda,
            1,
            Vec::<StreamRole>::new(),
        )]);
        assert!(no_roles.validate().is_err());

        let zero_lanes = ResourceDesc::new([DeviceResource::new(
            DeviceKind::Cuda,
            1,
            [StreamRole::Compute],
        )
        .with_streams_per_device(0)]);
        assert!(zero_lanes.validate().is_err());
    }

    #[test]
    fn rejects_oversized_descriptions() {
        let huge_count = ResourceDesc::new([DeviceResource::new(DeviceKind::Cpu, usize::MAX / 2 + 1, [StreamRole::Compute])
            .with_streams_per_device(2)]);
        assert!(matches!(huge_count.validate(), Err(VmError::Configuration(_))));

        let huge_lanes = ResourceDesc::new([DeviceResource::new(DeviceKind::Cuda, 1, [StreamRole::Compute])
            .with_streams_per_device(MAX_STREAMS_PER_DEVICE + 1)]);
        assert!(matches!(huge_lanes.validate(), Err(VmError::Configuration(_))));

        let many_machines = ResourceDesc::host_only().with_machine_num(MAX_MACHINES + 1);
        assert!(matches!(many_machines.validate(), Err(VmError::Configuration(_))));

        let at_limit = ResourceDesc::new([DeviceResource::new(DeviceKind::Cuda, MAX_DEVICES_PER_KIND, [StreamRole::Compute])
            .with_streams_per_device(MAX_STREAMS_PER_DEVICE)])
        .with_machine_num(MAX_MACHINES);
        assert!(at_limit.validate().is_ok());
    }

    #[test]
    fn helper_role_belongs_to_one_device_kind() {
        let twice = ResourceDesc::new([
            DeviceResource::new(DeviceKind::Cpu, 1, [StreamRole::Host, StreamRole::Helper]),
            DeviceResource::new(DeviceKind::Cuda, 2, [StreamRole::Compute, StreamRole::Helper]),
        ]);
        assert!(matches!(twice.validate(), Err(VmError::Configuration(_))));
    }

    #[test]
    fn thread_count_rounds_up() {
        let desc = StreamDesc {
            role: StreamRole::Compute,
            device_kind: DeviceKind::Cuda,
            stream_type: "cuda_compute".into(),
            device_tag: "cuda".into(),
            num_machines: 1,
            num_streams_per_machine: 5,
            num_streams_per_thread: 2,
            start_global_device_id: 0,
        };
        assert_eq!(desc.num_threads(), 3);
    }
}

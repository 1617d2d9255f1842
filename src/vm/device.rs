use std::fmt;

use serde::{Deserialize, Serialize};

/// Execution backend family a device belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Cpu,
    Cuda,
}

impl DeviceKind {
    /// Returns the canonical backend tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Cpu => "cpu",
            DeviceKind::Cuda => "cuda",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A physical or logical device on the local machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Device {
    pub kind: DeviceKind,
    pub id: i64,
}

impl Device {
    pub const fn new(kind: DeviceKind, id: i64) -> Self {
        Self { kind, id }
    }

    pub const fn cpu(id: i64) -> Self {
        Self::new(DeviceKind::Cpu, id)
    }

    pub const fn cuda(id: i64) -> Self {
        Self::new(DeviceKind::Cuda, id)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Role a stream plays on its device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamRole {
    /// General kernel execution.
    Compute,
    /// Memory transfers.
    Copy,
    /// Arbitrary host-side work.
    Host,
    /// Control-plane bookkeeping colocated with a device.
    Helper,
}

impl StreamRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamRole::Compute => "compute",
            StreamRole::Copy => "copy",
            StreamRole::Host => "host",
            StreamRole::Helper => "helper",
        }
    }
}

impl fmt::Display for StreamRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

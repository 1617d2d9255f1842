//! Virtual machine configuration and TOML loading.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::vm::resource::ResourceDesc;
use crate::{VmError, VmResult};

/// Who drives each thread context's dispatch step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One worker thread per thread context.
    #[default]
    Threaded,
    /// The scheduling pass runs every thread context on the calling thread.
    Inline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Spawn a thread that runs scheduling passes continuously.
    pub dedicated_thread: bool,
    /// Submissions admitted per pass.
    pub admission_batch: usize,
    /// How long idle worker and scheduler threads park between checks.
    pub idle_park_micros: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            dedicated_thread: false,
            admission_batch: 1024,
            idle_park_micros: 100,
        }
    }
}

impl SchedulerConfig {
    pub fn idle_park(&self) -> Duration {
        Duration::from_micros(self.idle_park_micros)
    }
}

/// Top-level configuration consumed once when a virtual machine is built.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// This machine's index within `resource.machine_num`.
    pub machine_id: i64,
    pub execution: ExecutionMode,
    pub scheduler: SchedulerConfig,
    pub resource: ResourceDesc,
}

impl VmConfig {
    pub fn with_execution(mut self, execution: ExecutionMode) -> Self {
        self.execution = execution;
        self
    }

    pub fn with_resource(mut self, resource: ResourceDesc) -> Self {
        self.resource = resource;
        self
    }

    pub fn with_dedicated_scheduler(mut self, dedicated: bool) -> Self {
        self.scheduler.dedicated_thread = dedicated;
        self
    }

    pub fn with_admission_batch(mut self, admission_batch: usize) -> Self {
        self.scheduler.admission_batch = admission_batch;
        self
    }

    pub fn from_toml_str(source: &str) -> VmResult<Self> {
        toml::from_str(source).map_err(|err| VmError::Configuration(format!("invalid config: {err}")))
    }

    /// Reads and parses a TOML configuration file.
    pub fn load_from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)
            .with_context(|| format!("reading configuration from {}", path.display()))?;
        let config: Self = toml::from_str(&data)
            .with_context(|| format!("parsing configuration {}", path.display()))?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> VmResult<String> {
        toml::to_string_pretty(self)
            .map_err(|err| VmError::Configuration(format!("cannot serialize config: {err}")))
    }

    /// Checks everything construction relies on before any thread starts.
    pub fn validate(&self) -> VmResult<()> {
        self.resource.validate()?;
        if self.machine_id < 0 || self.machine_id as usize >= self.resource.machine_num {
            return Err(VmError::Configuration(format!(
                "machine_id {} outside 0..{}",
                self.machine_id, self.resource.machine_num
            )));
        }
        if self.scheduler.admission_batch == 0 {
            return Err(VmError::Configuration("admission_batch must be at least 1".into()));
        }
        if self.scheduler.idle_park_micros == 0 {
            return Err(VmError::Configuration("idle_park_micros must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::device::{DeviceKind, StreamRole};

    #[test]
    fn empty_document_yields_defaults() {
        let config = VmConfig::from_toml_str("").expect("parse");
        assert_eq!(config, VmConfig::default());
        assert_eq!(config.scheduler.admission_batch, 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_devices_and_modes() {
        let config = VmConfig::from_toml_str(
            r#"
            machine_id = 1
            execution = "inline"

            [scheduler]
            dedicated_thread = true

            [resource]
            machine_num = 2

            [[resource.device]]
            kind = "cuda"
            count = 2
            roles = ["compute", "copy", "helper"]
            streams_per_thread = 2
            "#,
        )
        .expect("parse");
        assert_eq!(config.execution, ExecutionMode::Inline);
        assert!(config.scheduler.dedicated_thread);
        let cuda = config.resource.device(DeviceKind::Cuda).expect("cuda");
        assert_eq!(cuda.roles, vec![StreamRole::Compute, StreamRole::Copy, StreamRole::Helper]);
        assert_eq!(cuda.streams_per_device, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn machine_id_must_be_in_range() {
        let config = VmConfig {
            machine_id: 1,
            ..VmConfig::default()
        };
        assert!(matches!(config.validate(), Err(VmError::Configuration(_))));
    }

    #[test]
    fn unknown_execution_mode_is_rejected() {
        assert!(VmConfig::from_toml_str("execution = \"turbo\"").is_err());
    }
}

//! jobupdated.toml configuration parser.

use std::path::Path;
use std::time::Duration;

use jobupdate_controller::ControllerConfig;
use jobupdate_state::{InstanceIndex, UpdateSpec};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
    /// Updates to start once recovery has finished.
    #[serde(default)]
    pub updates: Vec<UpdateRequest>,
}

/// Inventory of the in-process scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default = "default_healthy_after_ms")]
    pub healthy_after_ms: u64,
    #[serde(default)]
    pub jobs: Vec<SimulatedJob>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            healthy_after_ms: default_healthy_after_ms(),
            jobs: Vec::new(),
        }
    }
}

impl SimulationConfig {
    pub fn healthy_after(&self) -> Duration {
        Duration::from_millis(self.healthy_after_ms)
    }
}

fn default_healthy_after_ms() -> u64 {
    1_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedJob {
    pub id: String,
    pub instances: u32,
    pub version: String,
    /// Instances that never become healthy on a given version.
    #[serde(default)]
    pub fail_on: Vec<FailureRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRule {
    pub instance: InstanceIndex,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub job: String,
    #[serde(default)]
    pub supersede: bool,
    pub spec: UpdateSpec,
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DaemonConfig = toml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty() {
        let config: DaemonConfig = toml::from_str("").unwrap();
        assert_eq!(config.controller, ControllerConfig::default());
        assert_eq!(config.simulation.healthy_after(), Duration::from_secs(1));
        assert!(config.updates.is_empty());
    }

    #[test]
    fn test_parse_full() {
        let toml_str = r#"
[controller]
tick_interval_ms = 100

[simulation]
healthy_after_ms = 250

[[simulation.jobs]]
id = "prod/api"
instances = 4
version = "v1"
fail_on = [{ instance = 2, version = "v2" }]

[[updates]]
job = "prod/api"

[updates.spec]
instance_count = 4
desired_version = "v2"
previous_version = "v1"
batch_size = 2
rollback_on_failure = true
"#;
        let config: DaemonConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.controller.tick_interval_ms, 100);
        assert_eq!(config.controller.command_queue_depth, 32);
        assert_eq!(config.simulation.jobs[0].fail_on[0].instance, 2);

        let update = &config.updates[0];
        assert!(!update.supersede);
        assert_eq!(update.spec.batch_size, 2);
        assert_eq!(update.spec.max_wait_for_running_ms, 300_000);
        assert!(update.spec.rollback_on_failure);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobupdated.toml");
        std::fs::write(&path, "[simulation]\nhealthy_after_ms = 5\n").unwrap();

        let config = DaemonConfig::from_file(&path).unwrap();
        assert_eq!(config.simulation.healthy_after_ms, 5);
    }
}

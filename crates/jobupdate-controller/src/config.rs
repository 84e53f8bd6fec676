//! Control-loop tuning shared by every controller in a registry.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timing and queueing parameters of the control loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Wake the loop at least this often, even without events.
    pub tick_interval_ms: u64,
    /// How often the tracker polls the scheduler.
    pub observation_poll_interval_ms: u64,
    /// Observations older than this are ignored.
    pub observation_staleness_ms: u64,
    /// First delay after the scheduler is unavailable.
    pub scheduler_backoff_initial_ms: u64,
    /// Cap on the doubling scheduler backoff.
    pub scheduler_backoff_max_ms: u64,
    /// A scheduler call that has not answered by now counts as an outage.
    pub scheduler_call_timeout_ms: u64,
    /// Pending commands per controller before senders wait.
    pub command_queue_depth: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            observation_poll_interval_ms: 1_000,
            observation_staleness_ms: 10_000,
            scheduler_backoff_initial_ms: 500,
            scheduler_backoff_max_ms: 30_000,
            scheduler_call_timeout_ms: 5_000,
            command_queue_depth: 32,
        }
    }
}

impl ControllerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn observation_poll_interval(&self) -> Duration {
        Duration::from_millis(self.observation_poll_interval_ms)
    }

    pub fn observation_staleness(&self) -> Duration {
        Duration::from_millis(self.observation_staleness_ms)
    }

    pub fn scheduler_backoff_initial(&self) -> Duration {
        Duration::from_millis(self.scheduler_backoff_initial_ms)
    }

    pub fn scheduler_backoff_max(&self) -> Duration {
        Duration::from_millis(self.scheduler_backoff_max_ms)
    }

    pub fn scheduler_call_timeout(&self) -> Duration {
        Duration::from_millis(self.scheduler_call_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_uses_defaults() {
        let cfg: ControllerConfig = serde_json::from_str(r#"{"tick_interval_ms": 50}"#).unwrap();
        assert_eq!(cfg.tick_interval(), Duration::from_millis(50));
        assert_eq!(cfg.observation_staleness_ms, 10_000);
        assert_eq!(cfg.command_queue_depth, 32);
        assert_eq!(cfg.scheduler_call_timeout(), Duration::from_secs(5));
    }
}

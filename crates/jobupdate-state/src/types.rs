//! Domain types for the job update state store.
//!
//! These types represent the persisted state of a job update: its identity,
//! its immutable spec, and the mutable status owned by the controller. All
//! types are serializable to/from JSON for storage in redb tables.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a job (the workload whose instances are being updated).
pub type JobId = String;

/// Zero-based index of an instance within a job.
pub type InstanceIndex = u32;

// ── Identity ──────────────────────────────────────────────────────

/// Globally unique identity of one job update.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobUpdateKey {
    pub job_id: JobId,
    pub update_id: String,
}

impl JobUpdateKey {
    pub fn new(job_id: &str, update_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            update_id: update_id.to_string(),
        }
    }

    /// Build the composite key for the updates table.
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.job_id, self.update_id)
    }

    /// Key prefix shared by every update of `job_id`.
    pub fn job_prefix(job_id: &str) -> String {
        format!("{job_id}/")
    }
}

impl fmt::Display for JobUpdateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.job_id, self.update_id)
    }
}

// ── Spec ──────────────────────────────────────────────────────────

/// Immutable parameters of a job update, fixed when the update starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateSpec {
    /// Number of instances the job runs; size of the progress table.
    pub instance_count: u32,
    /// Configuration version instances are moved to.
    pub desired_version: String,
    /// Configuration version instances revert to on rollback.
    pub previous_version: String,
    /// Maximum number of instances in flight at once.
    pub batch_size: u32,
    /// Time an instance must be observed healthy on its target version
    /// before it counts as done.
    #[serde(default)]
    pub min_wait_in_running_ms: u64,
    /// Time after which an instance that has not become healthy is failed.
    #[serde(default = "default_max_wait_for_running_ms")]
    pub max_wait_for_running_ms: u64,
    /// Failures tolerated within a single batch.
    #[serde(default)]
    pub max_batch_failures: u32,
    /// Failures tolerated across the whole update.
    #[serde(default)]
    pub max_total_failures: u32,
    /// Require an operator pulse before every batch.
    #[serde(default)]
    pub pulsed: bool,
    /// Revert touched instances when a failure threshold is exceeded.
    #[serde(default)]
    pub rollback_on_failure: bool,
}

fn default_max_wait_for_running_ms() -> u64 {
    300_000
}

impl Default for UpdateSpec {
    fn default() -> Self {
        Self {
            instance_count: 1,
            desired_version: String::new(),
            previous_version: String::new(),
            batch_size: 1,
            min_wait_in_running_ms: 0,
            max_wait_for_running_ms: default_max_wait_for_running_ms(),
            max_batch_failures: 0,
            max_total_failures: 0,
            pulsed: false,
            rollback_on_failure: false,
        }
    }
}

// ── Lifecycle ─────────────────────────────────────────────────────

/// Lifecycle state of a job update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateState {
    Initialized,
    RollingForward,
    RollForwardPaused,
    RollForwardAwaitingPulse,
    RollingBack,
    RollBackPaused,
    RollBackAwaitingPulse,
    RolledForward,
    RolledBack,
    Aborted,
    Failed,
    Error,
}

impl UpdateState {
    pub const ALL: [UpdateState; 12] = [
        UpdateState::Initialized,
        UpdateState::RollingForward,
        UpdateState::RollForwardPaused,
        UpdateState::RollForwardAwaitingPulse,
        UpdateState::RollingBack,
        UpdateState::RollBackPaused,
        UpdateState::RollBackAwaitingPulse,
        UpdateState::RolledForward,
        UpdateState::RolledBack,
        UpdateState::Aborted,
        UpdateState::Failed,
        UpdateState::Error,
    ];

    /// No transition leaves a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UpdateState::RolledForward
                | UpdateState::RolledBack
                | UpdateState::Aborted
                | UpdateState::Failed
                | UpdateState::Error
        )
    }

    /// States in which the controller issues instance changes.
    pub fn is_rolling(self) -> bool {
        matches!(self, UpdateState::RollingForward | UpdateState::RollingBack)
    }

    pub fn is_paused(self) -> bool {
        matches!(
            self,
            UpdateState::RollForwardPaused | UpdateState::RollBackPaused
        )
    }

    pub fn is_awaiting_pulse(self) -> bool {
        matches!(
            self,
            UpdateState::RollForwardAwaitingPulse | UpdateState::RollBackAwaitingPulse
        )
    }

    /// True for every state on the rollback side of the table.
    pub fn is_backward(self) -> bool {
        matches!(
            self,
            UpdateState::RollingBack
                | UpdateState::RollBackPaused
                | UpdateState::RollBackAwaitingPulse
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UpdateState::Initialized => "INITIALIZED",
            UpdateState::RollingForward => "ROLLING_FORWARD",
            UpdateState::RollForwardPaused => "ROLL_FORWARD_PAUSED",
            UpdateState::RollForwardAwaitingPulse => "ROLL_FORWARD_AWAITING_PULSE",
            UpdateState::RollingBack => "ROLLING_BACK",
            UpdateState::RollBackPaused => "ROLL_BACK_PAUSED",
            UpdateState::RollBackAwaitingPulse => "ROLL_BACK_AWAITING_PULSE",
            UpdateState::RolledForward => "ROLLED_FORWARD",
            UpdateState::RolledBack => "ROLLED_BACK",
            UpdateState::Aborted => "ABORTED",
            UpdateState::Failed => "FAILED",
            UpdateState::Error => "ERROR",
        }
    }
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Instance progress ─────────────────────────────────────────────

/// Progress of one instance within an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceProgress {
    /// Still on the previous version, untouched.
    Pending,
    /// Moving to the desired version.
    Updating,
    /// Healthy on the desired version.
    Updated,
    /// Did not become healthy on the desired version.
    Failed,
    /// Moving back to the previous version.
    Reverting,
    /// Back on the previous version.
    Reverted,
    /// Did not become healthy on the previous version.
    RevertFailed,
}

impl InstanceProgress {
    /// A command for this instance is outstanding.
    pub fn is_in_flight(self) -> bool {
        matches!(self, InstanceProgress::Updating | InstanceProgress::Reverting)
    }

    /// The instance was touched by the forward pass and not yet reverted.
    pub fn is_on_new_config(self) -> bool {
        matches!(self, InstanceProgress::Updated | InstanceProgress::Failed)
    }
}

// ── Status ────────────────────────────────────────────────────────

/// One entry in the update's transition history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateEvent {
    pub state: UpdateState,
    /// Unix timestamp (milliseconds) of the transition.
    pub timestamp_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Mutable status of a job update. Written only by the owning controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateStatus {
    pub state: UpdateState,
    /// Progress per instance, indexed by instance index.
    pub instances: Vec<InstanceProgress>,
    /// Instances currently in flight as one batch.
    pub current_batch: Vec<InstanceIndex>,
    /// Number of batches issued so far (both directions).
    pub batch_number: u32,
    pub instances_updated: u32,
    pub instances_reverted: u32,
    /// Failures recorded in the current batch.
    pub batch_failures: u32,
    /// Forward failures over the whole update.
    pub total_failures: u32,
    /// Revert failures over the whole update.
    pub revert_failures: u32,
    /// Batches authorized by operator pulses and not yet started.
    pub pulse_credits: u32,
    /// Reason attached to the most recent transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub events: Vec<UpdateEvent>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

impl UpdateStatus {
    /// Fresh `INITIALIZED` status with every instance pending.
    pub fn new(instance_count: u32, now_ms: u64) -> Self {
        Self {
            state: UpdateState::Initialized,
            instances: vec![InstanceProgress::Pending; instance_count as usize],
            current_batch: Vec::new(),
            batch_number: 0,
            instances_updated: 0,
            instances_reverted: 0,
            batch_failures: 0,
            total_failures: 0,
            revert_failures: 0,
            pulse_credits: 0,
            message: None,
            events: vec![UpdateEvent {
                state: UpdateState::Initialized,
                timestamp_ms: now_ms,
                message: None,
            }],
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        }
    }

    /// Move to `state`, recording the transition in the history.
    pub fn record_transition(&mut self, state: UpdateState, message: Option<String>, now_ms: u64) {
        self.state = state;
        self.message = message.clone();
        self.events.push(UpdateEvent {
            state,
            timestamp_ms: now_ms,
            message,
        });
        self.updated_at_ms = now_ms;
    }

    pub fn count(&self, progress: InstanceProgress) -> usize {
        self.instances.iter().filter(|p| **p == progress).count()
    }

    pub fn in_flight(&self) -> usize {
        self.instances.iter().filter(|p| p.is_in_flight()).count()
    }
}

/// Persisted record of one job update; also the status snapshot handed
/// to readers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobUpdate {
    pub key: JobUpdateKey,
    pub spec: UpdateSpec,
    pub status: UpdateStatus,
}

impl JobUpdate {
    pub fn table_key(&self) -> String {
        self.key.table_key()
    }
}

/// A stored value together with its compare-and-swap version token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

/// Current wall-clock time as Unix milliseconds.
pub fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_and_rolling_are_disjoint() {
        for state in UpdateState::ALL {
            assert!(!(state.is_terminal() && state.is_rolling()), "{state}");
        }
        assert_eq!(
            UpdateState::ALL.iter().filter(|s| s.is_terminal()).count(),
            5
        );
    }

    #[test]
    fn state_serializes_in_screaming_case() {
        let json = serde_json::to_string(&UpdateState::RollForwardAwaitingPulse).unwrap();
        assert_eq!(json, "\"ROLL_FORWARD_AWAITING_PULSE\"");
        assert_eq!(
            UpdateState::RollForwardAwaitingPulse.to_string(),
            "ROLL_FORWARD_AWAITING_PULSE"
        );
    }

    #[test]
    fn new_status_has_one_entry_per_instance() {
        let status = UpdateStatus::new(4, 1000);
        assert_eq!(status.state, UpdateState::Initialized);
        assert_eq!(status.instances.len(), 4);
        assert_eq!(status.count(InstanceProgress::Pending), 4);
        assert_eq!(status.events.len(), 1);
    }

    #[test]
    fn record_transition_appends_history() {
        let mut status = UpdateStatus::new(1, 1000);
        status.record_transition(UpdateState::RollingForward, None, 1001);
        status.record_transition(UpdateState::Aborted, Some("operator".into()), 1002);
        assert_eq!(status.state, UpdateState::Aborted);
        assert_eq!(status.message.as_deref(), Some("operator"));
        assert_eq!(status.events.len(), 3);
        assert_eq!(status.updated_at_ms, 1002);
    }

    #[test]
    fn spec_defaults_fill_missing_fields() {
        let spec: UpdateSpec = serde_json::from_str(
            r#"{"instance_count":3,"desired_version":"v2","previous_version":"v1","batch_size":1}"#,
        )
        .unwrap();
        assert_eq!(spec.max_wait_for_running_ms, 300_000);
        assert!(!spec.pulsed);
        assert!(!spec.rollback_on_failure);
    }

    #[test]
    fn key_formats() {
        let key = JobUpdateKey::new("prod/api", "u-1");
        assert_eq!(key.table_key(), "prod/api/u-1");
        assert_eq!(key.to_string(), "prod/api/u-1");
        assert_eq!(JobUpdateKey::job_prefix("prod/api"), "prod/api/");
    }
}

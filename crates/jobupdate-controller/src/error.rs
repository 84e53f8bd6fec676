//! Controller error types.

use jobupdate_state::{JobUpdateKey, StateError, UpdateState};
use thiserror::Error;

/// Errors returned by controller and registry operations.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// The command is not legal in the update's current lifecycle state.
    #[error("update {key} is {state}; cannot {command}")]
    InvalidState {
        key: JobUpdateKey,
        state: UpdateState,
        command: &'static str,
    },

    /// The job already has a non-terminal update.
    #[error("job {job_id} already has an active update {active}")]
    Conflict { job_id: String, active: JobUpdateKey },

    #[error("update not found: {0}")]
    NotFound(JobUpdateKey),

    /// A compare-and-swap write lost; another owner holds the record.
    #[error("lost ownership of update {key}: {source}")]
    PersistenceConflict {
        key: JobUpdateKey,
        #[source]
        source: StateError,
    },

    /// Transient scheduler failure; retried by the control loop.
    #[error("scheduler unavailable: {0}")]
    SchedulerUnavailable(String),

    /// Failure thresholds breached. Drives the rollback/failure transition
    /// inside the controller and is never returned to callers.
    #[error("failure threshold exceeded: {batch_failures} in batch, {total_failures} total")]
    PolicyViolation {
        batch_failures: u32,
        total_failures: u32,
    },

    #[error("invalid update spec: {0}")]
    InvalidSpec(String),

    /// The controller's loop exited before the command could be processed.
    #[error("controller for {0} has stopped")]
    ControllerStopped(JobUpdateKey),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type UpdateResult<T> = Result<T, UpdateError>;

impl UpdateError {
    /// Map a store error from a compare-and-swap write, singling out lost
    /// ownership.
    pub(crate) fn from_persist(key: &JobUpdateKey, err: StateError) -> Self {
        match err {
            StateError::VersionConflict { .. } => UpdateError::PersistenceConflict {
                key: key.clone(),
                source: err,
            },
            other => UpdateError::State(other),
        }
    }
}

//! Job update controller — batched rollouts with pulses and rollback.
//!
//! This crate moves the instances of a job from one configuration version
//! to another, a bounded batch at a time, gated on instance health. An
//! update can be paused, resumed, aborted, pulsed (one batch per operator
//! signal) or rolled back, and it survives process restarts through the
//! versioned records in `jobupdate-state`.
//!
//! # Components
//!
//! - **`machine`**: Update lifecycle transition table
//! - **`planner`**: Batch selection under the batch-size bound
//! - **`policy`**: Failure thresholds and the rollback decision
//! - **`tracker`**: Last-known instance observations from the scheduler
//! - **`controller`**: Per-update control loop (one tokio task each)
//! - **`registry`**: Command surface and controller ownership
//! - **`scheduler`**: Scheduler collaborator trait and a simulation

pub mod config;
pub mod controller;
pub mod error;
pub mod machine;
pub mod planner;
pub mod policy;
pub mod registry;
pub mod scheduler;
pub mod tracker;

pub use config::ControllerConfig;
pub use controller::{ControllerClient, ControllerContext, ControllerHandle, UpdateController};
pub use error::{UpdateError, UpdateResult};
pub use machine::{Command, Event, InternalEvent, Step};
pub use planner::Direction;
pub use policy::Verdict;
pub use registry::UpdateRegistry;
pub use scheduler::{
    ApplyOutcome, InstanceHealth, InstanceObservation, Scheduler, SchedulerUnavailable,
    SimulatedScheduler,
};
pub use tracker::InstanceStateTracker;

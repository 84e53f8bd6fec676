//! Scheduler collaborator — where instance changes are applied and observed.
//!
//! The controller never places or runs instances itself. It asks a
//! [`Scheduler`] to move an instance to a configuration version and reads
//! back [`InstanceObservation`]s. [`SimulatedScheduler`] is an in-process
//! implementation used by the daemon's simulation mode and by tests.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use jobupdate_state::InstanceIndex;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Health signal reported for an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceHealth {
    Healthy,
    Unhealthy,
    /// The instance's task terminated and will not become healthy.
    Failed,
    Unknown,
}

/// Last state the scheduler reported for one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceObservation {
    pub instance: InstanceIndex,
    pub config_version: String,
    pub health: InstanceHealth,
    /// Time since the instance's last state change, as of the observation.
    pub since_transition: Duration,
}

/// Scheduler verdict on an apply request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Accepted,
    Rejected(String),
}

/// Transient failure talking to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct SchedulerUnavailable(pub String);

/// The task scheduler as seen by the controller.
pub trait Scheduler: Send + Sync + 'static {
    /// Ask the scheduler to run `instance` of `job_id` at `config_version`.
    /// Repeating a request for the version an instance already targets is
    /// harmless.
    fn apply_instance_config<'a>(
        &'a self,
        job_id: &'a str,
        instance: InstanceIndex,
        config_version: &'a str,
    ) -> BoxFuture<'a, Result<ApplyOutcome, SchedulerUnavailable>>;

    /// Current observations for every instance of `job_id`.
    fn observe_instances<'a>(
        &'a self,
        job_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<InstanceObservation>, SchedulerUnavailable>>;
}

// ── Simulation ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct SimInstance {
    version: String,
    changed_at: Instant,
}

#[derive(Default)]
struct SimState {
    jobs: HashMap<String, Vec<SimInstance>>,
    /// (job, instance, version) combinations that fail once applied.
    failing: HashSet<(String, InstanceIndex, String)>,
    /// (job, instance) pairs whose applies are rejected.
    rejecting: HashSet<(String, InstanceIndex)>,
    /// Remaining calls answered with `SchedulerUnavailable`.
    outages: u32,
    apply_log: Vec<(String, InstanceIndex, String)>,
}

/// In-process scheduler. Instances become healthy `healthy_after` their
/// last apply unless marked failing for the applied version.
#[derive(Clone)]
pub struct SimulatedScheduler {
    inner: Arc<Mutex<SimState>>,
    healthy_after: Arc<Mutex<Duration>>,
}

impl SimulatedScheduler {
    pub fn new(healthy_after: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimState::default())),
            healthy_after: Arc::new(Mutex::new(healthy_after)),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SimState> {
        // The simulation holds no invariants a panicking holder could break.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn healthy_after(&self) -> Duration {
        *self.healthy_after.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a job with `count` instances running `version`.
    pub fn add_job(&self, job_id: &str, count: u32, version: &str) {
        let now = Instant::now();
        let instances = (0..count)
            .map(|_| SimInstance {
                version: version.to_string(),
                changed_at: now,
            })
            .collect();
        self.state().jobs.insert(job_id.to_string(), instances);
    }

    /// Make `instance` fail whenever it is moved to `version`.
    pub fn fail_on(&self, job_id: &str, instance: InstanceIndex, version: &str) {
        self.state()
            .failing
            .insert((job_id.to_string(), instance, version.to_string()));
    }

    /// Reject every apply request for `instance`.
    pub fn reject(&self, job_id: &str, instance: InstanceIndex) {
        self.state()
            .rejecting
            .insert((job_id.to_string(), instance));
    }

    /// Answer the next `calls` requests with `SchedulerUnavailable`.
    pub fn fail_next_calls(&self, calls: u32) {
        self.state().outages = calls;
    }

    pub fn set_healthy_after(&self, delay: Duration) {
        *self.healthy_after.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    /// Every accepted apply request, in order.
    pub fn applied(&self) -> Vec<(String, InstanceIndex, String)> {
        self.state().apply_log.clone()
    }

    /// Current version of every instance of `job_id`.
    pub fn versions(&self, job_id: &str) -> Vec<String> {
        self.state()
            .jobs
            .get(job_id)
            .map(|instances| instances.iter().map(|i| i.version.clone()).collect())
            .unwrap_or_default()
    }

    fn take_outage(state: &mut SimState) -> Result<(), SchedulerUnavailable> {
        if state.outages > 0 {
            state.outages -= 1;
            return Err(SchedulerUnavailable("simulated outage".to_string()));
        }
        Ok(())
    }
}

impl Scheduler for SimulatedScheduler {
    fn apply_instance_config<'a>(
        &'a self,
        job_id: &'a str,
        instance: InstanceIndex,
        config_version: &'a str,
    ) -> BoxFuture<'a, Result<ApplyOutcome, SchedulerUnavailable>> {
        Box::pin(async move {
            let mut state = self.state();
            Self::take_outage(&mut state)?;
            if state.rejecting.contains(&(job_id.to_string(), instance)) {
                return Ok(ApplyOutcome::Rejected(format!(
                    "instance {instance} rejected by policy"
                )));
            }
            let Some(slot) = state
                .jobs
                .get_mut(job_id)
                .and_then(|instances| instances.get_mut(instance as usize))
            else {
                return Ok(ApplyOutcome::Rejected(format!(
                    "unknown instance {job_id}/{instance}"
                )));
            };
            slot.version = config_version.to_string();
            slot.changed_at = Instant::now();
            state
                .apply_log
                .push((job_id.to_string(), instance, config_version.to_string()));
            debug!(job = %job_id, instance, version = %config_version, "simulated apply");
            Ok(ApplyOutcome::Accepted)
        })
    }

    fn observe_instances<'a>(
        &'a self,
        job_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<InstanceObservation>, SchedulerUnavailable>> {
        Box::pin(async move {
            let healthy_after = self.healthy_after();
            let mut state = self.state();
            Self::take_outage(&mut state)?;
            let now = Instant::now();
            let Some(instances) = state.jobs.get(job_id) else {
                return Ok(Vec::new());
            };
            let observations = instances
                .iter()
                .enumerate()
                .map(|(i, inst)| {
                    let index = i as InstanceIndex;
                    let age = now.duration_since(inst.changed_at);
                    let failing = state.failing.contains(&(
                        job_id.to_string(),
                        index,
                        inst.version.clone(),
                    ));
                    let (health, since_transition) = if failing {
                        (InstanceHealth::Failed, age)
                    } else if age >= healthy_after {
                        (InstanceHealth::Healthy, age - healthy_after)
                    } else {
                        (InstanceHealth::Unknown, age)
                    };
                    InstanceObservation {
                        instance: index,
                        config_version: inst.version.clone(),
                        health,
                        since_transition,
                    }
                })
                .collect();
            Ok(observations)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn apply_moves_instance_and_logs() {
        let sched = SimulatedScheduler::new(Duration::ZERO);
        sched.add_job("job", 2, "v1");

        let outcome = sched.apply_instance_config("job", 1, "v2").await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Accepted);
        assert_eq!(sched.versions("job"), vec!["v1", "v2"]);
        assert_eq!(sched.applied().len(), 1);
    }

    #[tokio::test]
    async fn unknown_instance_is_rejected() {
        let sched = SimulatedScheduler::new(Duration::ZERO);
        sched.add_job("job", 1, "v1");
        let outcome = sched.apply_instance_config("job", 5, "v2").await.unwrap();
        assert!(matches!(outcome, ApplyOutcome::Rejected(_)));
    }

    #[tokio::test]
    async fn failing_version_reports_failed_health() {
        let sched = SimulatedScheduler::new(Duration::ZERO);
        sched.add_job("job", 2, "v1");
        sched.fail_on("job", 0, "v2");
        sched.apply_instance_config("job", 0, "v2").await.unwrap();

        let obs = sched.observe_instances("job").await.unwrap();
        assert_eq!(obs[0].health, InstanceHealth::Failed);
        assert_eq!(obs[1].health, InstanceHealth::Healthy);
    }

    #[tokio::test]
    async fn instances_are_unknown_until_healthy_delay() {
        let sched = SimulatedScheduler::new(Duration::from_secs(3600));
        sched.add_job("job", 1, "v1");
        let obs = sched.observe_instances("job").await.unwrap();
        assert_eq!(obs[0].health, InstanceHealth::Unknown);

        sched.set_healthy_after(Duration::ZERO);
        let obs = sched.observe_instances("job").await.unwrap();
        assert_eq!(obs[0].health, InstanceHealth::Healthy);
    }

    #[tokio::test]
    async fn outages_are_consumed() {
        let sched = SimulatedScheduler::new(Duration::ZERO);
        sched.add_job("job", 1, "v1");
        sched.fail_next_calls(1);
        assert!(sched.observe_instances("job").await.is_err());
        assert!(sched.observe_instances("job").await.is_ok());
    }

    #[tokio::test]
    async fn outage_converts_into_std_error() {
        let sched = SimulatedScheduler::new(Duration::ZERO);
        sched.add_job("job", 1, "v1");
        sched.fail_next_calls(1);
        let err = sched.apply_instance_config("job", 0, "v2").await.unwrap_err();

        let boxed: Box<dyn std::error::Error + Send + Sync> = Box::new(err.clone());
        assert_eq!(boxed.to_string(), "simulated outage");
        let wrapped = anyhow::Error::from(err);
        assert!(wrapped.downcast_ref::<SchedulerUnavailable>().is_some());
    }
}

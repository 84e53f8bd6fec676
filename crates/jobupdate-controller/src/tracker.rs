//! Instance state tracker — last-known observations for one job.
//!
//! A poller task refreshes observations from the [`Scheduler`] on a fixed
//! interval and wakes the controller when an instance's version or health
//! changes. Reads are bounded by a staleness window: an observation older
//! than the window is treated as absent.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use jobupdate_state::InstanceIndex;
use tokio::sync::{Notify, watch};
use tracing::{debug, warn};

use crate::scheduler::{InstanceObservation, Scheduler};

/// An observation stamped with the time it was received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedObservation {
    pub observation: InstanceObservation,
    pub observed_at: Instant,
}

impl TrackedObservation {
    /// Time since the instance's last transition, extrapolated to `now`.
    pub fn since_transition(&self, now: Instant) -> Duration {
        self.observation.since_transition + now.saturating_duration_since(self.observed_at)
    }
}

/// Observed state of every instance of one job.
pub struct InstanceStateTracker {
    job_id: String,
    observations: RwLock<HashMap<InstanceIndex, TrackedObservation>>,
    changed: Notify,
}

impl InstanceStateTracker {
    pub fn new(job_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            observations: RwLock::new(HashMap::new()),
            changed: Notify::new(),
        }
    }

    /// Record a batch of observations received at `observed_at`. Wakes
    /// waiters if any instance's version or health differs from before.
    pub fn record(&self, observations: Vec<InstanceObservation>, observed_at: Instant) {
        let mut changed = false;
        {
            let mut map = self.observations.write().unwrap_or_else(|e| e.into_inner());
            for observation in observations {
                let previous = map.get(&observation.instance);
                if previous.is_none_or(|p| {
                    p.observation.config_version != observation.config_version
                        || p.observation.health != observation.health
                }) {
                    changed = true;
                }
                map.insert(
                    observation.instance,
                    TrackedObservation {
                        observation,
                        observed_at,
                    },
                );
            }
        }
        if changed {
            self.changed.notify_one();
        }
    }

    /// The latest observation of `instance`, if received within `max_staleness`.
    pub fn get(
        &self,
        instance: InstanceIndex,
        max_staleness: Duration,
        now: Instant,
    ) -> Option<TrackedObservation> {
        let map = self.observations.read().unwrap_or_else(|e| e.into_inner());
        map.get(&instance)
            .filter(|o| now.saturating_duration_since(o.observed_at) <= max_staleness)
            .cloned()
    }

    /// Wait until an observed version or health changes.
    pub async fn changed(&self) {
        self.changed.notified().await
    }

    /// Poll `scheduler` every `interval` until `shutdown` fires. Poll
    /// failures and polls that outlast `call_timeout` are logged; the
    /// previous observations age out through the staleness window.
    pub async fn run_poller(
        self: Arc<Self>,
        scheduler: Arc<dyn Scheduler>,
        interval: Duration,
        call_timeout: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        debug!(job = %self.job_id, ?interval, "instance poller starting");
        loop {
            let poll = tokio::time::timeout(call_timeout, scheduler.observe_instances(&self.job_id));
            let polled = tokio::select! {
                polled = poll => polled,
                _ = shutdown.changed() => break,
            };
            match polled {
                Ok(Ok(observations)) => self.record(observations, Instant::now()),
                Ok(Err(e)) => warn!(job = %self.job_id, error = %e, "instance observation failed"),
                Err(_) => warn!(job = %self.job_id, ?call_timeout, "instance observation timed out"),
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => break,
            }
        }
        debug!(job = %self.job_id, "instance poller shutting down");
    }
}

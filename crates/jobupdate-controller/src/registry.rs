//! Update registry — the table of controllers owned by one process.
//!
//! The registry is the command surface: it enforces at most one active
//! update per job, routes operator commands to the owning controller, and
//! answers status queries from controller snapshots or the store.
//!
//! Handles of finished controllers are released on the next command or
//! start; their records stay readable from the store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use jobupdate_state::*;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ControllerConfig;
use crate::controller::{ControllerClient, ControllerContext, ControllerHandle, UpdateController, settle_stopped};
use crate::error::{UpdateError, UpdateResult};
use crate::machine::Command;
use crate::scheduler::Scheduler;

pub struct UpdateRegistry {
    ctx: ControllerContext,
    controllers: Arc<RwLock<HashMap<JobUpdateKey, ControllerHandle>>>,
    /// One start at a time per job; entries live only while held.
    start_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl UpdateRegistry {
    pub fn new(
        store: Arc<dyn UpdateStore>,
        scheduler: Arc<dyn Scheduler>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            ctx: ControllerContext {
                store,
                scheduler,
                config,
            },
            controllers: Arc::new(RwLock::new(HashMap::new())),
            start_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Load every persisted update and restart controllers for the ones
    /// that have not finished. Returns the number of controllers started.
    pub async fn recover(&self) -> UpdateResult<usize> {
        let mut controllers = self.controllers.write().await;
        let entries = self.ctx.store.load_all("")?;
        let mut recovered = 0;
        for entry in entries {
            let key = entry.value.key.clone();
            if entry.value.status.state.is_terminal() || controllers.contains_key(&key) {
                continue;
            }
            let handle = UpdateController::resume(entry, self.ctx.clone());
            controllers.insert(key, handle);
            recovered += 1;
        }
        info!(recovered, "update registry recovered");
        Ok(recovered)
    }

    /// Start a new update of `job_id`. With `supersede`, an active update
    /// of the same job is aborted first; otherwise it is a conflict.
    pub async fn start_update(
        &self,
        job_id: &str,
        spec: UpdateSpec,
        supersede: bool,
    ) -> UpdateResult<JobUpdateKey> {
        validate_spec(job_id, &spec)?;

        // Serializes the active check and the insert for this job only;
        // the controller table itself is never locked across an await.
        let start_lock = self.start_lock(job_id);
        let _starting = start_lock.lock().await;
        self.reap_finished().await;

        if let Some(active) = self.active_update(job_id).await? {
            if !supersede {
                return Err(UpdateError::Conflict {
                    job_id: job_id.to_string(),
                    active,
                });
            }
            info!(job = %job_id, superseded = %active, "aborting superseded update");
            self.command(
                &active,
                Command::Abort {
                    reason: "superseded by a new update".to_string(),
                },
            )
            .await?;
        }

        let key = JobUpdateKey::new(job_id, &Uuid::new_v4().to_string());
        let handle = UpdateController::create(key.clone(), spec, self.ctx.clone())?;
        self.controllers.write().await.insert(key.clone(), handle);
        Ok(key)
    }

    fn start_lock(&self, job_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.start_locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(job_id.to_string()).or_default().clone()
    }

    /// The non-terminal update of `job_id`, if any. Live snapshots take
    /// precedence over stored records.
    async fn active_update(&self, job_id: &str) -> UpdateResult<Option<JobUpdateKey>> {
        let entries = self.ctx.store.load_all(&JobUpdateKey::job_prefix(job_id))?;
        let controllers = self.controllers.read().await;
        for entry in entries {
            let key = entry.value.key;
            if key.job_id != job_id {
                continue;
            }
            let state = match controllers.get(&key) {
                Some(handle) => handle.client().state(),
                None => entry.value.status.state,
            };
            if !state.is_terminal() {
                return Ok(Some(key));
            }
        }
        Ok(None)
    }

    pub async fn pause_update(&self, key: &JobUpdateKey, reason: &str) -> UpdateResult<UpdateState> {
        self.command(
            key,
            Command::Pause {
                reason: reason.to_string(),
            },
        )
        .await
    }

    pub async fn resume_update(&self, key: &JobUpdateKey, reason: &str) -> UpdateResult<UpdateState> {
        self.command(
            key,
            Command::Resume {
                reason: reason.to_string(),
            },
        )
        .await
    }

    /// Abort the update. Aborting a finished update succeeds without
    /// changing it.
    pub async fn abort_update(&self, key: &JobUpdateKey, reason: &str) -> UpdateResult<UpdateState> {
        self.command(
            key,
            Command::Abort {
                reason: reason.to_string(),
            },
        )
        .await
    }

    /// Grant one batch to a pulsed update. A pulse that arrives when the
    /// update is not waiting for one is accepted and has no effect.
    pub async fn pulse_update(&self, key: &JobUpdateKey) -> UpdateResult<UpdateState> {
        match self.command(key, Command::Pulse).await {
            Err(UpdateError::InvalidState { state, .. }) => {
                debug!(update = %key, %state, "pulse ignored");
                Ok(state)
            }
            other => other,
        }
    }

    /// Stop rolling forward and revert the instances already touched.
    pub async fn rollback_update(&self, key: &JobUpdateKey, reason: &str) -> UpdateResult<UpdateState> {
        self.command(
            key,
            Command::Rollback {
                reason: reason.to_string(),
            },
        )
        .await
    }

    async fn command(&self, key: &JobUpdateKey, command: Command) -> UpdateResult<UpdateState> {
        self.reap_finished().await;
        if let Some(client) = self.client(key).await {
            return client.send(command).await;
        }
        let entry = self
            .ctx
            .store
            .load(key)?
            .ok_or_else(|| UpdateError::NotFound(key.clone()))?;
        match command {
            Command::Abort { reason } if !entry.value.status.state.is_terminal() => {
                self.abort_stored(entry, reason)
            }
            command => settle_stopped(&entry.value, &command),
        }
    }

    /// Abort an unfinished update that has no running controller by
    /// writing the terminal state straight to the store.
    fn abort_stored(&self, entry: Versioned<JobUpdate>, reason: String) -> UpdateResult<UpdateState> {
        let mut record = entry.value;
        let from = record.status.state;
        record
            .status
            .record_transition(UpdateState::Aborted, Some(reason), epoch_millis());
        self.ctx
            .store
            .compare_and_swap(&record, Some(entry.version))
            .map_err(|e| UpdateError::from_persist(&record.key, e))?;
        info!(update = %record.key, %from, "aborted update with no running controller");
        Ok(UpdateState::Aborted)
    }

    async fn client(&self, key: &JobUpdateKey) -> Option<ControllerClient> {
        self.controllers
            .read()
            .await
            .get(key)
            .map(|handle| handle.client().clone())
    }

    /// Snapshot of one update.
    pub async fn get_update_status(&self, key: &JobUpdateKey) -> UpdateResult<JobUpdate> {
        if let Some(client) = self.client(key).await {
            return Ok(client.snapshot());
        }
        self.ctx
            .store
            .load(key)?
            .map(|entry| entry.value)
            .ok_or_else(|| UpdateError::NotFound(key.clone()))
    }

    /// Live and historical updates, oldest first, optionally for one job.
    pub async fn list_updates(&self, job_id: Option<&str>) -> UpdateResult<Vec<JobUpdate>> {
        let prefix = job_id.map(JobUpdateKey::job_prefix).unwrap_or_default();
        let controllers = self.controllers.read().await;
        let mut updates: Vec<JobUpdate> = self
            .ctx
            .store
            .load_all(&prefix)?
            .into_iter()
            .filter(|entry| job_id.is_none_or(|job| entry.value.key.job_id == job))
            .map(|entry| match controllers.get(&entry.value.key) {
                Some(handle) => handle.client().snapshot(),
                None => entry.value,
            })
            .collect();
        updates.sort_by(|a, b| {
            a.status
                .created_at_ms
                .cmp(&b.status.created_at_ms)
                .then_with(|| a.key.cmp(&b.key))
        });
        Ok(updates)
    }

    /// True when no controller loop is still running.
    pub async fn is_idle(&self) -> bool {
        self.controllers
            .read()
            .await
            .values()
            .all(ControllerHandle::is_finished)
    }

    /// Release the handles of controllers whose loop has exited. A
    /// controller halted in `ERROR` is kept so its in-memory state stays
    /// visible. Returns the number released.
    pub async fn reap_finished(&self) -> usize {
        let finished: Vec<ControllerHandle> = {
            let mut controllers = self.controllers.write().await;
            let keys: Vec<JobUpdateKey> = controllers
                .iter()
                .filter(|(_, handle)| {
                    handle.is_finished() && handle.client().state() != UpdateState::Error
                })
                .map(|(key, _)| key.clone())
                .collect();
            keys.iter().filter_map(|key| controllers.remove(key)).collect()
        };
        let count = finished.len();
        for handle in finished {
            handle.stop().await;
        }
        if count > 0 {
            debug!(released = count, "finished controllers released");
        }
        count
    }

    /// Controller handles currently held, running or finished.
    pub async fn controller_count(&self) -> usize {
        self.controllers.read().await.len()
    }

    /// Stop every controller and wait for its loop to exit.
    pub async fn shutdown(&self) {
        let handles: Vec<ControllerHandle> = self
            .controllers
            .write()
            .await
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        let count = handles.len();
        for handle in handles {
            handle.stop().await;
        }
        info!(controllers = count, "update registry shut down");
    }
}

fn validate_spec(job_id: &str, spec: &UpdateSpec) -> UpdateResult<()> {
    let problem = if job_id.is_empty() {
        "job id is empty"
    } else if spec.batch_size == 0 {
        "batch_size must be at least 1"
    } else if spec.desired_version.is_empty() {
        "desired_version is empty"
    } else if spec.previous_version.is_empty() {
        "previous_version is empty"
    } else {
        return Ok(());
    };
    warn!(job = %job_id, problem, "rejecting update spec");
    Err(UpdateError::InvalidSpec(problem.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> UpdateSpec {
        UpdateSpec {
            instance_count: 2,
            desired_version: "v2".to_string(),
            previous_version: "v1".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn spec_validation() {
        assert!(validate_spec("job", &spec()).is_ok());
        assert!(matches!(
            validate_spec("", &spec()),
            Err(UpdateError::InvalidSpec(_))
        ));

        let mut zero_batch = spec();
        zero_batch.batch_size = 0;
        assert!(validate_spec("job", &zero_batch).is_err());

        let mut no_version = spec();
        no_version.desired_version.clear();
        assert!(validate_spec("job", &no_version).is_err());
    }

    #[tokio::test]
    async fn start_locks_are_dropped_after_use() {
        let store = StateStore::open_in_memory().unwrap();
        let sched = crate::scheduler::SimulatedScheduler::new(std::time::Duration::ZERO);
        sched.add_job("job", 2, "v1");
        let registry = UpdateRegistry::new(
            Arc::new(store),
            Arc::new(sched),
            ControllerConfig::default(),
        );

        registry.start_update("job", spec(), false).await.unwrap();
        assert!(matches!(
            registry.start_update("job", spec(), false).await,
            Err(UpdateError::Conflict { .. })
        ));

        // The next lookup prunes every unheld entry.
        drop(registry.start_lock("other"));
        let held = registry.start_lock("job");
        {
            let locks = registry.start_locks.lock().unwrap();
            assert_eq!(locks.len(), 1);
            assert!(locks.contains_key("job"));
        }
        drop(held);
        registry.shutdown().await;
    }
}

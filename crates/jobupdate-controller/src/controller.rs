//! Update controller — drives one job update to a terminal state.
//!
//! Each controller owns a single tokio task. Operator commands arrive on an
//! mpsc queue and are handled one at a time by that task, so the update's
//! status has exactly one writer. On every wake (command, observation
//! change, or tick) the controller reconciles in-flight instances, applies
//! the rollback policy when a batch resolves, and issues the next batch.
//!
//! Every mutation is committed to the store with compare-and-swap before
//! the in-memory record and the published snapshot change, and before the
//! command's caller is answered.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use jobupdate_state::*;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ControllerConfig;
use crate::error::{UpdateError, UpdateResult};
use crate::machine::{self, Command, Event, InternalEvent, Step};
use crate::planner::{self, Direction};
use crate::policy::{self, Verdict};
use crate::scheduler::{ApplyOutcome, InstanceHealth, Scheduler, SchedulerUnavailable};
use crate::tracker::InstanceStateTracker;

/// Collaborators shared by every controller of a registry.
#[derive(Clone)]
pub struct ControllerContext {
    pub store: Arc<dyn UpdateStore>,
    pub scheduler: Arc<dyn Scheduler>,
    pub config: ControllerConfig,
}

struct CommandRequest {
    command: Command,
    reply: oneshot::Sender<UpdateResult<UpdateState>>,
}

/// Cloneable command and status access to one controller.
#[derive(Clone)]
pub struct ControllerClient {
    key: JobUpdateKey,
    commands: mpsc::Sender<CommandRequest>,
    snapshot: Arc<RwLock<JobUpdate>>,
}

impl ControllerClient {
    pub fn key(&self) -> &JobUpdateKey {
        &self.key
    }

    /// Point-in-time copy of the last committed record.
    pub fn snapshot(&self) -> JobUpdate {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn state(&self) -> UpdateState {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .status
            .state
    }

    /// Queue `command` and wait for the loop to commit or reject it.
    pub async fn send(&self, command: Command) -> UpdateResult<UpdateState> {
        let (reply, response) = oneshot::channel();
        let request = CommandRequest {
            command: command.clone(),
            reply,
        };
        if self.commands.send(request).await.is_err() {
            return settle_stopped(&self.snapshot(), &command);
        }
        match response.await {
            Ok(result) => result,
            // The loop exited with the request still queued.
            Err(_) => settle_stopped(&self.snapshot(), &command),
        }
    }
}

/// Owning handle to a running controller; stopping it consumes the handle.
pub struct ControllerHandle {
    client: ControllerClient,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ControllerHandle {
    pub fn client(&self) -> &ControllerClient {
        &self.client
    }

    /// The control loop has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the loop and wait for it to exit. Committed state is already
    /// in the store.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!(update = %self.client.key, error = %e, "controller task failed");
        }
    }
}

/// Answer a command for an update whose loop is no longer running.
pub(crate) fn settle_stopped(record: &JobUpdate, command: &Command) -> UpdateResult<UpdateState> {
    let state = record.status.state;
    if !state.is_terminal() {
        return Err(UpdateError::ControllerStopped(record.key.clone()));
    }
    match machine::transition(state, &Event::Command(command.clone())) {
        Ok(_) => Ok(state),
        Err(rejected) => Err(UpdateError::InvalidState {
            key: record.key.clone(),
            state: rejected.state,
            command: rejected.event,
        }),
    }
}

/// Doubling retry delay for scheduler outages.
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Option<Duration>,
    retry_at: Option<Instant>,
}

impl Backoff {
    fn new(config: &ControllerConfig) -> Self {
        Self {
            initial: config.scheduler_backoff_initial(),
            max: config.scheduler_backoff_max(),
            current: None,
            retry_at: None,
        }
    }

    fn ready(&self, now: Instant) -> bool {
        self.retry_at.is_none_or(|at| now >= at)
    }

    fn fail(&mut self, now: Instant) -> Duration {
        let delay = self
            .current
            .map(|d| (d * 2).min(self.max))
            .unwrap_or(self.initial);
        self.current = Some(delay);
        self.retry_at = Some(now + delay);
        delay
    }

    fn reset(&mut self) {
        self.current = None;
        self.retry_at = None;
    }
}

enum Wake {
    Command(Option<CommandRequest>),
    Observed,
    Tick,
    Shutdown,
}

/// What ended the wait on an outstanding scheduler call.
enum Serving<T> {
    Done(T),
    Command(Option<CommandRequest>),
    Shutdown,
}

/// A scheduler call abandoned before it answered.
enum Interrupt {
    /// A command that moves the update to another state.
    Command(CommandRequest),
    Shutdown,
}

/// Sending halves of a controller's command queue and shutdown signal.
struct Endpoints {
    commands: mpsc::Sender<CommandRequest>,
    shutdown: watch::Sender<bool>,
}

/// One apply request, bounded by `timeout`. An unanswered call is treated
/// like an outage.
async fn apply_with_timeout(
    scheduler: Arc<dyn Scheduler>,
    job_id: String,
    instance: InstanceIndex,
    target: String,
    timeout: Duration,
) -> Result<ApplyOutcome, SchedulerUnavailable> {
    let call = scheduler.apply_instance_config(&job_id, instance, &target);
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(SchedulerUnavailable(format!(
            "apply to instance {instance} timed out after {timeout:?}"
        ))),
    }
}

/// The control loop for one job update.
pub struct UpdateController {
    record: JobUpdate,
    version: u64,
    ctx: ControllerContext,
    tracker: Arc<InstanceStateTracker>,
    snapshot: Arc<RwLock<JobUpdate>>,
    /// When the outstanding command for each in-flight instance was sent.
    issued_at: HashMap<InstanceIndex, Instant>,
    /// In-flight instances whose command must be re-sent after recovery.
    reissue: Vec<InstanceIndex>,
    backoff: Backoff,
    queue: mpsc::Receiver<CommandRequest>,
    shutdown: watch::Receiver<bool>,
    /// Shutdown arrived while a scheduler call was outstanding.
    stopping: bool,
}

impl UpdateController {
    fn new(record: JobUpdate, version: u64, ctx: ControllerContext) -> (Self, Endpoints) {
        let tracker = Arc::new(InstanceStateTracker::new(&record.key.job_id));
        let backoff = Backoff::new(&ctx.config);
        let (commands, queue) = mpsc::channel(ctx.config.command_queue_depth.max(1));
        let (stop, shutdown) = watch::channel(false);
        let controller = Self {
            snapshot: Arc::new(RwLock::new(record.clone())),
            record,
            version,
            ctx,
            tracker,
            issued_at: HashMap::new(),
            reissue: Vec::new(),
            backoff,
            queue,
            shutdown,
            stopping: false,
        };
        let endpoints = Endpoints {
            commands,
            shutdown: stop,
        };
        (controller, endpoints)
    }

    /// Persist a new update, leave `INITIALIZED` and start its loop.
    pub fn create(
        key: JobUpdateKey,
        spec: UpdateSpec,
        ctx: ControllerContext,
    ) -> UpdateResult<ControllerHandle> {
        let record = JobUpdate {
            status: UpdateStatus::new(spec.instance_count, epoch_millis()),
            key,
            spec,
        };
        let version = ctx
            .store
            .compare_and_swap(&record, None)
            .map_err(|e| UpdateError::from_persist(&record.key, e))?;

        let pulsed = record.spec.pulsed;
        let (mut controller, endpoints) = Self::new(record, version, ctx);
        controller.apply_internal(InternalEvent::Initialized { pulsed }, None)?;
        info!(
            update = %controller.record.key,
            state = %controller.record.status.state,
            instances = controller.record.spec.instance_count,
            batch_size = controller.record.spec.batch_size,
            "update started"
        );
        Ok(controller.spawn(endpoints))
    }

    /// Rebuild a controller from a persisted record and continue where the
    /// last owner stopped. Nothing is replayed: in-flight instances are
    /// re-sent their current command and tracked afresh.
    pub fn resume(entry: Versioned<JobUpdate>, ctx: ControllerContext) -> ControllerHandle {
        let (mut controller, endpoints) = Self::new(entry.value, entry.version, ctx);
        let key = controller.record.key.clone();

        if let Err(problem) = check_consistency(&controller.record) {
            error!(update = %key, %problem, "persisted update is inconsistent");
            if let Err(e) =
                controller.apply_internal(InternalEvent::Inconsistency, Some(problem.clone()))
            {
                warn!(update = %key, error = %e, "could not persist ERROR state");
                if !controller.is_finished() {
                    controller.halt(problem);
                }
            }
        } else if controller.record.status.state == UpdateState::Initialized {
            let pulsed = controller.record.spec.pulsed;
            if let Err(e) = controller.apply_internal(InternalEvent::Initialized { pulsed }, None) {
                warn!(update = %key, error = %e, "could not leave INITIALIZED; will retry");
            }
        } else {
            let now = Instant::now();
            for (index, progress) in controller.record.status.instances.iter().enumerate() {
                if progress.is_in_flight() {
                    let index = index as InstanceIndex;
                    controller.reissue.push(index);
                    controller.issued_at.insert(index, now);
                }
            }
        }

        info!(
            update = %key,
            state = %controller.record.status.state,
            version = controller.version,
            in_flight = controller.reissue.len(),
            "update recovered"
        );
        controller.spawn(endpoints)
    }

    fn spawn(self, endpoints: Endpoints) -> ControllerHandle {
        let key = self.record.key.clone();
        let snapshot = self.snapshot.clone();
        let task = tokio::spawn(self.run());
        ControllerHandle {
            client: ControllerClient {
                key,
                commands: endpoints.commands,
                snapshot,
            },
            shutdown: endpoints.shutdown,
            task,
        }
    }

    async fn run(mut self) {
        let tracker = self.tracker.clone();
        let poller = tokio::spawn(tracker.clone().run_poller(
            self.ctx.scheduler.clone(),
            self.ctx.config.observation_poll_interval(),
            self.ctx.config.scheduler_call_timeout(),
            self.shutdown.clone(),
        ));
        let tick = self.ctx.config.tick_interval();

        loop {
            if self.is_finished() || self.stopping {
                break;
            }
            self.step().await;
            if self.is_finished() || self.stopping {
                break;
            }

            let wake = tokio::select! {
                request = self.queue.recv() => Wake::Command(request),
                _ = tracker.changed() => Wake::Observed,
                _ = tokio::time::sleep(tick) => Wake::Tick,
                _ = self.shutdown.changed() => Wake::Shutdown,
            };
            match wake {
                Wake::Command(Some(request)) => self.handle_command(request),
                Wake::Command(None) | Wake::Shutdown => break,
                Wake::Observed | Wake::Tick => {}
            }
            // Commands take priority over instance progress.
            while !self.is_finished() {
                match self.queue.try_recv() {
                    Ok(request) => self.handle_command(request),
                    Err(_) => break,
                }
            }
        }

        poller.abort();
        debug!(
            update = %self.record.key,
            state = %self.record.status.state,
            "control loop exited"
        );
    }

    /// Wait for a scheduler call while still answering the command queue.
    /// Commands that leave the state alone are answered in place; one that
    /// changes it, or shutdown, abandons the call.
    async fn await_serving<T>(&mut self, call: impl Future<Output = T>) -> Result<T, Interrupt> {
        tokio::pin!(call);
        loop {
            let serving = tokio::select! {
                biased;
                result = &mut call => Serving::Done(result),
                request = self.queue.recv() => Serving::Command(request),
                _ = self.shutdown.changed() => Serving::Shutdown,
            };
            match serving {
                Serving::Done(result) => return Ok(result),
                Serving::Command(Some(request)) => {
                    if self.changes_state(&request.command) {
                        return Err(Interrupt::Command(request));
                    }
                    self.handle_command(request);
                }
                Serving::Command(None) | Serving::Shutdown => return Err(Interrupt::Shutdown),
            }
        }
    }

    fn changes_state(&self, command: &Command) -> bool {
        let event = Event::Command(command.clone());
        matches!(
            machine::transition(self.record.status.state, &event),
            Ok(Step::To(_))
        )
    }

    fn interrupted(&mut self, interrupt: Interrupt) {
        match interrupt {
            Interrupt::Command(request) => self.handle_command(request),
            Interrupt::Shutdown => {
                debug!(update = %self.record.key, "shutdown during scheduler call");
                self.stopping = true;
            }
        }
    }

    fn is_finished(&self) -> bool {
        self.record.status.state.is_terminal()
    }

    // ── Transitions ────────────────────────────────────────────────

    /// Write `next` with compare-and-swap, then adopt and publish it.
    fn commit(&mut self, next: JobUpdate) -> UpdateResult<()> {
        match self.ctx.store.compare_and_swap(&next, Some(self.version)) {
            Ok(version) => {
                self.version = version;
                self.record = next;
                self.publish();
                Ok(())
            }
            Err(e) => {
                let err = UpdateError::from_persist(&self.record.key, e);
                if matches!(err, UpdateError::PersistenceConflict { .. }) {
                    error!(update = %self.record.key, error = %err, "halting controller");
                    self.halt(err.to_string());
                }
                Err(err)
            }
        }
    }

    /// Enter `ERROR` without persisting; used when the store can no longer
    /// be written by this controller.
    fn halt(&mut self, message: String) {
        self.record
            .status
            .record_transition(UpdateState::Error, Some(message), epoch_millis());
        self.publish();
    }

    fn publish(&self) {
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = self.record.clone();
    }

    fn handle_command(&mut self, request: CommandRequest) {
        let result = self.apply_command(request.command);
        // The caller may have given up waiting.
        let _ = request.reply.send(result);
    }

    fn apply_command(&mut self, command: Command) -> UpdateResult<UpdateState> {
        let current = self.record.status.state;
        let event = Event::Command(command.clone());
        let next_state = match machine::transition(current, &event) {
            Ok(Step::To(next)) => next,
            Ok(Step::Unchanged) => return Ok(current),
            Err(rejected) => {
                debug!(update = %self.record.key, state = %current, command = rejected.event, "command rejected");
                return Err(UpdateError::InvalidState {
                    key: self.record.key.clone(),
                    state: rejected.state,
                    command: rejected.event,
                });
            }
        };

        let mut next = self.record.clone();
        if command == Command::Pulse {
            next.status.pulse_credits += 1;
        }
        self.prepare(&mut next, next_state);
        next.status.record_transition(
            next_state,
            command.reason().map(str::to_string),
            epoch_millis(),
        );
        self.commit(next)?;
        info!(
            update = %self.record.key,
            command = command.name(),
            from = %current,
            to = %next_state,
            "command applied"
        );
        Ok(next_state)
    }

    fn apply_internal(
        &mut self,
        event: InternalEvent,
        message: Option<String>,
    ) -> UpdateResult<UpdateState> {
        let current = self.record.status.state;
        let next_state = match machine::transition(current, &Event::Internal(event.clone())) {
            Ok(Step::To(next)) => next,
            Ok(Step::Unchanged) => return Ok(current),
            Err(rejected) => {
                return Err(UpdateError::InvalidState {
                    key: self.record.key.clone(),
                    state: rejected.state,
                    command: rejected.event,
                });
            }
        };

        let mut next = self.record.clone();
        self.prepare(&mut next, next_state);
        next.status
            .record_transition(next_state, message, epoch_millis());
        self.commit(next)?;
        info!(
            update = %self.record.key,
            event = event.name(),
            from = %current,
            to = %next_state,
            "update transitioned"
        );
        Ok(next_state)
    }

    /// Side effects that accompany entering `next_state`.
    fn prepare(&mut self, next: &mut JobUpdate, next_state: UpdateState) {
        let entering_rollback =
            next_state == UpdateState::RollingBack && !self.record.status.state.is_backward();
        if entering_rollback {
            // Abandon the forward batch; whatever it touched gets reverted.
            for progress in next.status.instances.iter_mut() {
                if *progress == InstanceProgress::Updating {
                    *progress = InstanceProgress::Updated;
                }
            }
            next.status.current_batch.clear();
            next.status.batch_failures = 0;
            next.status.pulse_credits = 0;
            self.issued_at.clear();
            self.reissue.clear();
            self.backoff.reset();
        }
    }

    // ── Control loop body ──────────────────────────────────────────

    async fn step(&mut self) {
        let state = self.record.status.state;
        if state == UpdateState::Initialized {
            let pulsed = self.record.spec.pulsed;
            if let Err(e) = self.apply_internal(InternalEvent::Initialized { pulsed }, None) {
                warn!(update = %self.record.key, error = %e, "failed to leave INITIALIZED");
            }
            return;
        }
        if !state.is_rolling() {
            return;
        }
        let direction = if state == UpdateState::RollingBack {
            Direction::Backward
        } else {
            Direction::Forward
        };

        if !self.reissue.is_empty() && !self.reissue_in_flight(direction).await {
            return;
        }

        if let Err(e) = self.reconcile(direction) {
            warn!(update = %self.record.key, error = %e, "failed to record instance progress");
            return;
        }

        match self.resolve_batch(direction) {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                warn!(update = %self.record.key, error = %e, "failed to resolve batch");
                return;
            }
        }
        if !self.record.status.state.is_rolling() {
            return;
        }

        if planner::is_complete(&self.record.status.instances, direction) {
            let event = match direction {
                Direction::Forward => InternalEvent::AllInstancesUpdated,
                Direction::Backward => InternalEvent::AllInstancesReverted,
            };
            if let Err(e) = self.apply_internal(event, None) {
                warn!(update = %self.record.key, error = %e, "failed to complete update");
            }
            return;
        }

        if let Err(e) = self.issue_next_batch(direction).await {
            warn!(update = %self.record.key, error = %e, "failed to issue batch");
        }
    }

    fn target_version(&self, direction: Direction) -> &str {
        match direction {
            Direction::Forward => &self.record.spec.desired_version,
            Direction::Backward => &self.record.spec.previous_version,
        }
    }

    /// Re-send commands for instances that were in flight when the record
    /// was loaded. Returns false while the scheduler is unavailable or when
    /// a command or shutdown cut the re-send short.
    async fn reissue_in_flight(&mut self, direction: Direction) -> bool {
        let now = Instant::now();
        if !self.backoff.ready(now) {
            return false;
        }
        let target = self.target_version(direction).to_string();
        let job_id = self.record.key.job_id.clone();
        let timeout = self.ctx.config.scheduler_call_timeout();
        while let Some(&index) = self.reissue.first() {
            let call = apply_with_timeout(
                self.ctx.scheduler.clone(),
                job_id.clone(),
                index,
                target.clone(),
                timeout,
            );
            match self.await_serving(call).await {
                Ok(Ok(outcome)) => {
                    debug!(update = %self.record.key, instance = index, ?outcome, "re-sent in-flight command");
                    self.issued_at.insert(index, Instant::now());
                    self.reissue.remove(0);
                }
                Ok(Err(e)) => {
                    let delay = self.backoff.fail(Instant::now());
                    warn!(update = %self.record.key, error = %e, ?delay, "scheduler unavailable; backing off");
                    return false;
                }
                Err(interrupt) => {
                    self.interrupted(interrupt);
                    return false;
                }
            }
        }
        self.backoff.reset();
        true
    }

    /// Decide an in-flight instance from its observation: `Some(true)` when
    /// done, `Some(false)` when failed, `None` while undecided.
    fn judge(&self, index: InstanceIndex, issued: Instant, target: &str, now: Instant) -> Option<bool> {
        let spec = &self.record.spec;
        let staleness = self.ctx.config.observation_staleness();
        if let Some(tracked) = self.tracker.get(index, staleness, now) {
            // Observations from before the command say nothing about it.
            if tracked.observed_at >= issued && tracked.observation.config_version == target {
                match tracked.observation.health {
                    InstanceHealth::Healthy
                        if tracked.since_transition(now)
                            >= Duration::from_millis(spec.min_wait_in_running_ms) =>
                    {
                        return Some(true);
                    }
                    InstanceHealth::Failed => return Some(false),
                    _ => {}
                }
            }
        }
        if now.saturating_duration_since(issued) > Duration::from_millis(spec.max_wait_for_running_ms)
        {
            return Some(false);
        }
        None
    }

    /// Fold observations of in-flight instances into the progress table.
    fn reconcile(&mut self, direction: Direction) -> UpdateResult<()> {
        let now = Instant::now();
        let target = self.target_version(direction).to_string();
        let mut next: Option<JobUpdate> = None;
        let mut resolved = Vec::new();

        for &index in &self.record.status.current_batch {
            let i = index as usize;
            if !self.record.status.instances[i].is_in_flight() {
                continue;
            }
            let issued = self.issued_at.get(&index).copied().unwrap_or(now);
            let Some(succeeded) = self.judge(index, issued, &target, now) else {
                continue;
            };
            let status = &mut next.get_or_insert_with(|| self.record.clone()).status;
            match (direction, succeeded) {
                (Direction::Forward, true) => {
                    status.instances[i] = InstanceProgress::Updated;
                    status.instances_updated += 1;
                }
                (Direction::Forward, false) => {
                    status.instances[i] = InstanceProgress::Failed;
                    status.batch_failures += 1;
                    status.total_failures += 1;
                }
                (Direction::Backward, true) => {
                    status.instances[i] = InstanceProgress::Reverted;
                    status.instances_reverted += 1;
                }
                (Direction::Backward, false) => {
                    status.instances[i] = InstanceProgress::RevertFailed;
                    status.batch_failures += 1;
                    status.revert_failures += 1;
                }
            }
            if succeeded {
                debug!(update = %self.record.key, instance = index, version = %target, "instance done");
            } else {
                warn!(update = %self.record.key, instance = index, version = %target, "instance failed");
            }
            resolved.push(index);
        }

        if let Some(mut next) = next {
            next.status.updated_at_ms = epoch_millis();
            self.commit(next)?;
            for index in resolved {
                self.issued_at.remove(&index);
            }
        }
        Ok(())
    }

    /// When the current batch has fully resolved, run the rollback policy.
    /// Returns true when the loop may go on to plan the next batch.
    fn resolve_batch(&mut self, direction: Direction) -> UpdateResult<bool> {
        let status = &self.record.status;
        if status.current_batch.is_empty() {
            return Ok(true);
        }
        if status
            .current_batch
            .iter()
            .any(|&i| status.instances[i as usize].is_in_flight())
        {
            return Ok(false);
        }

        let total = match direction {
            Direction::Forward => status.total_failures,
            Direction::Backward => status.revert_failures,
        };
        let batch_failures = status.batch_failures;
        let spec = &self.record.spec;
        match policy::evaluate(batch_failures, total, spec) {
            Verdict::Continue => {
                debug!(
                    update = %self.record.key,
                    batch = status.batch_number,
                    failures = batch_failures,
                    "batch complete"
                );
                let mut next = self.record.clone();
                next.status.current_batch.clear();
                next.status.batch_failures = 0;
                next.status.updated_at_ms = epoch_millis();
                self.commit(next)?;
                Ok(true)
            }
            verdict => {
                let violation = UpdateError::PolicyViolation {
                    batch_failures,
                    total_failures: total,
                };
                warn!(update = %self.record.key, ?verdict, error = %violation, "rollback policy triggered");
                let rollback_on_failure = spec.rollback_on_failure;
                self.apply_internal(
                    InternalEvent::ThresholdExceeded {
                        rollback_on_failure,
                    },
                    Some(violation.to_string()),
                )?;
                Ok(false)
            }
        }
    }

    async fn issue_next_batch(&mut self, direction: Direction) -> UpdateResult<()> {
        let now = Instant::now();
        if !self.backoff.ready(now) {
            return Ok(());
        }
        let spec = &self.record.spec;
        let batch = planner::next_batch(&self.record.status.instances, spec.batch_size, direction);
        if batch.is_empty() {
            return Ok(());
        }
        if spec.pulsed && self.record.status.pulse_credits == 0 {
            self.apply_internal(InternalEvent::AwaitPulse, None)?;
            return Ok(());
        }

        let target = self.target_version(direction).to_string();
        let job_id = self.record.key.job_id.clone();
        let timeout = self.ctx.config.scheduler_call_timeout();
        let mut accepted = Vec::new();
        let mut rejected = Vec::new();
        let mut unavailable = None;
        let mut interrupt = None;
        let mut uncertain = None;
        for index in batch {
            let sent_at = Instant::now();
            let call = apply_with_timeout(
                self.ctx.scheduler.clone(),
                job_id.clone(),
                index,
                target.clone(),
                timeout,
            );
            match self.await_serving(call).await {
                Ok(Ok(ApplyOutcome::Accepted)) => accepted.push((index, sent_at)),
                Ok(Ok(ApplyOutcome::Rejected(reason))) => {
                    warn!(update = %self.record.key, instance = index, %reason, "scheduler rejected instance");
                    rejected.push(index);
                }
                Ok(Err(e)) => {
                    unavailable = Some(UpdateError::SchedulerUnavailable(e.to_string()));
                    break;
                }
                Err(cause) => {
                    // The scheduler may already have acted on the request.
                    accepted.push((index, sent_at));
                    uncertain = Some(index);
                    interrupt = Some(cause);
                    break;
                }
            }
        }

        let recorded = self.record_batch(direction, &target, &accepted, &rejected);
        if recorded.is_ok() {
            self.reissue.extend(uncertain);
        }
        if let Some(cause) = interrupt {
            self.interrupted(cause);
            return recorded;
        }
        recorded?;

        match unavailable {
            Some(err) => {
                let delay = self.backoff.fail(Instant::now());
                warn!(update = %self.record.key, error = %err, ?delay, "scheduler unavailable; backing off");
            }
            None => self.backoff.reset(),
        }
        Ok(())
    }

    /// Commit the instances a batch touched and start timing the accepted ones.
    fn record_batch(
        &mut self,
        direction: Direction,
        target: &str,
        accepted: &[(InstanceIndex, Instant)],
        rejected: &[InstanceIndex],
    ) -> UpdateResult<()> {
        if accepted.is_empty() && rejected.is_empty() {
            return Ok(());
        }
        let (moving, failed) = match direction {
            Direction::Forward => (InstanceProgress::Updating, InstanceProgress::Failed),
            Direction::Backward => (InstanceProgress::Reverting, InstanceProgress::RevertFailed),
        };
        let mut next = self.record.clone();
        let status = &mut next.status;
        for &(index, _) in accepted {
            status.instances[index as usize] = moving;
        }
        for &index in rejected {
            status.instances[index as usize] = failed;
            status.batch_failures += 1;
            match direction {
                Direction::Forward => status.total_failures += 1,
                Direction::Backward => status.revert_failures += 1,
            }
        }
        status.current_batch = accepted
            .iter()
            .map(|&(index, _)| index)
            .chain(rejected.iter().copied())
            .collect();
        status.current_batch.sort_unstable();
        status.batch_number += 1;
        if next.spec.pulsed {
            status.pulse_credits = status.pulse_credits.saturating_sub(1);
        }
        status.updated_at_ms = epoch_millis();
        let batch_number = status.batch_number;
        let size = status.current_batch.len();

        self.commit(next)?;
        self.issued_at.extend(accepted.iter().copied());
        info!(
            update = %self.record.key,
            batch = batch_number,
            instances = size,
            version = %target,
            "batch issued"
        );
        Ok(())
    }
}

/// Structural checks on a loaded record.
fn check_consistency(record: &JobUpdate) -> Result<(), String> {
    let status = &record.status;
    if status.instances.len() != record.spec.instance_count as usize {
        return Err(format!(
            "progress table has {} entries for {} instances",
            status.instances.len(),
            record.spec.instance_count
        ));
    }
    if let Some(&index) = status
        .current_batch
        .iter()
        .find(|&&i| i as usize >= status.instances.len())
    {
        return Err(format!("batch references unknown instance {index}"));
    }
    for (index, progress) in status.instances.iter().enumerate() {
        if progress.is_in_flight() && !status.current_batch.contains(&(index as InstanceIndex)) {
            return Err(format!("instance {index} is in flight outside the current batch"));
        }
    }
    Ok(())
}

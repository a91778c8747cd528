//! Public scheduler handle and its background loops.
//!
//! # Architecture
//!
//! ```text
//! Scheduler (facade)
//!     │  add_task / add_schedule / add_job / run_job / pause / stop
//!     ▼
//! DataStore (source of truth) ◄──────────────┐
//!     ▲                                      │
//!     │ acquire/release                      │ acquire/release
//! ScheduleLoop ── add_job ──► jobs ──► WorkerLoop ── results
//!     │                                      │
//!     └────────────► EventBroker ◄───────────┘
//!            (wake-ups, result waiting)
//! ```
//!
//! Any number of nodes may run these loops against a shared store; the
//! store's atomic acquisition is the only coordination primitive. The broker
//! only shortens wake-up latencies and never carries authoritative state.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::brokers::{EventBroker, EventCallback};
use crate::errors::{SchedulerError, StoreError, TriggerError};
use crate::events::{EventFilter, EventKind, EventTag, SchedulerEvent};
use crate::model::{Job, JobOutcome, JobResult, Schedule, Task};
use crate::registry::TaskRegistry;
use crate::retry::RetryPolicy;
use crate::store::{ConflictPolicy, DataStore};

mod reaper;
mod schedule_loop;
mod worker;

use reaper::ReaperLoop;
use schedule_loop::ScheduleLoop;
use worker::WorkerLoop;

/// How often `run_job` re-checks the store in case the release event was
/// dropped.
const RESULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Lifecycle of a scheduler node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Tunables for a scheduler node.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct SchedulerConfig {
    /// Node identity used for leases and event sourcing.
    #[builder(default = format!("metronome-{}", Uuid::new_v4()))]
    pub identity: String,

    /// Run the schedule-processing loop on this node.
    #[builder(default = true)]
    pub process_schedules: bool,

    /// Run the job-executing worker loop on this node.
    #[builder(default = true)]
    pub process_jobs: bool,

    #[builder(default = Duration::from_secs(30))]
    pub schedule_lease: Duration,

    #[builder(default = Duration::from_secs(60))]
    pub job_lease: Duration,

    /// Maximum schedules claimed per loop round.
    #[builder(default = 100usize)]
    pub schedule_batch_size: usize,

    /// Maximum jobs executing concurrently on this node.
    #[builder(default = 20usize)]
    pub max_concurrent_jobs: usize,

    /// Longest the loops sleep without an external wake-up.
    #[builder(default = Duration::from_secs(30))]
    pub max_poll_interval: Duration,

    /// Shortest sleep between loop rounds.
    #[builder(default = Duration::from_millis(100))]
    pub min_poll_interval: Duration,

    /// Cadence of per-job lease extensions while a handler runs.
    #[builder(default = Duration::from_secs(15))]
    pub heartbeat_interval: Duration,

    /// Cadence of `store.cleanup()`.
    #[builder(default = Duration::from_secs(60))]
    pub cleanup_interval: Duration,

    /// How long job results stay readable.
    #[builder(default = Duration::from_secs(300))]
    pub result_ttl: Duration,

    /// How long `stop()` waits for in-flight jobs to finish.
    #[builder(default = Duration::from_secs(30))]
    pub drain_timeout: Duration,

    #[builder(default)]
    pub retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Shared state handed to every loop.
pub(crate) struct SchedulerContext {
    pub(crate) store: Arc<dyn DataStore>,
    pub(crate) broker: Arc<dyn EventBroker>,
    pub(crate) registry: Arc<TaskRegistry>,
    pub(crate) config: SchedulerConfig,
    state: watch::Sender<RunState>,
    shutdown: Mutex<CancellationToken>,
    /// Kicks the schedule loop out of its sleep.
    pub(crate) schedule_wakeup: Notify,
    /// Kicks the worker loop out of its sleep.
    pub(crate) job_wakeup: Notify,
    fatal: Mutex<Option<String>>,
}

impl SchedulerContext {
    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_state(&self, state: RunState) {
        debug!(?state, "scheduler state change");
        self.state.send_replace(state);
    }

    fn current_state(&self) -> RunState {
        *self.state.borrow()
    }

    /// Publish an event stamped with this node's identity; failures are
    /// logged, never propagated (the broker is best-effort).
    pub(crate) async fn publish(&self, kind: EventKind) {
        let event = SchedulerEvent::new(&self.config.identity, kind);
        if let Err(error) = self.broker.publish(event).await {
            warn!(error = %error, "failed to publish event");
        }
    }

    /// Record an unrecoverable store failure and tear the node down.
    pub(crate) fn record_fatal(&self, error: &StoreError) {
        error!(error = %error, "fatal store failure; stopping node");
        {
            let mut fatal = self.fatal.lock().unwrap_or_else(|e| e.into_inner());
            if fatal.is_none() {
                *fatal = Some(error.to_string());
            }
        }
        self.set_state(RunState::Stopping);
        self.shutdown_token().cancel();
    }

    fn fatal_message(&self) -> Option<String> {
        self.fatal.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Handle to a scheduler node.
///
/// The handle is the facade over the whole system: it mutates entities in
/// the store, publishes change events so peer nodes wake promptly, and owns
/// the background loops spawned by [`start_in_background`].
///
/// [`start_in_background`]: Scheduler::start_in_background
pub struct Scheduler {
    ctx: Arc<SchedulerContext>,
}

impl Scheduler {
    /// Create a scheduler with default configuration.
    pub fn new(store: Arc<dyn DataStore>, broker: Arc<dyn EventBroker>) -> Self {
        Self::with_config(store, broker, SchedulerConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn DataStore>,
        broker: Arc<dyn EventBroker>,
        config: SchedulerConfig,
    ) -> Self {
        let (state, _) = watch::channel(RunState::Stopped);
        Self {
            ctx: Arc::new(SchedulerContext {
                store,
                broker,
                registry: Arc::new(TaskRegistry::new()),
                config,
                state,
                shutdown: Mutex::new(CancellationToken::new()),
                schedule_wakeup: Notify::new(),
                job_wakeup: Notify::new(),
                fatal: Mutex::new(None),
            }),
        }
    }

    pub fn identity(&self) -> &str {
        &self.ctx.config.identity
    }

    pub fn state(&self) -> RunState {
        self.ctx.current_state()
    }

    /// Handler registry for this node's workers.
    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.ctx.registry
    }

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    /// Persist a task record. The handler for its `func_reference` is
    /// registered separately through [`registry`](Scheduler::registry).
    pub async fn add_task(
        &self,
        task: Task,
        conflict: ConflictPolicy,
    ) -> Result<(), SchedulerError> {
        self.ctx.store.add_task(task, conflict).await?;
        Ok(())
    }

    pub async fn remove_task(&self, task_id: &str) -> Result<(), SchedulerError> {
        if !self.ctx.store.remove_task(task_id).await? {
            return Err(SchedulerError::TaskLookup(task_id.to_string()));
        }
        Ok(())
    }

    pub async fn get_tasks(&self) -> Result<Vec<Task>, SchedulerError> {
        Ok(self.ctx.store.get_tasks().await?)
    }

    // ------------------------------------------------------------------
    // Schedules
    // ------------------------------------------------------------------

    /// Persist a schedule. Its first fire time is computed here unless the
    /// caller supplied one; peers are woken through the broker.
    pub async fn add_schedule(
        &self,
        mut schedule: Schedule,
        conflict: ConflictPolicy,
    ) -> Result<String, SchedulerError> {
        let task = self
            .ctx
            .store
            .get_task(&schedule.task_id)
            .await?
            .ok_or_else(|| SchedulerError::TaskLookup(schedule.task_id.clone()))?;
        if schedule.misfire_grace_ms.is_none() {
            schedule.misfire_grace_ms = task.misfire_grace_ms;
        }
        if schedule.next_fire_time.is_none() {
            schedule.next_fire_time = schedule.trigger.next()?;
        }
        let Some(next_fire_time) = schedule.next_fire_time else {
            return Err(TriggerError::invalid("trigger yields no fire times").into());
        };
        schedule.updated_at = Utc::now();
        let schedule_id = schedule.id.clone();
        self.ctx.store.add_schedule(schedule, conflict).await?;
        self.ctx
            .publish(EventKind::ScheduleAdded {
                schedule_id: schedule_id.clone(),
                next_fire_time: Some(next_fire_time),
            })
            .await;
        self.ctx.schedule_wakeup.notify_one();
        Ok(schedule_id)
    }

    pub async fn get_schedule(&self, schedule_id: &str) -> Result<Schedule, SchedulerError> {
        let ids = [schedule_id.to_string()];
        self.ctx
            .store
            .get_schedules(Some(&ids))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| SchedulerError::ScheduleLookup(schedule_id.to_string()))
    }

    pub async fn get_schedules(&self) -> Result<Vec<Schedule>, SchedulerError> {
        Ok(self.ctx.store.get_schedules(None).await?)
    }

    pub async fn remove_schedule(&self, schedule_id: &str) -> Result<(), SchedulerError> {
        let _ = self.get_schedule(schedule_id).await?;
        self.ctx
            .store
            .remove_schedules(&[schedule_id.to_string()])
            .await?;
        self.ctx
            .publish(EventKind::ScheduleRemoved {
                schedule_id: schedule_id.to_string(),
            })
            .await;
        self.ctx.schedule_wakeup.notify_one();
        Ok(())
    }

    /// Stop materializing jobs for a schedule; its fire times keep passing
    /// by unobserved until it is unpaused.
    pub async fn pause_schedule(&self, schedule_id: &str) -> Result<(), SchedulerError> {
        self.set_paused(schedule_id, true).await
    }

    pub async fn unpause_schedule(&self, schedule_id: &str) -> Result<(), SchedulerError> {
        self.set_paused(schedule_id, false).await
    }

    async fn set_paused(&self, schedule_id: &str, paused: bool) -> Result<(), SchedulerError> {
        let mut schedule = self.get_schedule(schedule_id).await?;
        if schedule.paused == paused {
            return Ok(());
        }
        schedule.paused = paused;
        schedule.updated_at = Utc::now();
        let next_fire_time = schedule.next_fire_time;
        self.ctx
            .store
            .add_schedule(schedule, ConflictPolicy::Replace)
            .await?;
        self.ctx
            .publish(EventKind::ScheduleUpdated {
                schedule_id: schedule_id.to_string(),
                next_fire_time,
            })
            .await;
        self.ctx.schedule_wakeup.notify_one();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    /// Persist a one-shot job for immediate execution.
    pub async fn add_job(&self, job: Job) -> Result<Uuid, SchedulerError> {
        self.ctx
            .store
            .get_task(&job.task_id)
            .await?
            .ok_or_else(|| SchedulerError::TaskLookup(job.task_id.clone()))?;
        let job_id = job.id;
        let task_id = job.task_id.clone();
        let schedule_id = job.schedule_id.clone();
        self.ctx.store.add_job(job).await?;
        self.ctx
            .publish(EventKind::JobAdded {
                job_id,
                task_id,
                schedule_id,
            })
            .await;
        self.ctx.job_wakeup.notify_one();
        Ok(job_id)
    }

    /// Read a job's result, distinguishing "job unknown" from "not finished
    /// yet".
    pub async fn get_job_result(&self, job_id: Uuid) -> Result<JobResult, SchedulerError> {
        if let Some(result) = self.ctx.store.get_job_result(job_id).await? {
            return Ok(result);
        }
        let ids = [job_id];
        if self.ctx.store.get_jobs(Some(&ids)).await?.is_empty() {
            Err(SchedulerError::JobLookup(job_id))
        } else {
            Err(SchedulerError::JobResultNotReady(job_id))
        }
    }

    /// Convenience: enqueue a one-shot job and wait for its result.
    ///
    /// The wait listens for the release event and re-checks the store on a
    /// slow poll, so a dropped event cannot hang the caller.
    pub async fn run_job(
        &self,
        task_id: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, SchedulerError> {
        let job = Job::one_shot(task_id, args);
        let job_id = job.id;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let callback: EventCallback = Arc::new(move |event| {
            let _ = tx.send(event);
        });
        let filter = EventFilter::for_entity([EventTag::JobReleased], job_id.to_string());
        let subscription = self.ctx.broker.subscribe(filter, callback).await?;

        let result = match self.add_job(job).await {
            Ok(_) => {
                let wait = async {
                    loop {
                        tokio::select! {
                            _ = rx.recv() => {}
                            _ = tokio::time::sleep(RESULT_POLL_INTERVAL) => {}
                        }
                        if let Some(result) = self.ctx.store.get_job_result(job_id).await? {
                            return Ok::<JobResult, SchedulerError>(result);
                        }
                    }
                };
                wait.await
            }
            Err(error) => Err(error),
        };
        let _ = self.ctx.broker.unsubscribe(subscription).await;
        let result = result?;

        match result.outcome {
            JobOutcome::Success => Ok(result.return_value.unwrap_or(serde_json::Value::Null)),
            JobOutcome::Error => Err(SchedulerError::JobFailed {
                task_id: task_id.to_string(),
                exception: result.exception.unwrap_or_default(),
            }),
            JobOutcome::MissedDeadline => Err(SchedulerError::DeadlineMissed(job_id)),
            JobOutcome::Cancelled => Err(SchedulerError::JobCancelled(job_id)),
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Spawn the configured loops and return once they are running.
    pub async fn start_in_background(&self) -> Result<(), SchedulerError> {
        if self.ctx.current_state() != RunState::Stopped {
            return Err(SchedulerError::AlreadyRunning);
        }
        self.ctx.set_state(RunState::Starting);
        if let Err(error) = self.ctx.store.initialize().await {
            self.ctx.set_state(RunState::Stopped);
            return Err(error.into());
        }
        {
            let mut fatal = self.ctx.fatal.lock().unwrap_or_else(|e| e.into_inner());
            *fatal = None;
        }
        let token = CancellationToken::new();
        {
            let mut shutdown = self.ctx.shutdown.lock().unwrap_or_else(|e| e.into_inner());
            *shutdown = token.clone();
        }

        self.ctx.publish(EventKind::SchedulerStarted).await;

        let mut handles = Vec::new();
        if self.ctx.config.process_schedules {
            let scheduling = ScheduleLoop::new(self.ctx.clone());
            handles.push(tokio::spawn(scheduling.run(token.clone())));
        }
        if self.ctx.config.process_jobs {
            let worker = WorkerLoop::new(self.ctx.clone());
            handles.push(tokio::spawn(worker.run(token.clone())));
        }
        let reaper = ReaperLoop::new(self.ctx.clone());
        handles.push(tokio::spawn(reaper.run(token.clone())));

        // Supervisor: once every loop has wound down, the node is stopped.
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            futures::future::join_all(handles).await;
            ctx.publish(EventKind::SchedulerStopped).await;
            ctx.set_state(RunState::Stopped);
        });

        self.ctx.set_state(RunState::Running);
        info!(
            identity = %self.ctx.config.identity,
            schedules = self.ctx.config.process_schedules,
            jobs = self.ctx.config.process_jobs,
            "scheduler started"
        );
        Ok(())
    }

    /// Cancel all loops cooperatively and wait for them to wind down.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        if self.ctx.current_state() == RunState::Stopped {
            return Ok(());
        }
        self.ctx.set_state(RunState::Stopping);
        self.ctx.shutdown_token().cancel();
        self.wait_until_stopped().await
    }

    /// Wait until the node reaches `Stopped`; surfaces the fatal error that
    /// stopped it, if any.
    pub async fn wait_until_stopped(&self) -> Result<(), SchedulerError> {
        let mut receiver = self.ctx.state.subscribe();
        loop {
            if *receiver.borrow_and_update() == RunState::Stopped {
                break;
            }
            if receiver.changed().await.is_err() {
                break;
            }
        }
        match self.ctx.fatal_message() {
            Some(message) => Err(SchedulerError::Fatal(message)),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("identity", &self.ctx.config.identity)
            .field("state", &self.ctx.current_state())
            .finish()
    }
}

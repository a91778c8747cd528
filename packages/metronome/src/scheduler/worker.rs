//! Job-executing worker loop.
//!
//! Claims due jobs under a lease, resolves each task's handler through the
//! registry, executes with a per-job lease heartbeat, captures the outcome
//! into a result, and finalizes through the store. Handler errors become
//! `Error` results; they never escape the loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::SchedulerContext;
use crate::brokers::EventCallback;
use crate::errors::StoreError;
use crate::events::{EventFilter, EventKind, EventTag};
use crate::model::{Job, JobOutcome, JobResult};
use crate::registry::TaskInvocation;
use crate::retry::{with_backoff, RetryPolicy};

/// How one execution ended, before it is turned into a [`JobResult`].
enum Execution {
    Succeeded(serde_json::Value),
    Failed(String),
    Cancelled,
}

pub(crate) struct WorkerLoop {
    ctx: Arc<SchedulerContext>,
    /// Cancellation tokens of in-flight jobs, for shutdown draining.
    running: Arc<RwLock<HashMap<Uuid, CancellationToken>>>,
}

impl WorkerLoop {
    pub(crate) fn new(ctx: Arc<SchedulerContext>) -> Self {
        Self {
            ctx,
            running: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub(crate) async fn run(self, shutdown: CancellationToken) {
        let identity = self.ctx.config.identity.clone();
        info!(identity = %identity, "worker loop starting");

        // Wake up early when jobs are added anywhere.
        let ctx = self.ctx.clone();
        let callback: EventCallback = Arc::new(move |_event| {
            ctx.job_wakeup.notify_one();
        });
        let subscription = match self
            .ctx
            .broker
            .subscribe(EventFilter::for_kinds([EventTag::JobAdded]), callback)
            .await
        {
            Ok(handle) => Some(handle),
            Err(error) => {
                warn!(error = %error, "job wake-up subscription failed; polling only");
                None
            }
        };

        loop {
            if shutdown.is_cancelled() {
                break;
            }
            let capacity = self
                .ctx
                .config
                .max_concurrent_jobs
                .saturating_sub(self.running.read().await.len());
            if capacity == 0 {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.ctx.config.min_poll_interval) => {}
                }
                continue;
            }

            let jobs = match with_backoff(&self.ctx.config.retry, &shutdown, || {
                self.ctx
                    .store
                    .acquire_jobs(&self.ctx.config.identity, self.ctx.config.job_lease, capacity)
            })
            .await
            {
                Ok(jobs) => jobs,
                Err(error) => {
                    if shutdown.is_cancelled() {
                        break;
                    }
                    if !error.is_transient() {
                        self.ctx.record_fatal(&error);
                        break;
                    }
                    error!(error = %error, "failed to claim jobs");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            if jobs.is_empty() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = self.ctx.job_wakeup.notified() => {}
                    _ = tokio::time::sleep(self.ctx.config.max_poll_interval) => {}
                }
                continue;
            }
            debug!(count = jobs.len(), "claimed jobs");

            for job in &jobs {
                self.ctx
                    .publish(EventKind::JobAcquired {
                        job_id: job.id,
                        worker: self.ctx.config.identity.clone(),
                    })
                    .await;
            }

            // Process the batch concurrently; capacity bounds the batch size.
            let executions = jobs
                .into_iter()
                .map(|job| self.process_job(job, &shutdown));
            futures::future::join_all(executions).await;
        }

        self.drain().await;
        if let Some(handle) = subscription {
            let _ = self.ctx.broker.unsubscribe(handle).await;
        }
        info!(identity = %identity, "worker loop stopped");
    }

    /// Execute one claimed job and finalize it.
    async fn process_job(&self, job: Job, shutdown: &CancellationToken) {
        let config = &self.ctx.config;
        let now = Utc::now();

        // Late pickup: finalize as missed instead of executing.
        if let Some(deadline) = job.start_deadline {
            if now > deadline {
                warn!(job_id = %job.id, %deadline, "job missed its start deadline");
                let result = JobResult::missed_deadline(job.id, config.result_ttl);
                self.finalize(&job, result).await;
                self.ctx
                    .publish(EventKind::JobDeadlineMissed {
                        job_id: Some(job.id),
                        schedule_id: job.schedule_id.clone(),
                        scheduled_fire_time: job.scheduled_fire_time.unwrap_or(job.created_at),
                    })
                    .await;
                self.ctx
                    .publish(EventKind::JobReleased {
                        job_id: job.id,
                        outcome: JobOutcome::MissedDeadline,
                    })
                    .await;
                return;
            }
        }

        let job_cancel = shutdown.child_token();
        self.running.write().await.insert(job.id, job_cancel.clone());
        let started_at = Utc::now();

        let execution = self.execute_with_heartbeat(&job, job_cancel).await;

        let duration_ms = (Utc::now() - started_at).num_milliseconds();
        let (result, specific_event) = match execution {
            Execution::Succeeded(value) => {
                debug!(job_id = %job.id, task_id = %job.task_id, "job succeeded");
                (
                    JobResult::success(job.id, started_at, value, config.result_ttl),
                    Some(EventKind::JobSuccessful {
                        job_id: job.id,
                        task_id: job.task_id.clone(),
                        duration_ms,
                    }),
                )
            }
            Execution::Failed(exception) => {
                warn!(job_id = %job.id, task_id = %job.task_id, error = %exception, "job failed");
                (
                    JobResult::error(job.id, started_at, exception.clone(), config.result_ttl),
                    Some(EventKind::JobFailed {
                        job_id: job.id,
                        task_id: job.task_id.clone(),
                        exception,
                    }),
                )
            }
            Execution::Cancelled => {
                info!(job_id = %job.id, task_id = %job.task_id, "job cancelled by shutdown");
                (JobResult::cancelled(job.id, started_at, config.result_ttl), None)
            }
        };

        let outcome = result.outcome;
        self.finalize(&job, result).await;
        if let Some(event) = specific_event {
            self.ctx.publish(event).await;
        }
        self.ctx
            .publish(EventKind::JobReleased {
                job_id: job.id,
                outcome,
            })
            .await;
        self.running.write().await.remove(&job.id);
    }

    /// Run the handler while a background task keeps the job lease fresh.
    async fn execute_with_heartbeat(&self, job: &Job, cancel: CancellationToken) -> Execution {
        let ctx = self.ctx.clone();
        let job_id = job.id;
        let heartbeat_cancel = cancel.clone();
        let heartbeat = tokio::spawn(async move {
            let mut interval = tokio::time::interval(ctx.config.heartbeat_interval);
            interval.tick().await; // Skip the immediate tick.
            loop {
                tokio::select! {
                    _ = heartbeat_cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let extend = ctx.store
                            .extend_job_lease(&ctx.config.identity, job_id, ctx.config.job_lease)
                            .await;
                        if let Err(error) = extend {
                            warn!(job_id = %job_id, error = %error, "lease heartbeat failed");
                        }
                    }
                }
            }
        });

        let func_reference = match self.ctx.store.get_task(&job.task_id).await {
            Ok(Some(task)) => Ok(task.func_reference),
            Ok(None) => Err(format!("task {:?} no longer exists", job.task_id)),
            Err(error) => Err(format!("task lookup failed: {error}")),
        };

        let execution = match func_reference {
            Err(message) => Execution::Failed(message),
            Ok(func_reference) => {
                let invocation = TaskInvocation {
                    job_id: job.id,
                    task_id: job.task_id.clone(),
                    schedule_id: job.schedule_id.clone(),
                    scheduled_fire_time: job.scheduled_fire_time,
                    args: job.args.clone(),
                };
                tokio::select! {
                    _ = cancel.cancelled() => Execution::Cancelled,
                    outcome = self.ctx.registry.execute(&func_reference, invocation) => {
                        match outcome {
                            Ok(value) => Execution::Succeeded(value),
                            Err(error) => Execution::Failed(format!("{error:#}")),
                        }
                    }
                }
            }
        };

        cancel.cancel();
        let _ = heartbeat.await;
        execution
    }

    /// Write the result back; the job disappears from the store with it.
    /// Bounded retries: an unreleasable job falls back to lease expiry.
    async fn finalize(&self, job: &Job, result: JobResult) {
        let policy = RetryPolicy {
            max_attempts: Some(5),
            ..self.ctx.config.retry.clone()
        };
        let no_cancel = CancellationToken::new();
        let written = with_backoff(&policy, &no_cancel, || {
            self.ctx
                .store
                .release_job(&self.ctx.config.identity, job.id, result.clone())
        })
        .await;
        if let Err(error) = written {
            match error {
                StoreError::Fatal(_) => self.ctx.record_fatal(&error),
                _ => error!(job_id = %job.id, error = %error, "failed to release job"),
            }
        }
    }

    /// Cancel in-flight jobs and give them a bounded window to finish.
    async fn drain(&self) {
        let count = self.running.read().await.len();
        if count == 0 {
            return;
        }
        info!(count, "waiting for running jobs to finish");
        {
            let running = self.running.read().await;
            for token in running.values() {
                token.cancel();
            }
        }
        let deadline = tokio::time::Instant::now() + self.ctx.config.drain_timeout;
        while !self.running.read().await.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

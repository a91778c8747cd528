//! Schedule-processing loop.
//!
//! Each round: claim due schedules under a lease, turn missed fire times
//! into jobs per the coalesce and misfire policies, advance the triggers,
//! release the claims, publish events. Sleeps until the earliest known fire
//! time, capped by the poll interval, and wakes early on peer mutations.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::SchedulerContext;
use crate::brokers::EventCallback;
use crate::errors::StoreError;
use crate::events::{EventFilter, EventKind, EventTag};
use crate::model::{CoalescePolicy, Job, Schedule};
use crate::retry::with_backoff;

pub(crate) struct ScheduleLoop {
    ctx: Arc<SchedulerContext>,
}

impl ScheduleLoop {
    pub(crate) fn new(ctx: Arc<SchedulerContext>) -> Self {
        Self { ctx }
    }

    pub(crate) async fn run(self, shutdown: CancellationToken) {
        let identity = self.ctx.config.identity.clone();
        info!(identity = %identity, "schedule loop starting");

        // Wake up early when a peer mutates schedules.
        let ctx = self.ctx.clone();
        let callback: EventCallback = Arc::new(move |event| {
            if event.source != ctx.config.identity {
                ctx.schedule_wakeup.notify_one();
            }
        });
        let filter = EventFilter::for_kinds([
            EventTag::ScheduleAdded,
            EventTag::ScheduleUpdated,
            EventTag::ScheduleRemoved,
        ]);
        let subscription = match self.ctx.broker.subscribe(filter, callback).await {
            Ok(handle) => Some(handle),
            Err(error) => {
                warn!(error = %error, "schedule wake-up subscription failed; polling only");
                None
            }
        };

        loop {
            if shutdown.is_cancelled() {
                break;
            }
            let sleep_for = match self.tick(&shutdown).await {
                Ok(sleep_for) => sleep_for,
                Err(error) => {
                    if shutdown.is_cancelled() {
                        break;
                    }
                    if !error.is_transient() {
                        self.ctx.record_fatal(&error);
                        break;
                    }
                    error!(error = %error, "schedule processing failed");
                    self.ctx.config.min_poll_interval.max(std::time::Duration::from_secs(1))
                }
            };
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.ctx.schedule_wakeup.notified() => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }

        if let Some(handle) = subscription {
            let _ = self.ctx.broker.unsubscribe(handle).await;
        }
        info!(identity = %identity, "schedule loop stopped");
    }

    /// One claim/process/release round. Returns how long to sleep.
    async fn tick(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<std::time::Duration, StoreError> {
        let config = &self.ctx.config;
        let schedules = with_backoff(&config.retry, shutdown, || {
            self.ctx.store.acquire_schedules(
                &config.identity,
                config.schedule_lease,
                config.schedule_batch_size,
            )
        })
        .await?;

        if schedules.is_empty() {
            return Ok(config.max_poll_interval);
        }
        debug!(count = schedules.len(), "claimed due schedules");

        let mut released = Vec::with_capacity(schedules.len());
        let mut events = Vec::new();
        let mut earliest_next: Option<DateTime<Utc>> = None;
        for schedule in schedules {
            let processed = self.process_schedule(schedule, shutdown, &mut events).await?;
            if let Some(next) = processed.next_fire_time {
                earliest_next = Some(earliest_next.map_or(next, |e| e.min(next)));
            }
            released.push(processed);
        }

        with_backoff(&config.retry, shutdown, || {
            self.ctx
                .store
                .release_schedules(&config.identity, released.clone())
        })
        .await?;

        for event in events {
            self.ctx.publish(event).await;
        }

        let now = Utc::now();
        let sleep_for = match earliest_next {
            Some(next) if next > now => (next - now)
                .to_std()
                .unwrap_or(config.max_poll_interval)
                .min(config.max_poll_interval),
            // Something is already due again (coalesced backlog, tight
            // interval); go around quickly.
            Some(_) => config.min_poll_interval,
            None => config.max_poll_interval,
        };
        Ok(sleep_for.max(config.min_poll_interval))
    }

    /// Turn one claimed schedule's due fire times into jobs and advance its
    /// trigger. Returns the schedule ready for release.
    async fn process_schedule(
        &self,
        mut schedule: Schedule,
        shutdown: &CancellationToken,
        events: &mut Vec<EventKind>,
    ) -> Result<Schedule, StoreError> {
        let config = &self.ctx.config;
        let now = Utc::now();

        // Drain every fire time that has come due; the first future one (or
        // exhaustion) becomes the new next_fire_time.
        let mut due = Vec::new();
        let mut next = schedule.next_fire_time;
        let mut trigger_failed = false;
        while let Some(fire_time) = next {
            if fire_time > now {
                break;
            }
            due.push(fire_time);
            match schedule.trigger.next() {
                Ok(value) => next = value,
                Err(error) => {
                    warn!(
                        schedule_id = %schedule.id,
                        error = %error,
                        "trigger failed; removing schedule"
                    );
                    trigger_failed = true;
                    next = None;
                    break;
                }
            }
        }

        if trigger_failed {
            schedule.next_fire_time = None;
            events.push(EventKind::ScheduleRemoved {
                schedule_id: schedule.id.clone(),
            });
            return Ok(schedule);
        }

        let dispatchable: Vec<DateTime<Utc>> = match schedule.coalesce {
            CoalescePolicy::All => due.clone(),
            CoalescePolicy::Latest => due.last().copied().into_iter().collect(),
            CoalescePolicy::Earliest => due.first().copied().into_iter().collect(),
        };

        for fire_time in dispatchable {
            if let Some(grace_ms) = schedule.misfire_grace_ms {
                if now - fire_time > TimeDelta::milliseconds(grace_ms) {
                    debug!(
                        schedule_id = %schedule.id,
                        %fire_time,
                        "fire missed its grace period; skipping"
                    );
                    events.push(EventKind::JobDeadlineMissed {
                        job_id: None,
                        schedule_id: Some(schedule.id.clone()),
                        scheduled_fire_time: fire_time,
                    });
                    continue;
                }
            }
            let jitter_ms = match schedule.max_jitter_ms {
                Some(max) if max > 0 => rand::thread_rng().gen_range(0..=max),
                _ => 0,
            };
            let job = Job::for_schedule(&schedule, fire_time, jitter_ms);
            let job_id = job.id;
            with_backoff(&config.retry, shutdown, || {
                self.ctx.store.add_job(job.clone())
            })
            .await?;
            events.push(EventKind::JobAdded {
                job_id,
                task_id: schedule.task_id.clone(),
                schedule_id: Some(schedule.id.clone()),
            });
            self.ctx.job_wakeup.notify_one();
        }

        if let Some(last) = due.last() {
            schedule.last_fire_time = Some(*last);
        }
        schedule.next_fire_time = next;
        schedule.updated_at = now;
        if !due.is_empty() {
            events.push(match next {
                Some(next_fire_time) => EventKind::ScheduleUpdated {
                    schedule_id: schedule.id.clone(),
                    next_fire_time: Some(next_fire_time),
                },
                None => EventKind::ScheduleRemoved {
                    schedule_id: schedule.id.clone(),
                },
            });
        }
        Ok(schedule)
    }
}

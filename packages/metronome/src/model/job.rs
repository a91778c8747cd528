//! Job records: one materialized fire of a schedule, or a one-shot request.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use super::Schedule;

/// How a job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    /// The handler returned a value.
    Success,
    /// The handler returned an error; it is captured in the result, never
    /// rethrown inside the worker loop.
    Error,
    /// The job's start deadline had already passed when a worker picked it up.
    MissedDeadline,
    /// The worker was shut down while the handler was running.
    Cancelled,
}

/// A single unit of execution, immutable after creation except for the
/// acquisition fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,

    pub task_id: String,

    /// Set when this job was materialized from a schedule.
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub schedule_id: Option<String>,

    /// The fire time this job realizes; `None` for one-shot jobs, which run
    /// as soon as a worker has capacity.
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub scheduled_fire_time: Option<DateTime<Utc>>,

    /// Random delay drawn from `[0, schedule.max_jitter_ms]` at creation;
    /// workers will not pick the job up before `scheduled_fire_time + jitter`.
    #[builder(default)]
    #[serde(default)]
    pub jitter_ms: i64,

    /// Past this instant the job is finalized as `MissedDeadline` instead of
    /// being executed.
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub start_deadline: Option<DateTime<Utc>>,

    #[builder(default)]
    #[serde(default)]
    pub tags: Vec<String>,

    #[builder(default = serde_json::Value::Null)]
    #[serde(default)]
    pub args: serde_json::Value,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,

    /// Stamped when a worker claims the job.
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,

    /// Identity of the worker holding the acquisition lease.
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub acquired_by: Option<String>,

    /// When the acquisition lease lapses; past this instant the claim reverts
    /// without any data change.
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub acquired_until: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a one-shot job, runnable immediately.
    pub fn one_shot(task_id: impl Into<String>, args: serde_json::Value) -> Self {
        Self::builder().task_id(task_id.into()).args(args).build()
    }

    /// Materialize one fire of a schedule into a job.
    pub fn for_schedule(schedule: &Schedule, fire_time: DateTime<Utc>, jitter_ms: i64) -> Self {
        let mut job = Self::builder()
            .task_id(schedule.task_id.clone())
            .args(schedule.args.clone())
            .jitter_ms(jitter_ms)
            .build();
        job.schedule_id = Some(schedule.id.clone());
        job.scheduled_fire_time = Some(fire_time);
        job.start_deadline = schedule
            .misfire_grace_ms
            .map(|grace| fire_time + TimeDelta::milliseconds(grace));
        job
    }

    /// The earliest instant a worker may pick this job up.
    pub fn eligible_at(&self) -> DateTime<Utc> {
        match self.scheduled_fire_time {
            Some(fire_time) => fire_time + TimeDelta::milliseconds(self.jitter_ms),
            None => self.created_at,
        }
    }

    /// Whether a worker may claim this job at `now`.
    pub fn is_acquirable(&self, now: DateTime<Utc>) -> bool {
        self.eligible_at() <= now && self.acquired_until.map_or(true, |until| until <= now)
    }
}

/// The finalized outcome of a job, stored with a TTL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: Uuid,
    pub outcome: JobOutcome,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
    /// Value returned by the handler on success.
    pub return_value: Option<serde_json::Value>,
    /// Display form of the handler's error, if any.
    pub exception: Option<String>,
    /// The result disappears from the store past this instant.
    pub expires_at: DateTime<Utc>,
}

impl JobResult {
    fn new(
        job_id: Uuid,
        outcome: JobOutcome,
        started_at: Option<DateTime<Utc>>,
        ttl: Duration,
    ) -> Self {
        let finished_at = Utc::now();
        Self {
            job_id,
            outcome,
            started_at,
            finished_at,
            return_value: None,
            exception: None,
            expires_at: finished_at
                + TimeDelta::from_std(ttl).unwrap_or_else(|_| TimeDelta::seconds(300)),
        }
    }

    pub fn success(
        job_id: Uuid,
        started_at: DateTime<Utc>,
        return_value: serde_json::Value,
        ttl: Duration,
    ) -> Self {
        let mut result = Self::new(job_id, JobOutcome::Success, Some(started_at), ttl);
        result.return_value = Some(return_value);
        result
    }

    pub fn error(
        job_id: Uuid,
        started_at: DateTime<Utc>,
        exception: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        let mut result = Self::new(job_id, JobOutcome::Error, Some(started_at), ttl);
        result.exception = Some(exception.into());
        result
    }

    pub fn missed_deadline(job_id: Uuid, ttl: Duration) -> Self {
        Self::new(job_id, JobOutcome::MissedDeadline, None, ttl)
    }

    pub fn cancelled(job_id: Uuid, started_at: DateTime<Utc>, ttl: Duration) -> Self {
        Self::new(job_id, JobOutcome::Cancelled, Some(started_at), ttl)
    }

    /// Whether the TTL has lapsed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

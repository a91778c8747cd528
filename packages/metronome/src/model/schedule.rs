//! Schedule records: a persistent binding of a trigger to a task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::triggers::Trigger;

/// Policy for turning a backlog of missed fire times into jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CoalescePolicy {
    /// One job per missed fire time.
    All,
    /// One job, carrying the most recent missed fire time.
    #[default]
    Latest,
    /// One job, carrying the oldest missed fire time.
    Earliest,
}

/// A persistent binding of a [`Trigger`] to a task.
///
/// The embedded trigger carries its own advance state; the scheduler loop
/// only mutates it (and `next_fire_time`/`last_fire_time`) while holding an
/// acquisition lease, then writes the whole record back on release.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Schedule {
    /// Unique schedule id.
    pub id: String,

    /// The task whose handler runs when this schedule fires.
    pub task_id: String,

    /// Recurrence rule, including its restartable advance state.
    pub trigger: Trigger,

    /// Payload handed to every job this schedule creates.
    #[builder(default = serde_json::Value::Null)]
    #[serde(default)]
    pub args: serde_json::Value,

    /// Paused schedules are never acquired; their fire times keep passing by.
    #[builder(default)]
    #[serde(default)]
    pub paused: bool,

    #[builder(default)]
    #[serde(default)]
    pub coalesce: CoalescePolicy,

    /// Lateness budget; a fire older than this at processing time is dropped
    /// as missed instead of becoming a job.
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub misfire_grace_ms: Option<i64>,

    /// Upper bound for the uniform random delay applied to each job.
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub max_jitter_ms: Option<i64>,

    /// The next instant this schedule is due, or `None` once the trigger is
    /// exhausted (a terminal schedule is deleted on release).
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub next_fire_time: Option<DateTime<Utc>>,

    /// The most recent fire time the scheduler dispatched or skipped.
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub last_fire_time: Option<DateTime<Utc>>,

    /// Identity of the scheduler node holding the acquisition lease.
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub acquired_by: Option<String>,

    /// When the acquisition lease lapses; past this instant the claim reverts
    /// without any data change.
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub acquired_until: Option<DateTime<Utc>>,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,

    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    /// Whether this schedule is due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.paused && self.next_fire_time.is_some_and(|t| t <= now)
    }

    /// Whether a scheduler may claim this schedule at `now`.
    pub fn is_acquirable(&self, now: DateTime<Utc>) -> bool {
        self.is_due(now) && self.acquired_until.map_or(true, |until| until <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::triggers::DateTrigger;
    use chrono::TimeDelta;

    fn sample_schedule(next_fire_time: DateTime<Utc>) -> Schedule {
        Schedule::builder()
            .id("s1")
            .task_id("t1")
            .trigger(Trigger::from(DateTrigger::new(next_fire_time)))
            .next_fire_time(next_fire_time)
            .build()
    }

    #[test]
    fn defaults_to_latest_coalescing() {
        let schedule = sample_schedule(Utc::now());
        assert_eq!(schedule.coalesce, CoalescePolicy::Latest);
        assert!(!schedule.paused);
        assert!(schedule.acquired_by.is_none());
    }

    #[test]
    fn due_schedule_is_acquirable() {
        let now = Utc::now();
        let schedule = sample_schedule(now - TimeDelta::seconds(1));
        assert!(schedule.is_due(now));
        assert!(schedule.is_acquirable(now));
    }

    #[test]
    fn future_schedule_is_not_due() {
        let now = Utc::now();
        let schedule = sample_schedule(now + TimeDelta::seconds(10));
        assert!(!schedule.is_due(now));
    }

    #[test]
    fn paused_schedule_is_not_acquirable() {
        let now = Utc::now();
        let mut schedule = sample_schedule(now - TimeDelta::seconds(1));
        schedule.paused = true;
        assert!(!schedule.is_acquirable(now));
    }

    #[test]
    fn leased_schedule_is_not_acquirable_until_expiry() {
        let now = Utc::now();
        let mut schedule = sample_schedule(now - TimeDelta::seconds(1));
        schedule.acquired_by = Some("node-a".into());
        schedule.acquired_until = Some(now + TimeDelta::seconds(30));
        assert!(!schedule.is_acquirable(now));

        schedule.acquired_until = Some(now - TimeDelta::seconds(1));
        assert!(schedule.is_acquirable(now));
    }
}

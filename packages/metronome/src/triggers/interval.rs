//! Fixed-interval trigger.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::TriggerError;

/// Fires at `start_time + k·Δ` for k = 0, 1, … while within `end_time`.
///
/// `last_fire_time` is the advance state: the most recent yielded instant,
/// or `None` before the first fire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntervalTrigger {
    weeks: u32,
    days: u32,
    hours: u32,
    minutes: u32,
    seconds: u32,
    microseconds: u32,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    last_fire_time: Option<DateTime<Utc>>,
}

impl IntervalTrigger {
    /// Start building an interval trigger anchored at `start_time`.
    pub fn builder(start_time: DateTime<Utc>) -> IntervalTriggerBuilder {
        IntervalTriggerBuilder {
            weeks: 0,
            days: 0,
            hours: 0,
            minutes: 0,
            seconds: 0,
            microseconds: 0,
            start_time,
            end_time: None,
        }
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    fn interval(&self) -> Option<TimeDelta> {
        let delta = TimeDelta::try_weeks(i64::from(self.weeks))?
            + TimeDelta::try_days(i64::from(self.days))?
            + TimeDelta::try_hours(i64::from(self.hours))?
            + TimeDelta::try_minutes(i64::from(self.minutes))?
            + TimeDelta::try_seconds(i64::from(self.seconds))?
            + TimeDelta::microseconds(i64::from(self.microseconds));
        Some(delta)
    }

    pub(crate) fn next(&mut self) -> Option<DateTime<Utc>> {
        let candidate = match self.last_fire_time {
            None => self.start_time,
            Some(last) => last + self.interval()?,
        };
        if let Some(end) = self.end_time {
            if candidate > end {
                return None;
            }
        }
        self.last_fire_time = Some(candidate);
        Some(candidate)
    }
}

/// Builder for [`IntervalTrigger`]; `build` validates the rule.
#[derive(Debug, Clone)]
pub struct IntervalTriggerBuilder {
    weeks: u32,
    days: u32,
    hours: u32,
    minutes: u32,
    seconds: u32,
    microseconds: u32,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
}

impl IntervalTriggerBuilder {
    pub fn weeks(mut self, weeks: u32) -> Self {
        self.weeks = weeks;
        self
    }

    pub fn days(mut self, days: u32) -> Self {
        self.days = days;
        self
    }

    pub fn hours(mut self, hours: u32) -> Self {
        self.hours = hours;
        self
    }

    pub fn minutes(mut self, minutes: u32) -> Self {
        self.minutes = minutes;
        self
    }

    pub fn seconds(mut self, seconds: u32) -> Self {
        self.seconds = seconds;
        self
    }

    pub fn microseconds(mut self, microseconds: u32) -> Self {
        self.microseconds = microseconds;
        self
    }

    pub fn end_time(mut self, end_time: DateTime<Utc>) -> Self {
        self.end_time = Some(end_time);
        self
    }

    pub fn build(self) -> Result<IntervalTrigger, TriggerError> {
        let trigger = IntervalTrigger {
            weeks: self.weeks,
            days: self.days,
            hours: self.hours,
            minutes: self.minutes,
            seconds: self.seconds,
            microseconds: self.microseconds,
            start_time: self.start_time,
            end_time: self.end_time,
            last_fire_time: None,
        };
        match trigger.interval() {
            None => return Err(TriggerError::invalid("interval is too large")),
            Some(delta) if delta <= TimeDelta::zero() => {
                return Err(TriggerError::invalid("interval must be positive"));
            }
            Some(_) => {}
        }
        if let Some(end) = trigger.end_time {
            if end < trigger.start_time {
                return Err(TriggerError::invalid("end time precedes start time"));
            }
        }
        Ok(trigger)
    }
}

//! Cron-style trigger.
//!
//! Field expressions are parsed at construction into [`CronField`] values;
//! the parsed form is what gets serialized, so round-trips are exact and a
//! restored trigger never re-parses.

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeDelta, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use super::resolve_local;
use crate::errors::TriggerError;

mod field;

pub use field::{CronField, FieldExpr, FieldKind};

/// Upper bound on the day-by-day search: rules that match nothing within a
/// century (February 30th and friends) are treated as exhausted.
const MAX_SCAN_DAYS: u32 = 36_600;

/// Fires on wall-clock matches of a cron field expression, in a fixed
/// timezone.
///
/// Field significance runs year > month > day > week > day-of-week > hour >
/// minute > second. Fields left unset default to `*` when they are more
/// significant than the least significant explicitly-set field and to their
/// minimum otherwise; `week` and `day_of_week` always default to `*`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronTrigger {
    year: CronField,
    month: CronField,
    day: CronField,
    week: CronField,
    day_of_week: CronField,
    hour: CronField,
    minute: CronField,
    second: CronField,
    timezone: Tz,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    last_fire_time: Option<DateTime<Utc>>,
}

impl CronTrigger {
    /// Start building a cron trigger evaluated in `timezone`.
    pub fn builder(timezone: Tz) -> CronTriggerBuilder {
        CronTriggerBuilder {
            year: None,
            month: None,
            day: None,
            week: None,
            day_of_week: None,
            hour: None,
            minute: None,
            second: None,
            start_time: None,
            end_time: None,
            timezone,
        }
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub(crate) fn next(&mut self) -> Option<DateTime<Utc>> {
        // First call: smallest match at or after start_time. Afterwards:
        // strictly greater than the last fire (cron resolution is a second).
        let local_floor = match self.last_fire_time {
            Some(last) => {
                ceil_to_second(last.with_timezone(&self.timezone) + TimeDelta::seconds(1))
            }
            None => ceil_to_second(self.start_time.with_timezone(&self.timezone)),
        };
        let end_date = self
            .end_time
            .map(|end| end.with_timezone(&self.timezone).date_naive());

        let mut date = local_floor.date_naive();
        let mut time_floor = Some(local_floor.time());
        for _ in 0..MAX_SCAN_DAYS {
            if let Some(end) = end_date {
                if date > end {
                    return None;
                }
            }
            if self.date_matches(date) {
                let mut floor = time_floor;
                while let Some(time) = self.next_time_on(floor) {
                    let fire =
                        resolve_local(self.timezone, date.and_time(time)).with_timezone(&Utc);
                    if let Some(end) = self.end_time {
                        if fire > end {
                            return None;
                        }
                    }
                    // A DST gap can collapse distinct wall-clock times into
                    // one instant; skip collapsed duplicates to keep the
                    // sequence strictly increasing.
                    if self.last_fire_time.is_some_and(|last| fire <= last) {
                        if time.hour() == 23 && time.minute() == 59 && time.second() == 59 {
                            break;
                        }
                        floor = Some(time + TimeDelta::seconds(1));
                        continue;
                    }
                    self.last_fire_time = Some(fire);
                    return Some(fire);
                }
            }
            date = date.succ_opt()?;
            time_floor = None;
        }
        None
    }

    fn date_matches(&self, date: NaiveDate) -> bool {
        let last_of_month = days_in_month(date.year(), date.month());
        self.year.matches(date.year(), 0)
            && self.month.matches(date.month() as i32, 0)
            && self.day.matches(date.day() as i32, last_of_month)
            && self.week.matches(date.iso_week().week() as i32, 0)
            && self
                .day_of_week
                .matches(date.weekday().num_days_from_monday() as i32, 0)
    }

    /// Smallest matching wall-clock time on a date, at or after `floor`.
    fn next_time_on(&self, floor: Option<NaiveTime>) -> Option<NaiveTime> {
        let (floor_hour, floor_minute, floor_second) = match floor {
            Some(t) => (t.hour() as i32, t.minute() as i32, t.second() as i32),
            None => (0, 0, 0),
        };
        for hour in floor_hour..=23 {
            if !self.hour.matches(hour, 0) {
                continue;
            }
            let minute_floor = if hour == floor_hour { floor_minute } else { 0 };
            for minute in minute_floor..=59 {
                if !self.minute.matches(minute, 0) {
                    continue;
                }
                let second_floor = if hour == floor_hour && minute == floor_minute {
                    floor_second
                } else {
                    0
                };
                for second in second_floor..=59 {
                    if self.second.matches(second, 0) {
                        return NaiveTime::from_hms_opt(
                            hour as u32,
                            minute as u32,
                            second as u32,
                        );
                    }
                }
            }
        }
        None
    }
}

fn days_in_month(year: i32, month: u32) -> i32 {
    for day in (28..=31).rev() {
        if NaiveDate::from_ymd_opt(year, month, day).is_some() {
            return day as i32;
        }
    }
    28
}

fn ceil_to_second(dt: DateTime<Tz>) -> DateTime<Tz> {
    let subsec = dt.timestamp_subsec_nanos();
    if subsec == 0 {
        dt
    } else {
        dt - TimeDelta::nanoseconds(i64::from(subsec)) + TimeDelta::seconds(1)
    }
}

/// Builder for [`CronTrigger`]; `build` parses and validates every field.
#[derive(Debug, Clone)]
pub struct CronTriggerBuilder {
    year: Option<String>,
    month: Option<String>,
    day: Option<String>,
    week: Option<String>,
    day_of_week: Option<String>,
    hour: Option<String>,
    minute: Option<String>,
    second: Option<String>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    timezone: Tz,
}

impl CronTriggerBuilder {
    pub fn year(mut self, expr: impl Into<String>) -> Self {
        self.year = Some(expr.into());
        self
    }

    pub fn month(mut self, expr: impl Into<String>) -> Self {
        self.month = Some(expr.into());
        self
    }

    pub fn day(mut self, expr: impl Into<String>) -> Self {
        self.day = Some(expr.into());
        self
    }

    pub fn week(mut self, expr: impl Into<String>) -> Self {
        self.week = Some(expr.into());
        self
    }

    pub fn day_of_week(mut self, expr: impl Into<String>) -> Self {
        self.day_of_week = Some(expr.into());
        self
    }

    pub fn hour(mut self, expr: impl Into<String>) -> Self {
        self.hour = Some(expr.into());
        self
    }

    pub fn minute(mut self, expr: impl Into<String>) -> Self {
        self.minute = Some(expr.into());
        self
    }

    pub fn second(mut self, expr: impl Into<String>) -> Self {
        self.second = Some(expr.into());
        self
    }

    /// First instant the trigger may fire; defaults to construction time.
    pub fn start_time(mut self, start_time: DateTime<Utc>) -> Self {
        self.start_time = Some(start_time);
        self
    }

    pub fn end_time(mut self, end_time: DateTime<Utc>) -> Self {
        self.end_time = Some(end_time);
        self
    }

    pub fn build(self) -> Result<CronTrigger, TriggerError> {
        // Position in significance order; unset fields more significant than
        // the last explicitly-set one default to `*`, the rest to their
        // minimum. `week` and `day_of_week` always default to `*`.
        let specs = [
            &self.year,
            &self.month,
            &self.day,
            &self.week,
            &self.day_of_week,
            &self.hour,
            &self.minute,
            &self.second,
        ];
        let least_significant = specs.iter().rposition(|spec| spec.is_some());
        let resolve = |position: usize, kind: FieldKind| -> Result<CronField, TriggerError> {
            match specs[position] {
                Some(expr) => CronField::parse(kind, expr),
                None if matches!(kind, FieldKind::Week | FieldKind::DayOfWeek) => {
                    Ok(CronField::wildcard(kind))
                }
                None => Ok(match least_significant {
                    Some(least) if position > least => CronField::minimum(kind),
                    _ => CronField::wildcard(kind),
                }),
            }
        };
        let year = resolve(0, FieldKind::Year)?;
        let month = resolve(1, FieldKind::Month)?;
        let day = resolve(2, FieldKind::Day)?;
        let week = resolve(3, FieldKind::Week)?;
        let day_of_week = resolve(4, FieldKind::DayOfWeek)?;
        let hour = resolve(5, FieldKind::Hour)?;
        let minute = resolve(6, FieldKind::Minute)?;
        let second = resolve(7, FieldKind::Second)?;

        let start_time = self.start_time.unwrap_or_else(Utc::now);
        if let Some(end) = self.end_time {
            if end < start_time {
                return Err(TriggerError::invalid("end time precedes start time"));
            }
        }
        Ok(CronTrigger {
            year,
            month,
            day,
            week,
            day_of_week,
            hour,
            minute,
            second,
            timezone: self.timezone,
            start_time,
            end_time: self.end_time,
            last_fire_time: None,
        })
    }
}

//! Calendar-arithmetic trigger.

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeDelta, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use super::resolve_local;
use crate::errors::TriggerError;

/// Fires on calendar-arithmetic successors of a start date, at a fixed
/// wall-clock time in the trigger's timezone.
///
/// The date cursor advances by `years`/`months` anchored to the previous
/// fire's day of month; month steps that land on a nonexistent day
/// (January 31 + 1 month) are skipped to the next step. `weeks`/`days` are
/// then added as plain day arithmetic. Day-of-month values above 28 can
/// therefore skip months entirely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarIntervalTrigger {
    years: u32,
    months: u32,
    weeks: u32,
    days: u32,
    time: NaiveTime,
    start_date: NaiveDate,
    end_date: Option<NaiveDate>,
    timezone: Tz,
    #[serde(default)]
    last_fire_date: Option<NaiveDate>,
}

impl CalendarIntervalTrigger {
    /// Start building a calendar trigger anchored at `start_date` in
    /// `timezone`; the wall-clock fire time defaults to midnight.
    pub fn builder(start_date: NaiveDate, timezone: Tz) -> CalendarIntervalTriggerBuilder {
        CalendarIntervalTriggerBuilder {
            years: 0,
            months: 0,
            weeks: 0,
            days: 0,
            hour: 0,
            minute: 0,
            second: 0,
            start_date,
            end_date: None,
            timezone,
        }
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub(crate) fn next(&mut self) -> Option<DateTime<Utc>> {
        let next_date = match self.last_fire_date {
            None => self.start_date,
            Some(previous) => self.advance_date(previous),
        };
        if let Some(end) = self.end_date {
            if next_date > end {
                return None;
            }
        }
        let fire = resolve_local(self.timezone, next_date.and_time(self.time));
        self.last_fire_date = Some(next_date);
        Some(fire.with_timezone(&Utc))
    }

    /// Advance the date cursor by one interval, skipping month steps whose
    /// anchored day does not exist.
    fn advance_date(&self, previous: NaiveDate) -> NaiveDate {
        let mut year = previous.year();
        let mut month = previous.month() as i32;
        let date = loop {
            month += self.months as i32;
            year += self.years as i32 + (month - 1).div_euclid(12);
            month = (month - 1).rem_euclid(12) + 1;
            if let Some(date) = NaiveDate::from_ymd_opt(year, month as u32, previous.day()) {
                break date;
            }
            // Nonexistent day in the target month; take another step.
        };
        date + TimeDelta::days(i64::from(self.days) + i64::from(self.weeks) * 7)
    }
}

/// Builder for [`CalendarIntervalTrigger`]; `build` validates the rule.
#[derive(Debug, Clone)]
pub struct CalendarIntervalTriggerBuilder {
    years: u32,
    months: u32,
    weeks: u32,
    days: u32,
    hour: u32,
    minute: u32,
    second: u32,
    start_date: NaiveDate,
    end_date: Option<NaiveDate>,
    timezone: Tz,
}

impl CalendarIntervalTriggerBuilder {
    pub fn years(mut self, years: u32) -> Self {
        self.years = years;
        self
    }

    pub fn months(mut self, months: u32) -> Self {
        self.months = months;
        self
    }

    pub fn weeks(mut self, weeks: u32) -> Self {
        self.weeks = weeks;
        self
    }

    pub fn days(mut self, days: u32) -> Self {
        self.days = days;
        self
    }

    /// Wall-clock fire time in the trigger's timezone.
    pub fn at(mut self, hour: u32, minute: u32, second: u32) -> Self {
        self.hour = hour;
        self.minute = minute;
        self.second = second;
        self
    }

    pub fn end_date(mut self, end_date: NaiveDate) -> Self {
        self.end_date = Some(end_date);
        self
    }

    pub fn build(self) -> Result<CalendarIntervalTrigger, TriggerError> {
        if self.years == 0 && self.months == 0 && self.weeks == 0 && self.days == 0 {
            return Err(TriggerError::invalid("interval must be positive"));
        }
        if let Some(end) = self.end_date {
            if end < self.start_date {
                return Err(TriggerError::invalid("end date precedes start date"));
            }
        }
        let time = NaiveTime::from_hms_opt(self.hour, self.minute, self.second).ok_or_else(
            || {
                TriggerError::invalid(format!(
                    "invalid wall-clock time {:02}:{:02}:{:02}",
                    self.hour, self.minute, self.second
                ))
            },
        )?;
        Ok(CalendarIntervalTrigger {
            years: self.years,
            months: self.months,
            weeks: self.weeks,
            days: self.days,
            time,
            start_date: self.start_date,
            end_date: self.end_date,
            timezone: self.timezone,
            last_fire_date: None,
        })
    }
}

//! Recurrence rules producing lazy, restartable fire-time sequences.
//!
//! A trigger is a pure rule: given the same construction arguments and the
//! same advance state, `next()` always produces the same output, and a
//! trigger never rewinds. The advance state (last fire time, cached pending
//! times) is part of each variant's serialized fields, so a trigger restored
//! from storage resumes the exact remaining sequence.
//!
//! Variants:
//! - [`DateTrigger`] fires once at a fixed instant
//! - [`IntervalTrigger`] fires every fixed `Δ` from a start time
//! - [`CalendarIntervalTrigger`] fires on calendar arithmetic (months, years)
//!   at a fixed wall-clock time
//! - [`CronTrigger`] fires on wall-clock field matches
//! - [`AndTrigger`] fires where all children fire within a threshold
//! - [`OrTrigger`] fires on the merged sequence of its children

use chrono::{DateTime, LocalResult, NaiveDateTime, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::errors::TriggerError;

mod calendar;
mod combining;
pub mod cron;
mod date;
mod interval;

pub use calendar::{CalendarIntervalTrigger, CalendarIntervalTriggerBuilder};
pub use combining::{AndTrigger, OrTrigger};
pub use cron::{CronTrigger, CronTriggerBuilder};
pub use date::DateTrigger;
pub use interval::{IntervalTrigger, IntervalTriggerBuilder};

/// A recurrence rule together with its restartable advance state.
///
/// The serde tag doubles as the stable type discriminator for serializers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    Date(DateTrigger),
    Interval(IntervalTrigger),
    CalendarInterval(CalendarIntervalTrigger),
    Cron(CronTrigger),
    And(AndTrigger),
    Or(OrTrigger),
}

impl Trigger {
    /// Produce the next fire time, advancing the internal state.
    ///
    /// `Ok(None)` means the trigger is exhausted and will never fire again.
    /// Successive calls yield a strictly increasing sequence.
    pub fn next(&mut self) -> Result<Option<DateTime<Utc>>, TriggerError> {
        match self {
            Trigger::Date(t) => Ok(t.next()),
            Trigger::Interval(t) => Ok(t.next()),
            Trigger::CalendarInterval(t) => Ok(t.next()),
            Trigger::Cron(t) => Ok(t.next()),
            Trigger::And(t) => t.next(),
            Trigger::Or(t) => t.next(),
        }
    }
}

impl From<DateTrigger> for Trigger {
    fn from(t: DateTrigger) -> Self {
        Trigger::Date(t)
    }
}

impl From<IntervalTrigger> for Trigger {
    fn from(t: IntervalTrigger) -> Self {
        Trigger::Interval(t)
    }
}

impl From<CalendarIntervalTrigger> for Trigger {
    fn from(t: CalendarIntervalTrigger) -> Self {
        Trigger::CalendarInterval(t)
    }
}

impl From<CronTrigger> for Trigger {
    fn from(t: CronTrigger) -> Self {
        Trigger::Cron(t)
    }
}

impl From<AndTrigger> for Trigger {
    fn from(t: AndTrigger) -> Self {
        Trigger::And(t)
    }
}

impl From<OrTrigger> for Trigger {
    fn from(t: OrTrigger) -> Self {
        Trigger::Or(t)
    }
}

/// Map a wall-clock time to an instant in `tz`.
///
/// Ambiguous times (clocks rolled back) resolve to the earlier offset.
/// Nonexistent times (clocks jumped forward) resolve to the first valid
/// instant after the gap, probing in one-minute steps.
pub(crate) fn resolve_local(tz: Tz, naive: NaiveDateTime) -> DateTime<Tz> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt,
        LocalResult::Ambiguous(earliest, _) => earliest,
        LocalResult::None => {
            let mut probe = naive;
            loop {
                probe += TimeDelta::minutes(1);
                match tz.from_local_datetime(&probe) {
                    LocalResult::Single(dt) => return dt,
                    LocalResult::Ambiguous(earliest, _) => return earliest,
                    LocalResult::None => continue,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn naive(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    #[test]
    fn unambiguous_local_time_resolves_directly() {
        let tz = chrono_tz::Europe::Berlin;
        let resolved = resolve_local(tz, naive(2024, 6, 1, 12, 0, 0));
        assert_eq!(resolved.to_rfc3339(), "2024-06-01T12:00:00+02:00");
    }

    #[test]
    fn gap_time_skips_to_the_end_of_the_gap() {
        // Berlin jumps 02:00 -> 03:00 on 2024-03-31.
        let tz = chrono_tz::Europe::Berlin;
        let resolved = resolve_local(tz, naive(2024, 3, 31, 2, 30, 0));
        assert_eq!(resolved.to_rfc3339(), "2024-03-31T03:00:00+02:00");
    }

    #[test]
    fn ambiguous_time_resolves_to_the_earlier_offset() {
        // Berlin rolls 03:00 back to 02:00 on 2024-10-27; 02:30 happens twice.
        let tz = chrono_tz::Europe::Berlin;
        let resolved = resolve_local(tz, naive(2024, 10, 27, 2, 30, 0));
        assert_eq!(resolved.to_rfc3339(), "2024-10-27T02:30:00+02:00");
    }

    #[test]
    fn trigger_serialization_carries_a_type_tag() {
        let trigger = Trigger::from(DateTrigger::new(Utc::now()));
        let json = serde_json::to_value(&trigger).unwrap();
        assert_eq!(json["type"], "date");
    }
}

//! Boolean combinations of triggers.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use super::Trigger;
use crate::errors::TriggerError;

const DEFAULT_THRESHOLD_SECS: f64 = 1.0;
const DEFAULT_MAX_ITERATIONS: u32 = 10_000;

/// Fires where *all* children would fire within `threshold` seconds of each
/// other, yielding the earliest time of each aligned group.
///
/// The cached per-child pending times are the advance state: empty before
/// the first call, and containing `None` entries once any child has run dry
/// (which makes the whole trigger terminal).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AndTrigger {
    triggers: Vec<Trigger>,
    threshold: f64,
    max_iterations: u32,
    #[serde(default)]
    next_fire_times: Vec<Option<DateTime<Utc>>>,
}

impl AndTrigger {
    /// Combine triggers with the default threshold (1 s) and iteration bound
    /// (10 000).
    pub fn new(triggers: Vec<Trigger>) -> Result<Self, TriggerError> {
        Self::with_options(triggers, DEFAULT_THRESHOLD_SECS, DEFAULT_MAX_ITERATIONS)
    }

    /// Combine triggers with an explicit alignment threshold (seconds) and
    /// iteration bound.
    pub fn with_options(
        triggers: Vec<Trigger>,
        threshold: f64,
        max_iterations: u32,
    ) -> Result<Self, TriggerError> {
        if triggers.len() < 2 {
            return Err(TriggerError::invalid(
                "combining triggers require at least two children",
            ));
        }
        if !threshold.is_finite() || threshold < 0.0 {
            return Err(TriggerError::invalid("threshold must be non-negative"));
        }
        if max_iterations == 0 {
            return Err(TriggerError::invalid("max_iterations must be positive"));
        }
        Ok(Self {
            triggers,
            threshold,
            max_iterations,
            next_fire_times: Vec::new(),
        })
    }

    pub(crate) fn next(&mut self) -> Result<Option<DateTime<Utc>>, TriggerError> {
        if self.next_fire_times.is_empty() {
            self.next_fire_times = advance_all(&mut self.triggers)?;
        }
        let threshold = TimeDelta::microseconds((self.threshold * 1_000_000.0).round() as i64);

        for _ in 0..self.max_iterations {
            // Any exhausted child ends the whole intersection.
            let mut earliest: Option<DateTime<Utc>> = None;
            let mut latest: Option<DateTime<Utc>> = None;
            for pending in &self.next_fire_times {
                match pending {
                    None => return Ok(None),
                    Some(t) => {
                        earliest = Some(earliest.map_or(*t, |e| e.min(*t)));
                        latest = Some(latest.map_or(*t, |l| l.max(*t)));
                    }
                }
            }
            let (Some(earliest), Some(latest)) = (earliest, latest) else {
                return Ok(None);
            };

            if latest - earliest <= threshold {
                // The whole group fires as one; every child moves past it.
                self.next_fire_times = advance_all(&mut self.triggers)?;
                return Ok(Some(earliest));
            }

            // Let the laggards catch up.
            for index in 0..self.next_fire_times.len() {
                if self.next_fire_times[index] == Some(earliest) {
                    self.next_fire_times[index] = self.triggers[index].next()?;
                }
            }
        }
        Err(TriggerError::MaxIterationsReached(self.max_iterations))
    }
}

/// Fires on the chronological merge of all children, de-duplicating equal
/// timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrTrigger {
    triggers: Vec<Trigger>,
    #[serde(default)]
    next_fire_times: Vec<Option<DateTime<Utc>>>,
}

impl OrTrigger {
    pub fn new(triggers: Vec<Trigger>) -> Result<Self, TriggerError> {
        if triggers.len() < 2 {
            return Err(TriggerError::invalid(
                "combining triggers require at least two children",
            ));
        }
        Ok(Self {
            triggers,
            next_fire_times: Vec::new(),
        })
    }

    pub(crate) fn next(&mut self) -> Result<Option<DateTime<Utc>>, TriggerError> {
        if self.next_fire_times.is_empty() {
            self.next_fire_times = advance_all(&mut self.triggers)?;
        }
        let Some(earliest) = self.next_fire_times.iter().flatten().min().copied() else {
            return Ok(None);
        };
        // Advance every child sitting on the emitted time, which also
        // de-duplicates ties.
        for index in 0..self.next_fire_times.len() {
            if self.next_fire_times[index] == Some(earliest) {
                self.next_fire_times[index] = self.triggers[index].next()?;
            }
        }
        Ok(Some(earliest))
    }
}

fn advance_all(
    triggers: &mut [Trigger],
) -> Result<Vec<Option<DateTime<Utc>>>, TriggerError> {
    triggers.iter_mut().map(Trigger::next).collect()
}

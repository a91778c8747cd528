//! One-shot trigger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fires exactly once, at a fixed instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateTrigger {
    run_time: DateTime<Utc>,
    #[serde(default)]
    completed: bool,
}

impl DateTrigger {
    pub fn new(run_time: DateTime<Utc>) -> Self {
        Self {
            run_time,
            completed: false,
        }
    }

    pub fn run_time(&self) -> DateTime<Utc> {
        self.run_time
    }

    pub(crate) fn next(&mut self) -> Option<DateTime<Utc>> {
        if self.completed {
            None
        } else {
            self.completed = true;
            Some(self.run_time)
        }
    }
}

//! Typed scheduler events and subscription filters.
//!
//! Events are facts about what a node did, not commands. They flow through an
//! [`EventBroker`] with at-most-once delivery; the data store stays the only
//! source of truth, so a dropped event can delay a peer's wake-up but never
//! corrupt state.
//!
//! [`EventBroker`]: crate::brokers::EventBroker

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::JobOutcome;

/// A typed event with its wire metadata: when it happened and which node
/// caused it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerEvent {
    pub timestamp: DateTime<Utc>,
    /// Identity of the originating node.
    pub source: String,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl SchedulerEvent {
    pub fn new(source: impl Into<String>, kind: EventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            source: source.into(),
            kind,
        }
    }

    pub fn tag(&self) -> EventTag {
        self.kind.tag()
    }

    /// The id of the schedule or job this event is about, if any.
    pub fn entity_id(&self) -> Option<String> {
        self.kind.entity_id()
    }
}

/// Event payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    ScheduleAdded {
        schedule_id: String,
        next_fire_time: Option<DateTime<Utc>>,
    },
    ScheduleUpdated {
        schedule_id: String,
        next_fire_time: Option<DateTime<Utc>>,
    },
    ScheduleRemoved {
        schedule_id: String,
    },
    JobAdded {
        job_id: Uuid,
        task_id: String,
        schedule_id: Option<String>,
    },
    JobAcquired {
        job_id: Uuid,
        worker: String,
    },
    JobReleased {
        job_id: Uuid,
        outcome: JobOutcome,
    },
    JobSuccessful {
        job_id: Uuid,
        task_id: String,
        duration_ms: i64,
    },
    JobFailed {
        job_id: Uuid,
        task_id: String,
        exception: String,
    },
    /// A fire was dropped for lateness: either the scheduler skipped it
    /// before a job existed (`job_id` empty) or a worker picked the job up
    /// past its start deadline.
    JobDeadlineMissed {
        job_id: Option<Uuid>,
        schedule_id: Option<String>,
        scheduled_fire_time: DateTime<Utc>,
    },
    SchedulerStarted,
    SchedulerStopped,
}

impl EventKind {
    pub fn tag(&self) -> EventTag {
        match self {
            EventKind::ScheduleAdded { .. } => EventTag::ScheduleAdded,
            EventKind::ScheduleUpdated { .. } => EventTag::ScheduleUpdated,
            EventKind::ScheduleRemoved { .. } => EventTag::ScheduleRemoved,
            EventKind::JobAdded { .. } => EventTag::JobAdded,
            EventKind::JobAcquired { .. } => EventTag::JobAcquired,
            EventKind::JobReleased { .. } => EventTag::JobReleased,
            EventKind::JobSuccessful { .. } => EventTag::JobSuccessful,
            EventKind::JobFailed { .. } => EventTag::JobFailed,
            EventKind::JobDeadlineMissed { .. } => EventTag::JobDeadlineMissed,
            EventKind::SchedulerStarted => EventTag::SchedulerStarted,
            EventKind::SchedulerStopped => EventTag::SchedulerStopped,
        }
    }

    pub fn entity_id(&self) -> Option<String> {
        match self {
            EventKind::ScheduleAdded { schedule_id, .. }
            | EventKind::ScheduleUpdated { schedule_id, .. }
            | EventKind::ScheduleRemoved { schedule_id } => Some(schedule_id.clone()),
            EventKind::JobAdded { job_id, .. }
            | EventKind::JobAcquired { job_id, .. }
            | EventKind::JobReleased { job_id, .. }
            | EventKind::JobSuccessful { job_id, .. }
            | EventKind::JobFailed { job_id, .. } => Some(job_id.to_string()),
            EventKind::JobDeadlineMissed {
                job_id,
                schedule_id,
                ..
            } => job_id
                .map(|id| id.to_string())
                .or_else(|| schedule_id.clone()),
            EventKind::SchedulerStarted | EventKind::SchedulerStopped => None,
        }
    }
}

/// Discriminant-only view of [`EventKind`], used in subscription filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventTag {
    ScheduleAdded,
    ScheduleUpdated,
    ScheduleRemoved,
    JobAdded,
    JobAcquired,
    JobReleased,
    JobSuccessful,
    JobFailed,
    JobDeadlineMissed,
    SchedulerStarted,
    SchedulerStopped,
}

/// What a subscriber wants to see.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Accepted event kinds; `None` accepts every kind.
    pub kinds: Option<HashSet<EventTag>>,
    /// When set, only events about this schedule or job pass.
    pub entity_id: Option<String>,
}

impl EventFilter {
    /// Accept everything.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn for_kinds(kinds: impl IntoIterator<Item = EventTag>) -> Self {
        Self {
            kinds: Some(kinds.into_iter().collect()),
            entity_id: None,
        }
    }

    pub fn for_entity(
        kinds: impl IntoIterator<Item = EventTag>,
        entity_id: impl Into<String>,
    ) -> Self {
        Self {
            kinds: Some(kinds.into_iter().collect()),
            entity_id: Some(entity_id.into()),
        }
    }

    pub fn matches(&self, event: &SchedulerEvent) -> bool {
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.tag()) {
                return false;
            }
        }
        if let Some(entity_id) = &self.entity_id {
            if event.entity_id().as_deref() != Some(entity_id.as_str()) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_added(job_id: Uuid) -> SchedulerEvent {
        SchedulerEvent::new(
            "node-a",
            EventKind::JobAdded {
                job_id,
                task_id: "t1".into(),
                schedule_id: None,
            },
        )
    }

    #[test]
    fn events_serialize_with_a_kind_tag() {
        let event = SchedulerEvent::new("node-a", EventKind::SchedulerStarted);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "scheduler_started");
        assert_eq!(json["source"], "node-a");
    }

    #[test]
    fn events_roundtrip_through_json() {
        let events = vec![
            job_added(Uuid::new_v4()),
            SchedulerEvent::new(
                "node-a",
                EventKind::ScheduleUpdated {
                    schedule_id: "s1".into(),
                    next_fire_time: Some(Utc::now()),
                },
            ),
            SchedulerEvent::new(
                "node-a",
                EventKind::JobReleased {
                    job_id: Uuid::new_v4(),
                    outcome: JobOutcome::Success,
                },
            ),
            SchedulerEvent::new(
                "node-a",
                EventKind::JobDeadlineMissed {
                    job_id: None,
                    schedule_id: Some("s1".into()),
                    scheduled_fire_time: Utc::now(),
                },
            ),
        ];
        for event in events {
            let json = serde_json::to_string(&event).unwrap();
            let back: SchedulerEvent = serde_json::from_str(&json).unwrap();
            assert_eq!(event.tag(), back.tag());
            assert_eq!(event.entity_id(), back.entity_id());
        }
    }

    #[test]
    fn empty_filter_accepts_everything() {
        assert!(EventFilter::any().matches(&job_added(Uuid::new_v4())));
    }

    #[test]
    fn kind_filter_rejects_other_kinds() {
        let filter = EventFilter::for_kinds([EventTag::JobReleased]);
        assert!(!filter.matches(&job_added(Uuid::new_v4())));
    }

    #[test]
    fn entity_filter_matches_one_job() {
        let job_id = Uuid::new_v4();
        let filter = EventFilter::for_entity([EventTag::JobAdded], job_id.to_string());
        assert!(filter.matches(&job_added(job_id)));
        assert!(!filter.matches(&job_added(Uuid::new_v4())));
    }
}

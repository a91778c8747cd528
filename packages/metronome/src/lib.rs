//! # Metronome
//!
//! A persistent, distributed task scheduler: schedules bind recurrence
//! rules ([`Trigger`]s) to registered tasks, scheduler nodes materialize due
//! fires into jobs, and worker nodes execute them with at-least-once
//! semantics across a fleet.
//!
//! ## Architecture
//!
//! ```text
//! Scheduler (facade)
//!     │ add_task / add_schedule / add_job / run_job
//!     ▼
//! DataStore ── source of truth, atomic lease-based claims
//!     ▲                         ▲
//!     │ acquire_schedules       │ acquire_jobs
//! ScheduleLoop ─ add_job ─► WorkerLoop ─ release_job(result)
//!     │                         │
//!     └──────► EventBroker ◄────┘
//!        best-effort wake-ups and result waiting
//! ```
//!
//! ## Key invariants
//!
//! 1. **Triggers never rewind** - repeated `next()` is strictly increasing
//!    until exhaustion, and serialized advance state resumes the exact
//!    remaining sequence
//! 2. **The store is the only coordinator** - atomic acquisition with
//!    time-bounded leases; a lapsed lease reverts with no data change
//! 3. **One job per fire** - with N schedulers racing on a due schedule,
//!    exactly one advances it per fire time
//! 4. **Events are advisory** - at-most-once delivery; a dropped event can
//!    delay a wake-up but never corrupt state
//! 5. **Handler errors are data** - captured into the job result, never
//!    rethrown inside the worker loop
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use metronome::{
//!     ConflictPolicy, IntervalTrigger, LocalEventBroker, MemoryDataStore,
//!     Schedule, Scheduler, Task,
//! };
//!
//! let store = Arc::new(MemoryDataStore::new());
//! let broker = Arc::new(LocalEventBroker::new());
//! let scheduler = Scheduler::new(store, broker);
//!
//! scheduler.registry().register("tick", |invocation| async move {
//!     println!("tick at {:?}", invocation.scheduled_fire_time);
//!     Ok(serde_json::Value::Null)
//! });
//! scheduler.add_task(Task::new("clock", "tick"), ConflictPolicy::Fail).await?;
//!
//! let trigger = IntervalTrigger::builder(chrono::Utc::now()).minutes(5).build()?;
//! let schedule = Schedule::builder()
//!     .id("clock:5m")
//!     .task_id("clock")
//!     .trigger(trigger.into())
//!     .build();
//! scheduler.add_schedule(schedule, ConflictPolicy::Fail).await?;
//!
//! scheduler.start_in_background().await?;
//! scheduler.wait_until_stopped().await?;
//! ```

mod brokers;
mod errors;
mod events;
mod model;
mod registry;
mod retry;
mod scheduler;
mod serializers;
mod store;
mod triggers;

// Re-export error types
pub use errors::{BrokerError, SchedulerError, SerializationError, StoreError, TriggerError};

// Re-export entity models
pub use model::{CoalescePolicy, Job, JobOutcome, JobResult, Schedule, Task};

// Re-export the trigger kernel
pub use triggers::{
    AndTrigger, CalendarIntervalTrigger, CalendarIntervalTriggerBuilder, CronTrigger,
    CronTriggerBuilder, DateTrigger, IntervalTrigger, IntervalTriggerBuilder, OrTrigger, Trigger,
};

// Re-export cron field types for adapters that introspect expressions
pub use triggers::cron::{CronField, FieldExpr, FieldKind};

// Re-export serializer contract and implementations
pub use serializers::{pack, unpack, BinarySerializer, Envelope, JsonSerializer, Persistable, Serializer};

// Re-export event types
pub use events::{EventFilter, EventKind, EventTag, SchedulerEvent};

// Re-export broker contract and the in-process implementation
pub use brokers::{EventBroker, EventCallback, LocalEventBroker, SubscriptionHandle};

// Re-export store contract and the in-memory reference adapter
pub use store::{ConflictPolicy, DataStore, MemoryDataStore};

// Re-export the handler registry
pub use registry::{TaskInvocation, TaskRegistry};

// Re-export retry policy (part of SchedulerConfig)
pub use retry::RetryPolicy;

// Re-export the scheduler facade
pub use scheduler::{RunState, Scheduler, SchedulerConfig};

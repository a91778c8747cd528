//! Data store contract.
//!
//! The store is the single source of truth and the only cross-node
//! coordination primitive: `acquire_*` hands out time-bounded exclusive
//! claims, and every update to a single entity is serializable with respect
//! to other store operations on that entity.
//!
//! # Implementer notes
//!
//! - Claims must be atomic: `SELECT … FOR UPDATE SKIP LOCKED`, a conditional
//!   write on `acquired_until`, or a scripting primitive all qualify.
//! - A lease that lapses reverts the claim with no data change; `release_*`
//!   must therefore verify ownership and silently skip entities whose lease
//!   was lost to expiry.
//! - Timestamps keep microsecond precision and are never coerced across
//!   timezones; adapters persist entity payloads through a [`Serializer`].
//!
//! [`Serializer`]: crate::serializers::Serializer

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::errors::StoreError;
use crate::model::{Job, JobResult, Schedule, Task};

mod memory;

pub use memory::MemoryDataStore;

/// What to do when an insert collides with an existing id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Overwrite the existing entity.
    Replace,
    /// Keep the existing entity and return success.
    DoNothing,
    /// Fail with [`StoreError::Conflict`].
    #[default]
    Fail,
}

/// Transactional system of record for tasks, schedules, jobs, and results.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Prepare the backing storage: run schema migrations, create tables,
    /// verify connectivity. Called once before a node starts its loops.
    async fn initialize(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn add_task(&self, task: Task, conflict: ConflictPolicy) -> Result<(), StoreError>;

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, StoreError>;

    async fn get_tasks(&self) -> Result<Vec<Task>, StoreError>;

    /// Returns whether the task existed.
    async fn remove_task(&self, task_id: &str) -> Result<bool, StoreError>;

    async fn add_schedule(
        &self,
        schedule: Schedule,
        conflict: ConflictPolicy,
    ) -> Result<(), StoreError>;

    /// Read schedules, optionally restricted to the given ids.
    async fn get_schedules(&self, ids: Option<&[String]>) -> Result<Vec<Schedule>, StoreError>;

    async fn remove_schedules(&self, ids: &[String]) -> Result<(), StoreError>;

    /// Atomically claim up to `limit` due, unpaused, unleased schedules:
    /// stamp `acquired_by = scheduler_id` and `acquired_until = now + lease`
    /// and return them, ordered by `next_fire_time`.
    async fn acquire_schedules(
        &self,
        scheduler_id: &str,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<Schedule>, StoreError>;

    /// Write back processed schedules and clear their claims. A schedule
    /// whose `next_fire_time` is empty is terminal and gets deleted instead.
    /// Entities no longer leased by `scheduler_id` are skipped.
    async fn release_schedules(
        &self,
        scheduler_id: &str,
        schedules: Vec<Schedule>,
    ) -> Result<(), StoreError>;

    async fn add_job(&self, job: Job) -> Result<(), StoreError>;

    /// Read jobs, optionally restricted to the given ids.
    async fn get_jobs(&self, ids: Option<&[Uuid]>) -> Result<Vec<Job>, StoreError>;

    /// Atomically claim up to `limit` eligible, unleased jobs for a worker.
    /// Jobs of a task already running `max_running_jobs` instances are left
    /// for later.
    async fn acquire_jobs(
        &self,
        worker_id: &str,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError>;

    /// Heartbeat for a long-running job: re-stamp `acquired_until` iff the
    /// job is still held by `worker_id`.
    async fn extend_job_lease(
        &self,
        worker_id: &str,
        job_id: Uuid,
        lease: Duration,
    ) -> Result<(), StoreError>;

    /// Finalize a job: atomically write its result, delete the job, and
    /// start the result's TTL. Skipped if `worker_id` no longer holds the
    /// lease.
    async fn release_job(
        &self,
        worker_id: &str,
        job_id: Uuid,
        result: JobResult,
    ) -> Result<(), StoreError>;

    /// Read a job result, honoring its TTL.
    async fn get_job_result(&self, job_id: Uuid) -> Result<Option<JobResult>, StoreError>;

    /// Revert lapsed leases and drop expired results.
    async fn cleanup(&self) -> Result<(), StoreError>;
}

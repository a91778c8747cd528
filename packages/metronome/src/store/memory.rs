//! In-memory reference store.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{ConflictPolicy, DataStore};
use crate::errors::StoreError;
use crate::model::{Job, JobResult, Schedule, Task};

/// Reference implementation of [`DataStore`] for single-process deployments
/// and tests.
///
/// A single `RwLock` around all four tables makes every operation trivially
/// serializable; `acquire_*` is claim-then-stamp under the write lock, the
/// moral equivalent of `FOR UPDATE SKIP LOCKED`.
#[derive(Debug, Default)]
pub struct MemoryDataStore {
    inner: RwLock<Tables>,
}

#[derive(Debug, Default)]
struct Tables {
    tasks: HashMap<String, Task>,
    schedules: HashMap<String, Schedule>,
    jobs: HashMap<Uuid, Job>,
    results: HashMap<Uuid, JobResult>,
}

impl MemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lease_delta(lease: Duration) -> TimeDelta {
        TimeDelta::from_std(lease).unwrap_or_else(|_| TimeDelta::seconds(60))
    }

    /// Jobs currently leased per task, counting unexpired claims only.
    fn running_per_task(tables: &Tables, now: DateTime<Utc>) -> HashMap<String, u32> {
        let mut running: HashMap<String, u32> = HashMap::new();
        for job in tables.jobs.values() {
            if job.acquired_by.is_some() && job.acquired_until.is_some_and(|until| until > now) {
                *running.entry(job.task_id.clone()).or_default() += 1;
            }
        }
        running
    }
}

#[async_trait]
impl DataStore for MemoryDataStore {
    async fn add_task(&self, task: Task, conflict: ConflictPolicy) -> Result<(), StoreError> {
        let mut tables = self.inner.write().await;
        if tables.tasks.contains_key(&task.id) {
            match conflict {
                ConflictPolicy::Replace => {}
                ConflictPolicy::DoNothing => return Ok(()),
                ConflictPolicy::Fail => {
                    return Err(StoreError::Conflict { id: task.id });
                }
            }
        }
        tables.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        Ok(self.inner.read().await.tasks.get(task_id).cloned())
    }

    async fn get_tasks(&self) -> Result<Vec<Task>, StoreError> {
        let tables = self.inner.read().await;
        let mut tasks: Vec<Task> = tables.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tasks)
    }

    async fn remove_task(&self, task_id: &str) -> Result<bool, StoreError> {
        Ok(self.inner.write().await.tasks.remove(task_id).is_some())
    }

    async fn add_schedule(
        &self,
        schedule: Schedule,
        conflict: ConflictPolicy,
    ) -> Result<(), StoreError> {
        let mut tables = self.inner.write().await;
        if tables.schedules.contains_key(&schedule.id) {
            match conflict {
                ConflictPolicy::Replace => {}
                ConflictPolicy::DoNothing => return Ok(()),
                ConflictPolicy::Fail => {
                    return Err(StoreError::Conflict { id: schedule.id });
                }
            }
        }
        tables.schedules.insert(schedule.id.clone(), schedule);
        Ok(())
    }

    async fn get_schedules(&self, ids: Option<&[String]>) -> Result<Vec<Schedule>, StoreError> {
        let tables = self.inner.read().await;
        let mut schedules: Vec<Schedule> = match ids {
            Some(ids) => ids
                .iter()
                .filter_map(|id| tables.schedules.get(id).cloned())
                .collect(),
            None => tables.schedules.values().cloned().collect(),
        };
        schedules.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(schedules)
    }

    async fn remove_schedules(&self, ids: &[String]) -> Result<(), StoreError> {
        let mut tables = self.inner.write().await;
        for id in ids {
            tables.schedules.remove(id);
        }
        Ok(())
    }

    async fn acquire_schedules(
        &self,
        scheduler_id: &str,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<Schedule>, StoreError> {
        let now = Utc::now();
        let until = now + Self::lease_delta(lease);
        let mut tables = self.inner.write().await;

        let mut due: Vec<&String> = tables
            .schedules
            .values()
            .filter(|s| s.is_acquirable(now))
            .map(|s| &s.id)
            .collect();
        due.sort_by_key(|id| tables.schedules[*id].next_fire_time);
        let claimed: Vec<String> = due.into_iter().take(limit).cloned().collect();

        let mut acquired = Vec::with_capacity(claimed.len());
        for id in claimed {
            if let Some(schedule) = tables.schedules.get_mut(&id) {
                schedule.acquired_by = Some(scheduler_id.to_string());
                schedule.acquired_until = Some(until);
                acquired.push(schedule.clone());
            }
        }
        Ok(acquired)
    }

    async fn release_schedules(
        &self,
        scheduler_id: &str,
        schedules: Vec<Schedule>,
    ) -> Result<(), StoreError> {
        let mut tables = self.inner.write().await;
        for mut schedule in schedules {
            // A lapsed lease may have been claimed by someone else; their
            // copy wins and ours is dropped without a data change.
            let owned = tables
                .schedules
                .get(&schedule.id)
                .is_some_and(|current| current.acquired_by.as_deref() == Some(scheduler_id));
            if !owned {
                continue;
            }
            if schedule.next_fire_time.is_none() {
                tables.schedules.remove(&schedule.id);
            } else {
                schedule.acquired_by = None;
                schedule.acquired_until = None;
                tables.schedules.insert(schedule.id.clone(), schedule);
            }
        }
        Ok(())
    }

    async fn add_job(&self, job: Job) -> Result<(), StoreError> {
        self.inner.write().await.jobs.insert(job.id, job);
        Ok(())
    }

    async fn get_jobs(&self, ids: Option<&[Uuid]>) -> Result<Vec<Job>, StoreError> {
        let tables = self.inner.read().await;
        let mut jobs: Vec<Job> = match ids {
            Some(ids) => ids
                .iter()
                .filter_map(|id| tables.jobs.get(id).cloned())
                .collect(),
            None => tables.jobs.values().cloned().collect(),
        };
        jobs.sort_by_key(|job| (job.created_at, job.id));
        Ok(jobs)
    }

    async fn acquire_jobs(
        &self,
        worker_id: &str,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let now = Utc::now();
        let until = now + Self::lease_delta(lease);
        let mut tables = self.inner.write().await;
        let mut running = Self::running_per_task(&tables, now);
        let caps: HashMap<String, u32> = tables
            .tasks
            .values()
            .filter_map(|task| task.max_running_jobs.map(|cap| (task.id.clone(), cap)))
            .collect();

        let mut eligible: Vec<Uuid> = tables
            .jobs
            .values()
            .filter(|job| job.is_acquirable(now))
            .map(|job| job.id)
            .collect();
        eligible.sort_by_key(|id| {
            let job = &tables.jobs[id];
            (job.eligible_at(), job.created_at, job.id)
        });

        let mut acquired = Vec::new();
        for id in eligible {
            if acquired.len() >= limit {
                break;
            }
            let task_id = tables.jobs[&id].task_id.clone();
            if let Some(cap) = caps.get(&task_id) {
                if running.get(&task_id).copied().unwrap_or(0) >= *cap {
                    continue;
                }
            }
            if let Some(job) = tables.jobs.get_mut(&id) {
                job.acquired_by = Some(worker_id.to_string());
                job.acquired_until = Some(until);
                job.started_at = Some(now);
                acquired.push(job.clone());
                *running.entry(task_id).or_default() += 1;
            }
        }
        Ok(acquired)
    }

    async fn extend_job_lease(
        &self,
        worker_id: &str,
        job_id: Uuid,
        lease: Duration,
    ) -> Result<(), StoreError> {
        let until = Utc::now() + Self::lease_delta(lease);
        let mut tables = self.inner.write().await;
        if let Some(job) = tables.jobs.get_mut(&job_id) {
            if job.acquired_by.as_deref() == Some(worker_id) {
                job.acquired_until = Some(until);
            }
        }
        Ok(())
    }

    async fn release_job(
        &self,
        worker_id: &str,
        job_id: Uuid,
        result: JobResult,
    ) -> Result<(), StoreError> {
        let mut tables = self.inner.write().await;
        let owned = tables
            .jobs
            .get(&job_id)
            .is_some_and(|job| job.acquired_by.as_deref() == Some(worker_id));
        if !owned {
            return Ok(());
        }
        tables.jobs.remove(&job_id);
        tables.results.insert(job_id, result);
        Ok(())
    }

    async fn get_job_result(&self, job_id: Uuid) -> Result<Option<JobResult>, StoreError> {
        let now = Utc::now();
        let tables = self.inner.read().await;
        Ok(tables
            .results
            .get(&job_id)
            .filter(|result| !result.is_expired(now))
            .cloned())
    }

    async fn cleanup(&self) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut tables = self.inner.write().await;
        for schedule in tables.schedules.values_mut() {
            if schedule.acquired_until.is_some_and(|until| until <= now) {
                schedule.acquired_by = None;
                schedule.acquired_until = None;
            }
        }
        for job in tables.jobs.values_mut() {
            if job.acquired_until.is_some_and(|until| until <= now) {
                job.acquired_by = None;
                job.acquired_until = None;
                job.started_at = None;
            }
        }
        tables.results.retain(|_, result| !result.is_expired(now));
        Ok(())
    }
}

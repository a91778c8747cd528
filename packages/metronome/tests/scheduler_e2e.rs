//! End-to-end scheduler behavior on the in-memory store and local broker:
//! dispatch, coalescing, misfires, exclusivity across nodes, pause/unpause,
//! result waiting, and fatal-error shutdown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use metronome::{
    CoalescePolicy, ConflictPolicy, DataStore, DateTrigger, EventBroker, EventCallback,
    EventFilter, EventTag, IntervalTrigger, Job, JobOutcome, JobResult, LocalEventBroker,
    MemoryDataStore, Schedule, Scheduler, SchedulerConfig, SchedulerError, StoreError, Task,
    Trigger,
};
use uuid::Uuid;

const POLL: Duration = Duration::from_millis(25);

fn config(identity: &str, process_schedules: bool, process_jobs: bool) -> SchedulerConfig {
    SchedulerConfig::builder()
        .identity(identity.to_string())
        .process_schedules(process_schedules)
        .process_jobs(process_jobs)
        .max_poll_interval(Duration::from_millis(200))
        .min_poll_interval(Duration::from_millis(20))
        .cleanup_interval(Duration::from_millis(200))
        .schedule_lease(Duration::from_secs(5))
        .job_lease(Duration::from_secs(5))
        .build()
}

fn node(
    store: &Arc<MemoryDataStore>,
    broker: &Arc<LocalEventBroker>,
    identity: &str,
    process_schedules: bool,
    process_jobs: bool,
) -> Scheduler {
    Scheduler::with_config(
        store.clone(),
        broker.clone(),
        config(identity, process_schedules, process_jobs),
    )
}

/// Wait until the store holds no schedules (the backlog drained and every
/// trigger exhausted), or the timeout lapses.
async fn schedules_drained(store: &MemoryDataStore, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if store.get_schedules(None).await.unwrap().is_empty() {
            return true;
        }
        tokio::time::sleep(POLL).await;
    }
    false
}

async fn job_count_reaches(store: &MemoryDataStore, count: usize, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if store.get_jobs(None).await.unwrap().len() >= count {
            return true;
        }
        tokio::time::sleep(POLL).await;
    }
    false
}

async fn counter_reaches(counter: &AtomicUsize, count: usize, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if counter.load(Ordering::SeqCst) >= count {
            return true;
        }
        tokio::time::sleep(POLL).await;
    }
    false
}

#[tokio::test]
async fn run_job_returns_the_handler_value() {
    let store = Arc::new(MemoryDataStore::new());
    let broker = Arc::new(LocalEventBroker::new());
    let scheduler = node(&store, &broker, "node-a", true, true);

    scheduler
        .registry()
        .register("echo", |invocation| async move { Ok(invocation.args) });
    scheduler
        .add_task(Task::new("echo-task", "echo"), ConflictPolicy::Fail)
        .await
        .unwrap();
    scheduler.start_in_background().await.unwrap();

    let value = scheduler
        .run_job("echo-task", serde_json::json!({"n": 41}))
        .await
        .unwrap();
    assert_eq!(value, serde_json::json!({"n": 41}));

    scheduler.stop().await.unwrap();
}

#[tokio::test]
async fn run_job_surfaces_handler_errors_without_killing_the_worker() {
    let store = Arc::new(MemoryDataStore::new());
    let broker = Arc::new(LocalEventBroker::new());
    let scheduler = node(&store, &broker, "node-a", true, true);

    scheduler
        .registry()
        .register("explode", |_invocation| async move {
            Err(anyhow!("payload was cursed"))
        });
    scheduler
        .registry()
        .register("echo", |invocation| async move { Ok(invocation.args) });
    scheduler
        .add_task(Task::new("boom", "explode"), ConflictPolicy::Fail)
        .await
        .unwrap();
    scheduler
        .add_task(Task::new("echo-task", "echo"), ConflictPolicy::Fail)
        .await
        .unwrap();
    scheduler.start_in_background().await.unwrap();

    let err = scheduler
        .run_job("boom", serde_json::Value::Null)
        .await
        .unwrap_err();
    match err {
        SchedulerError::JobFailed { task_id, exception } => {
            assert_eq!(task_id, "boom");
            assert!(exception.contains("cursed"));
        }
        other => panic!("expected JobFailed, got {other:?}"),
    }

    // The worker survived and keeps executing.
    let value = scheduler
        .run_job("echo-task", serde_json::json!(1))
        .await
        .unwrap();
    assert_eq!(value, serde_json::json!(1));

    scheduler.stop().await.unwrap();
}

#[tokio::test]
async fn interval_schedule_executes_every_fire() {
    let store = Arc::new(MemoryDataStore::new());
    let broker = Arc::new(LocalEventBroker::new());
    let scheduler = node(&store, &broker, "node-a", true, true);

    let seen: Arc<Mutex<Vec<Option<DateTime<Utc>>>>> = Arc::new(Mutex::new(Vec::new()));
    let executed = Arc::new(AtomicUsize::new(0));
    let sink = seen.clone();
    let tally = executed.clone();
    scheduler.registry().register("record", move |invocation| {
        let sink = sink.clone();
        let tally = tally.clone();
        async move {
            sink.lock().unwrap().push(invocation.scheduled_fire_time);
            tally.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::Value::Null)
        }
    });
    scheduler
        .add_task(Task::new("recorder", "record"), ConflictPolicy::Fail)
        .await
        .unwrap();

    let start = Utc::now();
    let trigger = IntervalTrigger::builder(start)
        .microseconds(250_000)
        .end_time(start + TimeDelta::milliseconds(600))
        .build()
        .unwrap();
    let schedule = Schedule::builder()
        .id("rec")
        .task_id("recorder")
        .trigger(Trigger::from(trigger))
        .coalesce(CoalescePolicy::All)
        .build();
    scheduler.start_in_background().await.unwrap();
    scheduler
        .add_schedule(schedule, ConflictPolicy::Fail)
        .await
        .unwrap();

    // Fires at start, +250ms, +500ms; the schedule then exhausts.
    assert!(
        schedules_drained(&store, Duration::from_secs(5)).await,
        "schedule should exhaust and be deleted"
    );
    assert!(
        counter_reaches(&executed, 3, Duration::from_secs(5)).await,
        "all three fires should execute"
    );
    scheduler.stop().await.unwrap();

    // Jobs are created in fire-time order; executions of separate claims may
    // interleave, so compare the sorted set.
    let mut fire_times = seen.lock().unwrap().clone();
    fire_times.sort();
    let expected: Vec<Option<DateTime<Utc>>> = (0..3)
        .map(|k| Some(start + TimeDelta::microseconds(250_000 * k)))
        .collect();
    assert_eq!(fire_times, expected);
}

#[tokio::test]
async fn exactly_one_of_two_schedulers_materializes_each_fire() {
    let store = Arc::new(MemoryDataStore::new());
    let broker = Arc::new(LocalEventBroker::new());
    // Two scheduling nodes, no workers: jobs pile up for counting.
    let node_a = node(&store, &broker, "node-a", true, false);
    let node_b = node(&store, &broker, "node-b", true, false);

    store
        .add_task(Task::new("tick", "tick"), ConflictPolicy::Fail)
        .await
        .unwrap();

    let start = Utc::now();
    let trigger = IntervalTrigger::builder(start)
        .microseconds(500_000)
        .end_time(start + TimeDelta::milliseconds(1_600))
        .build()
        .unwrap();
    let schedule = Schedule::builder()
        .id("contended")
        .task_id("tick")
        .trigger(Trigger::from(trigger))
        .coalesce(CoalescePolicy::All)
        .build();

    node_a.start_in_background().await.unwrap();
    node_b.start_in_background().await.unwrap();
    node_a
        .add_schedule(schedule, ConflictPolicy::Fail)
        .await
        .unwrap();

    // Fires at +0, +500ms, +1000ms, +1500ms, then exhausts.
    assert!(
        schedules_drained(&store, Duration::from_secs(6)).await,
        "schedule should exhaust"
    );
    node_a.stop().await.unwrap();
    node_b.stop().await.unwrap();

    let jobs = store.get_jobs(None).await.unwrap();
    assert_eq!(jobs.len(), 4, "each fire becomes exactly one job");
    let mut fire_times: Vec<_> = jobs
        .iter()
        .map(|job| job.scheduled_fire_time.unwrap())
        .collect();
    fire_times.sort();
    fire_times.dedup();
    assert_eq!(fire_times.len(), 4, "no fire was materialized twice");
}

#[tokio::test]
async fn coalescing_controls_how_missed_fires_become_jobs() {
    for (coalesce, expected_jobs) in [
        (CoalescePolicy::All, 4usize),
        (CoalescePolicy::Latest, 1),
        (CoalescePolicy::Earliest, 1),
    ] {
        let store = Arc::new(MemoryDataStore::new());
        let broker = Arc::new(LocalEventBroker::new());
        let scheduler = node(&store, &broker, "node-a", true, false);
        store
            .add_task(Task::new("tick", "tick"), ConflictPolicy::Fail)
            .await
            .unwrap();

        // A schedule that has been due for a while: four fires in the past.
        let start = Utc::now() - TimeDelta::seconds(10);
        let trigger = IntervalTrigger::builder(start)
            .seconds(1)
            .end_time(start + TimeDelta::seconds(3))
            .build()
            .unwrap();
        let schedule = Schedule::builder()
            .id("backlog")
            .task_id("tick")
            .trigger(Trigger::from(trigger))
            .coalesce(coalesce)
            .build();

        scheduler.start_in_background().await.unwrap();
        scheduler
            .add_schedule(schedule, ConflictPolicy::Fail)
            .await
            .unwrap();

        assert!(
            schedules_drained(&store, Duration::from_secs(5)).await,
            "backlogged schedule should drain and exhaust ({coalesce:?})"
        );
        scheduler.stop().await.unwrap();

        let jobs = store.get_jobs(None).await.unwrap();
        assert_eq!(jobs.len(), expected_jobs, "{coalesce:?}");
        let fire_times: Vec<_> = jobs
            .iter()
            .map(|job| job.scheduled_fire_time.unwrap())
            .collect();
        match coalesce {
            CoalescePolicy::All => {
                let expected: Vec<_> =
                    (0..4).map(|k| start + TimeDelta::seconds(k)).collect();
                let mut sorted = fire_times.clone();
                sorted.sort();
                assert_eq!(sorted, expected);
            }
            CoalescePolicy::Latest => {
                assert_eq!(fire_times, vec![start + TimeDelta::seconds(3)]);
            }
            CoalescePolicy::Earliest => {
                assert_eq!(fire_times, vec![start]);
            }
        }
    }
}

#[tokio::test]
async fn misfire_grace_drops_stale_fires_with_events() {
    let store = Arc::new(MemoryDataStore::new());
    let broker = Arc::new(LocalEventBroker::new());
    let scheduler = node(&store, &broker, "node-a", true, false);
    store
        .add_task(Task::new("tick", "tick"), ConflictPolicy::Fail)
        .await
        .unwrap();

    let missed = Arc::new(AtomicUsize::new(0));
    let counter = missed.clone();
    let callback: EventCallback = Arc::new(move |_event| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    broker
        .subscribe(
            EventFilter::for_kinds([EventTag::JobDeadlineMissed]),
            callback,
        )
        .await
        .unwrap();

    let start = Utc::now() - TimeDelta::seconds(30);
    let trigger = IntervalTrigger::builder(start)
        .seconds(1)
        .end_time(start + TimeDelta::seconds(3))
        .build()
        .unwrap();
    let schedule = Schedule::builder()
        .id("stale")
        .task_id("tick")
        .trigger(Trigger::from(trigger))
        .coalesce(CoalescePolicy::All)
        .misfire_grace_ms(500i64)
        .build();

    scheduler.start_in_background().await.unwrap();
    scheduler
        .add_schedule(schedule, ConflictPolicy::Fail)
        .await
        .unwrap();

    assert!(schedules_drained(&store, Duration::from_secs(5)).await);
    assert!(
        counter_reaches(&missed, 4, Duration::from_secs(2)).await,
        "every stale fire should emit a deadline-missed event"
    );
    scheduler.stop().await.unwrap();

    assert!(store.get_jobs(None).await.unwrap().is_empty());
    assert_eq!(missed.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn paused_schedules_do_not_materialize_until_unpaused() {
    let store = Arc::new(MemoryDataStore::new());
    let broker = Arc::new(LocalEventBroker::new());
    let scheduler = node(&store, &broker, "node-a", true, false);
    store
        .add_task(Task::new("tick", "tick"), ConflictPolicy::Fail)
        .await
        .unwrap();

    let fire_time = Utc::now() - TimeDelta::seconds(1);
    let schedule = Schedule::builder()
        .id("dormant")
        .task_id("tick")
        .trigger(Trigger::from(DateTrigger::new(fire_time)))
        .paused(true)
        .build();

    scheduler.start_in_background().await.unwrap();
    scheduler
        .add_schedule(schedule, ConflictPolicy::Fail)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(store.get_jobs(None).await.unwrap().is_empty());
    assert_eq!(store.get_schedules(None).await.unwrap().len(), 1);

    scheduler.unpause_schedule("dormant").await.unwrap();
    assert!(
        job_count_reaches(&store, 1, Duration::from_secs(5)).await,
        "unpausing should release the pending fire"
    );
    scheduler.stop().await.unwrap();
}

#[tokio::test]
async fn per_task_capacity_serializes_executions() {
    let store = Arc::new(MemoryDataStore::new());
    let broker = Arc::new(LocalEventBroker::new());
    let scheduler = node(&store, &broker, "node-a", true, true);

    let spans: Arc<Mutex<Vec<(DateTime<Utc>, DateTime<Utc>)>>> =
        Arc::new(Mutex::new(Vec::new()));
    let sink = spans.clone();
    scheduler.registry().register("slow", move |_invocation| {
        let sink = sink.clone();
        async move {
            let started = Utc::now();
            tokio::time::sleep(Duration::from_millis(300)).await;
            sink.lock().unwrap().push((started, Utc::now()));
            Ok(serde_json::Value::Null)
        }
    });
    scheduler
        .add_task(
            Task::builder()
                .id("serial")
                .func_reference("slow")
                .max_running_jobs(1u32)
                .build(),
            ConflictPolicy::Fail,
        )
        .await
        .unwrap();
    scheduler.start_in_background().await.unwrap();

    let first = scheduler.run_job("serial", serde_json::Value::Null);
    let second = scheduler.run_job("serial", serde_json::Value::Null);
    let (first, second) = tokio::join!(first, second);
    first.unwrap();
    second.unwrap();
    scheduler.stop().await.unwrap();

    let spans = spans.lock().unwrap().clone();
    assert_eq!(spans.len(), 2);
    let (a, b) = (spans[0], spans[1]);
    let overlap = a.0 < b.1 && b.0 < a.1;
    assert!(!overlap, "capacity 1 must serialize executions: {a:?} vs {b:?}");
}

#[tokio::test]
async fn deadline_passed_at_pickup_finalizes_as_missed() {
    let store = Arc::new(MemoryDataStore::new());
    let broker = Arc::new(LocalEventBroker::new());
    let scheduler = node(&store, &broker, "node-a", false, true);
    store
        .add_task(Task::new("tick", "tick"), ConflictPolicy::Fail)
        .await
        .unwrap();

    let mut job = Job::one_shot("tick", serde_json::Value::Null);
    job.scheduled_fire_time = Some(Utc::now() - TimeDelta::seconds(10));
    job.start_deadline = Some(Utc::now() - TimeDelta::seconds(5));
    let job_id = job.id;
    store.add_job(job).await.unwrap();

    scheduler.start_in_background().await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut outcome = None;
    while tokio::time::Instant::now() < deadline {
        if let Some(result) = store.get_job_result(job_id).await.unwrap() {
            outcome = Some(result.outcome);
            break;
        }
        tokio::time::sleep(POLL).await;
    }
    scheduler.stop().await.unwrap();
    assert_eq!(outcome, Some(JobOutcome::MissedDeadline));
}

#[tokio::test]
async fn broken_trigger_removes_the_schedule_without_jobs() {
    let store = Arc::new(MemoryDataStore::new());
    let broker = Arc::new(LocalEventBroker::new());
    let scheduler = node(&store, &broker, "node-a", true, false);
    store
        .add_task(Task::new("tick", "tick"), ConflictPolicy::Fail)
        .await
        .unwrap();

    // An intersection that can never align: the first advance errors out.
    let start = Utc::now() - TimeDelta::seconds(5);
    let broken = metronome::AndTrigger::new(vec![
        IntervalTrigger::builder(start).seconds(4).build().unwrap().into(),
        IntervalTrigger::builder(start + TimeDelta::seconds(2))
            .seconds(4)
            .build()
            .unwrap()
            .into(),
    ])
    .unwrap();
    let schedule = Schedule::builder()
        .id("doomed")
        .task_id("tick")
        .trigger(Trigger::from(broken))
        .next_fire_time(start)
        .build();
    // Bypass the facade: it would trip over the trigger at add time.
    store
        .add_schedule(schedule, ConflictPolicy::Fail)
        .await
        .unwrap();

    scheduler.start_in_background().await.unwrap();
    assert!(
        schedules_drained(&store, Duration::from_secs(5)).await,
        "a schedule whose trigger fails should be removed"
    );
    scheduler.stop().await.unwrap();
    assert!(store.get_jobs(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn get_job_result_distinguishes_pending_from_unknown() {
    let store = Arc::new(MemoryDataStore::new());
    let broker = Arc::new(LocalEventBroker::new());
    let scheduler = node(&store, &broker, "node-a", false, false);
    store
        .add_task(Task::new("tick", "tick"), ConflictPolicy::Fail)
        .await
        .unwrap();

    let unknown = scheduler.get_job_result(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(unknown, SchedulerError::JobLookup(_)));

    let job_id = scheduler
        .add_job(Job::one_shot("tick", serde_json::Value::Null))
        .await
        .unwrap();
    let pending = scheduler.get_job_result(job_id).await.unwrap_err();
    assert!(matches!(pending, SchedulerError::JobResultNotReady(_)));
}

/// A store whose every operation fails fatally.
#[derive(Debug, Default)]
struct BrokenStore;

#[async_trait]
impl DataStore for BrokenStore {
    async fn add_task(&self, _: Task, _: ConflictPolicy) -> Result<(), StoreError> {
        Err(StoreError::Fatal(anyhow!("disk on fire")))
    }
    async fn get_task(&self, _: &str) -> Result<Option<Task>, StoreError> {
        Err(StoreError::Fatal(anyhow!("disk on fire")))
    }
    async fn get_tasks(&self) -> Result<Vec<Task>, StoreError> {
        Err(StoreError::Fatal(anyhow!("disk on fire")))
    }
    async fn remove_task(&self, _: &str) -> Result<bool, StoreError> {
        Err(StoreError::Fatal(anyhow!("disk on fire")))
    }
    async fn add_schedule(&self, _: Schedule, _: ConflictPolicy) -> Result<(), StoreError> {
        Err(StoreError::Fatal(anyhow!("disk on fire")))
    }
    async fn get_schedules(&self, _: Option<&[String]>) -> Result<Vec<Schedule>, StoreError> {
        Err(StoreError::Fatal(anyhow!("disk on fire")))
    }
    async fn remove_schedules(&self, _: &[String]) -> Result<(), StoreError> {
        Err(StoreError::Fatal(anyhow!("disk on fire")))
    }
    async fn acquire_schedules(
        &self,
        _: &str,
        _: Duration,
        _: usize,
    ) -> Result<Vec<Schedule>, StoreError> {
        Err(StoreError::Fatal(anyhow!("disk on fire")))
    }
    async fn release_schedules(&self, _: &str, _: Vec<Schedule>) -> Result<(), StoreError> {
        Err(StoreError::Fatal(anyhow!("disk on fire")))
    }
    async fn add_job(&self, _: Job) -> Result<(), StoreError> {
        Err(StoreError::Fatal(anyhow!("disk on fire")))
    }
    async fn get_jobs(&self, _: Option<&[Uuid]>) -> Result<Vec<Job>, StoreError> {
        Err(StoreError::Fatal(anyhow!("disk on fire")))
    }
    async fn acquire_jobs(&self, _: &str, _: Duration, _: usize) -> Result<Vec<Job>, StoreError> {
        Err(StoreError::Fatal(anyhow!("disk on fire")))
    }
    async fn extend_job_lease(&self, _: &str, _: Uuid, _: Duration) -> Result<(), StoreError> {
        Err(StoreError::Fatal(anyhow!("disk on fire")))
    }
    async fn release_job(&self, _: &str, _: Uuid, _: JobResult) -> Result<(), StoreError> {
        Err(StoreError::Fatal(anyhow!("disk on fire")))
    }
    async fn get_job_result(&self, _: Uuid) -> Result<Option<JobResult>, StoreError> {
        Err(StoreError::Fatal(anyhow!("disk on fire")))
    }
    async fn cleanup(&self) -> Result<(), StoreError> {
        Err(StoreError::Fatal(anyhow!("disk on fire")))
    }
}

#[tokio::test]
async fn fatal_store_errors_stop_the_node_and_surface() {
    let broker = Arc::new(LocalEventBroker::new());
    let scheduler = Scheduler::with_config(
        Arc::new(BrokenStore),
        broker,
        config("node-a", true, false),
    );

    scheduler.start_in_background().await.unwrap();
    let err = scheduler.wait_until_stopped().await.unwrap_err();
    match err {
        SchedulerError::Fatal(message) => assert!(message.contains("disk on fire")),
        other => panic!("expected Fatal, got {other:?}"),
    }
    assert_eq!(scheduler.state(), metronome::RunState::Stopped);
}

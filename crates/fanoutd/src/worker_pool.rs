//! Bounded-parallelism dispatcher: pulls work units, hands them to an
//! agent worker on background threads, and persists every lifecycle
//! transition.
//!
//! One mutex guards the active set and the capacity check. It is never
//! held across the runner invocation; worker threads only retake it to
//! remove themselves when they finish.

use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;

use fanout_agents::stream::session_id_from_init;
use fanout_agents::types::{ExecuteRequest, ExecutionHooks, UnitOutcome, UnitWorker};
use fanout_core::state::{StateMachineError, UnitStatus, WorkerState};
use fanout_core::types::{JobId, LogLevel, WorkUnit, WorkerId, WorkerRecord};

use crate::job_log::JobLogger;
use crate::persistence::{SqliteStore, StoreError};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    State(#[from] StateMachineError),
}

/// Callback invoked with the finished unit and its outcome. The unit
/// is mutable so a failure callback can flip it back to `pending` for
/// a retry before the pool persists it.
pub type UnitCallback = Arc<dyn Fn(&mut WorkUnit, &UnitOutcome) + Send + Sync>;

struct PoolShared {
    active: Mutex<HashSet<WorkerId>>,
    spawned: Mutex<Vec<WorkerId>>,
    running: AtomicBool,
}

/// Bounded worker pool for one job.
pub struct WorkerPool {
    job_id: JobId,
    worker: Arc<dyn UnitWorker>,
    store: Arc<SqliteStore>,
    max_workers: usize,
    unit_timeout: Duration,
    on_unit_complete: Option<UnitCallback>,
    on_unit_failed: Option<UnitCallback>,
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    pub fn new(
        job_id: JobId,
        worker: Arc<dyn UnitWorker>,
        store: Arc<SqliteStore>,
        max_workers: usize,
        unit_timeout: Duration,
        on_unit_complete: Option<UnitCallback>,
        on_unit_failed: Option<UnitCallback>,
    ) -> Self {
        Self {
            job_id,
            worker,
            store,
            max_workers: max_workers.max(1),
            unit_timeout,
            on_unit_complete,
            on_unit_failed,
            shared: Arc::new(PoolShared {
                active: Mutex::new(HashSet::new()),
                spawned: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
            }),
        }
    }

    pub fn start(&self) {
        self.shared.running.store(true, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn active_count(&self) -> usize {
        self.shared.active.lock().map(|set| set.len()).unwrap_or(0)
    }

    /// Submit a unit for execution. Returns `false` when the pool is
    /// at capacity or stopped; the unit is untouched in that case.
    pub fn submit(&self, mut unit: WorkUnit, prompt_template: &str) -> Result<bool, PoolError> {
        if !self.is_running() {
            return Ok(false);
        }

        let worker_record = {
            let mut active = self
                .shared
                .active
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if active.len() >= self.max_workers {
                return Ok(false);
            }

            let worker_record = WorkerRecord::busy(
                self.job_id.clone(),
                unit.unit_id.clone(),
                std::process::id(),
            );

            unit.transition_to(UnitStatus::Assigned)?;
            unit.worker_id = Some(worker_record.worker_id.clone());
            unit.assigned_at = Some(Utc::now());

            self.store.create_worker(&worker_record)?;
            self.store.update_work_unit(&unit)?;

            active.insert(worker_record.worker_id.clone());
            self.shared
                .spawned
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(worker_record.worker_id.clone());
            worker_record
        };

        let worker = Arc::clone(&self.worker);
        let store = Arc::clone(&self.store);
        let shared = Arc::clone(&self.shared);
        let on_complete = self.on_unit_complete.clone();
        let on_failed = self.on_unit_failed.clone();
        let job_id = self.job_id.clone();
        let prompt = prompt_template.to_string();
        let timeout = self.unit_timeout;

        thread::spawn(move || {
            run_unit(
                worker,
                store,
                shared,
                job_id,
                worker_record,
                unit,
                prompt,
                timeout,
                on_complete,
                on_failed,
            );
        });

        Ok(true)
    }

    /// Block until a submit would succeed, the timeout elapses, or the
    /// pool is stopped.
    pub fn wait_for_available_slot(&self, timeout: Option<Duration>) -> bool {
        let started = Instant::now();
        loop {
            if !self.is_running() {
                return false;
            }
            if self.active_count() < self.max_workers {
                return true;
            }
            if let Some(timeout) = timeout {
                if started.elapsed() >= timeout {
                    return false;
                }
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Block until every in-flight task has drained.
    pub fn wait_for_completion(&self) {
        while self.active_count() > 0 {
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Refuse new submissions, drain in-flight work, and mark every
    /// worker this pool ever spawned as terminated.
    pub fn stop(&self) -> Result<(), StoreError> {
        self.shared.running.store(false, Ordering::SeqCst);
        self.wait_for_completion();

        let spawned = self
            .shared
            .spawned
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for worker_id in spawned {
            if let Some(mut worker) = self.store.get_worker(&worker_id)? {
                if worker.status != WorkerState::Terminated {
                    worker.status = WorkerState::Terminated;
                    self.store.update_worker(&worker)?;
                }
            }
        }
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
fn run_unit(
    worker: Arc<dyn UnitWorker>,
    store: Arc<SqliteStore>,
    shared: Arc<PoolShared>,
    job_id: JobId,
    mut worker_record: WorkerRecord,
    mut unit: WorkUnit,
    prompt_template: String,
    timeout: Duration,
    on_complete: Option<UnitCallback>,
    on_failed: Option<UnitCallback>,
) {
    let logger = JobLogger::new(Arc::clone(&store), job_id, "worker");

    if let Err(err) = unit.transition_to(UnitStatus::Processing) {
        // The unit left the assigned state under us; release the slot
        // without touching it.
        logger.unit_error(
            &unit.unit_id,
            format!("refusing to dispatch unit: {err}"),
            None,
        );
        release_worker(&store, &shared, &logger, &mut worker_record);
        return;
    }
    unit.started_at = Some(Utc::now());
    if let Err(err) = store.update_work_unit(&unit) {
        logger.unit_error(
            &unit.unit_id,
            format!("failed to mark unit processing: {err}"),
            None,
        );
    }

    let event_store = Arc::clone(&store);
    let event_unit_id = unit.unit_id.clone();
    let on_event = move |_kind: fanout_agents::stream::StreamEventKind,
                         event: &serde_json::Value| {
        if let Some(session_id) = session_id_from_init(event) {
            let _ = event_store.set_unit_session_id(&event_unit_id, &session_id);
        }
        let _ = event_store.append_conversation_event(&event_unit_id, event);
    };

    let spawn_store = Arc::clone(&store);
    let spawn_unit_id = unit.unit_id.clone();
    let on_spawn = move |pid: u32| {
        let _ = spawn_store.set_unit_process_id(&spawn_unit_id, Some(pid));
    };

    let outcome = {
        let request = ExecuteRequest {
            prompt_template: &prompt_template,
            payload: &unit.payload,
            timeout,
            hooks: ExecutionHooks {
                on_event: Some(&on_event),
                on_spawn: Some(&on_spawn),
            },
        };
        catch_unwind(AssertUnwindSafe(|| worker.execute(request)))
    };

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(panic) => {
            let message = panic
                .downcast_ref::<String>()
                .cloned()
                .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
                .unwrap_or_else(|| "worker panicked".to_string());
            UnitOutcome::failure(
                fanout_agents::types::FailureKind::NoResult,
                format!("unexpected worker error: {message}"),
                "",
                0.0,
            )
        }
    };

    unit.completed_at = Some(Utc::now());
    unit.execution_time_seconds = Some(outcome.execution_time_seconds);
    unit.process_id = None;
    if !outcome.rendered_prompt.is_empty() {
        unit.rendered_prompt = Some(outcome.rendered_prompt.clone());
    }
    if !outcome.conversation.is_empty() {
        unit.conversation = Some(outcome.conversation.clone());
    } else if let Ok(Some(current)) = store.get_work_unit(&unit.unit_id) {
        // Keep whatever was streamed before the worker gave up.
        unit.conversation = current.conversation;
    }
    if outcome.session_id.is_some() {
        unit.session_id = outcome.session_id.clone();
    }
    if outcome.cost_usd.is_some() {
        unit.cost_usd = outcome.cost_usd;
    }
    unit.result = Some(outcome.to_result_value());

    let target = if outcome.success {
        UnitStatus::Completed
    } else {
        UnitStatus::Failed
    };
    if let Err(err) = unit.transition_to(target) {
        logger.unit_error(
            &unit.unit_id,
            format!("cannot finish unit: {err}"),
            None,
        );
        release_worker(&store, &shared, &logger, &mut worker_record);
        return;
    }

    if outcome.success {
        unit.error = None;
        worker_record.units_completed += 1;
        worker_record.total_execution_time += outcome.execution_time_seconds;

        logger.worker_log(
            LogLevel::Info,
            format!(
                "worker completed unit {} in {:.1}s",
                unit.unit_id.as_str(),
                outcome.execution_time_seconds
            ),
            Some(worker_record.worker_id.clone()),
            Some(unit.unit_id.clone()),
            Some(json!({
                "cost_usd": outcome.cost_usd,
                "num_turns": outcome.num_turns,
            })),
        );

        if let Some(callback) = &on_complete {
            callback(&mut unit, &outcome);
        }
    } else {
        unit.error = Some(
            outcome
                .error
                .clone()
                .unwrap_or_else(|| "unknown error".to_string()),
        );
        worker_record.units_failed += 1;

        logger.worker_log(
            LogLevel::Error,
            format!(
                "worker failed unit {}: {}",
                unit.unit_id.as_str(),
                unit.error.as_deref().unwrap_or("unknown error")
            ),
            Some(worker_record.worker_id.clone()),
            Some(unit.unit_id.clone()),
            outcome.failure.map(|kind| json!({"failure": kind.as_str()})),
        );

        if let Some(callback) = &on_failed {
            callback(&mut unit, &outcome);
        }
    }

    if let Err(err) = store.update_work_unit(&unit) {
        logger.unit_error(
            &unit.unit_id,
            format!("failed to persist finished unit: {err}"),
            None,
        );
    }

    release_worker(&store, &shared, &logger, &mut worker_record);
}

/// Return a worker slot: persist the idle record and drop it from the
/// active set.
fn release_worker(
    store: &SqliteStore,
    shared: &PoolShared,
    logger: &JobLogger,
    worker_record: &mut WorkerRecord,
) {
    worker_record.status = WorkerState::Idle;
    worker_record.current_unit_id = None;
    worker_record.last_heartbeat = Some(Utc::now());
    if let Err(err) = store.update_worker(worker_record) {
        logger.error(format!("failed to persist worker state: {err}"));
    }

    shared
        .active
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .remove(&worker_record.worker_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanout_agents::testing::{MockStep, MockWorker};
    use fanout_core::types::{Job, Payload, UnitId};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn setup(max_workers: usize) -> (Arc<SqliteStore>, Arc<MockWorker>, JobId) {
        let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
        let job_id = JobId::new("J1");
        let job = Job::new(
            job_id.clone(),
            "pool test",
            "intent",
            "work on {item}",
            "record",
            3,
            max_workers,
        );
        store.create_job(&job).expect("create job");
        (store, Arc::new(MockWorker::new()), job_id)
    }

    fn mk_unit(store: &SqliteStore, id: &str, item: &str) -> WorkUnit {
        let mut payload = Payload::new();
        payload.insert("item".to_string(), json!(item));
        let unit = WorkUnit::new(UnitId::new(id), JobId::new("J1"), "record", payload, 3);
        store.create_work_unit(&unit).expect("create unit");
        unit
    }

    fn pool_with(
        store: &Arc<SqliteStore>,
        worker: &Arc<MockWorker>,
        job_id: &JobId,
        max_workers: usize,
        on_complete: Option<UnitCallback>,
        on_failed: Option<UnitCallback>,
    ) -> WorkerPool {
        let pool = WorkerPool::new(
            job_id.clone(),
            worker.clone() as Arc<dyn UnitWorker>,
            store.clone(),
            max_workers,
            Duration::from_secs(10),
            on_complete,
            on_failed,
        );
        pool.start();
        pool
    }

    #[test]
    fn completed_unit_is_fully_persisted() {
        let (store, worker, job_id) = setup(2);
        let unit = mk_unit(&store, "U1", "a");
        let pool = pool_with(&store, &worker, &job_id, 2, None, None);

        assert!(pool.submit(unit, "work on {item}").expect("submit"));
        pool.wait_for_completion();

        let loaded = store
            .get_work_unit(&UnitId::new("U1"))
            .expect("get")
            .expect("exists");
        assert_eq!(loaded.status, UnitStatus::Completed);
        assert!(loaded.worker_id.is_some());
        assert!(loaded.started_at.is_some());
        assert!(loaded.completed_at.is_some());
        assert!(loaded.session_id.expect("session").starts_with("mock-session-"));
        assert_eq!(loaded.cost_usd, Some(0.01));
        assert_eq!(loaded.rendered_prompt.as_deref(), Some("work on a"));
        assert!(loaded.process_id.is_none());
        let conversation = loaded.conversation.expect("conversation");
        assert_eq!(conversation.len(), 3);
        assert_eq!(conversation[0]["type"], "system");
        assert_eq!(conversation[2]["type"], "result");

        pool.stop().expect("stop");
    }

    #[test]
    fn submit_refuses_beyond_capacity() {
        let (store, worker, job_id) = setup(1);
        worker.script(
            "slow",
            vec![MockStep::ok().with_delay(Duration::from_millis(500))],
        );
        let first = mk_unit(&store, "U1", "slow");
        let second = mk_unit(&store, "U2", "b");
        let pool = pool_with(&store, &worker, &job_id, 1, None, None);

        assert!(pool.submit(first, "t").expect("first submit"));
        assert!(
            !pool.submit(second.clone(), "t").expect("second submit"),
            "pool at capacity must refuse"
        );

        assert!(pool.wait_for_available_slot(Some(Duration::from_secs(5))));
        assert!(pool.submit(second, "t").expect("resubmit"));
        pool.wait_for_completion();
        pool.stop().expect("stop");
    }

    #[test]
    fn stopped_pool_refuses_submissions() {
        let (store, worker, job_id) = setup(1);
        let unit = mk_unit(&store, "U1", "a");
        let pool = pool_with(&store, &worker, &job_id, 1, None, None);
        pool.stop().expect("stop");

        assert!(!pool.submit(unit, "t").expect("submit after stop"));
        assert!(!pool.wait_for_available_slot(Some(Duration::from_millis(200))));
    }

    #[test]
    fn completion_callback_fires_once_per_unit() {
        let (store, worker, job_id) = setup(2);
        let completed = Arc::new(AtomicUsize::new(0));
        let callback_count = completed.clone();
        let on_complete: UnitCallback = Arc::new(move |_unit, outcome| {
            assert!(outcome.success);
            callback_count.fetch_add(1, Ordering::SeqCst);
        });

        let pool = pool_with(&store, &worker, &job_id, 2, Some(on_complete), None);
        for (id, item) in [("U1", "a"), ("U2", "b")] {
            let unit = mk_unit(&store, id, item);
            assert!(pool.submit(unit, "t").expect("submit"));
        }
        pool.wait_for_completion();

        assert_eq!(completed.load(Ordering::SeqCst), 2);
        pool.stop().expect("stop");
    }

    #[test]
    fn failure_callback_can_reset_unit_for_retry() {
        let (store, worker, job_id) = setup(1);
        worker.script("flaky", vec![MockStep::fail("transient glitch")]);

        let on_failed: UnitCallback = Arc::new(|unit, _outcome| {
            if unit.can_retry() {
                unit.retry_count += 1;
                unit.transition_to(UnitStatus::Pending).expect("retry reset");
                unit.worker_id = None;
                unit.assigned_at = None;
                unit.started_at = None;
            }
        });

        let pool = pool_with(&store, &worker, &job_id, 1, None, Some(on_failed));
        let unit = mk_unit(&store, "U1", "flaky");
        assert!(pool.submit(unit, "t").expect("submit"));
        pool.wait_for_completion();

        let loaded = store
            .get_work_unit(&UnitId::new("U1"))
            .expect("get")
            .expect("exists");
        assert_eq!(loaded.status, UnitStatus::Pending);
        assert_eq!(loaded.retry_count, 1);
        assert!(loaded.worker_id.is_none());

        pool.stop().expect("stop");
    }

    #[test]
    fn worker_panic_is_recorded_as_failure() {
        let (store, worker, job_id) = setup(1);
        worker.panic_on("doomed");

        let failures = Arc::new(AtomicUsize::new(0));
        let failure_count = failures.clone();
        let on_failed: UnitCallback = Arc::new(move |_unit, outcome| {
            assert!(!outcome.success);
            failure_count.fetch_add(1, Ordering::SeqCst);
        });

        let pool = pool_with(&store, &worker, &job_id, 1, None, Some(on_failed));
        let unit = mk_unit(&store, "U1", "doomed");
        assert!(pool.submit(unit, "t").expect("submit"));
        pool.wait_for_completion();

        let loaded = store
            .get_work_unit(&UnitId::new("U1"))
            .expect("get")
            .expect("exists");
        assert_eq!(loaded.status, UnitStatus::Failed);
        assert!(loaded.error.expect("error").contains("crash"));
        assert_eq!(failures.load(Ordering::SeqCst), 1);

        pool.stop().expect("stop");
    }

    #[test]
    fn stop_terminates_every_spawned_worker() {
        let (store, worker, job_id) = setup(2);
        let pool = pool_with(&store, &worker, &job_id, 2, None, None);
        for (id, item) in [("U1", "a"), ("U2", "b")] {
            let unit = mk_unit(&store, id, item);
            assert!(pool.submit(unit, "t").expect("submit"));
        }
        pool.wait_for_completion();
        pool.stop().expect("stop");

        let active = store.get_active_workers(&job_id).expect("active workers");
        assert!(active.is_empty(), "no worker may stay idle/busy after stop");
    }

    #[test]
    fn worker_counters_accumulate() {
        let (store, worker, job_id) = setup(1);
        let pool = pool_with(&store, &worker, &job_id, 1, None, None);
        let unit = mk_unit(&store, "U1", "a");
        assert!(pool.submit(unit, "t").expect("submit"));
        pool.wait_for_completion();

        let loaded = store
            .get_work_unit(&UnitId::new("U1"))
            .expect("get")
            .expect("exists");
        let worker_record = store
            .get_worker(loaded.worker_id.as_ref().expect("worker id"))
            .expect("get worker")
            .expect("worker exists");
        assert_eq!(worker_record.units_completed, 1);
        assert_eq!(worker_record.units_failed, 0);
        assert!(worker_record.last_heartbeat.is_some());

        pool.stop().expect("stop");
    }
}

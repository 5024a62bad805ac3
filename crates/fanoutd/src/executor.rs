//! The job executor: a detached supervisor process that owns one job
//! from start to finish.
//!
//! On every entry (fresh start or resume) it reopens the store,
//! installs stop handlers, recovers stale state, then drives the
//! worker pool until the batch drains, optionally runs the synthesis
//! unit, and persists the final status. Its lifetime is independent of
//! whichever process spawned it.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};

use fanout_agents::process::{kill_group, pid_is_alive, terminate};
use fanout_agents::types::UnitWorker;
use fanout_core::state::{JobStatus, StateMachineError, UnitStatus};
use fanout_core::types::{
    Job, JobId, Payload, UnitId, WorkUnit, POST_PROCESSING_UNIT_TYPE,
};

use crate::job_log::JobLogger;
use crate::persistence::{SqliteStore, StoreError};
use crate::signal::StopFlag;
use crate::worker_pool::{PoolError, UnitCallback, WorkerPool};

const IDLE_POLL: Duration = Duration::from_secs(1);
const DRAIN_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("job not found: {job_id}")]
    JobNotFound { job_id: String },
    #[error("work unit not found: {unit_id}")]
    UnitNotFound { unit_id: String },
    #[error("work unit {unit_id} does not belong to job {job_id}")]
    UnitJobMismatch { unit_id: String, job_id: String },
    #[error("no process recorded for {what}")]
    NoProcess { what: String },
    #[error("cannot restart unit in '{status}' status; only failed units can be restarted")]
    NotRestartable { status: &'static str },
    #[error("no pending units to process")]
    NoPendingUnits,
    #[error("supervisor crashed: {message}")]
    Crashed { message: String },
    #[error(transparent)]
    State(#[from] StateMachineError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

/// Liveness of the supervisor recorded for a job.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ExecutorStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub error: Option<String>,
}

/// Supervisor for one job.
pub struct JobExecutor {
    job_id: JobId,
    store: Arc<SqliteStore>,
    worker: Arc<dyn UnitWorker>,
    unit_timeout: Duration,
    stop: StopFlag,
}

impl JobExecutor {
    pub fn new(
        job_id: JobId,
        store: Arc<SqliteStore>,
        worker: Arc<dyn UnitWorker>,
        unit_timeout: Duration,
        stop: StopFlag,
    ) -> Self {
        Self {
            job_id,
            store,
            worker,
            unit_timeout,
            stop,
        }
    }

    /// Run the job to completion (or pause). Any crash marks the job
    /// `failed` with the reason in its metadata before returning.
    pub fn run(&self) -> Result<(), ExecutorError> {
        let result = catch_unwind(AssertUnwindSafe(|| self.run_inner()));
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                self.record_crash(&err.to_string());
                Err(err)
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<String>()
                    .cloned()
                    .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
                    .unwrap_or_else(|| "supervisor panicked".to_string());
                self.record_crash(&message);
                Err(ExecutorError::Crashed { message })
            }
        }
    }

    fn record_crash(&self, message: &str) {
        if let Ok(Some(mut job)) = self.store.get_job(&self.job_id) {
            // Terminal states stay put; a crash can only fail a job
            // that was actually in flight.
            if job.transition_to(JobStatus::Failed).is_err() {
                tracing::error!(
                    "supervisor error for job {} in status '{}': {message}",
                    self.job_id.0,
                    job.status.as_str()
                );
                return;
            }
            job.metadata
                .insert("executor_error".to_string(), json!(message));
            job.metadata.insert(
                "executor_error_at".to_string(),
                json!(Utc::now().to_rfc3339()),
            );
            let _ = self.store.update_job(&job);
        }
    }

    fn run_inner(&self) -> Result<(), ExecutorError> {
        let logger = JobLogger::new(Arc::clone(&self.store), self.job_id.clone(), "executor");

        let mut job = self
            .store
            .get_job(&self.job_id)?
            .ok_or_else(|| ExecutorError::JobNotFound {
                job_id: self.job_id.0.clone(),
            })?;

        logger.info(format!(
            "supervisor started (pid {}) for job '{}' with {} units, max_workers={}",
            std::process::id(),
            job.name,
            job.total_units,
            job.max_workers
        ));

        let stale_workers = self
            .store
            .cleanup_stale_workers(&self.job_id, pid_is_alive)?;
        let stuck_units = self.store.reset_stuck_units(&self.job_id)?;
        if stale_workers > 0 || stuck_units > 0 {
            logger.info(format!(
                "recovered from previous run: {stale_workers} stale workers terminated, {stuck_units} stuck units reset"
            ));
        }

        // A failed job never re-enters `running`: it only comes back
        // through bypass (straight into synthesis) or with explicitly
        // restarted units, and the batch outcome is recomputed at the
        // end either way. Everything else must take the
        // `running` edge or the supervisor refuses to start.
        if job.status == JobStatus::Failed {
            logger.info("re-entering failed job for bypass synthesis or restarted units");
        } else {
            job.transition_to(JobStatus::Running)?;
            if job.started_at.is_none() {
                job.started_at = Some(Utc::now());
            }
            self.store.update_job(&job)?;
        }

        let pool = self.build_pool(&job, &logger);
        pool.start();

        let mut submitted: usize = 0;
        while !self.stop.is_set() {
            let mut pending = self
                .store
                .get_pending_units(&self.job_id, job.max_workers as i64)?;
            // A recovered post-processing unit must not be dispatched
            // with the per-item template; the synthesis phase below
            // owns it.
            pending.retain(|unit| !unit.is_post_processing());

            if pending.is_empty() {
                if pool.active_count() == 0 {
                    logger.info("no pending units and no active workers; batch drained");
                    break;
                }
                std::thread::sleep(IDLE_POLL);
                continue;
            }

            for unit in pending {
                if self.stop.is_set() {
                    break;
                }

                while !pool.wait_for_available_slot(Some(Duration::from_secs(1))) {
                    if self.stop.is_set() || !pool.is_running() {
                        break;
                    }
                }
                if self.stop.is_set() {
                    break;
                }

                let unit_id = unit.unit_id.clone();
                if pool.submit(unit, &job.worker_prompt_template)? {
                    submitted += 1;
                    logger.debug(format!(
                        "submitted unit {} ({submitted} total)",
                        unit_id.as_str()
                    ));
                }
            }
        }

        logger.info("waiting for in-flight units to finish");
        self.drain_pool(&pool, &logger)?;

        // Post-processing synthesis, when the batch outcome allows it.
        let mut job = self
            .store
            .get_job(&self.job_id)?
            .ok_or_else(|| ExecutorError::JobNotFound {
                job_id: self.job_id.0.clone(),
            })?;
        let post_already_done = match &job.post_processing_unit_id {
            Some(unit_id) => self
                .store
                .get_work_unit(unit_id)?
                .map(|unit| unit.status == UnitStatus::Completed)
                .unwrap_or(false),
            None => false,
        };
        let should_post_process = job.post_processing_prompt.is_some()
            && !post_already_done
            && !self.stop.is_set()
            && (job.all_units_succeeded() || (job.bypass_failures && job.all_units_done()));

        if should_post_process {
            if job.bypass_failures && !job.all_units_succeeded() {
                logger.info(format!(
                    "bypass enabled; running post-processing despite {} failed units",
                    job.failed_units
                ));
                self.log_bypassed_units(&logger)?;
            } else {
                logger.info(format!(
                    "all {} units completed; starting post-processing",
                    job.total_units
                ));
            }
            self.run_post_processing(&mut job, &pool, &logger)?;
        }

        let mut job = self
            .store
            .get_job(&self.job_id)?
            .ok_or_else(|| ExecutorError::JobNotFound {
                job_id: self.job_id.0.clone(),
            })?;
        let post_unit = match &job.post_processing_unit_id {
            Some(unit_id) => self.store.get_work_unit(unit_id)?,
            None => None,
        };

        let final_status = determine_final_status(&job, post_unit.as_ref(), self.stop.is_set());
        if let Err(err) = job.transition_to(final_status) {
            // E.g. a failed job stopped before synthesis began stays
            // failed rather than drifting to paused.
            logger.warning(format!(
                "keeping status '{}': {err}",
                job.status.as_str()
            ));
        }
        job.completed_at = Some(Utc::now());
        job.metadata.insert(
            "executor_completed_at".to_string(),
            json!(Utc::now().to_rfc3339()),
        );
        self.store.update_job(&job)?;
        logger.info(format!("job finished with status '{}'", job.status.as_str()));

        pool.stop()?;
        Ok(())
    }

    fn build_pool(&self, job: &Job, logger: &JobLogger) -> WorkerPool {
        let store = Arc::clone(&self.store);
        let job_id = self.job_id.clone();
        let complete_logger = logger.clone();
        let on_complete: UnitCallback = Arc::new(move |unit: &mut WorkUnit, _outcome| {
            if !unit.is_post_processing() {
                let _ = store.increment_completed_units(&job_id);
            }
            if let Ok(Some(job)) = store.get_job(&job_id) {
                complete_logger.unit_info(
                    &unit.unit_id,
                    format!(
                        "unit completed ({}/{})",
                        job.completed_units, job.total_units
                    ),
                );
            }
        });

        let store = Arc::clone(&self.store);
        let job_id = self.job_id.clone();
        let failure_logger = logger.clone();
        let on_failed: UnitCallback = Arc::new(move |unit: &mut WorkUnit, _outcome| {
            let error = unit
                .error
                .clone()
                .unwrap_or_else(|| "unknown error".to_string());
            if unit.can_retry() {
                if let Err(err) = unit.transition_to(UnitStatus::Pending) {
                    failure_logger.unit_error(
                        &unit.unit_id,
                        format!("cannot requeue unit for retry: {err}"),
                        None,
                    );
                    return;
                }
                unit.retry_count += 1;
                unit.worker_id = None;
                unit.assigned_at = None;
                unit.started_at = None;
                failure_logger.unit_warning(
                    &unit.unit_id,
                    format!(
                        "unit failed, will retry ({}/{}): {error}",
                        unit.retry_count, unit.max_retries
                    ),
                );
            } else {
                if !unit.is_post_processing() {
                    let _ = store.increment_failed_units(&job_id);
                }
                failure_logger.unit_error(
                    &unit.unit_id,
                    format!(
                        "unit failed permanently after {} retries: {error}",
                        unit.max_retries
                    ),
                    Some(json!({"error": error})),
                );
            }
        });

        WorkerPool::new(
            self.job_id.clone(),
            Arc::clone(&self.worker),
            Arc::clone(&self.store),
            job.max_workers,
            self.unit_timeout,
            Some(on_complete),
            Some(on_failed),
        )
    }

    /// Wait for in-flight tasks, escalating to a group-kill of live
    /// agent children when a second stop request arrives mid-drain.
    fn drain_pool(&self, pool: &WorkerPool, logger: &JobLogger) -> Result<(), ExecutorError> {
        let mut escalated = false;
        loop {
            if pool.active_count() == 0 {
                return Ok(());
            }
            if !escalated && self.stop.request_count() >= 2 {
                escalated = true;
                logger.warning("second stop request; killing live agent processes");
                let processing = self.store.list_units_for_job(
                    &self.job_id,
                    Some(UnitStatus::Processing),
                    i64::MAX,
                    0,
                    false,
                )?;
                for unit in processing {
                    if let Some(pid) = unit.process_id {
                        let _ = kill_group(pid, libc::SIGKILL);
                    }
                }
            }
            std::thread::sleep(DRAIN_POLL);
        }
    }

    fn log_bypassed_units(&self, logger: &JobLogger) -> Result<(), ExecutorError> {
        let failed = self.store.list_units_for_job(
            &self.job_id,
            Some(UnitStatus::Failed),
            i64::MAX,
            0,
            true,
        )?;
        for unit in failed {
            logger.unit_warning(
                &unit.unit_id,
                format!(
                    "bypassing failed unit: {}",
                    unit.error.as_deref().unwrap_or("unknown error")
                ),
            );
        }
        Ok(())
    }

    fn run_post_processing(
        &self,
        job: &mut Job,
        pool: &WorkerPool,
        logger: &JobLogger,
    ) -> Result<(), ExecutorError> {
        job.transition_to(JobStatus::PostProcessing)?;
        self.store.update_job(job)?;

        // A previous run may have left a synthesis unit behind; give
        // it another attempt instead of orphaning it.
        if let Some(existing_id) = job.post_processing_unit_id.clone() {
            if let Some(mut existing) = self.store.get_work_unit(&existing_id)? {
                if existing.status != UnitStatus::Completed {
                    existing.reset_to_pending()?;
                    self.store.update_work_unit(&existing)?;
                    return self.dispatch_post_unit(job, existing, pool, logger);
                }
            }
        }

        let mut payload = Payload::new();
        payload.insert("type".to_string(), json!(POST_PROCESSING_UNIT_TYPE));
        payload.insert(
            "total_units_processed".to_string(),
            json!(job.total_units),
        );
        payload.insert("completed_units".to_string(), json!(job.completed_units));
        payload.insert("job_name".to_string(), json!(job.name));
        payload.insert("job_description".to_string(), json!(job.description));
        for (metadata_key, payload_key) in [
            ("post_processing_name", "name"),
            ("post_processing_working_directory", "working_directory"),
            ("post_processing_output_directory", "output_directory"),
        ] {
            if let Some(value) = job.metadata.get(metadata_key) {
                payload.insert(payload_key.to_string(), value.clone());
            }
        }

        let max_retries = job
            .metadata
            .get("max_retries")
            .and_then(Value::as_u64)
            .map(|retries| retries as u32)
            .unwrap_or(3);
        let post_unit = WorkUnit::new(
            UnitId::generate(),
            job.job_id.clone(),
            POST_PROCESSING_UNIT_TYPE,
            payload,
            max_retries,
        );
        self.store.create_work_unit(&post_unit)?;

        job.post_processing_unit_id = Some(post_unit.unit_id.clone());
        self.store.update_job(job)?;
        logger.unit_info(&post_unit.unit_id, "created post-processing unit");

        self.dispatch_post_unit(job, post_unit, pool, logger)
    }

    fn dispatch_post_unit(
        &self,
        job: &Job,
        post_unit: WorkUnit,
        pool: &WorkerPool,
        logger: &JobLogger,
    ) -> Result<(), ExecutorError> {
        pool.start();
        let prompt = job
            .post_processing_prompt
            .clone()
            .unwrap_or_default();
        let post_unit_id = post_unit.unit_id.clone();
        pool.submit(post_unit, &prompt)?;

        logger.info("waiting for post-processing to complete");
        self.drain_pool(pool, logger)?;

        match self.store.get_work_unit(&post_unit_id)? {
            Some(unit) if unit.status == UnitStatus::Completed => {
                logger.info("post-processing completed successfully");
            }
            Some(unit) => {
                logger.error(format!(
                    "post-processing ended with status '{}': {}",
                    unit.status.as_str(),
                    unit.error.as_deref().unwrap_or("unknown error")
                ));
            }
            None => logger.warning("post-processing unit disappeared from the store"),
        }
        Ok(())
    }

    // --- Process-level helpers used by the orchestrator and HTTP layer ---

    /// Spawn a detached supervisor for `job_id`, recording its pid in
    /// the job metadata. The child gets a new process group, a NULL
    /// stdin, and a log file next to the store; the caller returns
    /// immediately.
    pub fn spawn_detached(
        store: &SqliteStore,
        job_id: &JobId,
        db_path: &Path,
    ) -> Result<u32, ExecutorError> {
        let mut job = store
            .get_job(job_id)?
            .ok_or_else(|| ExecutorError::JobNotFound {
                job_id: job_id.0.clone(),
            })?;

        let log_path = db_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(format!("executor-{}.log", job_id.as_str()));
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        let exe = std::env::current_exe()?;
        let mut command = std::process::Command::new(exe);
        command
            .arg("run-job")
            .arg(job_id.as_str())
            .arg("--db")
            .arg(db_path)
            .stdin(std::process::Stdio::null())
            .stdout(log_file.try_clone()?)
            .stderr(log_file);

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let child = command.spawn()?;
        let pid = child.id();

        job.metadata.insert("executor_pid".to_string(), json!(pid));
        job.metadata.insert(
            "executor_started_at".to_string(),
            json!(Utc::now().to_rfc3339()),
        );
        store.update_job(&job)?;

        Ok(pid)
    }

    /// Supervisor liveness for a job, from its recorded pid.
    pub fn executor_status(
        store: &SqliteStore,
        job_id: &JobId,
    ) -> Result<Option<ExecutorStatus>, StoreError> {
        let Some(job) = store.get_job(job_id)? else {
            return Ok(None);
        };

        let pid = job.executor_pid();
        let running = pid.map(pid_is_alive).unwrap_or(false);
        Ok(Some(ExecutorStatus {
            running,
            pid,
            started_at: job
                .metadata_str("executor_started_at")
                .map(str::to_string),
            completed_at: job
                .metadata_str("executor_completed_at")
                .map(str::to_string),
            error: job.metadata_str("executor_error").map(str::to_string),
        }))
    }

    /// Graceful stop: SIGTERM to the recorded supervisor pid.
    pub fn stop_executor(store: &SqliteStore, job_id: &JobId) -> Result<(), ExecutorError> {
        let job = store
            .get_job(job_id)?
            .ok_or_else(|| ExecutorError::JobNotFound {
                job_id: job_id.0.clone(),
            })?;
        let pid = job.executor_pid().ok_or_else(|| ExecutorError::NoProcess {
            what: format!("job {}", job_id.as_str()),
        })?;
        terminate(pid).map_err(|source| ExecutorError::Io { source })
    }

    /// Hard kill: SIGKILL the supervisor's whole process group, mark
    /// the job failed, and reset stranded units.
    pub fn kill_executor(store: &SqliteStore, job_id: &JobId) -> Result<u32, ExecutorError> {
        let mut job = store
            .get_job(job_id)?
            .ok_or_else(|| ExecutorError::JobNotFound {
                job_id: job_id.0.clone(),
            })?;
        let pid = job.executor_pid().ok_or_else(|| ExecutorError::NoProcess {
            what: format!("job {}", job_id.as_str()),
        })?;

        if pid_is_alive(pid) {
            kill_group(pid, libc::SIGKILL).map_err(|source| ExecutorError::Io { source })?;
        }

        // A supervisor can only be killed mid-flight; terminal
        // statuses keep their outcome.
        if job.transition_to(JobStatus::Failed).is_ok() {
            job.metadata
                .insert("killed_at".to_string(), json!(Utc::now().to_rfc3339()));
            job.metadata
                .insert("kill_reason".to_string(), json!("user requested kill"));
            store.update_job(&job)?;
        }
        store.cleanup_stale_workers(job_id, pid_is_alive)?;
        store.reset_stuck_units(job_id)?;

        Ok(pid)
    }

    /// Group-kill one unit's agent subprocess and mark the unit failed
    /// with error `killed`.
    pub fn kill_work_unit(
        store: &SqliteStore,
        job_id: &JobId,
        unit_id: &UnitId,
    ) -> Result<u32, ExecutorError> {
        let mut unit = store
            .get_work_unit(unit_id)?
            .ok_or_else(|| ExecutorError::UnitNotFound {
                unit_id: unit_id.0.clone(),
            })?;
        if &unit.job_id != job_id {
            return Err(ExecutorError::UnitJobMismatch {
                unit_id: unit_id.0.clone(),
                job_id: job_id.0.clone(),
            });
        }
        let pid = unit.process_id.ok_or_else(|| ExecutorError::NoProcess {
            what: format!("unit {}", unit_id.as_str()),
        })?;

        if pid_is_alive(pid) {
            kill_group(pid, libc::SIGKILL).map_err(|source| ExecutorError::Io { source })?;
        }

        unit.transition_to(UnitStatus::Failed)?;
        unit.error = Some("killed".to_string());
        unit.process_id = None;
        unit.completed_at = Some(Utc::now());
        store.update_work_unit(&unit)?;
        Ok(pid)
    }

    /// Reset a failed unit to `pending` (keeping its retry count) and
    /// release its slot in the job's failure counter.
    pub fn restart_work_unit(
        store: &SqliteStore,
        job_id: &JobId,
        unit_id: &UnitId,
    ) -> Result<(), ExecutorError> {
        let mut unit = store
            .get_work_unit(unit_id)?
            .ok_or_else(|| ExecutorError::UnitNotFound {
                unit_id: unit_id.0.clone(),
            })?;
        if &unit.job_id != job_id {
            return Err(ExecutorError::UnitJobMismatch {
                unit_id: unit_id.0.clone(),
                job_id: job_id.0.clone(),
            });
        }
        if unit.status != UnitStatus::Failed {
            return Err(ExecutorError::NotRestartable {
                status: unit.status.as_str(),
            });
        }

        if let Some(pid) = unit.process_id {
            let _ = kill_group(pid, libc::SIGKILL);
        }

        store.decrement_failed_units(job_id)?;

        unit.reset_to_pending()?;
        store.update_work_unit(&unit)?;
        Ok(())
    }

    /// Resume a paused or failed job. Idempotent: if the recorded
    /// supervisor is still alive its pid is returned and nothing is
    /// spawned.
    pub fn resume_job(
        store: &SqliteStore,
        job_id: &JobId,
        db_path: &Path,
    ) -> Result<u32, ExecutorError> {
        let job = store
            .get_job(job_id)?
            .ok_or_else(|| ExecutorError::JobNotFound {
                job_id: job_id.0.clone(),
            })?;

        if let Some(pid) = job.executor_pid() {
            if pid_is_alive(pid) {
                return Ok(pid);
            }
        }

        let has_pending = !store.get_pending_units(job_id, 1)?.is_empty();
        let post_done = match &job.post_processing_unit_id {
            Some(unit_id) => store
                .get_work_unit(unit_id)?
                .map(|unit| unit.status == UnitStatus::Completed)
                .unwrap_or(false),
            None => false,
        };
        let can_post_process = job.post_processing_prompt.is_some()
            && !post_done
            && job.all_units_done()
            && (job.all_units_succeeded() || job.bypass_failures);
        if !has_pending && !can_post_process {
            return Err(ExecutorError::NoPendingUnits);
        }

        Self::spawn_detached(store, job_id, db_path)
    }
}

/// Final status once the pool has drained.
fn determine_final_status(job: &Job, post_unit: Option<&WorkUnit>, stopped: bool) -> JobStatus {
    let post_failed = post_unit.map(|u| u.status == UnitStatus::Failed).unwrap_or(false);
    let post_succeeded = post_unit
        .map(|u| u.status == UnitStatus::Completed)
        .unwrap_or(false);

    if post_failed {
        return JobStatus::Failed;
    }

    if job.all_units_succeeded() && (job.post_processing_prompt.is_none() || post_succeeded) {
        return JobStatus::Completed;
    }

    if job.bypass_failures && post_succeeded {
        return JobStatus::Completed;
    }

    if job.failed_units > 0 && job.all_units_done() && !stopped {
        return JobStatus::Failed;
    }

    JobStatus::Paused
}

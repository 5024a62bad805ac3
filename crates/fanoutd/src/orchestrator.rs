//! Front-facing API: creates jobs from enumerated data sources, runs
//! the pre-batch test phase, and spawns/resumes detached supervisors.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};

use fanout_agents::stream::session_id_from_init;
use fanout_agents::types::{ExecuteRequest, ExecutionHooks, UnitWorker};
use fanout_core::config::Config;
use fanout_core::state::{JobStatus, StateMachineError, UnitStatus};
use fanout_core::types::{Job, JobId, Payload, UnitId, WorkUnit};

use crate::enumerators::{create_enumerator, EnumeratorError};
use crate::executor::{ExecutorError, JobExecutor};
use crate::persistence::{SqliteStore, StoreError};
use crate::prompt::PromptSynthesizer;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("agent worker '{worker}' is not available on this host")]
    WorkerUnavailable { worker: String },
    #[error(transparent)]
    Enumeration(#[from] EnumeratorError),
    #[error("no items found to process")]
    NoItems,
    #[error("job not found: {job_id}")]
    JobNotFound { job_id: String },
    #[error("no pending units to test")]
    NoPendingUnits,
    #[error("cannot start job in '{status}' status")]
    InvalidState { status: &'static str },
    #[error(transparent)]
    State(#[from] StateMachineError),
    #[error("failed to persist {what}")]
    PersistFailed { what: &'static str },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

/// Request to create a batch job.
#[derive(Debug, Clone)]
pub struct CreateJobRequest {
    pub name: String,
    pub user_intent: String,
    pub enumerator_type: String,
    pub enumerator_config: Value,
    pub max_workers: Option<usize>,
    pub max_retries: Option<u32>,
    pub post_processing_prompt: Option<String>,
    pub post_processing_output_directory: Option<String>,
    pub metadata: Option<Payload>,
}

/// Summary returned from a successful create.
#[derive(Debug, Clone)]
pub struct CreatedJob {
    pub job_id: JobId,
    pub total_units: i64,
    pub worker_prompt_template: String,
    pub sample_payload: Option<Payload>,
    pub enumerator_metadata: Payload,
    pub has_post_processing: bool,
}

/// Result of the synchronous test-phase run.
#[derive(Debug, Clone)]
pub struct TestReport {
    pub job_id: JobId,
    pub test_unit_id: UnitId,
    pub test_passed: bool,
    pub payload: Payload,
    pub output: Option<String>,
    pub error: Option<String>,
    pub execution_time_seconds: Option<f64>,
    pub cost_usd: Option<f64>,
    pub remaining_units: i64,
    pub conversation: Vec<Value>,
    pub awaiting_approval: bool,
}

/// What `start_job` did.
#[derive(Debug, Clone)]
pub enum StartOutcome {
    /// A detached supervisor is now processing the batch.
    Started { pid: u32, remaining_units: i64 },
    /// The test phase ran (or its results were re-fetched).
    Testing(TestReport),
    /// The test was rejected; job is back to `created`.
    Reset,
    /// A supervisor was already alive.
    AlreadyRunning { pid: u32 },
}

/// Aggregated job progress for status queries.
#[derive(Debug, Clone, serde::Serialize)]
pub struct JobStatusReport {
    pub job_id: JobId,
    pub status: JobStatus,
    pub executor_running: bool,
    pub executor_pid: Option<u32>,
    pub total_units: i64,
    pub completed_units: i64,
    pub failed_units: i64,
    pub progress_percentage: f64,
    pub unit_stats: std::collections::HashMap<String, i64>,
}

pub struct Orchestrator {
    store: Arc<SqliteStore>,
    worker: Arc<dyn UnitWorker>,
    synthesizer: PromptSynthesizer,
    config: Config,
}

impl Orchestrator {
    pub fn new(store: Arc<SqliteStore>, worker: Arc<dyn UnitWorker>, config: Config) -> Self {
        Self {
            store,
            worker,
            synthesizer: PromptSynthesizer::new(),
            config,
        }
    }

    /// Enumerate items, synthesize the worker prompt template, and
    /// persist the job with one pending unit per item. Nothing is
    /// persisted when enumeration fails or awaits approval.
    pub fn create_job(&self, request: CreateJobRequest) -> Result<CreatedJob, OrchestratorError> {
        if !self.worker.is_available() {
            return Err(OrchestratorError::WorkerUnavailable {
                worker: self.worker.name().to_string(),
            });
        }

        let enumerator =
            create_enumerator(&request.enumerator_type, &request.enumerator_config)?;
        enumerator.validate()?;
        let result = enumerator.enumerate()?;
        if result.items.is_empty() {
            return Err(OrchestratorError::NoItems);
        }

        let worker_prompt = if request.enumerator_type == "file" {
            self.synthesizer.file_processing_prompt(&request.user_intent)
        } else {
            let fields = payload_field_descriptions(&result.metadata, result.items.first());
            self.synthesizer.generic_prompt(
                &request.user_intent,
                Some(&request.enumerator_type),
                fields.as_ref(),
            )
        };

        let max_workers = request.max_workers.unwrap_or(self.config.max_workers);
        let max_retries = request.max_retries.unwrap_or(self.config.max_retries);

        let mut job = Job::new(
            JobId::generate(),
            request.name,
            request.user_intent,
            worker_prompt.clone(),
            request.enumerator_type.clone(),
            result.items.len() as i64,
            max_workers,
        );
        job.post_processing_prompt = request.post_processing_prompt.clone();
        if let Some(metadata) = request.metadata {
            for (key, value) in metadata {
                job.metadata.insert(key, value);
            }
        }
        if let Some(output_directory) = request.post_processing_output_directory {
            job.metadata.insert(
                "post_processing_output_directory".to_string(),
                json!(output_directory),
            );
        }
        job.metadata
            .insert("max_retries".to_string(), json!(max_retries));

        if !self.store.create_job(&job)? {
            return Err(OrchestratorError::PersistFailed { what: "job" });
        }

        let sample_payload = result.items.first().cloned();
        for item in result.items {
            let unit = WorkUnit::new(
                UnitId::generate(),
                job.job_id.clone(),
                request.enumerator_type.clone(),
                item,
                max_retries,
            );
            if !self.store.create_work_unit(&unit)? {
                return Err(OrchestratorError::PersistFailed { what: "work unit" });
            }
        }

        Ok(CreatedJob {
            job_id: job.job_id,
            total_units: job.total_units,
            worker_prompt_template: worker_prompt,
            sample_payload,
            enumerator_metadata: result.metadata,
            has_post_processing: job.post_processing_prompt.is_some(),
        })
    }

    /// Start a job, honoring the test phase. The first call on a
    /// `created` job runs one unit synchronously and parks the job in
    /// `testing` for human review; `approve` then either spawns the
    /// supervisor or resets for another round.
    pub fn start_job(
        &self,
        job_id: &JobId,
        approve: Option<bool>,
        skip_test: bool,
    ) -> Result<StartOutcome, OrchestratorError> {
        let job = self
            .store
            .get_job(job_id)?
            .ok_or_else(|| OrchestratorError::JobNotFound {
                job_id: job_id.0.clone(),
            })?;

        match job.status {
            JobStatus::Created => {
                if skip_test || self.config.skip_test {
                    self.start_supervisor(job)
                } else {
                    self.run_test_phase(job)
                }
            }
            JobStatus::Testing => match approve {
                Some(true) => self.start_supervisor(job),
                Some(false) => self.reject_test(job),
                None => self.existing_test_report(&job).map(StartOutcome::Testing),
            },
            JobStatus::Running => {
                if let Some(pid) = job.executor_pid() {
                    if fanout_agents::process::pid_is_alive(pid) {
                        return Ok(StartOutcome::AlreadyRunning { pid });
                    }
                }
                self.start_supervisor(job)
            }
            other => Err(OrchestratorError::InvalidState {
                status: other.as_str(),
            }),
        }
    }

    /// Resume a paused/failed job. Returns the supervisor pid, reusing
    /// a live one when present.
    pub fn resume_job(&self, job_id: &JobId) -> Result<u32, OrchestratorError> {
        Ok(JobExecutor::resume_job(
            &self.store,
            job_id,
            &self.config.storage_path,
        )?)
    }

    /// Ask the supervisor to stop gracefully.
    pub fn kill_job(&self, job_id: &JobId) -> Result<(), OrchestratorError> {
        Ok(JobExecutor::stop_executor(&self.store, job_id)?)
    }

    pub fn get_job_status(&self, job_id: &JobId) -> Result<JobStatusReport, OrchestratorError> {
        let job = self
            .store
            .get_job(job_id)?
            .ok_or_else(|| OrchestratorError::JobNotFound {
                job_id: job_id.0.clone(),
            })?;

        let executor = JobExecutor::executor_status(&self.store, job_id)?.ok_or_else(|| {
            OrchestratorError::JobNotFound {
                job_id: job_id.0.clone(),
            }
        })?;
        let counts = self.store.count_units_by_status(job_id)?;
        let unit_stats = counts
            .into_iter()
            .map(|(status, count)| (status.as_str().to_string(), count))
            .collect();

        Ok(JobStatusReport {
            job_id: job.job_id.clone(),
            status: job.status,
            executor_running: executor.running,
            executor_pid: executor.pid,
            total_units: job.total_units,
            completed_units: job.completed_units,
            failed_units: job.failed_units,
            progress_percentage: job.progress_percentage(),
            unit_stats,
        })
    }

    fn start_supervisor(&self, mut job: Job) -> Result<StartOutcome, OrchestratorError> {
        job.transition_to(JobStatus::Running)?;
        if job.started_at.is_none() {
            job.started_at = Some(Utc::now());
        }
        self.store.update_job(&job)?;

        let pid =
            JobExecutor::spawn_detached(&self.store, &job.job_id, &self.config.storage_path)?;
        Ok(StartOutcome::Started {
            pid,
            remaining_units: (job.total_units - job.completed_units).max(0),
        })
    }

    fn run_test_phase(&self, mut job: Job) -> Result<StartOutcome, OrchestratorError> {
        let mut units = self.store.get_pending_units(&job.job_id, 1)?;
        let mut test_unit = units.pop().ok_or(OrchestratorError::NoPendingUnits)?;

        job.transition_to(JobStatus::Testing)?;
        job.test_unit_id = Some(test_unit.unit_id.clone());
        self.store.update_job(&job)?;

        // The test run is synchronous; the unit goes straight from
        // pending to processing without a pool slot.
        test_unit.transition_to(UnitStatus::Processing)?;
        test_unit.started_at = Some(Utc::now());
        self.store.update_work_unit(&test_unit)?;

        let event_store = Arc::clone(&self.store);
        let event_unit_id = test_unit.unit_id.clone();
        let on_event = move |_kind: fanout_agents::stream::StreamEventKind,
                             event: &Value| {
            if let Some(session_id) = session_id_from_init(event) {
                let _ = event_store.set_unit_session_id(&event_unit_id, &session_id);
            }
            let _ = event_store.append_conversation_event(&event_unit_id, event);
        };
        let spawn_store = Arc::clone(&self.store);
        let spawn_unit_id = test_unit.unit_id.clone();
        let on_spawn = move |pid: u32| {
            let _ = spawn_store.set_unit_process_id(&spawn_unit_id, Some(pid));
        };

        let outcome = self.worker.execute(ExecuteRequest {
            prompt_template: &job.worker_prompt_template,
            payload: &test_unit.payload,
            timeout: Duration::from_secs(self.config.worker_timeout_secs),
            hooks: ExecutionHooks {
                on_event: Some(&on_event),
                on_spawn: Some(&on_spawn),
            },
        });

        test_unit.transition_to(if outcome.success {
            UnitStatus::Completed
        } else {
            UnitStatus::Failed
        })?;
        test_unit.completed_at = Some(Utc::now());
        test_unit.result = Some(outcome.to_result_value());
        test_unit.error = outcome.error.clone();
        test_unit.execution_time_seconds = Some(outcome.execution_time_seconds);
        test_unit.rendered_prompt = Some(outcome.rendered_prompt.clone());
        test_unit.conversation = Some(outcome.conversation.clone());
        test_unit.session_id = outcome.session_id.clone();
        test_unit.cost_usd = outcome.cost_usd;
        test_unit.process_id = None;
        self.store.update_work_unit(&test_unit)?;

        job.test_passed = outcome.success;
        if outcome.success {
            job.completed_units = 1;
        }
        self.store.update_job(&job)?;

        Ok(StartOutcome::Testing(TestReport {
            job_id: job.job_id.clone(),
            test_unit_id: test_unit.unit_id.clone(),
            test_passed: outcome.success,
            payload: test_unit.payload.clone(),
            output: outcome.output,
            error: outcome.error,
            execution_time_seconds: test_unit.execution_time_seconds,
            cost_usd: test_unit.cost_usd,
            remaining_units: job.total_units - 1,
            conversation: outcome.conversation,
            awaiting_approval: true,
        }))
    }

    fn existing_test_report(&self, job: &Job) -> Result<TestReport, OrchestratorError> {
        let test_unit_id =
            job.test_unit_id
                .clone()
                .ok_or_else(|| OrchestratorError::JobNotFound {
                    job_id: job.job_id.0.clone(),
                })?;
        let test_unit = self
            .store
            .get_work_unit(&test_unit_id)?
            .ok_or_else(|| OrchestratorError::JobNotFound {
                job_id: job.job_id.0.clone(),
            })?;

        let output = test_unit
            .result
            .as_ref()
            .and_then(|result| result.get("output"))
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(TestReport {
            job_id: job.job_id.clone(),
            test_unit_id: test_unit.unit_id.clone(),
            test_passed: job.test_passed,
            payload: test_unit.payload.clone(),
            output,
            error: test_unit.error.clone(),
            execution_time_seconds: test_unit.execution_time_seconds,
            cost_usd: test_unit.cost_usd,
            remaining_units: job.total_units - job.completed_units,
            conversation: test_unit.conversation.clone().unwrap_or_default(),
            awaiting_approval: true,
        })
    }

    /// Reject the test: job returns to `created` and the test unit
    /// goes back to `pending` for the next round.
    fn reject_test(&self, mut job: Job) -> Result<StartOutcome, OrchestratorError> {
        if let Some(test_unit_id) = job.test_unit_id.take() {
            if let Some(mut test_unit) = self.store.get_work_unit(&test_unit_id)? {
                let was_completed = test_unit.status == UnitStatus::Completed;
                test_unit.reset_to_pending()?;
                self.store.update_work_unit(&test_unit)?;
                if was_completed && job.completed_units > 0 {
                    job.completed_units -= 1;
                }
            }
        }

        job.transition_to(JobStatus::Created)?;
        job.test_passed = false;
        self.store.update_job(&job)?;
        Ok(StartOutcome::Reset)
    }
}

/// Field descriptions for the prompt synthesizer, from enumeration
/// metadata columns or the first item's keys.
fn payload_field_descriptions(
    metadata: &Payload,
    sample: Option<&Payload>,
) -> Option<BTreeMap<String, String>> {
    if let Some(columns) = metadata.get("columns").and_then(Value::as_array) {
        let fields: BTreeMap<String, String> = columns
            .iter()
            .filter_map(Value::as_str)
            .map(|column| (column.to_string(), format!("from column '{column}'")))
            .collect();
        if !fields.is_empty() {
            return Some(fields);
        }
    }

    let sample = sample?;
    let fields: BTreeMap<String, String> = sample
        .keys()
        .filter(|key| !key.starts_with('_'))
        .map(|key| (key.clone(), "payload field".to_string()))
        .collect();
    if fields.is_empty() {
        None
    } else {
        Some(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanout_agents::testing::{MockStep, MockWorker};
    use fanout_agents::types::UnitOutcome;
    use std::path::PathBuf;

    struct UnavailableWorker;

    impl UnitWorker for UnavailableWorker {
        fn name(&self) -> &str {
            "ghost"
        }
        fn is_available(&self) -> bool {
            false
        }
        fn execute(&self, _request: ExecuteRequest<'_>) -> UnitOutcome {
            unreachable!("unavailable worker must never execute")
        }
    }

    fn test_config() -> Config {
        Config {
            max_workers: 2,
            max_retries: 3,
            storage_path: PathBuf::from("/tmp/fanout-test/batch.db"),
            dashboard_port: 3847,
            skip_test: false,
            worker_timeout_secs: 10,
        }
    }

    fn orchestrator_with(worker: Arc<dyn UnitWorker>) -> (Orchestrator, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
        let orchestrator = Orchestrator::new(store.clone(), worker, test_config());
        (orchestrator, store)
    }

    fn temp_items_file(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "fanout-orch-{name}-{}.json",
            std::process::id()
        ));
        std::fs::write(&path, contents).expect("write items");
        path
    }

    fn create_request(path: &std::path::Path) -> CreateJobRequest {
        CreateJobRequest {
            name: "summarize records".to_string(),
            user_intent: "summarize each record into one sentence".to_string(),
            enumerator_type: "json".to_string(),
            enumerator_config: json!({"file_path": path.display().to_string()}),
            max_workers: None,
            max_retries: None,
            post_processing_prompt: None,
            post_processing_output_directory: None,
            metadata: None,
        }
    }

    #[test]
    fn create_job_persists_job_and_pending_units() {
        let worker = Arc::new(MockWorker::new());
        let (orchestrator, store) = orchestrator_with(worker);
        let path = temp_items_file(
            "create",
            r#"[{"item": "a", "title": "first"}, {"item": "b", "title": "second"}]"#,
        );

        let created = orchestrator
            .create_job(create_request(&path))
            .expect("create job");

        assert_eq!(created.total_units, 2);
        assert!(created.worker_prompt_template.contains("summarize each record"));
        assert!(created.worker_prompt_template.contains("{item}"));
        assert!(created.worker_prompt_template.contains("{title}"));
        assert_eq!(
            created
                .sample_payload
                .as_ref()
                .and_then(|payload| payload.get("item"))
                .and_then(Value::as_str),
            Some("a")
        );

        let job = store
            .get_job(&created.job_id)
            .expect("get")
            .expect("exists");
        assert_eq!(job.status, JobStatus::Created);
        assert_eq!(job.total_units, 2);
        assert_eq!(job.unit_type, "json");

        let pending = store
            .get_pending_units(&created.job_id, 10)
            .expect("pending");
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].payload["item"], "a");
        assert_eq!(pending[1].payload["item"], "b");

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn create_job_records_post_processing_configuration() {
        let worker = Arc::new(MockWorker::new());
        let (orchestrator, store) = orchestrator_with(worker);
        let path = temp_items_file("postproc", r#"[{"item": "a"}]"#);

        let mut request = create_request(&path);
        request.post_processing_prompt = Some("write a combined report".to_string());
        request.post_processing_output_directory = Some("/tmp/reports".to_string());

        let created = orchestrator.create_job(request).expect("create job");
        assert!(created.has_post_processing);

        let job = store
            .get_job(&created.job_id)
            .expect("get")
            .expect("exists");
        assert_eq!(
            job.post_processing_prompt.as_deref(),
            Some("write a combined report")
        );
        assert_eq!(
            job.metadata_str("post_processing_output_directory"),
            Some("/tmp/reports")
        );

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn unavailable_worker_fails_creation_early() {
        let (orchestrator, store) = orchestrator_with(Arc::new(UnavailableWorker));
        let path = temp_items_file("unavailable", r#"[{"item": "a"}]"#);

        let err = orchestrator
            .create_job(create_request(&path))
            .expect_err("must fail fast");
        assert!(matches!(err, OrchestratorError::WorkerUnavailable { .. }));
        assert_eq!(store.count_jobs(None).expect("count"), 0);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn empty_enumeration_persists_nothing() {
        let worker = Arc::new(MockWorker::new());
        let (orchestrator, store) = orchestrator_with(worker);
        let path = temp_items_file("empty", "[]");

        let err = orchestrator
            .create_job(create_request(&path))
            .expect_err("no items");
        assert!(matches!(err, OrchestratorError::NoItems));
        assert_eq!(store.count_jobs(None).expect("count"), 0);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn pending_approval_surfaces_code_and_persists_nothing() {
        let worker = Arc::new(MockWorker::new());
        let (orchestrator, store) = orchestrator_with(worker);

        let request = CreateJobRequest {
            name: "dynamic".to_string(),
            user_intent: "process generated items".to_string(),
            enumerator_type: "dynamic".to_string(),
            enumerator_config: json!({"code": "echo '[{\"item\": 1}]'"}),
            max_workers: None,
            max_retries: None,
            post_processing_prompt: None,
            post_processing_output_directory: None,
            metadata: None,
        };

        match orchestrator.create_job(request) {
            Err(OrchestratorError::Enumeration(EnumeratorError::PendingApproval { code })) => {
                assert!(code.contains("echo"));
            }
            other => panic!("expected pending approval, got {other:?}"),
        }
        assert_eq!(store.count_jobs(None).expect("count"), 0);
    }

    #[test]
    fn test_phase_runs_first_unit_synchronously() {
        let worker = Arc::new(MockWorker::new());
        let (orchestrator, store) = orchestrator_with(worker);
        let path = temp_items_file("testphase", r#"[{"item": "a"}, {"item": "b"}]"#);
        let created = orchestrator
            .create_job(create_request(&path))
            .expect("create");

        let outcome = orchestrator
            .start_job(&created.job_id, None, false)
            .expect("start");
        let report = match outcome {
            StartOutcome::Testing(report) => report,
            other => panic!("expected testing outcome, got {other:?}"),
        };

        assert!(report.test_passed);
        assert!(report.awaiting_approval);
        assert_eq!(report.remaining_units, 1);
        assert!(!report.conversation.is_empty());
        assert!(report.output.is_some());

        let job = store
            .get_job(&created.job_id)
            .expect("get")
            .expect("exists");
        assert_eq!(job.status, JobStatus::Testing);
        assert!(job.test_passed);
        assert_eq!(job.completed_units, 1);
        assert_eq!(job.test_unit_id.as_ref(), Some(&report.test_unit_id));

        let test_unit = store
            .get_work_unit(&report.test_unit_id)
            .expect("get")
            .expect("exists");
        assert_eq!(test_unit.status, UnitStatus::Completed);
        assert!(test_unit.conversation.is_some());
        assert!(test_unit.session_id.is_some());

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn rejecting_the_test_resets_job_and_unit() {
        let worker = Arc::new(MockWorker::new());
        let (orchestrator, store) = orchestrator_with(worker);
        let path = temp_items_file("reject", r#"[{"item": "a"}, {"item": "b"}]"#);
        let created = orchestrator
            .create_job(create_request(&path))
            .expect("create");

        let report = match orchestrator
            .start_job(&created.job_id, None, false)
            .expect("start")
        {
            StartOutcome::Testing(report) => report,
            other => panic!("expected testing outcome, got {other:?}"),
        };

        let outcome = orchestrator
            .start_job(&created.job_id, Some(false), false)
            .expect("reject");
        assert!(matches!(outcome, StartOutcome::Reset));

        let job = store
            .get_job(&created.job_id)
            .expect("get")
            .expect("exists");
        assert_eq!(job.status, JobStatus::Created);
        assert!(!job.test_passed);
        assert!(job.test_unit_id.is_none());
        assert_eq!(job.completed_units, 0);

        let ex_test_unit = store
            .get_work_unit(&report.test_unit_id)
            .expect("get")
            .expect("exists");
        assert_eq!(ex_test_unit.status, UnitStatus::Pending);
        assert!(ex_test_unit.conversation.is_none());

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn failed_test_leaves_job_testing_without_progress() {
        let worker = Arc::new(MockWorker::new().with_default(MockStep::fail("bad prompt")));
        let (orchestrator, store) = orchestrator_with(worker);
        let path = temp_items_file("failtest", r#"[{"item": "a"}]"#);
        let created = orchestrator
            .create_job(create_request(&path))
            .expect("create");

        let report = match orchestrator
            .start_job(&created.job_id, None, false)
            .expect("start")
        {
            StartOutcome::Testing(report) => report,
            other => panic!("expected testing outcome, got {other:?}"),
        };

        assert!(!report.test_passed);
        assert_eq!(report.error.as_deref(), Some("bad prompt"));

        let job = store
            .get_job(&created.job_id)
            .expect("get")
            .expect("exists");
        assert_eq!(job.status, JobStatus::Testing);
        assert!(!job.test_passed);
        assert_eq!(job.completed_units, 0);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn start_on_running_job_with_live_supervisor_is_idempotent() {
        let worker = Arc::new(MockWorker::new());
        let (orchestrator, store) = orchestrator_with(worker);
        let path = temp_items_file("idempotent", r#"[{"item": "a"}]"#);
        let created = orchestrator
            .create_job(create_request(&path))
            .expect("create");

        let mut job = store
            .get_job(&created.job_id)
            .expect("get")
            .expect("exists");
        job.status = JobStatus::Running;
        job.metadata
            .insert("executor_pid".to_string(), json!(std::process::id()));
        store.update_job(&job).expect("update");

        let outcome = orchestrator
            .start_job(&created.job_id, None, false)
            .expect("start");
        match outcome {
            StartOutcome::AlreadyRunning { pid } => assert_eq!(pid, std::process::id()),
            other => panic!("expected already-running, got {other:?}"),
        }

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn starting_a_completed_job_is_invalid() {
        let worker = Arc::new(MockWorker::new());
        let (orchestrator, store) = orchestrator_with(worker);
        let path = temp_items_file("invalid", r#"[{"item": "a"}]"#);
        let created = orchestrator
            .create_job(create_request(&path))
            .expect("create");

        let mut job = store
            .get_job(&created.job_id)
            .expect("get")
            .expect("exists");
        job.status = JobStatus::Completed;
        store.update_job(&job).expect("update");

        let err = orchestrator
            .start_job(&created.job_id, None, false)
            .expect_err("completed job cannot start");
        assert!(matches!(
            err,
            OrchestratorError::InvalidState { status: "completed" }
        ));

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn status_report_aggregates_progress_and_unit_stats() {
        let worker = Arc::new(MockWorker::new());
        let (orchestrator, store) = orchestrator_with(worker);
        let path = temp_items_file("status", r#"[{"item": "a"}, {"item": "b"}]"#);
        let created = orchestrator
            .create_job(create_request(&path))
            .expect("create");

        let mut job = store
            .get_job(&created.job_id)
            .expect("get")
            .expect("exists");
        job.completed_units = 1;
        store.update_job(&job).expect("update");

        let report = orchestrator
            .get_job_status(&created.job_id)
            .expect("status");
        assert_eq!(report.total_units, 2);
        assert_eq!(report.completed_units, 1);
        assert_eq!(report.progress_percentage, 50.0);
        assert_eq!(report.unit_stats.get("pending"), Some(&2));
        assert!(!report.executor_running);

        let _ = std::fs::remove_file(path);
    }
}

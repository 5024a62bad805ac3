//! Data model: jobs, work units, workers, and log entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state::{
    is_job_transition_allowed, is_unit_transition_allowed, JobStatus, StateMachineError,
    UnitStatus, WorkerState,
};

/// Unit type tag reserved for the synthetic post-processing unit.
pub const POST_PROCESSING_UNIT_TYPE: &str = "post_processing";

/// Ordered string-keyed payload attached to a work unit.
pub type Payload = serde_json::Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnitId(pub String);

impl UnitId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A batch job: a prompt template applied across many work units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub name: String,
    /// The user's original intent text.
    pub description: String,
    pub status: JobStatus,
    pub worker_prompt_template: String,
    pub unit_type: String,
    pub total_units: i64,
    pub completed_units: i64,
    pub failed_units: i64,
    pub max_workers: usize,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub test_unit_id: Option<UnitId>,
    pub test_passed: bool,
    pub post_processing_prompt: Option<String>,
    pub post_processing_unit_id: Option<UnitId>,
    pub bypass_failures: bool,
    /// Free-form metadata; the supervisor records `executor_pid`,
    /// `executor_started_at`, and friends here.
    pub metadata: Payload,
}

impl Job {
    pub fn new(
        job_id: JobId,
        name: impl Into<String>,
        description: impl Into<String>,
        worker_prompt_template: impl Into<String>,
        unit_type: impl Into<String>,
        total_units: i64,
        max_workers: usize,
    ) -> Self {
        Self {
            job_id,
            name: name.into(),
            description: description.into(),
            status: JobStatus::Created,
            worker_prompt_template: worker_prompt_template.into(),
            unit_type: unit_type.into(),
            total_units,
            completed_units: 0,
            failed_units: 0,
            max_workers,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            test_unit_id: None,
            test_passed: false,
            post_processing_prompt: None,
            post_processing_unit_id: None,
            bypass_failures: false,
            metadata: Payload::new(),
        }
    }

    /// Move the job to `to`, refusing transitions the state machine
    /// does not permit.
    pub fn transition_to(&mut self, to: JobStatus) -> Result<(), StateMachineError> {
        if !is_job_transition_allowed(self.status, to) {
            return Err(StateMachineError::InvalidJobTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Completion percentage, capped at 100 to tolerate legacy rows
    /// whose post-processing unit was miscounted into the total.
    pub fn progress_percentage(&self) -> f64 {
        if self.total_units == 0 {
            return 0.0;
        }
        let pct = (self.completed_units as f64 / self.total_units as f64) * 100.0;
        pct.min(100.0)
    }

    pub fn all_units_done(&self) -> bool {
        self.completed_units + self.failed_units >= self.total_units
    }

    pub fn all_units_succeeded(&self) -> bool {
        self.completed_units >= self.total_units
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// The supervisor pid recorded by the most recent detached start.
    pub fn executor_pid(&self) -> Option<u32> {
        self.metadata
            .get("executor_pid")
            .and_then(Value::as_u64)
            .and_then(|pid| u32::try_from(pid).ok())
    }
}

/// One item of a batch, with its own payload, status, and conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub unit_id: UnitId,
    pub job_id: JobId,
    pub unit_type: String,
    pub status: UnitStatus,
    pub payload: Payload,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub worker_id: Option<WorkerId>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub execution_time_seconds: Option<f64>,
    pub output_files: Vec<String>,
    pub rendered_prompt: Option<String>,
    /// Streamed agent events in emission order; `None` until the first
    /// event arrives.
    pub conversation: Option<Vec<Value>>,
    pub session_id: Option<String>,
    pub cost_usd: Option<f64>,
    /// OS pid of the agent subprocess while the unit is processing.
    pub process_id: Option<u32>,
}

impl WorkUnit {
    pub fn new(
        unit_id: UnitId,
        job_id: JobId,
        unit_type: impl Into<String>,
        payload: Payload,
        max_retries: u32,
    ) -> Self {
        Self {
            unit_id,
            job_id,
            unit_type: unit_type.into(),
            status: UnitStatus::Pending,
            payload,
            created_at: Utc::now(),
            assigned_at: None,
            started_at: None,
            completed_at: None,
            worker_id: None,
            result: None,
            error: None,
            retry_count: 0,
            max_retries,
            execution_time_seconds: None,
            output_files: Vec::new(),
            rendered_prompt: None,
            conversation: None,
            session_id: None,
            cost_usd: None,
            process_id: None,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    pub fn is_post_processing(&self) -> bool {
        self.unit_type == POST_PROCESSING_UNIT_TYPE
    }

    /// Move the unit to `to`, refusing transitions the state machine
    /// does not permit.
    pub fn transition_to(&mut self, to: UnitStatus) -> Result<(), StateMachineError> {
        if !is_unit_transition_allowed(self.status, to) {
            return Err(StateMachineError::InvalidUnitTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Reset the unit for another attempt, clearing execution state.
    /// The retry counter is deliberately preserved so total attempts
    /// stay auditable.
    pub fn reset_to_pending(&mut self) -> Result<(), StateMachineError> {
        self.transition_to(UnitStatus::Pending)?;
        self.error = None;
        self.result = None;
        self.worker_id = None;
        self.assigned_at = None;
        self.started_at = None;
        self.completed_at = None;
        self.execution_time_seconds = None;
        self.process_id = None;
        self.conversation = None;
        self.rendered_prompt = None;
        self.session_id = None;
        self.cost_usd = None;
        Ok(())
    }
}

/// Persistent record of one worker slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: WorkerId,
    pub job_id: JobId,
    pub status: WorkerState,
    pub current_unit_id: Option<UnitId>,
    /// Pid of the supervisor process that owns this worker slot.
    pub process_id: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub units_completed: i64,
    pub units_failed: i64,
    pub total_execution_time: f64,
}

impl WorkerRecord {
    pub fn busy(job_id: JobId, current_unit_id: UnitId, process_id: u32) -> Self {
        Self {
            worker_id: WorkerId::generate(),
            job_id,
            status: WorkerState::Busy,
            current_unit_id: Some(current_unit_id),
            process_id: Some(process_id),
            started_at: Utc::now(),
            last_heartbeat: None,
            units_completed: 0,
            units_failed: 0,
            total_execution_time: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

/// A per-job log row persisted in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: Option<i64>,
    pub job_id: JobId,
    pub source: String,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub worker_id: Option<WorkerId>,
    pub unit_id: Option<UnitId>,
    pub extra: Option<Value>,
}

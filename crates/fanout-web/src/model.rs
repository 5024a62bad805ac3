//! Response views for the HTTP API.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use fanout_core::state::{JobStatus, UnitStatus, WorkerState};
use fanout_core::types::{Job, Payload, WorkUnit, WorkerRecord};
use fanoutd::executor::ExecutorStatus;
use fanoutd::persistence::LiveUnitSnapshot;

#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub job_id: String,
    pub name: String,
    pub status: JobStatus,
    pub unit_type: String,
    pub total_units: i64,
    pub completed_units: i64,
    pub failed_units: i64,
    pub progress_percentage: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub active_workers: usize,
    pub total_cost_usd: Option<f64>,
}

impl JobSummary {
    pub fn from_job(job: &Job, active_workers: usize, total_cost_usd: Option<f64>) -> Self {
        Self {
            job_id: job.job_id.0.clone(),
            name: job.name.clone(),
            status: job.status,
            unit_type: job.unit_type.clone(),
            total_units: job.total_units,
            completed_units: job.completed_units.min(job.total_units),
            failed_units: job.failed_units,
            progress_percentage: job.progress_percentage(),
            created_at: job.created_at,
            started_at: job.started_at,
            active_workers,
            total_cost_usd,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobSummary>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub job_id: String,
    pub name: String,
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
    pub test_unit_id: Option<String>,
    pub test_passed: bool,
    pub post_processing_prompt: Option<String>,
    pub post_processing_unit_id: Option<String>,
    pub bypass_failures: bool,
    pub metadata: Payload,
    pub total_cost_usd: Option<f64>,
}

impl JobView {
    pub fn from_job(job: &Job, total_cost_usd: Option<f64>) -> Self {
        Self {
            job_id: job.job_id.0.clone(),
            name: job.name.clone(),
            description: job.description.clone(),
            status: job.status,
            worker_prompt_template: job.worker_prompt_template.clone(),
            unit_type: job.unit_type.clone(),
            total_units: job.total_units,
            completed_units: job.completed_units.min(job.total_units),
            failed_units: job.failed_units,
            max_workers: job.max_workers,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            test_unit_id: job.test_unit_id.as_ref().map(|id| id.0.clone()),
            test_passed: job.test_passed,
            post_processing_prompt: job.post_processing_prompt.clone(),
            post_processing_unit_id: job
                .post_processing_unit_id
                .as_ref()
                .map(|id| id.0.clone()),
            bypass_failures: job.bypass_failures,
            metadata: job.metadata.clone(),
            total_cost_usd,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerView {
    pub worker_id: String,
    pub job_id: String,
    pub status: WorkerState,
    pub current_unit_id: Option<String>,
    pub current_unit_payload: Option<Payload>,
    pub units_completed: i64,
    pub units_failed: i64,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl WorkerView {
    pub fn from_worker(worker: &WorkerRecord, current_unit_payload: Option<Payload>) -> Self {
        Self {
            worker_id: worker.worker_id.0.clone(),
            job_id: worker.job_id.0.clone(),
            status: worker.status,
            current_unit_id: worker.current_unit_id.as_ref().map(|id| id.0.clone()),
            current_unit_payload,
            units_completed: worker.units_completed,
            units_failed: worker.units_failed,
            started_at: worker.started_at,
            last_heartbeat: worker.last_heartbeat,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitSummary {
    pub unit_id: String,
    pub unit_type: String,
    pub status: UnitStatus,
    pub payload: Payload,
    pub worker_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub execution_time_seconds: Option<f64>,
    pub retry_count: u32,
    pub error: Option<String>,
    pub cost_usd: Option<f64>,
    pub session_id: Option<String>,
    pub process_id: Option<u32>,
}

impl UnitSummary {
    pub fn from_unit(unit: &WorkUnit) -> Self {
        Self {
            unit_id: unit.unit_id.0.clone(),
            unit_type: unit.unit_type.clone(),
            status: unit.status,
            payload: unit.payload.clone(),
            worker_id: unit.worker_id.as_ref().map(|id| id.0.clone()),
            started_at: unit.started_at,
            completed_at: unit.completed_at,
            execution_time_seconds: unit.execution_time_seconds,
            retry_count: unit.retry_count,
            error: unit.error.clone(),
            cost_usd: unit.cost_usd,
            session_id: unit.session_id.clone(),
            process_id: unit.process_id,
        }
    }
}

/// Full unit detail, conversation included.
#[derive(Debug, Clone, Serialize)]
pub struct UnitDetail {
    #[serde(flatten)]
    pub summary: UnitSummary,
    pub max_retries: u32,
    pub rendered_prompt: Option<String>,
    pub conversation: Vec<Value>,
    pub result: Option<Value>,
    pub output_files: Vec<String>,
}

impl UnitDetail {
    pub fn from_unit(unit: &WorkUnit) -> Self {
        Self {
            summary: UnitSummary::from_unit(unit),
            max_retries: unit.max_retries,
            rendered_prompt: unit.rendered_prompt.clone(),
            conversation: unit.conversation.clone().unwrap_or_default(),
            result: unit.result.clone(),
            output_files: unit.output_files.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct UnitStats {
    pub pending: i64,
    pub assigned: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

impl UnitStats {
    pub fn from_counts(counts: &std::collections::HashMap<UnitStatus, i64>) -> Self {
        Self {
            pending: counts.get(&UnitStatus::Pending).copied().unwrap_or(0),
            assigned: counts.get(&UnitStatus::Assigned).copied().unwrap_or(0),
            processing: counts.get(&UnitStatus::Processing).copied().unwrap_or(0),
            completed: counts.get(&UnitStatus::Completed).copied().unwrap_or(0),
            failed: counts.get(&UnitStatus::Failed).copied().unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobDetailResponse {
    pub job: JobView,
    pub workers: Vec<WorkerView>,
    pub recent_units: Vec<UnitSummary>,
    pub unit_stats: UnitStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitListResponse {
    pub units: Vec<UnitSummary>,
    pub post_processing_unit: Option<UnitSummary>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitDetailResponse {
    pub unit: UnitDetail,
}

#[derive(Debug, Clone, Serialize)]
pub struct LiveResponse {
    pub job_id: String,
    pub job_status: JobStatus,
    pub active_units: Vec<LiveUnitSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkersResponse {
    pub workers: Vec<WorkerView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    pub total_jobs: i64,
    pub jobs_by_status: std::collections::BTreeMap<String, i64>,
    pub units_by_status: std::collections::BTreeMap<String, i64>,
    pub total_cost_usd: Option<f64>,
    pub active_workers: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogsResponse {
    pub logs: Vec<fanout_core::types::LogEntry>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutorResponse {
    pub job_id: String,
    pub job_name: String,
    pub job_status: JobStatus,
    pub executor: ExecutorStatus,
    pub metadata: Payload,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

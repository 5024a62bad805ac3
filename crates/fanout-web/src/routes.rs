//! Route handlers for the read/command API.

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use fanout_core::state::{JobStatus, UnitStatus};
use fanout_core::types::{JobId, LogLevel, UnitId};
use fanoutd::executor::JobExecutor;
use fanoutd::persistence::LogFilter;

use crate::error::ApiError;
use crate::model::{
    CommandResponse, ExecutorResponse, JobDetailResponse, JobListResponse, JobSummary, JobView,
    LiveResponse, LogsResponse, StatsResponse, UnitDetail, UnitDetailResponse, UnitListResponse,
    UnitStats, UnitSummary, WorkerView, WorkersResponse,
};
use crate::state::ApiState;

const DEFAULT_JOB_LIMIT: i64 = 50;
const DEFAULT_UNIT_LIMIT: i64 = 100;
const DEFAULT_LOG_LIMIT: i64 = 100;
const RECENT_UNIT_LIMIT: i64 = 10;

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/api/jobs", get(list_jobs))
        .route("/api/jobs/{job_id}", get(get_job))
        .route("/api/jobs/{job_id}/units", get(list_units))
        .route("/api/jobs/{job_id}/units/{unit_id}", get(get_unit))
        .route("/api/jobs/{job_id}/live", get(live_activity))
        .route("/api/jobs/{job_id}/logs", get(get_logs))
        .route("/api/jobs/{job_id}/executor", get(get_executor))
        .route("/api/workers", get(list_workers))
        .route("/api/stats", get(stats))
        .route("/api/jobs/{job_id}/bypass", post(bypass_failures))
        .route("/api/jobs/{job_id}/kill", post(kill_job))
        .route("/api/jobs/{job_id}/restart", post(restart_job))
        .route("/api/jobs/{job_id}/units/{unit_id}/kill", post(kill_unit))
        .route(
            "/api/jobs/{job_id}/units/{unit_id}/restart",
            post(restart_unit),
        )
        .with_state(state)
}

async fn index() -> impl IntoResponse {
    "fanout-web running"
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "ok": true }))
}

#[derive(Debug, Deserialize)]
struct JobsQuery {
    status: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn list_jobs(
    State(state): State<ApiState>,
    Query(query): Query<JobsQuery>,
) -> Result<Json<JobListResponse>, ApiError> {
    let status = match query.status.as_deref() {
        Some(tag) => Some(JobStatus::parse(tag).map_err(|err| ApiError::Command {
            code: "BAD_REQUEST",
            message: err.to_string(),
        })?),
        None => None,
    };
    let limit = query.limit.unwrap_or(DEFAULT_JOB_LIMIT).max(1);
    let offset = query.offset.unwrap_or(0).max(0);

    let jobs = state.store.list_jobs(status, limit, offset)?;
    let total = state.store.count_jobs(status)?;

    let mut summaries = Vec::with_capacity(jobs.len());
    for job in &jobs {
        let active = state.store.get_active_workers(&job.job_id)?.len();
        let cost = state.store.job_total_cost(&job.job_id)?;
        summaries.push(JobSummary::from_job(job, active, cost));
    }

    Ok(Json(JobListResponse {
        jobs: summaries,
        total,
        limit,
        offset,
    }))
}

async fn get_job(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobDetailResponse>, ApiError> {
    let job_id = JobId::new(job_id);
    let job = state
        .store
        .get_job(&job_id)?
        .ok_or_else(|| ApiError::JobNotFound {
            job_id: job_id.0.clone(),
        })?;

    let mut workers = Vec::new();
    for worker in state.store.get_busy_workers(&job_id)? {
        let payload = match &worker.current_unit_id {
            Some(unit_id) => state
                .store
                .get_work_unit(unit_id)?
                .map(|unit| unit.payload),
            None => None,
        };
        workers.push(WorkerView::from_worker(&worker, payload));
    }

    // Recent activity: in-flight first, then fresh completions and
    // failures.
    let mut recent = Vec::new();
    for (status, limit) in [
        (UnitStatus::Processing, RECENT_UNIT_LIMIT),
        (UnitStatus::Completed, RECENT_UNIT_LIMIT),
        (UnitStatus::Failed, 5),
    ] {
        for unit in state
            .store
            .list_units_for_job(&job_id, Some(status), limit, 0, false)?
        {
            recent.push(UnitSummary::from_unit(&unit));
        }
    }
    recent.sort_by(|a, b| {
        let a_key = a.completed_at.or(a.started_at);
        let b_key = b.completed_at.or(b.started_at);
        b_key.cmp(&a_key)
    });
    recent.truncate(RECENT_UNIT_LIMIT as usize);

    let counts = state.store.count_units_by_status(&job_id)?;
    let cost = state.store.job_total_cost(&job_id)?;

    Ok(Json(JobDetailResponse {
        job: JobView::from_job(&job, cost),
        workers,
        recent_units: recent,
        unit_stats: UnitStats::from_counts(&counts),
    }))
}

#[derive(Debug, Deserialize)]
struct UnitsQuery {
    status: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn list_units(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
    Query(query): Query<UnitsQuery>,
) -> Result<Json<UnitListResponse>, ApiError> {
    let job_id = JobId::new(job_id);
    let job = state
        .store
        .get_job(&job_id)?
        .ok_or_else(|| ApiError::JobNotFound {
            job_id: job_id.0.clone(),
        })?;

    let status = match query.status.as_deref() {
        Some(tag) => Some(UnitStatus::parse(tag).map_err(|err| ApiError::Command {
            code: "BAD_REQUEST",
            message: err.to_string(),
        })?),
        None => None,
    };
    let limit = query.limit.unwrap_or(DEFAULT_UNIT_LIMIT).max(1);
    let offset = query.offset.unwrap_or(0).max(0);

    let units = state
        .store
        .list_units_for_job(&job_id, status, limit, offset, true)?;
    let post_processing_unit = match &job.post_processing_unit_id {
        Some(unit_id) => state
            .store
            .get_work_unit(unit_id)?
            .map(|unit| UnitSummary::from_unit(&unit)),
        None => None,
    };

    Ok(Json(UnitListResponse {
        units: units.iter().map(UnitSummary::from_unit).collect(),
        post_processing_unit,
        limit,
        offset,
    }))
}

async fn get_unit(
    State(state): State<ApiState>,
    Path((job_id, unit_id)): Path<(String, String)>,
) -> Result<Json<UnitDetailResponse>, ApiError> {
    let job_id = JobId::new(job_id);
    let unit_id = UnitId::new(unit_id);
    let unit = state
        .store
        .get_work_unit(&unit_id)?
        .filter(|unit| unit.job_id == job_id)
        .ok_or_else(|| ApiError::UnitNotFound {
            unit_id: unit_id.0.clone(),
        })?;

    Ok(Json(UnitDetailResponse {
        unit: UnitDetail::from_unit(&unit),
    }))
}

async fn live_activity(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<Json<LiveResponse>, ApiError> {
    let job_id = JobId::new(job_id);
    let job = state
        .store
        .get_job(&job_id)?
        .ok_or_else(|| ApiError::JobNotFound {
            job_id: job_id.0.clone(),
        })?;

    let active_units = state.store.active_units_with_latest_event(&job_id)?;
    Ok(Json(LiveResponse {
        job_id: job_id.0,
        job_status: job.status,
        active_units,
    }))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    source: Option<String>,
    level: Option<String>,
    since: Option<chrono::DateTime<chrono::Utc>>,
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn get_logs(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<LogsResponse>, ApiError> {
    let job_id = JobId::new(job_id);
    if state.store.get_job(&job_id)?.is_none() {
        return Err(ApiError::JobNotFound { job_id: job_id.0 });
    }

    let level = match query.level.as_deref() {
        Some("debug") => Some(LogLevel::Debug),
        Some("info") => Some(LogLevel::Info),
        Some("warning") => Some(LogLevel::Warning),
        Some("error") => Some(LogLevel::Error),
        Some(other) => {
            return Err(ApiError::Command {
                code: "BAD_REQUEST",
                message: format!("unknown log level: {other}"),
            })
        }
        None => None,
    };

    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT).max(1);
    let offset = query.offset.unwrap_or(0).max(0);
    let filter = LogFilter {
        source: query.source,
        level,
        since: query.since,
        limit,
        offset,
    };

    let logs = state.store.query_logs(&job_id, &filter)?;
    let total = state.store.count_logs(&job_id)?;
    Ok(Json(LogsResponse {
        logs,
        total,
        limit,
        offset,
    }))
}

async fn get_executor(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<Json<ExecutorResponse>, ApiError> {
    let job_id = JobId::new(job_id);
    let job = state
        .store
        .get_job(&job_id)?
        .ok_or_else(|| ApiError::JobNotFound {
            job_id: job_id.0.clone(),
        })?;
    let executor = JobExecutor::executor_status(&state.store, &job_id)?
        .ok_or(ApiError::JobNotFound { job_id: job_id.0 })?;

    Ok(Json(ExecutorResponse {
        job_id: job.job_id.0.clone(),
        job_name: job.name.clone(),
        job_status: job.status,
        executor,
        metadata: job.metadata,
    }))
}

async fn list_workers(
    State(state): State<ApiState>,
) -> Result<Json<WorkersResponse>, ApiError> {
    let workers = state.store.get_all_active_workers()?;
    let mut views = Vec::with_capacity(workers.len());
    for worker in &workers {
        let payload = match &worker.current_unit_id {
            Some(unit_id) => state
                .store
                .get_work_unit(unit_id)?
                .map(|unit| unit.payload),
            None => None,
        };
        views.push(WorkerView::from_worker(worker, payload));
    }
    Ok(Json(WorkersResponse { workers: views }))
}

async fn stats(State(state): State<ApiState>) -> Result<Json<StatsResponse>, ApiError> {
    let mut jobs_by_status = std::collections::BTreeMap::new();
    for status in [
        JobStatus::Created,
        JobStatus::Testing,
        JobStatus::Ready,
        JobStatus::Running,
        JobStatus::Paused,
        JobStatus::PostProcessing,
        JobStatus::Completed,
        JobStatus::Failed,
    ] {
        let count = state.store.count_jobs(Some(status))?;
        if count > 0 {
            jobs_by_status.insert(status.as_str().to_string(), count);
        }
    }
    let total_jobs = state.store.count_jobs(None)?;

    let units_by_status = state
        .store
        .count_all_units_by_status()?
        .into_iter()
        .map(|(status, count)| (status.as_str().to_string(), count))
        .collect();

    Ok(Json(StatsResponse {
        total_jobs,
        jobs_by_status,
        units_by_status,
        total_cost_usd: state.store.total_cost_all_jobs()?,
        active_workers: state.store.count_active_workers_all()?,
    }))
}

// --- Command endpoints ---

fn require_writable(state: &ApiState) -> Result<(), ApiError> {
    if state.read_only {
        Err(ApiError::ReadOnly)
    } else {
        Ok(())
    }
}

/// Enable `bypass_failures` and resume the job so post-processing can
/// run despite terminally failed units.
async fn bypass_failures(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<Json<CommandResponse>, ApiError> {
    require_writable(&state)?;
    let job_id = JobId::new(job_id);
    let mut job = state
        .store
        .get_job(&job_id)?
        .ok_or_else(|| ApiError::JobNotFound {
            job_id: job_id.0.clone(),
        })?;

    if job.post_processing_prompt.is_none() {
        return Err(ApiError::Command {
            code: "NO_POST_PROCESSING",
            message: "this job has no post-processing step configured".to_string(),
        });
    }
    if !job.all_units_done() {
        return Err(ApiError::Command {
            code: "UNITS_STILL_PROCESSING",
            message: "cannot bypass until all units have finished processing".to_string(),
        });
    }
    if job.failed_units == 0 {
        return Err(ApiError::Command {
            code: "NO_FAILURES",
            message: "no failures to bypass; all units succeeded".to_string(),
        });
    }
    if job.bypass_failures {
        return Err(ApiError::Command {
            code: "ALREADY_BYPASSED",
            message: "bypass has already been enabled for this job".to_string(),
        });
    }

    job.bypass_failures = true;
    state.store.update_job(&job)?;

    let pid = JobExecutor::resume_job(&state.store, &job_id, &state.db_path)?;
    Ok(Json(CommandResponse {
        success: true,
        message: format!(
            "bypass enabled; {} failed units will be ignored by post-processing",
            job.failed_units
        ),
        pid: Some(pid),
    }))
}

async fn kill_job(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<Json<CommandResponse>, ApiError> {
    require_writable(&state)?;
    let job_id = JobId::new(job_id);
    let pid = JobExecutor::kill_executor(&state.store, &job_id)?;
    Ok(Json(CommandResponse {
        success: true,
        message: "supervisor killed".to_string(),
        pid: Some(pid),
    }))
}

async fn restart_job(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<Json<CommandResponse>, ApiError> {
    require_writable(&state)?;
    let job_id = JobId::new(job_id);
    let job = state
        .store
        .get_job(&job_id)?
        .ok_or_else(|| ApiError::JobNotFound {
            job_id: job_id.0.clone(),
        })?;

    if let Some(pid) = job.executor_pid() {
        if fanout_agents::process::pid_is_alive(pid) {
            return Err(ApiError::Command {
                code: "ALREADY_RUNNING",
                message: "the supervisor is already running".to_string(),
            });
        }
    }

    state
        .store
        .cleanup_stale_workers(&job_id, fanout_agents::process::pid_is_alive)?;
    state.store.reset_stuck_units(&job_id)?;

    let pid = JobExecutor::resume_job(&state.store, &job_id, &state.db_path)?;
    Ok(Json(CommandResponse {
        success: true,
        message: "supervisor restarted".to_string(),
        pid: Some(pid),
    }))
}

async fn kill_unit(
    State(state): State<ApiState>,
    Path((job_id, unit_id)): Path<(String, String)>,
) -> Result<Json<CommandResponse>, ApiError> {
    require_writable(&state)?;
    let pid = JobExecutor::kill_work_unit(
        &state.store,
        &JobId::new(job_id),
        &UnitId::new(unit_id),
    )?;
    Ok(Json(CommandResponse {
        success: true,
        message: "work unit process killed".to_string(),
        pid: Some(pid),
    }))
}

async fn restart_unit(
    State(state): State<ApiState>,
    Path((job_id, unit_id)): Path<(String, String)>,
) -> Result<Json<CommandResponse>, ApiError> {
    require_writable(&state)?;
    JobExecutor::restart_work_unit(&state.store, &JobId::new(job_id), &UnitId::new(unit_id))?;
    Ok(Json(CommandResponse {
        success: true,
        message: "work unit reset to pending".to_string(),
        pid: None,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use std::path::PathBuf;
    use std::sync::Arc;
    use tower::ServiceExt;

    use fanout_core::types::{Job, Payload, WorkUnit};
    use fanoutd::persistence::SqliteStore;

    fn test_state(read_only: bool) -> ApiState {
        let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
        ApiState::new(store, PathBuf::from("/tmp/fanout-web-test.db"), read_only)
    }

    fn seed_job(state: &ApiState, id: &str, status: JobStatus) -> Job {
        let mut job = Job::new(
            fanout_core::types::JobId::new(id),
            format!("job {id}"),
            "summarize everything",
            "work on {item}",
            "record",
            2,
            2,
        );
        job.status = status;
        state.store.create_job(&job).expect("create job");
        job
    }

    fn seed_unit(state: &ApiState, job_id: &str, unit_id: &str, status: UnitStatus) -> WorkUnit {
        let mut payload = Payload::new();
        payload.insert("item".to_string(), json!(unit_id));
        let mut unit = WorkUnit::new(
            fanout_core::types::UnitId::new(unit_id),
            fanout_core::types::JobId::new(job_id),
            "record",
            payload,
            3,
        );
        unit.status = status;
        state.store.create_work_unit(&unit).expect("create unit");
        unit
    }

    async fn call(router: Router, method: &str, uri: &str) -> (StatusCode, Value) {
        let response = router
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    #[tokio::test]
    async fn health_endpoint_responds() {
        let state = test_state(false);
        let (status, body) = call(router(state), "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn list_jobs_returns_summaries_and_total() {
        let state = test_state(false);
        seed_job(&state, "J1", JobStatus::Running);
        seed_job(&state, "J2", JobStatus::Completed);

        let (status, body) = call(router(state), "GET", "/api/jobs").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 2);
        assert_eq!(body["jobs"].as_array().expect("jobs").len(), 2);
    }

    #[tokio::test]
    async fn list_jobs_filters_by_status() {
        let state = test_state(false);
        seed_job(&state, "J1", JobStatus::Running);
        seed_job(&state, "J2", JobStatus::Completed);

        let (status, body) =
            call(router(state), "GET", "/api/jobs?status=completed").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 1);
        assert_eq!(body["jobs"][0]["job_id"], "J2");
    }

    #[tokio::test]
    async fn missing_job_returns_spec_error_shape() {
        let state = test_state(false);
        let (status, body) = call(router(state), "GET", "/api/jobs/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "JOB_NOT_FOUND");
        assert!(body["error"]["message"]
            .as_str()
            .expect("message")
            .contains("nope"));
    }

    #[tokio::test]
    async fn job_detail_includes_stats_and_recent_units() {
        let state = test_state(false);
        seed_job(&state, "J1", JobStatus::Running);
        seed_unit(&state, "J1", "U1", UnitStatus::Completed);
        seed_unit(&state, "J1", "U2", UnitStatus::Pending);

        let (status, body) = call(router(state), "GET", "/api/jobs/J1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["job"]["job_id"], "J1");
        assert_eq!(body["unit_stats"]["completed"], 1);
        assert_eq!(body["unit_stats"]["pending"], 1);
        let recent = body["recent_units"].as_array().expect("recent units");
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0]["unit_id"], "U1");
    }

    #[tokio::test]
    async fn unit_list_separates_post_processing_unit() {
        let state = test_state(false);
        let mut job = seed_job(&state, "J1", JobStatus::Completed);
        seed_unit(&state, "J1", "U1", UnitStatus::Completed);

        let mut payload = Payload::new();
        payload.insert("type".to_string(), json!("post_processing"));
        let mut post = WorkUnit::new(
            fanout_core::types::UnitId::new("UP"),
            fanout_core::types::JobId::new("J1"),
            fanout_core::types::POST_PROCESSING_UNIT_TYPE,
            payload,
            3,
        );
        post.status = UnitStatus::Completed;
        state.store.create_work_unit(&post).expect("create post unit");
        job.post_processing_unit_id = Some(post.unit_id.clone());
        state.store.update_job(&job).expect("update job");

        let (status, body) = call(router(state), "GET", "/api/jobs/J1/units").await;
        assert_eq!(status, StatusCode::OK);
        let units = body["units"].as_array().expect("units");
        assert_eq!(units.len(), 1, "post-processing unit is not in the main list");
        assert_eq!(body["post_processing_unit"]["unit_id"], "UP");
    }

    #[tokio::test]
    async fn unit_detail_includes_conversation() {
        let state = test_state(false);
        seed_job(&state, "J1", JobStatus::Running);
        let mut unit = seed_unit(&state, "J1", "U1", UnitStatus::Completed);
        unit.conversation = Some(vec![
            json!({"type": "system", "subtype": "init", "session_id": "s1"}),
            json!({"type": "result", "is_error": false}),
        ]);
        state.store.update_work_unit(&unit).expect("update unit");

        let (status, body) = call(router(state), "GET", "/api/jobs/J1/units/U1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["unit"]["unit_id"], "U1");
        assert_eq!(
            body["unit"]["conversation"].as_array().expect("conv").len(),
            2
        );
    }

    #[tokio::test]
    async fn unit_from_another_job_is_not_found() {
        let state = test_state(false);
        seed_job(&state, "J1", JobStatus::Running);
        seed_job(&state, "J2", JobStatus::Running);
        seed_unit(&state, "J2", "U1", UnitStatus::Pending);

        let (status, body) = call(router(state), "GET", "/api/jobs/J1/units/U1").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "UNIT_NOT_FOUND");
    }

    #[tokio::test]
    async fn live_endpoint_lists_active_units() {
        let state = test_state(false);
        seed_job(&state, "J1", JobStatus::Running);
        let mut unit = seed_unit(&state, "J1", "U1", UnitStatus::Processing);
        unit.started_at = Some(chrono::Utc::now());
        unit.conversation = Some(vec![json!({
            "type": "assistant",
            "message": {"content": [{"type": "text", "text": "thinking hard"}]},
        })]);
        state.store.update_work_unit(&unit).expect("update unit");

        let (status, body) = call(router(state), "GET", "/api/jobs/J1/live").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["job_status"], "running");
        let active = body["active_units"].as_array().expect("active");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0]["latest_event"]["type"], "text");
    }

    #[tokio::test]
    async fn stats_aggregates_jobs_and_units() {
        let state = test_state(false);
        seed_job(&state, "J1", JobStatus::Running);
        seed_job(&state, "J2", JobStatus::Completed);
        seed_unit(&state, "J1", "U1", UnitStatus::Pending);
        seed_unit(&state, "J1", "U2", UnitStatus::Completed);

        let (status, body) = call(router(state), "GET", "/api/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_jobs"], 2);
        assert_eq!(body["jobs_by_status"]["running"], 1);
        assert_eq!(body["units_by_status"]["pending"], 1);
    }

    #[tokio::test]
    async fn bypass_validates_preconditions() {
        let state = test_state(false);

        // No post-processing configured.
        let mut job = seed_job(&state, "J1", JobStatus::Failed);
        let (status, body) = call(router(state.clone()), "POST", "/api/jobs/J1/bypass").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "NO_POST_PROCESSING");

        // Units still in flight.
        job.post_processing_prompt = Some("synth".to_string());
        job.completed_units = 1;
        state.store.update_job(&job).expect("update");
        let (_, body) = call(router(state.clone()), "POST", "/api/jobs/J1/bypass").await;
        assert_eq!(body["error"]["code"], "UNITS_STILL_PROCESSING");

        // Nothing failed.
        job.completed_units = 2;
        job.failed_units = 0;
        state.store.update_job(&job).expect("update");
        let (_, body) = call(router(state.clone()), "POST", "/api/jobs/J1/bypass").await;
        assert_eq!(body["error"]["code"], "NO_FAILURES");

        // Already bypassed.
        job.completed_units = 1;
        job.failed_units = 1;
        job.bypass_failures = true;
        state.store.update_job(&job).expect("update");
        let (_, body) = call(router(state.clone()), "POST", "/api/jobs/J1/bypass").await;
        assert_eq!(body["error"]["code"], "ALREADY_BYPASSED");
    }

    #[tokio::test]
    async fn bypass_sets_flag_and_reuses_live_supervisor() {
        let state = test_state(false);
        let mut job = seed_job(&state, "J1", JobStatus::Failed);
        job.post_processing_prompt = Some("synth".to_string());
        job.completed_units = 1;
        job.failed_units = 1;
        // A live pid (our own) means resume must not spawn anything.
        job.metadata
            .insert("executor_pid".to_string(), json!(std::process::id()));
        state.store.update_job(&job).expect("update");

        let (status, body) = call(router(state.clone()), "POST", "/api/jobs/J1/bypass").await;
        assert_eq!(status, StatusCode::OK, "body: {body}");
        assert_eq!(body["success"], true);
        assert_eq!(body["pid"], std::process::id());

        let job = state
            .store
            .get_job(&fanout_core::types::JobId::new("J1"))
            .expect("get")
            .expect("exists");
        assert!(job.bypass_failures);
    }

    #[tokio::test]
    async fn restart_refuses_while_supervisor_alive() {
        let state = test_state(false);
        let mut job = seed_job(&state, "J1", JobStatus::Running);
        job.metadata
            .insert("executor_pid".to_string(), json!(std::process::id()));
        state.store.update_job(&job).expect("update");

        let (status, body) = call(router(state), "POST", "/api/jobs/J1/restart").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "ALREADY_RUNNING");
    }

    #[tokio::test]
    async fn restart_without_pending_units_fails() {
        let state = test_state(false);
        let mut job = seed_job(&state, "J1", JobStatus::Failed);
        job.completed_units = 2;
        state.store.update_job(&job).expect("update");
        seed_unit(&state, "J1", "U1", UnitStatus::Completed);

        let (status, body) = call(router(state), "POST", "/api/jobs/J1/restart").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "RESTART_FAILED");
    }

    #[tokio::test]
    async fn restart_unit_resets_failed_unit() {
        let state = test_state(false);
        seed_job(&state, "J1", JobStatus::Failed);
        seed_unit(&state, "J1", "U1", UnitStatus::Failed);

        let (status, body) =
            call(router(state.clone()), "POST", "/api/jobs/J1/units/U1/restart").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);

        let unit = state
            .store
            .get_work_unit(&fanout_core::types::UnitId::new("U1"))
            .expect("get")
            .expect("exists");
        assert_eq!(unit.status, UnitStatus::Pending);
    }

    #[tokio::test]
    async fn kill_unit_without_process_fails_cleanly() {
        let state = test_state(false);
        seed_job(&state, "J1", JobStatus::Running);
        seed_unit(&state, "J1", "U1", UnitStatus::Processing);

        let (status, body) =
            call(router(state), "POST", "/api/jobs/J1/units/U1/kill").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "KILL_FAILED");
    }

    #[tokio::test]
    async fn read_only_mode_rejects_commands_but_serves_reads() {
        let state = test_state(true);
        seed_job(&state, "J1", JobStatus::Running);

        let (status, _body) = call(router(state.clone()), "GET", "/api/jobs/J1").await;
        assert_eq!(status, StatusCode::OK);

        for uri in [
            "/api/jobs/J1/bypass",
            "/api/jobs/J1/kill",
            "/api/jobs/J1/restart",
            "/api/jobs/J1/units/U1/kill",
            "/api/jobs/J1/units/U1/restart",
        ] {
            let (status, body) = call(router(state.clone()), "POST", uri).await;
            assert_eq!(status, StatusCode::FORBIDDEN, "uri: {uri}");
            assert_eq!(body["error"]["code"], "READ_ONLY");
        }
    }

    #[tokio::test]
    async fn logs_endpoint_paginates() {
        let state = test_state(false);
        seed_job(&state, "J1", JobStatus::Running);
        for index in 0..5 {
            state
                .store
                .append_log(&fanout_core::types::LogEntry {
                    id: None,
                    job_id: fanout_core::types::JobId::new("J1"),
                    source: "executor".to_string(),
                    level: fanout_core::types::LogLevel::Info,
                    message: format!("message {index}"),
                    timestamp: chrono::Utc::now(),
                    worker_id: None,
                    unit_id: None,
                    extra: None,
                })
                .expect("append log");
        }

        let (status, body) =
            call(router(state), "GET", "/api/jobs/J1/logs?limit=2").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["logs"].as_array().expect("logs").len(), 2);
        assert_eq!(body["total"], 5);
    }
}

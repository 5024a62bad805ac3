use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use fanoutd::executor::ExecutorError;
use fanoutd::persistence::StoreError;
use fanoutd::worker_pool::PoolError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("job not found: {job_id}")]
    JobNotFound { job_id: String },
    #[error("work unit not found: {unit_id}")]
    UnitNotFound { unit_id: String },
    #[error("{message}")]
    Command {
        code: &'static str,
        message: String,
    },
    #[error("this endpoint is read-only")]
    ReadOnly,
    #[error("database error: {message}")]
    Db { message: String },
    #[error("server error: {message}")]
    Server { message: String },
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Db {
            message: err.to_string(),
        }
    }
}

impl From<ExecutorError> for ApiError {
    fn from(err: ExecutorError) -> Self {
        match err {
            ExecutorError::JobNotFound { job_id } => ApiError::JobNotFound { job_id },
            ExecutorError::UnitNotFound { unit_id } => ApiError::UnitNotFound { unit_id },
            ExecutorError::UnitJobMismatch { .. } | ExecutorError::NoProcess { .. } => {
                ApiError::Command {
                    code: "KILL_FAILED",
                    message: err.to_string(),
                }
            }
            ExecutorError::NotRestartable { .. } | ExecutorError::NoPendingUnits => {
                ApiError::Command {
                    code: "RESTART_FAILED",
                    message: err.to_string(),
                }
            }
            ExecutorError::State(state) | ExecutorError::Pool(PoolError::State(state)) => {
                ApiError::Command {
                    code: "INVALID_STATE",
                    message: state.to_string(),
                }
            }
            ExecutorError::Store(store) | ExecutorError::Pool(PoolError::Store(store)) => {
                store.into()
            }
            other => ApiError::Server {
                message: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::JobNotFound { job_id } => (
                StatusCode::NOT_FOUND,
                "JOB_NOT_FOUND".to_string(),
                format!("Job not found: {job_id}"),
            ),
            ApiError::UnitNotFound { unit_id } => (
                StatusCode::NOT_FOUND,
                "UNIT_NOT_FOUND".to_string(),
                format!("Work unit not found: {unit_id}"),
            ),
            ApiError::Command { code, message } => {
                (StatusCode::BAD_REQUEST, code.to_string(), message)
            }
            ApiError::ReadOnly => (
                StatusCode::FORBIDDEN,
                "READ_ONLY".to_string(),
                "this dashboard is read-only".to_string(),
            ),
            ApiError::Db { message } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DB_ERROR".to_string(),
                format!("Database error: {message}"),
            ),
            ApiError::Server { message } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "SERVER_ERROR".to_string(),
                message,
            ),
        };

        let body = ErrorBody {
            error: ErrorDetail { code, message },
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executor_errors_map_to_api_codes() {
        let err: ApiError = ExecutorError::JobNotFound {
            job_id: "J1".to_string(),
        }
        .into();
        assert!(matches!(err, ApiError::JobNotFound { .. }));

        let err: ApiError = ExecutorError::NoPendingUnits.into();
        assert!(matches!(
            err,
            ApiError::Command {
                code: "RESTART_FAILED",
                ..
            }
        ));

        let err: ApiError = ExecutorError::NoProcess {
            what: "unit U1".to_string(),
        }
        .into();
        assert!(matches!(
            err,
            ApiError::Command {
                code: "KILL_FAILED",
                ..
            }
        ));
    }
}

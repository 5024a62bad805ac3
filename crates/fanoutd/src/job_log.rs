//! DB-backed per-job logger.
//!
//! Job activity is persisted in the `logs` table so the dashboard can
//! show it; each entry is mirrored to `tracing` for operators watching
//! the process itself.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use fanout_core::types::{JobId, LogEntry, LogLevel, UnitId, WorkerId};

use crate::persistence::SqliteStore;

#[derive(Clone)]
pub struct JobLogger {
    store: Arc<SqliteStore>,
    job_id: JobId,
    source: String,
}

impl JobLogger {
    pub fn new(store: Arc<SqliteStore>, job_id: JobId, source: impl Into<String>) -> Self {
        Self {
            store,
            job_id,
            source: source.into(),
        }
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message.into(), None, None, None);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.log(LogLevel::Warning, message.into(), None, None, None);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message.into(), None, None, None);
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message.into(), None, None, None);
    }

    pub fn unit_info(&self, unit_id: &UnitId, message: impl Into<String>) {
        self.log(
            LogLevel::Info,
            message.into(),
            None,
            Some(unit_id.clone()),
            None,
        );
    }

    pub fn unit_warning(&self, unit_id: &UnitId, message: impl Into<String>) {
        self.log(
            LogLevel::Warning,
            message.into(),
            None,
            Some(unit_id.clone()),
            None,
        );
    }

    pub fn unit_error(&self, unit_id: &UnitId, message: impl Into<String>, extra: Option<Value>) {
        self.log(
            LogLevel::Error,
            message.into(),
            None,
            Some(unit_id.clone()),
            extra,
        );
    }

    pub fn worker_log(
        &self,
        level: LogLevel,
        message: impl Into<String>,
        worker_id: Option<WorkerId>,
        unit_id: Option<UnitId>,
        extra: Option<Value>,
    ) {
        self.log(level, message.into(), worker_id, unit_id, extra);
    }

    fn log(
        &self,
        level: LogLevel,
        message: String,
        worker_id: Option<WorkerId>,
        unit_id: Option<UnitId>,
        extra: Option<Value>,
    ) {
        match level {
            LogLevel::Debug => tracing::debug!(job = %self.job_id.0, "{message}"),
            LogLevel::Info => tracing::info!(job = %self.job_id.0, "{message}"),
            LogLevel::Warning => tracing::warn!(job = %self.job_id.0, "{message}"),
            LogLevel::Error => tracing::error!(job = %self.job_id.0, "{message}"),
        }

        let entry = LogEntry {
            id: None,
            job_id: self.job_id.clone(),
            source: self.source.clone(),
            level,
            message,
            timestamp: Utc::now(),
            worker_id,
            unit_id,
            extra,
        };
        // A failed log write must never take the job down with it.
        if let Err(err) = self.store.append_log(&entry) {
            tracing::warn!("failed to persist job log entry: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::LogFilter;
    use fanout_core::types::Job;

    #[test]
    fn logger_persists_entries_with_source_and_level() {
        let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
        let job = Job::new(
            JobId::new("J1"),
            "test",
            "intent",
            "template",
            "file",
            1,
            1,
        );
        store.create_job(&job).expect("create job");

        let logger = JobLogger::new(store.clone(), JobId::new("J1"), "executor");
        logger.info("starting up");
        logger.unit_error(&UnitId::new("U1"), "unit blew up", None);

        let entries = store
            .query_logs(&JobId::new("J1"), &LogFilter::default())
            .expect("query logs");
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|entry| entry.source == "executor"));
        assert!(entries
            .iter()
            .any(|entry| entry.level == LogLevel::Error
                && entry.unit_id.as_ref().map(|id| id.as_str()) == Some("U1")));
    }
}

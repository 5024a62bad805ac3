//! SQLite persistence layer.
//!
//! Single-writer / multi-reader: WAL journal mode plus a generous busy
//! timeout serialize concurrent writers from different processes.
//! Mutations that violate a constraint return `Ok(false)`; everything
//! else bubbles as [`StoreError`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;

use fanout_core::state::{JobStatus, UnitStatus, WorkerState};
use fanout_core::types::{
    Job, JobId, LogEntry, LogLevel, Payload, UnitId, WorkUnit, WorkerId, WorkerRecord,
    POST_PROCESSING_UNIT_TYPE,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);
const PREVIEW_TEXT_LIMIT: usize = 200;
const PREVIEW_INPUT_LIMIT: usize = 120;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {source}")]
    Sql {
        #[from]
        source: rusqlite::Error,
    },
    #[error("json serialization error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
    #[error("timestamp parse error for value '{value}': {source}")]
    TimestampParse {
        value: String,
        #[source]
        source: chrono::ParseError,
    },
    #[error("unknown status tag in store: {source}")]
    Status {
        #[from]
        source: fanout_core::state::UnknownStatusTag,
    },
    #[error("failed to create store directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    /// True when the underlying database file is beyond repair; the
    /// CLI maps this to its dedicated exit code.
    pub fn is_corruption(&self) -> bool {
        match self {
            StoreError::Sql {
                source: rusqlite::Error::SqliteFailure(err, _),
            } => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase
            ),
            _ => false,
        }
    }
}

/// Filter for log queries.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub source: Option<String>,
    pub level: Option<LogLevel>,
    pub since: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

/// Snapshot of an active unit with its most recent meaningful event.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct LiveUnitSnapshot {
    pub unit_id: UnitId,
    pub payload: Payload,
    pub status: UnitStatus,
    pub process_id: Option<u32>,
    pub latest_event: Option<Value>,
}

/// SQLite-backed store for jobs, work units, workers, and logs.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open (creating if necessary) the store at `path` and bring its
    /// schema up to date.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.configure()?;
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.configure()?;
        store.migrate()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn configure(&self) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.busy_timeout(BUSY_TIMEOUT)?;
        // journal_mode returns a row; read and discard it.
        let _mode: String =
            conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
        Ok(())
    }

    fn migrate(&self) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS jobs (
    job_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT NOT NULL,
    status TEXT NOT NULL,
    worker_prompt_template TEXT NOT NULL,
    unit_type TEXT NOT NULL,
    total_units INTEGER NOT NULL,
    completed_units INTEGER NOT NULL DEFAULT 0,
    failed_units INTEGER NOT NULL DEFAULT 0,
    max_workers INTEGER NOT NULL DEFAULT 4,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    test_unit_id TEXT,
    test_passed INTEGER NOT NULL DEFAULT 0,
    metadata TEXT,
    post_processing_prompt TEXT,
    post_processing_unit_id TEXT,
    bypass_failures INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS work_units (
    unit_id TEXT PRIMARY KEY,
    job_id TEXT NOT NULL,
    unit_type TEXT NOT NULL,
    status TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    assigned_at TEXT,
    started_at TEXT,
    completed_at TEXT,
    worker_id TEXT,
    result TEXT,
    error TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 3,
    execution_time_seconds REAL,
    output_files TEXT,
    rendered_prompt TEXT,
    conversation TEXT,
    session_id TEXT,
    cost_usd REAL,
    process_id INTEGER
);

CREATE TABLE IF NOT EXISTS workers (
    worker_id TEXT PRIMARY KEY,
    job_id TEXT NOT NULL,
    status TEXT NOT NULL,
    current_unit_id TEXT,
    process_id INTEGER,
    started_at TEXT NOT NULL,
    last_heartbeat TEXT,
    units_completed INTEGER NOT NULL DEFAULT 0,
    units_failed INTEGER NOT NULL DEFAULT 0,
    total_execution_time REAL NOT NULL DEFAULT 0.0
);

CREATE TABLE IF NOT EXISTS logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL,
    source TEXT NOT NULL,
    level TEXT NOT NULL,
    message TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    worker_id TEXT,
    unit_id TEXT,
    extra TEXT
);

CREATE INDEX IF NOT EXISTS idx_work_units_job ON work_units(job_id);
CREATE INDEX IF NOT EXISTS idx_work_units_status ON work_units(job_id, status);
CREATE INDEX IF NOT EXISTS idx_workers_job ON workers(job_id);
CREATE INDEX IF NOT EXISTS idx_logs_job ON logs(job_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
"#,
        )?;

        // Additive migrations for databases written by older builds:
        // compare actual columns against the expected set and add the
        // missing ones. Readers tolerate NULL in all of these.
        let unit_columns = [
            ("rendered_prompt", "TEXT"),
            ("conversation", "TEXT"),
            ("session_id", "TEXT"),
            ("cost_usd", "REAL"),
            ("process_id", "INTEGER"),
        ];
        add_missing_columns(&conn, "work_units", &unit_columns)?;

        let job_columns = [
            ("post_processing_prompt", "TEXT"),
            ("post_processing_unit_id", "TEXT"),
            ("bypass_failures", "INTEGER NOT NULL DEFAULT 0"),
        ];
        add_missing_columns(&conn, "jobs", &job_columns)?;

        Ok(())
    }

    // --- Jobs ---

    pub fn create_job(&self, job: &Job) -> Result<bool, StoreError> {
        let conn = self.conn();
        let result = conn.execute(
            r#"
INSERT INTO jobs (
    job_id, name, description, status, worker_prompt_template, unit_type,
    total_units, completed_units, failed_units, max_workers,
    created_at, started_at, completed_at, test_unit_id, test_passed,
    metadata, post_processing_prompt, post_processing_unit_id, bypass_failures
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
"#,
            params![
                job.job_id.0,
                job.name,
                job.description,
                job.status.as_str(),
                job.worker_prompt_template,
                job.unit_type,
                job.total_units,
                job.completed_units,
                job.failed_units,
                job.max_workers as i64,
                job.created_at.to_rfc3339(),
                job.started_at.map(|at| at.to_rfc3339()),
                job.completed_at.map(|at| at.to_rfc3339()),
                job.test_unit_id.as_ref().map(|id| id.0.clone()),
                job.test_passed as i64,
                serde_json::to_string(&job.metadata)?,
                job.post_processing_prompt,
                job.post_processing_unit_id.as_ref().map(|id| id.0.clone()),
                job.bypass_failures as i64,
            ],
        );
        write_result(result)
    }

    pub fn update_job(&self, job: &Job) -> Result<bool, StoreError> {
        let conn = self.conn();
        let result = conn.execute(
            r#"
UPDATE jobs SET
    status = ?1, completed_units = ?2, failed_units = ?3,
    started_at = ?4, completed_at = ?5, test_unit_id = ?6, test_passed = ?7,
    metadata = ?8, post_processing_prompt = ?9, post_processing_unit_id = ?10,
    bypass_failures = ?11, worker_prompt_template = ?12
WHERE job_id = ?13
"#,
            params![
                job.status.as_str(),
                job.completed_units,
                job.failed_units,
                job.started_at.map(|at| at.to_rfc3339()),
                job.completed_at.map(|at| at.to_rfc3339()),
                job.test_unit_id.as_ref().map(|id| id.0.clone()),
                job.test_passed as i64,
                serde_json::to_string(&job.metadata)?,
                job.post_processing_prompt,
                job.post_processing_unit_id.as_ref().map(|id| id.0.clone()),
                job.bypass_failures as i64,
                job.worker_prompt_template,
                job.job_id.0,
            ],
        );
        write_result(result)
    }

    pub fn get_job(&self, job_id: &JobId) -> Result<Option<Job>, StoreError> {
        let conn = self.conn();
        conn.query_row(
            "SELECT * FROM jobs WHERE job_id = ?1",
            params![job_id.0],
            job_from_row,
        )
        .optional()?
        .transpose()
    }

    pub fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Job>, StoreError> {
        let conn = self.conn();
        let mut jobs = Vec::new();
        match status {
            Some(status) => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM jobs WHERE status = ?1 ORDER BY created_at DESC LIMIT ?2 OFFSET ?3",
                )?;
                let rows = stmt.query_map(params![status.as_str(), limit, offset], job_from_row)?;
                for row in rows {
                    jobs.push(row??);
                }
            }
            None => {
                let mut stmt = conn
                    .prepare("SELECT * FROM jobs ORDER BY created_at DESC LIMIT ?1 OFFSET ?2")?;
                let rows = stmt.query_map(params![limit, offset], job_from_row)?;
                for row in rows {
                    jobs.push(row??);
                }
            }
        }
        Ok(jobs)
    }

    /// Atomic counter bump; safe to call from concurrent pool threads.
    pub fn increment_completed_units(&self, job_id: &JobId) -> Result<bool, StoreError> {
        let conn = self.conn();
        let result = conn.execute(
            "UPDATE jobs SET completed_units = completed_units + 1 WHERE job_id = ?1",
            params![job_id.0],
        );
        write_result(result)
    }

    /// Atomic counter bump; safe to call from concurrent pool threads.
    pub fn increment_failed_units(&self, job_id: &JobId) -> Result<bool, StoreError> {
        let conn = self.conn();
        let result = conn.execute(
            "UPDATE jobs SET failed_units = failed_units + 1 WHERE job_id = ?1",
            params![job_id.0],
        );
        write_result(result)
    }

    /// Release one slot from the failure counter, clamped at zero.
    pub fn decrement_failed_units(&self, job_id: &JobId) -> Result<bool, StoreError> {
        let conn = self.conn();
        let result = conn.execute(
            "UPDATE jobs SET failed_units = MAX(failed_units - 1, 0) WHERE job_id = ?1",
            params![job_id.0],
        );
        write_result(result)
    }

    pub fn count_jobs(&self, status: Option<JobStatus>) -> Result<i64, StoreError> {
        let conn = self.conn();
        let count = match status {
            Some(status) => conn.query_row(
                "SELECT COUNT(*) FROM jobs WHERE status = ?1",
                params![status.as_str()],
                |row| row.get(0),
            )?,
            None => conn.query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get(0))?,
        };
        Ok(count)
    }

    // --- Work units ---

    pub fn create_work_unit(&self, unit: &WorkUnit) -> Result<bool, StoreError> {
        let conn = self.conn();
        let result = conn.execute(
            r#"
INSERT INTO work_units (
    unit_id, job_id, unit_type, status, payload, created_at, assigned_at,
    started_at, completed_at, worker_id, result, error, retry_count,
    max_retries, execution_time_seconds, output_files, rendered_prompt,
    conversation, session_id, cost_usd, process_id
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)
"#,
            params![
                unit.unit_id.0,
                unit.job_id.0,
                unit.unit_type,
                unit.status.as_str(),
                serde_json::to_string(&unit.payload)?,
                unit.created_at.to_rfc3339(),
                unit.assigned_at.map(|at| at.to_rfc3339()),
                unit.started_at.map(|at| at.to_rfc3339()),
                unit.completed_at.map(|at| at.to_rfc3339()),
                unit.worker_id.as_ref().map(|id| id.0.clone()),
                unit.result
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                unit.error,
                unit.retry_count,
                unit.max_retries,
                unit.execution_time_seconds,
                serde_json::to_string(&unit.output_files)?,
                unit.rendered_prompt,
                unit.conversation
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                unit.session_id,
                unit.cost_usd,
                unit.process_id,
            ],
        );
        write_result(result)
    }

    pub fn update_work_unit(&self, unit: &WorkUnit) -> Result<bool, StoreError> {
        let conn = self.conn();
        let result = conn.execute(
            r#"
UPDATE work_units SET
    status = ?1, assigned_at = ?2, started_at = ?3, completed_at = ?4,
    worker_id = ?5, result = ?6, error = ?7, retry_count = ?8,
    execution_time_seconds = ?9, output_files = ?10, rendered_prompt = ?11,
    conversation = ?12, session_id = ?13, cost_usd = ?14, process_id = ?15
WHERE unit_id = ?16
"#,
            params![
                unit.status.as_str(),
                unit.assigned_at.map(|at| at.to_rfc3339()),
                unit.started_at.map(|at| at.to_rfc3339()),
                unit.completed_at.map(|at| at.to_rfc3339()),
                unit.worker_id.as_ref().map(|id| id.0.clone()),
                unit.result
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                unit.error,
                unit.retry_count,
                unit.execution_time_seconds,
                serde_json::to_string(&unit.output_files)?,
                unit.rendered_prompt,
                unit.conversation
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                unit.session_id,
                unit.cost_usd,
                unit.process_id,
                unit.unit_id.0,
            ],
        );
        write_result(result)
    }

    pub fn get_work_unit(&self, unit_id: &UnitId) -> Result<Option<WorkUnit>, StoreError> {
        let conn = self.conn();
        conn.query_row(
            "SELECT * FROM work_units WHERE unit_id = ?1",
            params![unit_id.0],
            unit_from_row,
        )
        .optional()?
        .transpose()
    }

    /// Pending units in `created_at` order, oldest first.
    pub fn get_pending_units(
        &self,
        job_id: &JobId,
        limit: i64,
    ) -> Result<Vec<WorkUnit>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM work_units WHERE job_id = ?1 AND status = ?2 ORDER BY created_at ASC LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![job_id.0, UnitStatus::Pending.as_str(), limit],
            unit_from_row,
        )?;
        let mut units = Vec::new();
        for row in rows {
            units.push(row??);
        }
        Ok(units)
    }

    pub fn list_units_for_job(
        &self,
        job_id: &JobId,
        status: Option<UnitStatus>,
        limit: i64,
        offset: i64,
        exclude_post_processing: bool,
    ) -> Result<Vec<WorkUnit>, StoreError> {
        let conn = self.conn();
        let mut sql = String::from("SELECT * FROM work_units WHERE job_id = ?1");
        if status.is_some() {
            sql.push_str(" AND status = ?2");
        }
        if exclude_post_processing {
            sql.push_str(&format!(" AND unit_type != '{POST_PROCESSING_UNIT_TYPE}'"));
        }
        sql.push_str(" ORDER BY created_at ASC LIMIT ");
        sql.push_str(&limit.to_string());
        sql.push_str(" OFFSET ");
        sql.push_str(&offset.to_string());

        let mut units = Vec::new();
        let mut stmt = conn.prepare(&sql)?;
        match status {
            Some(status) => {
                let rows = stmt.query_map(params![job_id.0, status.as_str()], unit_from_row)?;
                for row in rows {
                    units.push(row??);
                }
            }
            None => {
                let rows = stmt.query_map(params![job_id.0], unit_from_row)?;
                for row in rows {
                    units.push(row??);
                }
            }
        }
        Ok(units)
    }

    pub fn count_units_by_status(
        &self,
        job_id: &JobId,
    ) -> Result<HashMap<UnitStatus, i64>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM work_units WHERE job_id = ?1 GROUP BY status",
        )?;
        let rows = stmt.query_map(params![job_id.0], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut counts = HashMap::new();
        for row in rows {
            let (tag, count) = row?;
            counts.insert(UnitStatus::parse(&tag)?, count);
        }
        Ok(counts)
    }

    /// Recompute finished-unit counters straight from unit rows,
    /// excluding the post-processing unit. Used for consistency checks
    /// against the persisted job counters.
    pub fn recount_finished_units(&self, job_id: &JobId) -> Result<(i64, i64), StoreError> {
        let conn = self.conn();
        let completed = conn.query_row(
            "SELECT COUNT(*) FROM work_units WHERE job_id = ?1 AND status = ?2 AND unit_type != ?3",
            params![
                job_id.0,
                UnitStatus::Completed.as_str(),
                POST_PROCESSING_UNIT_TYPE
            ],
            |row| row.get(0),
        )?;
        let failed = conn.query_row(
            "SELECT COUNT(*) FROM work_units WHERE job_id = ?1 AND status = ?2 AND unit_type != ?3",
            params![
                job_id.0,
                UnitStatus::Failed.as_str(),
                POST_PROCESSING_UNIT_TYPE
            ],
            |row| row.get(0),
        )?;
        Ok((completed, failed))
    }

    pub fn set_unit_session_id(
        &self,
        unit_id: &UnitId,
        session_id: &str,
    ) -> Result<bool, StoreError> {
        let conn = self.conn();
        let result = conn.execute(
            "UPDATE work_units SET session_id = ?1 WHERE unit_id = ?2",
            params![session_id, unit_id.0],
        );
        write_result(result)
    }

    pub fn set_unit_process_id(
        &self,
        unit_id: &UnitId,
        process_id: Option<u32>,
    ) -> Result<bool, StoreError> {
        let conn = self.conn();
        let result = conn.execute(
            "UPDATE work_units SET process_id = ?1 WHERE unit_id = ?2",
            params![process_id, unit_id.0],
        );
        write_result(result)
    }

    /// Append one streamed event to a unit's conversation, preserving
    /// emission order. Read-modify-write inside a transaction.
    pub fn append_conversation_event(
        &self,
        unit_id: &UnitId,
        event: &Value,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let existing: Option<Option<String>> = tx
            .query_row(
                "SELECT conversation FROM work_units WHERE unit_id = ?1",
                params![unit_id.0],
                |row| row.get(0),
            )
            .optional()?;

        let Some(stored) = existing else {
            return Ok(false);
        };

        let mut conversation: Vec<Value> = match stored {
            Some(text) if !text.is_empty() => serde_json::from_str(&text)?,
            _ => Vec::new(),
        };
        conversation.push(event.clone());

        tx.execute(
            "UPDATE work_units SET conversation = ?1 WHERE unit_id = ?2",
            params![serde_json::to_string(&conversation)?, unit_id.0],
        )?;
        tx.commit()?;
        Ok(true)
    }

    pub fn job_total_cost(&self, job_id: &JobId) -> Result<Option<f64>, StoreError> {
        let conn = self.conn();
        let total: Option<f64> = conn.query_row(
            "SELECT SUM(cost_usd) FROM work_units WHERE job_id = ?1 AND cost_usd IS NOT NULL",
            params![job_id.0],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    /// Active units with their most recent meaningful event, for the
    /// live-activity view. Ordered by `started_at` descending.
    pub fn active_units_with_latest_event(
        &self,
        job_id: &JobId,
    ) -> Result<Vec<LiveUnitSnapshot>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
SELECT unit_id, payload, status, process_id, conversation
FROM work_units
WHERE job_id = ?1 AND status IN ('processing', 'assigned')
ORDER BY started_at DESC
"#,
        )?;
        let rows = stmt.query_map(params![job_id.0], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<u32>>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })?;

        let mut snapshots = Vec::new();
        for row in rows {
            let (unit_id, payload, status, process_id, conversation) = row?;
            snapshots.push(LiveUnitSnapshot {
                unit_id: UnitId::new(unit_id),
                payload: serde_json::from_str(&payload)?,
                status: UnitStatus::parse(&status)?,
                process_id,
                latest_event: extract_latest_event(conversation.as_deref()),
            });
        }
        Ok(snapshots)
    }

    /// Unit counts across every job, for the aggregate stats view.
    pub fn count_all_units_by_status(&self) -> Result<HashMap<UnitStatus, i64>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM work_units GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut counts = HashMap::new();
        for row in rows {
            let (tag, count) = row?;
            counts.insert(UnitStatus::parse(&tag)?, count);
        }
        Ok(counts)
    }

    pub fn total_cost_all_jobs(&self) -> Result<Option<f64>, StoreError> {
        let conn = self.conn();
        let total: Option<f64> = conn.query_row(
            "SELECT SUM(cost_usd) FROM work_units WHERE cost_usd IS NOT NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    pub fn count_active_workers_all(&self) -> Result<i64, StoreError> {
        let conn = self.conn();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM workers WHERE status IN ('idle', 'busy')",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // --- Workers ---

    pub fn create_worker(&self, worker: &WorkerRecord) -> Result<bool, StoreError> {
        let conn = self.conn();
        let result = conn.execute(
            r#"
INSERT INTO workers (
    worker_id, job_id, status, current_unit_id, process_id,
    started_at, last_heartbeat, units_completed, units_failed, total_execution_time
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
"#,
            params![
                worker.worker_id.0,
                worker.job_id.0,
                worker.status.as_str(),
                worker.current_unit_id.as_ref().map(|id| id.0.clone()),
                worker.process_id,
                worker.started_at.to_rfc3339(),
                worker.last_heartbeat.map(|at| at.to_rfc3339()),
                worker.units_completed,
                worker.units_failed,
                worker.total_execution_time,
            ],
        );
        write_result(result)
    }

    pub fn update_worker(&self, worker: &WorkerRecord) -> Result<bool, StoreError> {
        let conn = self.conn();
        let result = conn.execute(
            r#"
UPDATE workers SET
    status = ?1, current_unit_id = ?2, last_heartbeat = ?3,
    units_completed = ?4, units_failed = ?5, total_execution_time = ?6
WHERE worker_id = ?7
"#,
            params![
                worker.status.as_str(),
                worker.current_unit_id.as_ref().map(|id| id.0.clone()),
                worker.last_heartbeat.map(|at| at.to_rfc3339()),
                worker.units_completed,
                worker.units_failed,
                worker.total_execution_time,
                worker.worker_id.0,
            ],
        );
        write_result(result)
    }

    pub fn get_worker(&self, worker_id: &WorkerId) -> Result<Option<WorkerRecord>, StoreError> {
        let conn = self.conn();
        conn.query_row(
            "SELECT * FROM workers WHERE worker_id = ?1",
            params![worker_id.0],
            worker_from_row,
        )
        .optional()?
        .transpose()
    }

    /// Workers currently idle or busy for a job.
    pub fn get_active_workers(&self, job_id: &JobId) -> Result<Vec<WorkerRecord>, StoreError> {
        self.workers_in_states(job_id, &[WorkerState::Idle, WorkerState::Busy])
    }

    /// Idle/busy workers across every job.
    pub fn get_all_active_workers(&self) -> Result<Vec<WorkerRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT * FROM workers WHERE status IN ('idle', 'busy')")?;
        let rows = stmt.query_map([], worker_from_row)?;
        let mut workers = Vec::new();
        for row in rows {
            workers.push(row??);
        }
        Ok(workers)
    }

    pub fn get_busy_workers(&self, job_id: &JobId) -> Result<Vec<WorkerRecord>, StoreError> {
        self.workers_in_states(job_id, &[WorkerState::Busy])
    }

    fn workers_in_states(
        &self,
        job_id: &JobId,
        states: &[WorkerState],
    ) -> Result<Vec<WorkerRecord>, StoreError> {
        let conn = self.conn();
        let tags: Vec<String> = states
            .iter()
            .map(|state| format!("'{}'", state.as_str()))
            .collect();
        let sql = format!(
            "SELECT * FROM workers WHERE job_id = ?1 AND status IN ({})",
            tags.join(", ")
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![job_id.0], worker_from_row)?;
        let mut workers = Vec::new();
        for row in rows {
            workers.push(row??);
        }
        Ok(workers)
    }

    /// Mark every idle/busy worker of this job `terminated` when its
    /// recorded pid is no longer alive. Run on supervisor start to
    /// clear the wreckage of a previous crashed run.
    pub fn cleanup_stale_workers(
        &self,
        job_id: &JobId,
        pid_is_alive: impl Fn(u32) -> bool,
    ) -> Result<usize, StoreError> {
        let stale: Vec<WorkerId> = {
            let conn = self.conn();
            let mut stmt = conn.prepare(
                "SELECT worker_id, process_id FROM workers WHERE job_id = ?1 AND status IN ('idle', 'busy')",
            )?;
            let rows = stmt.query_map(params![job_id.0], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<u32>>(1)?))
            })?;
            let mut stale = Vec::new();
            for row in rows {
                let (worker_id, process_id) = row?;
                let alive = process_id.map(&pid_is_alive).unwrap_or(false);
                if !alive {
                    stale.push(WorkerId::new(worker_id));
                }
            }
            stale
        };

        let conn = self.conn();
        for worker_id in &stale {
            conn.execute(
                "UPDATE workers SET status = 'terminated' WHERE worker_id = ?1",
                params![worker_id.0],
            )?;
        }
        Ok(stale.len())
    }

    /// Reset units stuck in `assigned`/`processing` whose worker is
    /// terminated or missing. Retry counts are left untouched.
    pub fn reset_stuck_units(&self, job_id: &JobId) -> Result<usize, StoreError> {
        let conn = self.conn();
        let count = conn.execute(
            r#"
UPDATE work_units
SET status = 'pending', worker_id = NULL, process_id = NULL,
    assigned_at = NULL, started_at = NULL
WHERE job_id = ?1
  AND status IN ('assigned', 'processing')
  AND (
        worker_id IS NULL
        OR worker_id NOT IN (
            SELECT worker_id FROM workers WHERE status IN ('idle', 'busy')
        )
  )
"#,
            params![job_id.0],
        )?;
        Ok(count)
    }

    // --- Logs ---

    pub fn append_log(&self, entry: &LogEntry) -> Result<bool, StoreError> {
        let conn = self.conn();
        let result = conn.execute(
            r#"
INSERT INTO logs (job_id, source, level, message, timestamp, worker_id, unit_id, extra)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
"#,
            params![
                entry.job_id.0,
                entry.source,
                entry.level.as_str(),
                entry.message,
                entry.timestamp.to_rfc3339(),
                entry.worker_id.as_ref().map(|id| id.0.clone()),
                entry.unit_id.as_ref().map(|id| id.0.clone()),
                entry
                    .extra
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
            ],
        );
        write_result(result)
    }

    pub fn query_logs(
        &self,
        job_id: &JobId,
        filter: &LogFilter,
    ) -> Result<Vec<LogEntry>, StoreError> {
        let conn = self.conn();
        let mut sql = String::from("SELECT * FROM logs WHERE job_id = ?1");
        if filter.source.is_some() {
            sql.push_str(" AND source = ?2");
        }
        if let Some(level) = filter.level {
            sql.push_str(&format!(" AND level = '{}'", level.as_str()));
        }
        if let Some(since) = filter.since {
            sql.push_str(&format!(" AND timestamp > '{}'", since.to_rfc3339()));
        }
        let limit = if filter.limit > 0 { filter.limit } else { 100 };
        sql.push_str(&format!(
            " ORDER BY timestamp DESC LIMIT {limit} OFFSET {}",
            filter.offset
        ));

        let mut stmt = conn.prepare(&sql)?;
        let mut entries = Vec::new();
        match &filter.source {
            Some(source) => {
                let rows = stmt.query_map(params![job_id.0, source], log_from_row)?;
                for row in rows {
                    entries.push(row??);
                }
            }
            None => {
                let rows = stmt.query_map(params![job_id.0], log_from_row)?;
                for row in rows {
                    entries.push(row??);
                }
            }
        }
        Ok(entries)
    }

    pub fn count_logs(&self, job_id: &JobId) -> Result<i64, StoreError> {
        let conn = self.conn();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM logs WHERE job_id = ?1",
            params![job_id.0],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

fn write_result(result: Result<usize, rusqlite::Error>) -> Result<bool, StoreError> {
    match result {
        Ok(_) => Ok(true),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Ok(false)
        }
        Err(err) => Err(err.into()),
    }
}

fn add_missing_columns(
    conn: &Connection,
    table: &str,
    expected: &[(&str, &str)],
) -> Result<(), StoreError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    let mut existing = std::collections::HashSet::new();
    for row in rows {
        existing.insert(row?);
    }

    for (name, column_type) in expected {
        if !existing.contains(*name) {
            conn.execute(
                &format!("ALTER TABLE {table} ADD COLUMN {name} {column_type}"),
                [],
            )?;
        }
    }
    Ok(())
}

fn parse_timestamp(value: String) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|source| StoreError::TimestampParse { value, source })
}

fn parse_optional_timestamp(
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, StoreError> {
    value.map(parse_timestamp).transpose()
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Result<Job, StoreError>> {
    let status: String = row.get("status")?;
    let created_at: String = row.get("created_at")?;
    let started_at: Option<String> = row.get("started_at")?;
    let completed_at: Option<String> = row.get("completed_at")?;
    let metadata: Option<String> = row.get("metadata")?;
    let test_unit_id: Option<String> = row.get("test_unit_id")?;
    let post_processing_unit_id: Option<String> = row.get("post_processing_unit_id")?;

    let job = (|| -> Result<Job, StoreError> {
        Ok(Job {
            job_id: JobId::new(row.get::<_, String>("job_id")?),
            name: row.get("name")?,
            description: row.get("description")?,
            status: JobStatus::parse(&status)?,
            worker_prompt_template: row.get("worker_prompt_template")?,
            unit_type: row.get("unit_type")?,
            total_units: row.get("total_units")?,
            completed_units: row.get("completed_units")?,
            failed_units: row.get("failed_units")?,
            max_workers: row.get::<_, i64>("max_workers")?.max(1) as usize,
            created_at: parse_timestamp(created_at.clone())?,
            started_at: parse_optional_timestamp(started_at.clone())?,
            completed_at: parse_optional_timestamp(completed_at.clone())?,
            test_unit_id: test_unit_id.clone().map(UnitId::new),
            test_passed: row.get::<_, i64>("test_passed")? != 0,
            post_processing_prompt: row.get("post_processing_prompt")?,
            post_processing_unit_id: post_processing_unit_id.clone().map(UnitId::new),
            bypass_failures: row.get::<_, i64>("bypass_failures")? != 0,
            metadata: match &metadata {
                Some(text) if !text.is_empty() => serde_json::from_str(text)?,
                _ => Payload::new(),
            },
        })
    })();
    Ok(job)
}

fn unit_from_row(row: &Row<'_>) -> rusqlite::Result<Result<WorkUnit, StoreError>> {
    let status: String = row.get("status")?;
    let payload: String = row.get("payload")?;
    let created_at: String = row.get("created_at")?;
    let assigned_at: Option<String> = row.get("assigned_at")?;
    let started_at: Option<String> = row.get("started_at")?;
    let completed_at: Option<String> = row.get("completed_at")?;
    let worker_id: Option<String> = row.get("worker_id")?;
    let result: Option<String> = row.get("result")?;
    let output_files: Option<String> = row.get("output_files")?;
    let conversation: Option<String> = row.get("conversation")?;

    let unit = (|| -> Result<WorkUnit, StoreError> {
        Ok(WorkUnit {
            unit_id: UnitId::new(row.get::<_, String>("unit_id")?),
            job_id: JobId::new(row.get::<_, String>("job_id")?),
            unit_type: row.get("unit_type")?,
            status: UnitStatus::parse(&status)?,
            payload: serde_json::from_str(&payload)?,
            created_at: parse_timestamp(created_at.clone())?,
            assigned_at: parse_optional_timestamp(assigned_at.clone())?,
            started_at: parse_optional_timestamp(started_at.clone())?,
            completed_at: parse_optional_timestamp(completed_at.clone())?,
            worker_id: worker_id.clone().map(WorkerId::new),
            result: result
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            error: row.get("error")?,
            retry_count: row.get("retry_count")?,
            max_retries: row.get("max_retries")?,
            execution_time_seconds: row.get("execution_time_seconds")?,
            output_files: match &output_files {
                Some(text) if !text.is_empty() => serde_json::from_str(text)?,
                _ => Vec::new(),
            },
            rendered_prompt: row.get("rendered_prompt")?,
            conversation: match &conversation {
                Some(text) if !text.is_empty() => Some(serde_json::from_str(text)?),
                _ => None,
            },
            session_id: row.get("session_id")?,
            cost_usd: row.get("cost_usd")?,
            process_id: row.get("process_id")?,
        })
    })();
    Ok(unit)
}

fn worker_from_row(row: &Row<'_>) -> rusqlite::Result<Result<WorkerRecord, StoreError>> {
    let status: String = row.get("status")?;
    let started_at: String = row.get("started_at")?;
    let last_heartbeat: Option<String> = row.get("last_heartbeat")?;
    let current_unit_id: Option<String> = row.get("current_unit_id")?;

    let worker = (|| -> Result<WorkerRecord, StoreError> {
        Ok(WorkerRecord {
            worker_id: WorkerId::new(row.get::<_, String>("worker_id")?),
            job_id: JobId::new(row.get::<_, String>("job_id")?),
            status: WorkerState::parse(&status)?,
            current_unit_id: current_unit_id.clone().map(UnitId::new),
            process_id: row.get("process_id")?,
            started_at: parse_timestamp(started_at.clone())?,
            last_heartbeat: parse_optional_timestamp(last_heartbeat.clone())?,
            units_completed: row.get("units_completed")?,
            units_failed: row.get("units_failed")?,
            total_execution_time: row.get("total_execution_time")?,
        })
    })();
    Ok(worker)
}

fn log_from_row(row: &Row<'_>) -> rusqlite::Result<Result<LogEntry, StoreError>> {
    let level: String = row.get("level")?;
    let timestamp: String = row.get("timestamp")?;
    let worker_id: Option<String> = row.get("worker_id")?;
    let unit_id: Option<String> = row.get("unit_id")?;
    let extra: Option<String> = row.get("extra")?;

    let entry = (|| -> Result<LogEntry, StoreError> {
        Ok(LogEntry {
            id: row.get("id")?,
            job_id: JobId::new(row.get::<_, String>("job_id")?),
            source: row.get("source")?,
            level: match level.as_str() {
                "debug" => LogLevel::Debug,
                "info" => LogLevel::Info,
                "warning" => LogLevel::Warning,
                _ => LogLevel::Error,
            },
            message: row.get("message")?,
            timestamp: parse_timestamp(timestamp.clone())?,
            worker_id: worker_id.clone().map(WorkerId::new),
            unit_id: unit_id.clone().map(UnitId::new),
            extra: extra
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
        })
    })();
    Ok(entry)
}

/// Latest meaningful event from a stored conversation: the newest
/// assistant text or tool-use block, truncated for preview display.
fn extract_latest_event(conversation_json: Option<&str>) -> Option<Value> {
    let conversation: Vec<Value> = serde_json::from_str(conversation_json?).ok()?;

    for event in conversation.iter().rev() {
        if event.get("type").and_then(Value::as_str) != Some("assistant") {
            continue;
        }
        let content = event.get("message")?.get("content")?.as_array()?;
        for block in content.iter().rev() {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => {
                    if let Some(text) = block.get("text").and_then(Value::as_str) {
                        if !text.is_empty() {
                            return Some(serde_json::json!({
                                "type": "text",
                                "content": truncate(text, PREVIEW_TEXT_LIMIT),
                            }));
                        }
                    }
                }
                Some("tool_use") => {
                    let tool = block
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown");
                    let input = block
                        .get("input")
                        .map(|input| input.to_string())
                        .unwrap_or_default();
                    return Some(serde_json::json!({
                        "type": "tool_use",
                        "tool": tool,
                        "input_preview": truncate(&input, PREVIEW_INPUT_LIMIT),
                    }));
                }
                _ => {}
            }
        }
    }
    None
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        text.to_string()
    } else {
        text.chars().take(limit).collect()
    }
}

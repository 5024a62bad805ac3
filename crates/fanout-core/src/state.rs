//! Status enums and the job / work-unit state machines.

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
#[error("unknown status tag: '{tag}'")]
pub struct UnknownStatusTag {
    pub tag: String,
}

#[derive(Debug, thiserror::Error)]
pub enum StateMachineError {
    #[error("invalid job status transition: {from:?} -> {to:?}")]
    InvalidJobTransition { from: JobStatus, to: JobStatus },
    #[error("invalid unit status transition: {from:?} -> {to:?}")]
    InvalidUnitTransition { from: UnitStatus, to: UnitStatus },
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    Testing,
    Ready,
    Running,
    Paused,
    PostProcessing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Testing => "testing",
            JobStatus::Ready => "ready",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::PostProcessing => "post_processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(tag: &str) -> Result<Self, UnknownStatusTag> {
        match tag {
            "created" => Ok(JobStatus::Created),
            "testing" => Ok(JobStatus::Testing),
            "ready" => Ok(JobStatus::Ready),
            "running" => Ok(JobStatus::Running),
            "paused" => Ok(JobStatus::Paused),
            "post_processing" => Ok(JobStatus::PostProcessing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(UnknownStatusTag {
                tag: other.to_string(),
            }),
        }
    }

    /// Terminal statuses never transition again on their own; `Failed`
    /// can still be revived by an explicit resume or bypass.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed)
    }
}

/// Lifecycle status of a work unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Pending,
    Assigned,
    Processing,
    Completed,
    Failed,
}

impl UnitStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UnitStatus::Pending => "pending",
            UnitStatus::Assigned => "assigned",
            UnitStatus::Processing => "processing",
            UnitStatus::Completed => "completed",
            UnitStatus::Failed => "failed",
        }
    }

    pub fn parse(tag: &str) -> Result<Self, UnknownStatusTag> {
        match tag {
            "pending" => Ok(UnitStatus::Pending),
            "assigned" => Ok(UnitStatus::Assigned),
            "processing" => Ok(UnitStatus::Processing),
            "completed" => Ok(UnitStatus::Completed),
            "failed" => Ok(UnitStatus::Failed),
            other => Err(UnknownStatusTag {
                tag: other.to_string(),
            }),
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, UnitStatus::Assigned | UnitStatus::Processing)
    }

    pub fn is_finished(self) -> bool {
        matches!(self, UnitStatus::Completed | UnitStatus::Failed)
    }
}

/// State of a worker slot inside a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Busy,
    Failed,
    Terminated,
}

impl WorkerState {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Busy => "busy",
            WorkerState::Failed => "failed",
            WorkerState::Terminated => "terminated",
        }
    }

    pub fn parse(tag: &str) -> Result<Self, UnknownStatusTag> {
        match tag {
            "idle" => Ok(WorkerState::Idle),
            "busy" => Ok(WorkerState::Busy),
            "failed" => Ok(WorkerState::Failed),
            "terminated" => Ok(WorkerState::Terminated),
            other => Err(UnknownStatusTag {
                tag: other.to_string(),
            }),
        }
    }
}

/// Whether a job may move from `from` to `to`.
///
/// Self-transitions are always allowed so idempotent updates do not
/// have to special-case their current state.
pub fn is_job_transition_allowed(from: JobStatus, to: JobStatus) -> bool {
    use JobStatus::*;

    if from == to {
        return true;
    }

    match (from, to) {
        (Created, Testing | Running) => true,
        (Testing, Running | Created) => true,
        (Ready, Running) => true,
        (Running, PostProcessing | Completed | Failed | Paused) => true,
        // The only way out of failed is the bypass path, straight into
        // synthesis.
        (Failed, PostProcessing) => true,
        (PostProcessing, Completed | Failed) => true,
        (Paused, Running) => true,
        _ => false,
    }
}

/// Whether a work unit may move from `from` to `to`.
///
/// Beyond the pending → assigned → processing → completed|failed
/// ladder: pending → processing covers the synchronous test run,
/// assigned/processing → pending the stuck-unit recovery, failed →
/// pending a retry or explicit restart, and completed → pending the
/// reset of a rejected test unit.
pub fn is_unit_transition_allowed(from: UnitStatus, to: UnitStatus) -> bool {
    use UnitStatus::*;

    if from == to {
        return true;
    }

    match (from, to) {
        (Pending, Assigned | Processing) => true,
        (Assigned, Processing | Pending) => true,
        (Processing, Completed | Failed | Pending) => true,
        (Failed, Pending) => true,
        (Completed, Pending) => true,
        _ => false,
    }
}

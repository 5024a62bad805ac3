//! Request/outcome types and the worker trait.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use fanout_core::types::Payload;

use crate::stream::StreamEventKind;

/// Why a unit execution failed without a terminal result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    NoResult,
    Unavailable,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::NoResult => "no_result",
            FailureKind::Unavailable => "unavailable",
        }
    }
}

/// Callbacks fired while a unit executes. Both are optional; they must
/// be cheap since they run on the streaming path.
#[derive(Default, Clone, Copy)]
pub struct ExecutionHooks<'a> {
    /// Fired once per streamed event, in emission order.
    pub on_event: Option<&'a (dyn Fn(StreamEventKind, &Value) + Send + Sync)>,
    /// Fired once with the subprocess pid right after spawn.
    pub on_spawn: Option<&'a (dyn Fn(u32) + Send + Sync)>,
}

impl<'a> ExecutionHooks<'a> {
    pub fn fire_event(&self, kind: StreamEventKind, event: &Value) {
        if let Some(callback) = self.on_event {
            callback(kind, event);
        }
    }

    pub fn fire_spawn(&self, pid: u32) {
        if let Some(callback) = self.on_spawn {
            callback(pid);
        }
    }
}

/// One unit of agent work: a prompt template plus the unit payload.
pub struct ExecuteRequest<'a> {
    pub prompt_template: &'a str,
    pub payload: &'a Payload,
    pub timeout: Duration,
    pub hooks: ExecutionHooks<'a>,
}

/// Structured result of executing one work unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitOutcome {
    pub success: bool,
    /// Final result text from the terminal event, on success.
    pub output: Option<String>,
    pub error: Option<String>,
    pub failure: Option<FailureKind>,
    pub execution_time_seconds: f64,
    /// Every streamed event, in emission order.
    pub conversation: Vec<Value>,
    pub rendered_prompt: String,
    pub session_id: Option<String>,
    pub cost_usd: Option<f64>,
    pub num_turns: Option<i64>,
    pub duration_ms: Option<i64>,
    pub duration_api_ms: Option<i64>,
    pub exit_code: Option<i32>,
}

impl UnitOutcome {
    pub fn failure(
        kind: FailureKind,
        error: impl Into<String>,
        rendered_prompt: impl Into<String>,
        execution_time_seconds: f64,
    ) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
            failure: Some(kind),
            execution_time_seconds,
            conversation: Vec::new(),
            rendered_prompt: rendered_prompt.into(),
            session_id: None,
            cost_usd: None,
            num_turns: None,
            duration_ms: None,
            duration_api_ms: None,
            exit_code: None,
        }
    }

    /// Summary persisted into the work unit's `result` column.
    pub fn to_result_value(&self) -> Value {
        serde_json::json!({
            "success": self.success,
            "output": self.output,
            "error": self.error,
            "failure": self.failure.map(FailureKind::as_str),
            "execution_time_seconds": self.execution_time_seconds,
            "session_id": self.session_id,
            "cost_usd": self.cost_usd,
            "num_turns": self.num_turns,
            "duration_ms": self.duration_ms,
            "duration_api_ms": self.duration_api_ms,
            "exit_code": self.exit_code,
        })
    }
}

/// A worker that can execute one unit of agent work.
///
/// Implementations must be callable from many pool threads at once.
pub trait UnitWorker: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the backing executable can be located at all. Checked
    /// once at job creation so a missing CLI fails early instead of
    /// failing every unit.
    fn is_available(&self) -> bool;

    fn execute(&self, request: ExecuteRequest<'_>) -> UnitOutcome;
}

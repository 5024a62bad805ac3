//! Parsing of the agent CLI's line-delimited JSON event stream.
//!
//! The stream contract: the first event is `{type:"system",
//! subtype:"init"}` carrying the session id; `assistant` and `user`
//! events carry message content blocks; the terminal `result` event is
//! authoritative for success, cost, and timing (the exit code is
//! advisory only).

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamEventKind {
    System,
    Assistant,
    User,
    Result,
    Unknown,
}

impl StreamEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamEventKind::System => "system",
            StreamEventKind::Assistant => "assistant",
            StreamEventKind::User => "user",
            StreamEventKind::Result => "result",
            StreamEventKind::Unknown => "unknown",
        }
    }
}

/// Parse one stdout line into a JSON event. Non-JSON lines (progress
/// noise, partial writes) are skipped, not errors.
pub fn parse_event_line(line: &str) -> Option<Value> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    serde_json::from_str::<Value>(trimmed).ok()
}

pub fn classify_event(event: &Value) -> StreamEventKind {
    match event.get("type").and_then(Value::as_str) {
        Some("system") => StreamEventKind::System,
        Some("assistant") => StreamEventKind::Assistant,
        Some("user") => StreamEventKind::User,
        Some("result") => StreamEventKind::Result,
        _ => StreamEventKind::Unknown,
    }
}

/// Session id from the initial `system`/`init` event, if this is one.
pub fn session_id_from_init(event: &Value) -> Option<String> {
    if event.get("type").and_then(Value::as_str) != Some("system") {
        return None;
    }
    if event.get("subtype").and_then(Value::as_str) != Some("init") {
        return None;
    }
    event
        .get("session_id")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Fields of the terminal `result` event.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalResult {
    pub is_error: bool,
    pub result: Option<String>,
    pub total_cost_usd: Option<f64>,
    pub num_turns: Option<i64>,
    pub duration_ms: Option<i64>,
    pub duration_api_ms: Option<i64>,
}

impl TerminalResult {
    pub fn from_event(event: &Value) -> Option<Self> {
        if classify_event(event) != StreamEventKind::Result {
            return None;
        }
        Some(Self {
            is_error: event
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            result: event
                .get("result")
                .and_then(Value::as_str)
                .map(str::to_string),
            total_cost_usd: event.get("total_cost_usd").and_then(Value::as_f64),
            num_turns: event.get("num_turns").and_then(Value::as_i64),
            duration_ms: event.get("duration_ms").and_then(Value::as_i64),
            duration_api_ms: event.get("duration_api_ms").and_then(Value::as_i64),
        })
    }
}

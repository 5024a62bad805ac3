//! Scripted worker for exercising pools and executors without
//! spawning real agent processes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::{json, Value};

use crate::stream::StreamEventKind;
use crate::types::{ExecuteRequest, UnitOutcome, UnitWorker};

/// One scripted execution step.
#[derive(Debug, Clone)]
pub struct MockStep {
    pub success: bool,
    pub error: Option<String>,
    pub cost_usd: f64,
    pub delay: Duration,
}

impl MockStep {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
            cost_usd: 0.01,
            delay: Duration::from_millis(20),
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            cost_usd: 0.0,
            delay: Duration::from_millis(20),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// A [`UnitWorker`] that replays scripted outcomes.
///
/// Steps are keyed by the payload's key field (default `item`); each
/// execution for a key consumes the next step, so "fail twice then
/// succeed" retry flows are one script away. Unscripted keys get the
/// default step.
pub struct MockWorker {
    key_field: String,
    default_step: MockStep,
    scripts: Mutex<HashMap<String, Vec<MockStep>>>,
    executions: Mutex<Vec<String>>,
    counter: AtomicUsize,
    panic_keys: Mutex<Vec<String>>,
}

impl Default for MockWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockWorker {
    pub fn new() -> Self {
        Self {
            key_field: "item".to_string(),
            default_step: MockStep::ok(),
            scripts: Mutex::new(HashMap::new()),
            executions: Mutex::new(Vec::new()),
            counter: AtomicUsize::new(0),
            panic_keys: Mutex::new(Vec::new()),
        }
    }

    pub fn with_key_field(mut self, field: impl Into<String>) -> Self {
        self.key_field = field.into();
        self
    }

    pub fn with_default(mut self, step: MockStep) -> Self {
        self.default_step = step;
        self
    }

    /// Queue steps for a payload key; consumed front to back.
    pub fn script(&self, key: impl Into<String>, steps: Vec<MockStep>) {
        self.scripts.lock().expect("scripts lock").insert(key.into(), steps);
    }

    /// Make executions for this key panic, to exercise crash handling.
    pub fn panic_on(&self, key: impl Into<String>) {
        self.panic_keys.lock().expect("panic lock").push(key.into());
    }

    /// Keys in execution order, for ordering assertions.
    pub fn executed_keys(&self) -> Vec<String> {
        self.executions.lock().expect("executions lock").clone()
    }

    pub fn execution_count(&self) -> usize {
        self.counter.load(Ordering::SeqCst)
    }

    fn key_for(&self, request: &ExecuteRequest<'_>) -> String {
        request
            .payload
            .get(&self.key_field)
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| "<unkeyed>".to_string())
    }

    fn next_step(&self, key: &str) -> MockStep {
        let mut scripts = self.scripts.lock().expect("scripts lock");
        match scripts.get_mut(key) {
            Some(steps) if !steps.is_empty() => steps.remove(0),
            _ => self.default_step.clone(),
        }
    }
}

impl UnitWorker for MockWorker {
    fn name(&self) -> &str {
        "mock"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn execute(&self, request: ExecuteRequest<'_>) -> UnitOutcome {
        let key = self.key_for(&request);
        let sequence = self.counter.fetch_add(1, Ordering::SeqCst);
        self.executions.lock().expect("executions lock").push(key.clone());

        if self
            .panic_keys
            .lock()
            .expect("panic lock")
            .iter()
            .any(|panic_key| panic_key == &key)
        {
            panic!("mock worker crash for key '{key}'");
        }

        let step = self.next_step(&key);
        let session_id = format!("mock-session-{sequence}");

        request.hooks.fire_spawn(std::process::id());

        let init = json!({
            "type": "system",
            "subtype": "init",
            "session_id": session_id,
            "tools": [],
            "model": "mock",
        });
        request.hooks.fire_event(StreamEventKind::System, &init);

        std::thread::sleep(step.delay);

        let assistant = json!({
            "type": "assistant",
            "message": {"content": [{"type": "text", "text": format!("processed {key}")}]},
        });
        request
            .hooks
            .fire_event(StreamEventKind::Assistant, &assistant);

        let result_text = step
            .error
            .clone()
            .unwrap_or_else(|| format!("done with {key}"));
        let terminal = json!({
            "type": "result",
            "subtype": if step.success { "success" } else { "error" },
            "is_error": !step.success,
            "result": result_text,
            "total_cost_usd": step.cost_usd,
            "num_turns": 1,
            "duration_ms": step.delay.as_millis() as i64,
        });
        request.hooks.fire_event(StreamEventKind::Result, &terminal);

        let rendered =
            fanout_core::render::render_template(request.prompt_template, request.payload);

        UnitOutcome {
            success: step.success,
            output: step.success.then_some(result_text.clone()),
            error: (!step.success).then_some(result_text),
            failure: None,
            execution_time_seconds: step.delay.as_secs_f64(),
            conversation: vec![init, assistant, terminal],
            rendered_prompt: rendered,
            session_id: Some(session_id),
            cost_usd: Some(step.cost_usd),
            num_turns: Some(1),
            duration_ms: Some(step.delay.as_millis() as i64),
            duration_api_ms: None,
            exit_code: Some(if step.success { 0 } else { 1 }),
        }
    }
}

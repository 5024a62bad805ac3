//! Executes one work unit by spawning an agent CLI subprocess and
//! streaming its events.
//!
//! Two contracts here are load-bearing:
//!
//! * The child's stdin is always `Stdio::null()`. Supervisors are
//!   themselves detached, and an inherited terminal makes the agent
//!   block forever on interactive probes.
//! * The child gets its own process group, so a timeout can kill the
//!   whole tree (the CLI spawns tool subprocesses of its own).

use std::io::{BufRead, BufReader, Read};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value;

use fanout_core::render::render_template;
use fanout_core::types::Payload;

use crate::adapter::{AgentAdapter, ClaudeAdapter};
use crate::process::kill_group;
use crate::stream::{classify_event, parse_event_line, session_id_from_init, TerminalResult};
use crate::types::{ExecuteRequest, FailureKind, UnitOutcome, UnitWorker};

/// Worker backed by the Claude CLI.
pub struct ClaudeCliWorker {
    adapter: ClaudeAdapter,
    poll_interval: Duration,
}

impl ClaudeCliWorker {
    pub fn new(adapter: ClaudeAdapter) -> Self {
        Self {
            adapter,
            poll_interval: Duration::from_millis(50),
        }
    }

    /// Worker that grants the CLI access to payload file directories.
    pub fn with_file_access() -> Self {
        Self::new(ClaudeAdapter::with_file_access())
    }

    fn working_directory(payload: &Payload) -> Option<&str> {
        payload
            .get("working_directory")
            .and_then(Value::as_str)
            .filter(|dir| std::path::Path::new(dir).is_dir())
    }
}

impl UnitWorker for ClaudeCliWorker {
    fn name(&self) -> &str {
        if self.adapter.grant_file_access {
            "claude-cli-with-files"
        } else {
            "claude-cli"
        }
    }

    fn is_available(&self) -> bool {
        self.adapter.is_available()
    }

    fn execute(&self, request: ExecuteRequest<'_>) -> UnitOutcome {
        let started = Instant::now();
        let rendered = render_template(request.prompt_template, request.payload);
        let command = self.adapter.build_command(&rendered, request.payload);

        let mut builder = Command::new(&command.executable);
        builder
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            builder.process_group(0);
        }

        if let Some(dir) = Self::working_directory(request.payload) {
            builder.current_dir(dir);
        }

        let mut child = match builder.spawn() {
            Ok(child) => child,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return UnitOutcome::failure(
                    FailureKind::Unavailable,
                    format!("agent executable not found: {}", command.executable),
                    rendered,
                    started.elapsed().as_secs_f64(),
                );
            }
            Err(err) => {
                return UnitOutcome::failure(
                    FailureKind::NoResult,
                    format!("failed to spawn agent process: {err}"),
                    rendered,
                    started.elapsed().as_secs_f64(),
                );
            }
        };

        let pid = child.id();
        request.hooks.fire_spawn(pid);

        let (line_tx, line_rx) = mpsc::channel::<String>();
        let stdout_handle = child.stdout.take().map(|stdout| {
            thread::spawn(move || {
                let reader = BufReader::new(stdout);
                for line in reader.lines().map_while(Result::ok) {
                    if line_tx.send(line).is_err() {
                        break;
                    }
                }
            })
        });

        // Drain stderr concurrently so a chatty child cannot block on a
        // full pipe.
        let stderr_handle = child.stderr.take().map(|mut stderr| {
            thread::spawn(move || {
                let mut buffer = String::new();
                let _ = stderr.read_to_string(&mut buffer);
                buffer
            })
        });

        let deadline = started + request.timeout;
        let mut conversation: Vec<Value> = Vec::new();
        let mut session_id: Option<String> = None;
        let mut terminal: Option<TerminalResult> = None;
        let mut exit_code: Option<i32> = None;
        let mut timed_out = false;

        loop {
            drain_events(
                &line_rx,
                &request,
                &mut conversation,
                &mut session_id,
                &mut terminal,
            );

            if Instant::now() >= deadline {
                timed_out = true;
                let _ = kill_group(pid, libc::SIGKILL);
                let _ = child.wait();
                break;
            }

            match child.try_wait() {
                Ok(Some(status)) => {
                    exit_code = status.code();
                    break;
                }
                Ok(None) => {}
                Err(_) => break,
            }

            thread::sleep(self.poll_interval);
        }

        if let Some(handle) = stdout_handle {
            let _ = handle.join();
        }
        drain_events(
            &line_rx,
            &request,
            &mut conversation,
            &mut session_id,
            &mut terminal,
        );
        let stderr_output = stderr_handle
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();

        let wall_seconds = started.elapsed().as_secs_f64();

        if timed_out {
            let mut outcome = UnitOutcome::failure(
                FailureKind::Timeout,
                format!(
                    "execution timed out after {} seconds",
                    request.timeout.as_secs()
                ),
                rendered,
                wall_seconds,
            );
            outcome.conversation = conversation;
            outcome.session_id = session_id;
            return outcome;
        }

        match terminal {
            Some(result) => {
                let execution_time_seconds = result
                    .duration_ms
                    .map(|ms| ms as f64 / 1000.0)
                    .unwrap_or(wall_seconds);
                UnitOutcome {
                    success: !result.is_error,
                    output: if result.is_error {
                        None
                    } else {
                        result.result.clone()
                    },
                    error: if result.is_error { result.result } else { None },
                    failure: None,
                    execution_time_seconds,
                    conversation,
                    rendered_prompt: rendered,
                    session_id,
                    cost_usd: result.total_cost_usd,
                    num_turns: result.num_turns,
                    duration_ms: result.duration_ms,
                    duration_api_ms: result.duration_api_ms,
                    exit_code,
                }
            }
            None => {
                let mut outcome = UnitOutcome::failure(
                    FailureKind::NoResult,
                    format!(
                        "no terminal result event; exit code: {}; stderr: {}",
                        exit_code.map_or("unknown".to_string(), |code| code.to_string()),
                        stderr_output.trim(),
                    ),
                    rendered,
                    wall_seconds,
                );
                outcome.conversation = conversation;
                outcome.session_id = session_id;
                outcome.exit_code = exit_code;
                outcome
            }
        }
    }
}

fn drain_events(
    line_rx: &mpsc::Receiver<String>,
    request: &ExecuteRequest<'_>,
    conversation: &mut Vec<Value>,
    session_id: &mut Option<String>,
    terminal: &mut Option<TerminalResult>,
) {
    while let Ok(line) = line_rx.try_recv() {
        let Some(event) = parse_event_line(&line) else {
            continue;
        };

        let kind = classify_event(&event);
        if session_id.is_none() {
            if let Some(id) = session_id_from_init(&event) {
                *session_id = Some(id);
            }
        }
        if terminal.is_none() {
            *terminal = TerminalResult::from_event(&event);
        }

        conversation.push(event.clone());
        request.hooks.fire_event(kind, &event);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use std::sync::Mutex;

    use serde_json::json;

    use fanout_core::types::Payload;

    use crate::adapter::ClaudeAdapter;
    use crate::stream::StreamEventKind;
    use crate::types::{ExecuteRequest, ExecutionHooks, FailureKind, UnitWorker};

    use super::ClaudeCliWorker;

    /// Write a throwaway shell script that stands in for the agent CLI.
    fn fake_agent(name: &str, body: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "fanout-fake-agent-{}-{}-{}",
            name,
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        let script = format!("#!/bin/sh\n{body}\n");
        fs::write(&path, script).expect("write fake agent");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod fake agent");
        path
    }

    fn worker_for(script: &PathBuf) -> ClaudeCliWorker {
        ClaudeCliWorker::new(ClaudeAdapter {
            executable: script.display().to_string(),
            ..ClaudeAdapter::default()
        })
    }

    fn request<'a>(
        payload: &'a Payload,
        timeout_secs: u64,
        hooks: ExecutionHooks<'a>,
    ) -> ExecuteRequest<'a> {
        ExecuteRequest {
            prompt_template: "process {item}",
            payload,
            timeout: std::time::Duration::from_secs(timeout_secs),
            hooks,
        }
    }

    const HAPPY_SCRIPT: &str = r#"
echo '{"type":"system","subtype":"init","session_id":"sess-42","model":"claude"}'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"working"}]}}'
echo '{"type":"result","subtype":"success","is_error":false,"result":"all done","total_cost_usd":0.01,"num_turns":3,"duration_ms":2000,"duration_api_ms":1500}'
"#;

    #[test]
    fn happy_path_captures_session_result_and_conversation() {
        let script = fake_agent("happy", HAPPY_SCRIPT);
        let worker = worker_for(&script);
        let mut payload = Payload::new();
        payload.insert("item".to_string(), json!("a"));

        let outcome = worker.execute(request(&payload, 30, ExecutionHooks::default()));

        assert!(outcome.success, "outcome: {outcome:?}");
        assert_eq!(outcome.session_id.as_deref(), Some("sess-42"));
        assert_eq!(outcome.output.as_deref(), Some("all done"));
        assert_eq!(outcome.cost_usd, Some(0.01));
        assert_eq!(outcome.num_turns, Some(3));
        assert_eq!(outcome.execution_time_seconds, 2.0);
        assert_eq!(outcome.conversation.len(), 3);
        assert_eq!(outcome.conversation[0]["type"], "system");
        assert_eq!(outcome.conversation[2]["type"], "result");
        assert_eq!(outcome.rendered_prompt, "process a");

        let _ = fs::remove_file(script);
    }

    #[test]
    fn events_are_delivered_to_hooks_in_order() {
        let script = fake_agent("hooks", HAPPY_SCRIPT);
        let worker = worker_for(&script);
        let payload = Payload::new();

        let seen: Mutex<Vec<StreamEventKind>> = Mutex::new(Vec::new());
        let on_event = |kind: StreamEventKind, _event: &serde_json::Value| {
            seen.lock().expect("lock").push(kind);
        };
        let spawned: Mutex<Option<u32>> = Mutex::new(None);
        let on_spawn = |pid: u32| {
            *spawned.lock().expect("lock") = Some(pid);
        };

        let hooks = ExecutionHooks {
            on_event: Some(&on_event),
            on_spawn: Some(&on_spawn),
        };
        let outcome = worker.execute(request(&payload, 30, hooks));

        assert!(outcome.success);
        assert_eq!(
            *seen.lock().expect("lock"),
            vec![
                StreamEventKind::System,
                StreamEventKind::Assistant,
                StreamEventKind::Result,
            ]
        );
        assert!(spawned.lock().expect("lock").is_some());

        let _ = fs::remove_file(script);
    }

    #[test]
    fn error_result_becomes_failure_with_message() {
        let script = fake_agent(
            "error",
            r#"echo '{"type":"result","subtype":"error","is_error":true,"result":"model refused"}'"#,
        );
        let worker = worker_for(&script);
        let payload = Payload::new();

        let outcome = worker.execute(request(&payload, 30, ExecutionHooks::default()));

        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("model refused"));
        assert!(outcome.output.is_none());
        assert!(outcome.failure.is_none());

        let _ = fs::remove_file(script);
    }

    #[test]
    fn exit_without_terminal_event_is_no_result() {
        let script = fake_agent(
            "noresult",
            r#"
echo '{"type":"system","subtype":"init","session_id":"sess-7"}'
echo 'oops' >&2
exit 3
"#,
        );
        let worker = worker_for(&script);
        let payload = Payload::new();

        let outcome = worker.execute(request(&payload, 30, ExecutionHooks::default()));

        assert!(!outcome.success);
        assert_eq!(outcome.failure, Some(FailureKind::NoResult));
        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(outcome.session_id.as_deref(), Some("sess-7"));
        let error = outcome.error.expect("error message");
        assert!(error.contains("exit code: 3"));
        assert!(error.contains("oops"));

        let _ = fs::remove_file(script);
    }

    #[test]
    fn timeout_kills_the_process_group() {
        let script = fake_agent(
            "sleepy",
            r#"
echo '{"type":"system","subtype":"init","session_id":"sess-slow"}'
sleep 60
"#,
        );
        let worker = worker_for(&script);
        let payload = Payload::new();

        let started = std::time::Instant::now();
        let outcome = worker.execute(request(&payload, 1, ExecutionHooks::default()));

        assert!(!outcome.success);
        assert_eq!(outcome.failure, Some(FailureKind::Timeout));
        assert_eq!(outcome.session_id.as_deref(), Some("sess-slow"));
        assert!(
            started.elapsed() < std::time::Duration::from_secs(10),
            "timeout must not wait for the child's sleep"
        );

        let _ = fs::remove_file(script);
    }

    #[test]
    fn child_stdin_is_null_so_reads_do_not_hang() {
        // `cat` copies stdin to stdout; with a NULL stdin it sees EOF
        // immediately instead of blocking on a terminal.
        let script = fake_agent(
            "stdin",
            r#"
cat > /dev/null
echo '{"type":"result","is_error":false,"result":"stdin closed"}'
"#,
        );
        let worker = worker_for(&script);
        let payload = Payload::new();

        let started = std::time::Instant::now();
        let outcome = worker.execute(request(&payload, 30, ExecutionHooks::default()));

        assert!(outcome.success);
        assert_eq!(outcome.output.as_deref(), Some("stdin closed"));
        assert!(
            started.elapsed() < std::time::Duration::from_secs(10),
            "a NULL stdin must unblock the child immediately"
        );

        let _ = fs::remove_file(script);
    }

    #[test]
    fn missing_executable_is_unavailable() {
        let worker = ClaudeCliWorker::new(ClaudeAdapter {
            executable: "/no/such/agent-cli".to_string(),
            ..ClaudeAdapter::default()
        });
        let payload = Payload::new();

        let outcome = worker.execute(request(&payload, 5, ExecutionHooks::default()));

        assert!(!outcome.success);
        assert_eq!(outcome.failure, Some(FailureKind::Unavailable));
        assert!(!worker.is_available());
    }

    #[test]
    fn non_json_output_lines_are_skipped() {
        let script = fake_agent(
            "noisy",
            r#"
echo 'warming up...'
echo '{"type":"result","is_error":false,"result":"ok"}'
echo 'shutting down'
"#,
        );
        let worker = worker_for(&script);
        let payload = Payload::new();

        let outcome = worker.execute(request(&payload, 30, ExecutionHooks::default()));

        assert!(outcome.success);
        assert_eq!(outcome.conversation.len(), 1);

        let _ = fs::remove_file(script);
    }

    #[test]
    fn worker_names_reflect_file_access_mode() {
        assert_eq!(
            ClaudeCliWorker::new(ClaudeAdapter::default()).name(),
            "claude-cli"
        );
        assert_eq!(
            ClaudeCliWorker::with_file_access().name(),
            "claude-cli-with-files"
        );
    }
}

//! Command construction for agent CLIs.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde_json::Value;

use fanout_core::types::Payload;

use crate::process::find_in_path;

/// A fully-built command line for one agent invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCommand {
    pub executable: String,
    pub args: Vec<String>,
}

/// Builds the command line for a particular agent CLI.
pub trait AgentAdapter: Send + Sync {
    fn executable(&self) -> &str;
    fn build_command(&self, rendered_prompt: &str, payload: &Payload) -> AgentCommand;

    fn is_available(&self) -> bool {
        find_in_path(self.executable()).is_some()
    }
}

/// Adapter for the Claude CLI in non-interactive streaming mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaudeAdapter {
    pub executable: String,
    /// Model override passed through verbatim.
    pub model: Option<String>,
    /// Max agentic turns, passed through verbatim.
    pub max_turns: Option<u32>,
    /// Grant the CLI access to directories referenced by the payload
    /// via `--add-dir`, skipping permission prompts.
    pub grant_file_access: bool,
}

impl Default for ClaudeAdapter {
    fn default() -> Self {
        Self {
            executable: "claude".to_string(),
            model: None,
            max_turns: None,
            grant_file_access: false,
        }
    }
}

impl ClaudeAdapter {
    pub fn with_file_access() -> Self {
        Self {
            grant_file_access: true,
            ..Self::default()
        }
    }

    /// Directories the agent needs to touch, derived from well-known
    /// payload fields. Only directories that actually exist are
    /// granted.
    fn payload_directories(payload: &Payload) -> BTreeSet<PathBuf> {
        let mut directories = BTreeSet::new();

        if let Some(path) = payload.get("file_path").and_then(Value::as_str) {
            add_parent_if_exists(&mut directories, Path::new(path));
        }

        if let Some(paths) = payload.get("file_paths").and_then(Value::as_array) {
            for entry in paths {
                if let Some(path) = entry.as_str() {
                    add_parent_if_exists(&mut directories, Path::new(path));
                }
            }
        }

        if let Some(dir) = payload.get("output_directory").and_then(Value::as_str) {
            let output = Path::new(dir);
            if output.is_dir() {
                directories.insert(output.to_path_buf());
            } else if let Some(parent) = output.parent() {
                if parent.is_dir() {
                    directories.insert(parent.to_path_buf());
                }
            }
        }

        directories
    }
}

fn add_parent_if_exists(directories: &mut BTreeSet<PathBuf>, file: &Path) {
    if !file.exists() {
        return;
    }
    if let Some(parent) = file.parent() {
        directories.insert(parent.to_path_buf());
    }
}

impl AgentAdapter for ClaudeAdapter {
    fn executable(&self) -> &str {
        &self.executable
    }

    fn build_command(&self, rendered_prompt: &str, payload: &Payload) -> AgentCommand {
        let mut args = vec![
            "--print".to_string(),
            rendered_prompt.to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];

        if let Some(model) = &self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }

        if let Some(max_turns) = self.max_turns {
            args.push("--max-turns".to_string());
            args.push(max_turns.to_string());
        }

        if self.grant_file_access {
            let directories = Self::payload_directories(payload);
            if !directories.is_empty() {
                args.push("--dangerously-skip-permissions".to_string());
                for directory in directories {
                    args.push("--add-dir".to_string());
                    args.push(directory.display().to_string());
                }
            }
        }

        AgentCommand {
            executable: self.executable.clone(),
            args,
        }
    }
}

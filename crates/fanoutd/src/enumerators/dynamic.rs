//! User-supplied enumeration code behind a mandatory approval gate.
//!
//! The code is a shell script whose stdout must be a JSON array of
//! objects. It only ever executes when the stored config carries
//! `approved: true` AND `approved_code` byte-identical to `code`;
//! anything else surfaces the code for human review instead. This is
//! an authorization gate, not a sandbox: approved code runs with the
//! daemon's privileges.

use std::process::{Command, Stdio};

use serde::Deserialize;
use serde_json::{json, Value};

use fanout_core::types::Payload;

use super::{config_error, EnumerationResult, Enumerator, EnumeratorError};

fn default_shell() -> String {
    "sh".to_string()
}

#[derive(Debug, Clone, Deserialize)]
struct DynamicConfig {
    code: String,
    #[serde(default)]
    approved: bool,
    /// The exact code that was approved; execution requires an exact
    /// match so edits after approval force a re-review.
    #[serde(default)]
    approved_code: Option<String>,
    #[serde(default = "default_shell")]
    shell: String,
    /// Extra context exposed to the script as the
    /// `ENUMERATOR_CONTEXT` environment variable (JSON-encoded).
    #[serde(default)]
    context: Payload,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct DynamicEnumerator {
    config: DynamicConfig,
}

impl DynamicEnumerator {
    pub fn from_config(config: &Value) -> Result<Self, EnumeratorError> {
        let config: DynamicConfig =
            serde_json::from_value(config.clone()).map_err(config_error)?;
        Ok(Self { config })
    }

    fn approval_granted(&self) -> bool {
        self.config.approved
            && self.config.approved_code.as_deref() == Some(self.config.code.as_str())
    }
}

impl Enumerator for DynamicEnumerator {
    fn enumerator_type(&self) -> &'static str {
        "dynamic"
    }

    fn validate(&self) -> Result<(), EnumeratorError> {
        if self.config.code.trim().is_empty() {
            return Err(EnumeratorError::InvalidConfig {
                message: "code cannot be empty".to_string(),
            });
        }
        Ok(())
    }

    fn enumerate(&self) -> Result<EnumerationResult, EnumeratorError> {
        self.validate()?;

        if !self.approval_granted() {
            return Err(EnumeratorError::PendingApproval {
                code: self.config.code.clone(),
            });
        }

        let context_json =
            serde_json::to_string(&self.config.context).map_err(config_error)?;
        let output = Command::new(&self.config.shell)
            .arg("-c")
            .arg(&self.config.code)
            .env("ENUMERATOR_CONTEXT", context_json)
            .stdin(Stdio::null())
            .output()
            .map_err(|err| EnumeratorError::Failed {
                message: format!("failed to run enumeration code: {err}"),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EnumeratorError::Failed {
                message: format!(
                    "enumeration code exited with {}: {}",
                    output.status,
                    stderr.trim()
                ),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let parsed: Value =
            serde_json::from_str(stdout.trim()).map_err(|err| EnumeratorError::Failed {
                message: format!("enumeration code must print a JSON array: {err}"),
            })?;
        let array = parsed.as_array().ok_or_else(|| EnumeratorError::Failed {
            message: "enumeration code must print a JSON array of objects".to_string(),
        })?;

        let mut items = Vec::new();
        for (index, element) in array.iter().enumerate() {
            let mut item = match element {
                Value::Object(object) => object.clone(),
                other => {
                    let mut wrapped = Payload::new();
                    wrapped.insert("value".to_string(), other.clone());
                    wrapped
                }
            };
            item.insert("_index".to_string(), json!(index));
            items.push(item);

            if let Some(limit) = self.config.limit {
                if items.len() >= limit {
                    break;
                }
            }
        }

        let mut metadata = Payload::new();
        metadata.insert("item_count".to_string(), json!(items.len()));
        metadata.insert("shell".to_string(), json!(self.config.shell));

        Ok(EnumerationResult { items, metadata })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unapproved_code_is_surfaced_not_executed() {
        let enumerator = DynamicEnumerator::from_config(&json!({
            "code": "echo '[{\"x\": 1}]'",
        }))
        .expect("config");

        match enumerator.enumerate() {
            Err(EnumeratorError::PendingApproval { code }) => {
                assert!(code.contains("echo"));
            }
            other => panic!("expected pending approval, got {other:?}"),
        }
    }

    #[test]
    fn approval_requires_exact_code_match() {
        let enumerator = DynamicEnumerator::from_config(&json!({
            "code": "echo '[{\"x\": 1}]'",
            "approved": true,
            "approved_code": "echo '[]'",
        }))
        .expect("config");

        assert!(matches!(
            enumerator.enumerate(),
            Err(EnumeratorError::PendingApproval { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn approved_code_produces_items() {
        let code = "echo '[{\"name\": \"a\"}, {\"name\": \"b\"}]'";
        let enumerator = DynamicEnumerator::from_config(&json!({
            "code": code,
            "approved": true,
            "approved_code": code,
        }))
        .expect("config");

        let result = enumerator.enumerate().expect("enumerate");
        assert_eq!(result.items.len(), 2);
        assert_eq!(result.items[0]["name"], "a");
        assert_eq!(result.items[1]["_index"], 1);
    }

    #[cfg(unix)]
    #[test]
    fn context_reaches_the_script() {
        let code = r#"case "$ENUMERATOR_CONTEXT" in *api*) echo '[{"ctx": "found"}]';; *) echo '[]';; esac"#;
        let enumerator = DynamicEnumerator::from_config(&json!({
            "code": code,
            "approved": true,
            "approved_code": code,
            "context": {"source": "api"},
        }))
        .expect("config");

        let result = enumerator.enumerate().expect("enumerate");
        assert_eq!(result.items[0]["ctx"], "found");
    }

    #[cfg(unix)]
    #[test]
    fn failing_script_is_an_enumeration_failure() {
        let code = "echo doom >&2; exit 7";
        let enumerator = DynamicEnumerator::from_config(&json!({
            "code": code,
            "approved": true,
            "approved_code": code,
        }))
        .expect("config");

        match enumerator.enumerate() {
            Err(EnumeratorError::Failed { message }) => {
                assert!(message.contains("doom"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn non_array_output_is_rejected() {
        let code = "echo '{\"not\": \"array\"}'";
        let enumerator = DynamicEnumerator::from_config(&json!({
            "code": code,
            "approved": true,
            "approved_code": code,
        }))
        .expect("config");

        assert!(matches!(
            enumerator.enumerate(),
            Err(EnumeratorError::Failed { .. })
        ));
    }

    #[test]
    fn empty_code_is_invalid() {
        let enumerator =
            DynamicEnumerator::from_config(&json!({"code": "   "})).expect("config");
        assert!(matches!(
            enumerator.validate(),
            Err(EnumeratorError::InvalidConfig { .. })
        ));
    }
}

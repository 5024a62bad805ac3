//! Placeholder substitution for worker prompt templates.

use serde_json::Value;

use crate::types::Payload;

/// Render a `{placeholder}` template against a unit payload.
///
/// This is a total function: every `{key}` whose key exists in the
/// payload is substituted; unknown keys are left in place and reported
/// through a trailing error marker instead of aborting, so the rendered
/// prompt stays reproducible and the agent can still ask for the
/// missing data. `{{` and `}}` escape literal braces.
pub fn render_template(template: &str, payload: &Payload) -> String {
    let mut rendered = String::with_capacity(template.len());
    let mut missing: Vec<String> = Vec::new();
    let mut chars = template.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '{' => {
                if chars.peek() == Some(&'{') {
                    chars.next();
                    rendered.push('{');
                    continue;
                }

                let mut key = String::new();
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == '}' {
                        closed = true;
                        break;
                    }
                    key.push(inner);
                }

                if !closed {
                    rendered.push('{');
                    rendered.push_str(&key);
                    continue;
                }

                match payload.get(&key) {
                    Some(value) => rendered.push_str(&value_to_string(value)),
                    None => {
                        rendered.push('{');
                        rendered.push_str(&key);
                        rendered.push('}');
                        if !missing.contains(&key) {
                            missing.push(key);
                        }
                    }
                }
            }
            '}' => {
                if chars.peek() == Some(&'}') {
                    chars.next();
                }
                rendered.push('}');
            }
            other => rendered.push(other),
        }
    }

    if !missing.is_empty() {
        rendered.push_str("\n\n[ERROR: missing template variables: ");
        rendered.push_str(&missing.join(", "));
        rendered.push(']');
    }

    rendered
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

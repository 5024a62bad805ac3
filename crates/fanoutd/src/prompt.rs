//! Synthesizes per-item worker prompt templates from high-level user
//! intent.
//!
//! The output is a template with `{placeholder}` slots that the runner
//! fills from each unit's payload at execution time.

use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
pub struct PromptSynthesizer;

impl PromptSynthesizer {
    pub fn new() -> Self {
        Self
    }

    /// Template for file-processing batches; always exposes the
    /// `{file_path}` placeholder.
    pub fn file_processing_prompt(&self, user_intent: &str) -> String {
        let mut parts = vec![
            "You are processing a file as part of a batch operation.".to_string(),
            String::new(),
            "FILE TO PROCESS: {file_path}".to_string(),
            String::new(),
        ];
        parts.extend(task_block(user_intent));
        parts.extend(execution_guidelines());
        parts.push(String::new());
        parts.push("Complete ALL aspects of the task and report success or failure.".to_string());
        parts.join("\n")
    }

    /// Template for any other unit type. `payload_fields` maps field
    /// names to short descriptions; each becomes a placeholder line so
    /// the worker sees the unit's data.
    pub fn generic_prompt(
        &self,
        user_intent: &str,
        unit_type: Option<&str>,
        payload_fields: Option<&BTreeMap<String, String>>,
    ) -> String {
        let mut parts = vec![match unit_type {
            Some(unit_type) => {
                format!("You are processing a {unit_type} as part of a batch operation.")
            }
            None => "You are processing an item as part of a batch operation.".to_string(),
        }];

        parts.push(String::new());
        parts.push("WORK UNIT DATA:".to_string());
        parts.push(
            "The payload for this work unit is provided below. Use the data to complete your task."
                .to_string(),
        );

        if let Some(fields) = payload_fields {
            parts.push(String::new());
            for (field, description) in fields {
                parts.push(format!("- {field}: {{{field}}}  ({description})"));
            }
        }

        parts.push(String::new());
        parts.extend(task_block(user_intent));
        parts.extend(execution_guidelines());
        parts.push(String::new());
        parts.push("Complete ALL aspects of the task and report success or failure.".to_string());
        parts.join("\n")
    }
}

fn task_block(user_intent: &str) -> Vec<String> {
    vec![
        "=== YOUR COMPLETE TASK ===".to_string(),
        "The following describes EVERYTHING you must do. Follow ALL instructions including any output/storage requirements:".to_string(),
        String::new(),
        user_intent.to_string(),
        String::new(),
        "=== END TASK ===".to_string(),
    ]
}

fn execution_guidelines() -> Vec<String> {
    vec![
        String::new(),
        "EXECUTION GUIDELINES:".to_string(),
        "- Use your available tools to complete this task".to_string(),
        "- Work autonomously - you have full tool access".to_string(),
        "- If you encounter errors, try to resolve them or fail gracefully".to_string(),
        "- Complete ALL parts of the task above, including any output requirements".to_string(),
        "- Report your results clearly at the end".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_prompt_exposes_file_path_placeholder() {
        let prompt = PromptSynthesizer::new().file_processing_prompt("rotate the image");
        assert!(prompt.contains("{file_path}"));
        assert!(prompt.contains("rotate the image"));
        assert!(prompt.contains("=== YOUR COMPLETE TASK ==="));
    }

    #[test]
    fn generic_prompt_lists_payload_fields_as_placeholders() {
        let mut fields = BTreeMap::new();
        fields.insert("url".to_string(), "from column 'url'".to_string());
        fields.insert("title".to_string(), "payload field".to_string());

        let prompt = PromptSynthesizer::new().generic_prompt(
            "summarize the page",
            Some("url"),
            Some(&fields),
        );
        assert!(prompt.contains("processing a url"));
        assert!(prompt.contains("- url: {url}"));
        assert!(prompt.contains("- title: {title}"));
        assert!(prompt.contains("summarize the page"));
    }

    #[test]
    fn generic_prompt_without_type_or_fields_still_renders() {
        let prompt = PromptSynthesizer::new().generic_prompt("do work", None, None);
        assert!(prompt.contains("processing an item"));
        assert!(prompt.contains("do work"));
    }
}

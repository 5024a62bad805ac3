//! Structured-document enumerator: items from a JSON array.

use std::path::PathBuf;

use serde::Deserialize;
use serde_json::{json, Value};

use fanout_core::types::Payload;

use super::{config_error, EnumerationResult, Enumerator, EnumeratorError};

#[derive(Debug, Clone, Deserialize)]
struct JsonConfig {
    file_path: PathBuf,
    /// Dot-separated path to the items array ("data.items"); empty
    /// means the document root must be an array.
    #[serde(default)]
    items_path: String,
    #[serde(default)]
    id_field: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

/// Enumerate elements of a JSON array. Object elements keep their
/// fields; scalars are wrapped as `{"value": ...}`. Every payload gets
/// `_index` (and `_id` when `id_field` is configured).
#[derive(Debug, Clone)]
pub struct JsonEnumerator {
    config: JsonConfig,
}

impl JsonEnumerator {
    pub fn from_config(config: &Value) -> Result<Self, EnumeratorError> {
        let config: JsonConfig = serde_json::from_value(config.clone()).map_err(config_error)?;
        Ok(Self { config })
    }

    fn items_at_path<'a>(&self, data: &'a Value) -> Result<&'a Value, EnumeratorError> {
        if self.config.items_path.is_empty() {
            return Ok(data);
        }

        let mut current = data;
        for key in self.config.items_path.split('.') {
            let object = current.as_object().ok_or_else(|| EnumeratorError::Failed {
                message: format!(
                    "failed to locate items at path '{}': cannot access '{key}' on non-object",
                    self.config.items_path
                ),
            })?;
            current = object.get(key).ok_or_else(|| EnumeratorError::Failed {
                message: format!(
                    "failed to locate items at path '{}': key '{key}' not found",
                    self.config.items_path
                ),
            })?;
        }
        Ok(current)
    }
}

impl Enumerator for JsonEnumerator {
    fn enumerator_type(&self) -> &'static str {
        "json"
    }

    fn validate(&self) -> Result<(), EnumeratorError> {
        if !self.config.file_path.exists() {
            return Err(EnumeratorError::InvalidConfig {
                message: format!("JSON file not found: {}", self.config.file_path.display()),
            });
        }
        if !self.config.file_path.is_file() {
            return Err(EnumeratorError::InvalidConfig {
                message: format!("path is not a file: {}", self.config.file_path.display()),
            });
        }
        Ok(())
    }

    fn enumerate(&self) -> Result<EnumerationResult, EnumeratorError> {
        self.validate()?;

        let text =
            std::fs::read_to_string(&self.config.file_path).map_err(|err| {
                EnumeratorError::Failed {
                    message: format!("cannot read JSON file: {err}"),
                }
            })?;
        let data: Value = serde_json::from_str(&text).map_err(|err| EnumeratorError::Failed {
            message: format!("JSON parsing error: {err}"),
        })?;

        let items_value = self.items_at_path(&data)?;
        let array = items_value.as_array().ok_or_else(|| EnumeratorError::Failed {
            message: format!(
                "items at path '{}' is not an array",
                if self.config.items_path.is_empty() {
                    "(root)"
                } else {
                    &self.config.items_path
                }
            ),
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
            if let Some(id_field) = &self.config.id_field {
                if let Some(id) = item.get(id_field).cloned() {
                    item.insert("_id".to_string(), id);
                }
            }
            items.push(item);

            if let Some(limit) = self.config.limit {
                if items.len() >= limit {
                    break;
                }
            }
        }

        let mut metadata = Payload::new();
        metadata.insert(
            "file_path".to_string(),
            json!(self.config.file_path.display().to_string()),
        );
        metadata.insert(
            "items_path".to_string(),
            json!(if self.config.items_path.is_empty() {
                "(root)".to_string()
            } else {
                self.config.items_path.clone()
            }),
        );
        metadata.insert("item_count".to_string(), json!(items.len()));

        Ok(EnumerationResult { items, metadata })
    }
}

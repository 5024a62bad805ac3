//! Delimited-text enumerator: one work item per row.

use std::path::PathBuf;

use serde::Deserialize;
use serde_json::{json, Value};

use fanout_core::types::Payload;

use super::{config_error, EnumerationResult, Enumerator, EnumeratorError};

fn default_delimiter() -> String {
    ",".to_string()
}

fn default_has_header() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
struct CsvConfig {
    file_path: PathBuf,
    #[serde(default)]
    id_column: Option<String>,
    #[serde(default = "default_delimiter")]
    delimiter: String,
    #[serde(default = "default_has_header")]
    has_header: bool,
    #[serde(default)]
    columns: Vec<String>,
    #[serde(default)]
    limit: Option<usize>,
}

/// Enumerate rows of a delimited file. Each payload maps column names
/// to cell values plus `_row_index` (and `_id` when `id_column` is
/// configured).
#[derive(Debug, Clone)]
pub struct CsvEnumerator {
    config: CsvConfig,
}

impl CsvEnumerator {
    pub fn from_config(config: &Value) -> Result<Self, EnumeratorError> {
        let config: CsvConfig = serde_json::from_value(config.clone()).map_err(config_error)?;
        Ok(Self { config })
    }

    fn delimiter_byte(&self) -> Result<u8, EnumeratorError> {
        let bytes = self.config.delimiter.as_bytes();
        if bytes.len() != 1 {
            return Err(EnumeratorError::InvalidConfig {
                message: format!(
                    "delimiter must be a single byte, got '{}'",
                    self.config.delimiter
                ),
            });
        }
        Ok(bytes[0])
    }
}

impl Enumerator for CsvEnumerator {
    fn enumerator_type(&self) -> &'static str {
        "csv"
    }

    fn validate(&self) -> Result<(), EnumeratorError> {
        if !self.config.file_path.exists() {
            return Err(EnumeratorError::InvalidConfig {
                message: format!("CSV file not found: {}", self.config.file_path.display()),
            });
        }
        if !self.config.file_path.is_file() {
            return Err(EnumeratorError::InvalidConfig {
                message: format!("path is not a file: {}", self.config.file_path.display()),
            });
        }
        if !self.config.has_header && self.config.columns.is_empty() {
            return Err(EnumeratorError::InvalidConfig {
                message: "columns required when has_header is false".to_string(),
            });
        }
        self.delimiter_byte()?;
        Ok(())
    }

    fn enumerate(&self) -> Result<EnumerationResult, EnumeratorError> {
        self.validate()?;

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter_byte()?)
            .has_headers(self.config.has_header)
            .flexible(true)
            .from_path(&self.config.file_path)
            .map_err(|err| EnumeratorError::Failed {
                message: format!("cannot open CSV: {err}"),
            })?;

        let columns: Vec<String> = if self.config.has_header {
            reader
                .headers()
                .map_err(|err| EnumeratorError::Failed {
                    message: format!("CSV parsing error: {err}"),
                })?
                .iter()
                .map(str::to_string)
                .collect()
        } else {
            self.config.columns.clone()
        };

        let mut items = Vec::new();
        for (index, record) in reader.records().enumerate() {
            let record = record.map_err(|err| EnumeratorError::Failed {
                message: format!("CSV parsing error: {err}"),
            })?;
            // Ragged rows are skipped rather than aborting the batch.
            if record.len() != columns.len() {
                continue;
            }

            let mut item = Payload::new();
            for (column, value) in columns.iter().zip(record.iter()) {
                item.insert(column.clone(), json!(value));
            }
            item.insert("_row_index".to_string(), json!(index));
            if let Some(id_column) = &self.config.id_column {
                if let Some(id) = item.get(id_column).cloned() {
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
        metadata.insert("columns".to_string(), json!(columns));
        metadata.insert("row_count".to_string(), json!(items.len()));

        Ok(EnumerationResult { items, metadata })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_csv(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "fanout-csv-enum-{name}-{}.csv",
            std::process::id()
        ));
        fs::write(&path, contents).expect("write csv");
        path
    }

    #[test]
    fn rows_become_items_with_row_index() {
        let path = temp_csv("basic", "name,age\nalice,30\nbob,41\n");
        let enumerator = CsvEnumerator::from_config(
            &json!({"file_path": path.display().to_string(), "id_column": "name"}),
        )
        .expect("config");

        let result = enumerator.enumerate().expect("enumerate");
        assert_eq!(result.items.len(), 2);
        assert_eq!(result.items[0]["name"], "alice");
        assert_eq!(result.items[0]["_row_index"], 0);
        assert_eq!(result.items[0]["_id"], "alice");
        assert_eq!(result.items[1]["age"], "41");
        assert_eq!(result.metadata["columns"], json!(["name", "age"]));

        let _ = fs::remove_file(path);
    }

    #[test]
    fn headerless_files_need_explicit_columns() {
        let path = temp_csv("noheader", "alice,30\nbob,41\n");

        let missing = CsvEnumerator::from_config(
            &json!({"file_path": path.display().to_string(), "has_header": false}),
        )
        .expect("config");
        assert!(matches!(
            missing.validate(),
            Err(EnumeratorError::InvalidConfig { .. })
        ));

        let with_columns = CsvEnumerator::from_config(&json!({
            "file_path": path.display().to_string(),
            "has_header": false,
            "columns": ["name", "age"],
        }))
        .expect("config");
        let result = with_columns.enumerate().expect("enumerate");
        assert_eq!(result.items.len(), 2);
        assert_eq!(result.items[0]["name"], "alice");

        let _ = fs::remove_file(path);
    }

    #[test]
    fn ragged_rows_are_skipped() {
        let path = temp_csv("ragged", "a,b\n1,2\nonly-one\n3,4\n");
        let enumerator =
            CsvEnumerator::from_config(&json!({"file_path": path.display().to_string()}))
                .expect("config");
        let result = enumerator.enumerate().expect("enumerate");
        assert_eq!(result.items.len(), 2);

        let _ = fs::remove_file(path);
    }

    #[test]
    fn custom_delimiter_and_limit() {
        let path = temp_csv("tabs", "x\ty\n1\t2\n3\t4\n5\t6\n");
        let enumerator = CsvEnumerator::from_config(&json!({
            "file_path": path.display().to_string(),
            "delimiter": "\t",
            "limit": 2,
        }))
        .expect("config");
        let result = enumerator.enumerate().expect("enumerate");
        assert_eq!(result.items.len(), 2);
        assert_eq!(result.items[0]["x"], "1");

        let _ = fs::remove_file(path);
    }

    #[test]
    fn missing_file_is_invalid() {
        let enumerator =
            CsvEnumerator::from_config(&json!({"file_path": "/no/such/file.csv"}))
                .expect("config");
        assert!(matches!(
            enumerator.validate(),
            Err(EnumeratorError::InvalidConfig { .. })
        ));
    }
}

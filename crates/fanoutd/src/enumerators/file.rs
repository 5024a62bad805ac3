//! Filesystem enumerator: glob patterns over a base directory.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;
use serde_json::{json, Value};

use fanout_core::types::Payload;

use super::{config_error, EnumerationResult, Enumerator, EnumeratorError};

fn default_pattern() -> String {
    "**/*".to_string()
}

#[derive(Debug, Clone, Deserialize)]
struct FileConfig {
    base_directory: PathBuf,
    #[serde(default = "default_pattern")]
    pattern: String,
    #[serde(default)]
    exclude_patterns: Vec<String>,
    #[serde(default)]
    include_hidden: bool,
    #[serde(default)]
    limit: Option<usize>,
}

/// Enumerate files matching a glob pattern. Each item payload carries
/// `file_path`, `relative_path`, `file_name`, `file_extension`, and
/// `file_size`.
#[derive(Debug, Clone)]
pub struct FileEnumerator {
    config: FileConfig,
}

impl FileEnumerator {
    pub fn from_config(config: &Value) -> Result<Self, EnumeratorError> {
        let config: FileConfig =
            serde_json::from_value(config.clone()).map_err(config_error)?;
        Ok(Self { config })
    }
}

impl Enumerator for FileEnumerator {
    fn enumerator_type(&self) -> &'static str {
        "file"
    }

    fn validate(&self) -> Result<(), EnumeratorError> {
        let base = &self.config.base_directory;
        if !base.exists() {
            return Err(EnumeratorError::InvalidConfig {
                message: format!("base directory does not exist: {}", base.display()),
            });
        }
        if !base.is_dir() {
            return Err(EnumeratorError::InvalidConfig {
                message: format!("base directory is not a directory: {}", base.display()),
            });
        }
        if self.config.pattern.is_empty() {
            return Err(EnumeratorError::InvalidConfig {
                message: "pattern cannot be empty".to_string(),
            });
        }
        Ok(())
    }

    fn enumerate(&self) -> Result<EnumerationResult, EnumeratorError> {
        self.validate()?;

        let base = self
            .config
            .base_directory
            .canonicalize()
            .map_err(|err| EnumeratorError::Failed {
                message: format!("cannot resolve base directory: {err}"),
            })?;
        let full_pattern = format!("{}/{}", base.display(), self.config.pattern);

        let excludes: Vec<glob::Pattern> = self
            .config
            .exclude_patterns
            .iter()
            .map(|pattern| glob::Pattern::new(pattern))
            .collect::<Result<_, _>>()
            .map_err(|err| EnumeratorError::InvalidConfig {
                message: format!("bad exclude pattern: {err}"),
            })?;

        let entries = glob::glob(&full_pattern).map_err(|err| EnumeratorError::InvalidConfig {
            message: format!("bad glob pattern: {err}"),
        })?;

        let mut items = Vec::new();
        for entry in entries {
            let path = entry.map_err(|err| EnumeratorError::Failed {
                message: format!("file enumeration failed: {err}"),
            })?;
            if !path.is_file() {
                continue;
            }

            let file_name = match path.file_name().and_then(|name| name.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            if !self.config.include_hidden && file_name.starts_with('.') {
                continue;
            }

            let relative = path.strip_prefix(&base).unwrap_or(&path).to_path_buf();
            if excludes.iter().any(|pattern| pattern.matches_path(&relative)) {
                continue;
            }

            let size = path
                .metadata()
                .map(|metadata| metadata.len())
                .unwrap_or(0);
            let extension = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
                .unwrap_or_default();

            let mut item = Payload::new();
            item.insert("file_path".to_string(), json!(path.display().to_string()));
            item.insert(
                "relative_path".to_string(),
                json!(relative.display().to_string()),
            );
            item.insert("file_name".to_string(), json!(file_name));
            item.insert("file_extension".to_string(), json!(extension));
            item.insert("file_size".to_string(), json!(size));
            items.push(item);

            if let Some(limit) = self.config.limit {
                if items.len() >= limit {
                    break;
                }
            }
        }

        items.sort_by(|a, b| {
            let a_path = a.get("file_path").and_then(Value::as_str).unwrap_or("");
            let b_path = b.get("file_path").and_then(Value::as_str).unwrap_or("");
            a_path.cmp(b_path)
        });

        let mut by_extension: BTreeMap<String, u64> = BTreeMap::new();
        for item in &items {
            let ext = item
                .get("file_extension")
                .and_then(Value::as_str)
                .filter(|ext| !ext.is_empty())
                .unwrap_or("(no extension)")
                .to_string();
            *by_extension.entry(ext).or_insert(0) += 1;
        }

        let mut metadata = Payload::new();
        metadata.insert(
            "base_directory".to_string(),
            json!(base.display().to_string()),
        );
        metadata.insert("pattern".to_string(), json!(self.config.pattern));
        metadata.insert(
            "file_counts_by_extension".to_string(),
            serde_json::to_value(&by_extension).map_err(config_error)?,
        );

        Ok(EnumerationResult { items, metadata })
    }
}

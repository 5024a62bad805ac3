//! Data-source adapters that turn a configuration into the ordered
//! list of work-unit payloads for a job.

use serde_json::Value;

use fanout_core::types::Payload;

mod csv_source;
mod dynamic;
mod file;
mod json_source;
mod sql;

pub use csv_source::CsvEnumerator;
pub use dynamic::DynamicEnumerator;
pub use file::FileEnumerator;
pub use json_source::JsonEnumerator;
pub use sql::SqlEnumerator;

pub const ENUMERATOR_TYPES: &[&str] = &["file", "csv", "json", "sql", "dynamic"];

#[derive(Debug, thiserror::Error)]
pub enum EnumeratorError {
    #[error("unknown enumerator type: '{requested}'. Available types: {available}")]
    UnknownType {
        requested: String,
        available: String,
    },
    #[error("invalid enumerator config: {message}")]
    InvalidConfig { message: String },
    #[error("enumeration failed: {message}")]
    Failed { message: String },
    /// User-supplied code that has not been approved yet. Carries the
    /// code back to the caller for human review; nothing may execute.
    #[error("enumeration code is awaiting approval")]
    PendingApproval { code: String },
}

/// Result of a successful enumeration.
#[derive(Debug, Clone, Default)]
pub struct EnumerationResult {
    /// Ordered item payloads, one per future work unit.
    pub items: Vec<Payload>,
    /// Source-specific details (columns, counts, paths).
    pub metadata: Payload,
}

/// A data-source adapter. Enumeration happens server-side; items never
/// travel through the chat channel.
pub trait Enumerator {
    fn enumerator_type(&self) -> &'static str;

    /// Check the configuration without touching the data source more
    /// than necessary.
    fn validate(&self) -> Result<(), EnumeratorError>;

    fn enumerate(&self) -> Result<EnumerationResult, EnumeratorError>;

    /// One item for test runs; avoids a full enumeration where the
    /// source supports it.
    fn sample_item(&self) -> Result<Option<Payload>, EnumeratorError> {
        let result = self.enumerate()?;
        Ok(result.items.into_iter().next())
    }
}

/// Resolve an enumerator by its type tag.
pub fn create_enumerator(
    enumerator_type: &str,
    config: &Value,
) -> Result<Box<dyn Enumerator>, EnumeratorError> {
    match enumerator_type {
        "file" => Ok(Box::new(FileEnumerator::from_config(config)?)),
        "csv" => Ok(Box::new(CsvEnumerator::from_config(config)?)),
        "json" => Ok(Box::new(JsonEnumerator::from_config(config)?)),
        "sql" => Ok(Box::new(SqlEnumerator::from_config(config)?)),
        "dynamic" => Ok(Box::new(DynamicEnumerator::from_config(config)?)),
        other => Err(EnumeratorError::UnknownType {
            requested: other.to_string(),
            available: ENUMERATOR_TYPES.join(", "),
        }),
    }
}

pub(crate) fn config_error(err: serde_json::Error) -> EnumeratorError {
    EnumeratorError::InvalidConfig {
        message: err.to_string(),
    }
}

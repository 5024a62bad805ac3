//! Tabular-query enumerator: one work item per result row of a
//! read-only SQL query against an embedded database file.

use serde::Deserialize;
use serde_json::{json, Value};

use fanout_core::types::Payload;

use super::{config_error, EnumerationResult, Enumerator, EnumeratorError};

#[derive(Debug, Clone, Deserialize)]
struct SqlConfig {
    /// `sqlite:///path/to.db`, `sqlite://path/to.db`, or a bare path.
    connection_string: String,
    query: String,
    #[serde(default)]
    id_column: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

/// Enumerate rows from a SQL query. The query must return everything
/// the workers need; workers receive row data as-is and never re-query
/// the database.
#[derive(Debug, Clone)]
pub struct SqlEnumerator {
    config: SqlConfig,
}

impl SqlEnumerator {
    pub fn from_config(config: &Value) -> Result<Self, EnumeratorError> {
        let config: SqlConfig = serde_json::from_value(config.clone()).map_err(config_error)?;
        Ok(Self { config })
    }

    fn database_path(&self) -> &str {
        let raw = self.config.connection_string.as_str();
        raw.strip_prefix("sqlite:///")
            .or_else(|| raw.strip_prefix("sqlite://"))
            .unwrap_or(raw)
    }
}

impl Enumerator for SqlEnumerator {
    fn enumerator_type(&self) -> &'static str {
        "sql"
    }

    fn validate(&self) -> Result<(), EnumeratorError> {
        if self.config.connection_string.is_empty() {
            return Err(EnumeratorError::InvalidConfig {
                message: "connection_string is required".to_string(),
            });
        }
        if self.config.query.is_empty() {
            return Err(EnumeratorError::InvalidConfig {
                message: "query is required".to_string(),
            });
        }
        // Enumeration is read-only.
        if !self
            .config
            .query
            .trim_start()
            .to_ascii_lowercase()
            .starts_with("select")
        {
            return Err(EnumeratorError::InvalidConfig {
                message: "only SELECT queries are allowed".to_string(),
            });
        }
        if !std::path::Path::new(self.database_path()).exists() {
            return Err(EnumeratorError::InvalidConfig {
                message: format!("database not found: {}", self.database_path()),
            });
        }
        Ok(())
    }

    fn enumerate(&self) -> Result<EnumerationResult, EnumeratorError> {
        self.validate()?;

        let conn = rusqlite::Connection::open_with_flags(
            self.database_path(),
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
        )
        .map_err(|err| EnumeratorError::Failed {
            message: format!("cannot open database: {err}"),
        })?;

        let mut stmt = conn
            .prepare(&self.config.query)
            .map_err(|err| EnumeratorError::Failed {
                message: format!("query preparation failed: {err}"),
            })?;
        let columns: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();

        let mut rows = stmt.query([]).map_err(|err| EnumeratorError::Failed {
            message: format!("query execution failed: {err}"),
        })?;

        let mut items = Vec::new();
        let mut index = 0usize;
        while let Some(row) = rows.next().map_err(|err| EnumeratorError::Failed {
            message: format!("row fetch failed: {err}"),
        })? {
            let mut item = Payload::new();
            for (column_index, column) in columns.iter().enumerate() {
                let value = match row.get_ref(column_index) {
                    Ok(value_ref) => sql_value_to_json(value_ref),
                    Err(_) => Value::Null,
                };
                item.insert(column.clone(), value);
            }
            item.insert("_row_index".to_string(), json!(index));
            if let Some(id_column) = &self.config.id_column {
                if let Some(id) = item.get(id_column).cloned() {
                    item.insert("_id".to_string(), id);
                }
            }
            items.push(item);
            index += 1;

            if let Some(limit) = self.config.limit {
                if items.len() >= limit {
                    break;
                }
            }
        }

        let mut metadata = Payload::new();
        metadata.insert("columns".to_string(), json!(columns));
        metadata.insert("row_count".to_string(), json!(items.len()));

        Ok(EnumerationResult { items, metadata })
    }
}

fn sql_value_to_json(value: rusqlite::types::ValueRef<'_>) -> Value {
    use rusqlite::types::ValueRef;
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(int) => json!(int),
        ValueRef::Real(real) => json!(real),
        ValueRef::Text(text) => json!(String::from_utf8_lossy(text).to_string()),
        ValueRef::Blob(blob) => json!(format!("<blob {} bytes>", blob.len())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    fn temp_db(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "fanout-sql-enum-{name}-{}.db",
            std::process::id()
        ));
        let _ = fs::remove_file(&path);
        let conn = rusqlite::Connection::open(&path).expect("create db");
        conn.execute_batch(
            r#"
CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT, score REAL);
INSERT INTO items (id, name, score) VALUES (1, 'alpha', 0.5);
INSERT INTO items (id, name, score) VALUES (2, 'beta', NULL);
INSERT INTO items (id, name, score) VALUES (3, 'gamma', 2.25);
"#,
        )
        .expect("seed db");
        path
    }

    #[test]
    fn rows_become_typed_payloads() {
        let path = temp_db("typed");
        let enumerator = SqlEnumerator::from_config(&json!({
            "connection_string": path.display().to_string(),
            "query": "SELECT id, name, score FROM items ORDER BY id",
            "id_column": "id",
        }))
        .expect("config");

        let result = enumerator.enumerate().expect("enumerate");
        assert_eq!(result.items.len(), 3);
        assert_eq!(result.items[0]["name"], "alpha");
        assert_eq!(result.items[0]["score"], 0.5);
        assert_eq!(result.items[1]["score"], Value::Null);
        assert_eq!(result.items[2]["_id"], 3);
        assert_eq!(result.metadata["columns"], json!(["id", "name", "score"]));

        let _ = fs::remove_file(path);
    }

    #[test]
    fn sqlite_url_prefix_is_accepted() {
        let path = temp_db("prefix");
        let enumerator = SqlEnumerator::from_config(&json!({
            "connection_string": format!("sqlite:///{}", path.display()),
            "query": "SELECT id FROM items",
        }))
        .expect("config");

        let result = enumerator.enumerate().expect("enumerate");
        assert_eq!(result.items.len(), 3);

        let _ = fs::remove_file(path);
    }

    #[test]
    fn non_select_queries_are_rejected() {
        let path = temp_db("readonly");
        let enumerator = SqlEnumerator::from_config(&json!({
            "connection_string": path.display().to_string(),
            "query": "DELETE FROM items",
        }))
        .expect("config");

        assert!(matches!(
            enumerator.validate(),
            Err(EnumeratorError::InvalidConfig { .. })
        ));

        let _ = fs::remove_file(path);
    }

    #[test]
    fn limit_caps_rows() {
        let path = temp_db("limit");
        let enumerator = SqlEnumerator::from_config(&json!({
            "connection_string": path.display().to_string(),
            "query": "SELECT id FROM items ORDER BY id",
            "limit": 1,
        }))
        .expect("config");

        let result = enumerator.enumerate().expect("enumerate");
        assert_eq!(result.items.len(), 1);
        assert_eq!(result.items[0]["id"], 1);

        let _ = fs::remove_file(path);
    }

    #[test]
    fn missing_database_is_invalid() {
        let enumerator = SqlEnumerator::from_config(&json!({
            "connection_string": "/no/such/database.db",
            "query": "SELECT 1",
        }))
        .expect("config");
        assert!(matches!(
            enumerator.validate(),
            Err(EnumeratorError::InvalidConfig { .. })
        ));
    }
}

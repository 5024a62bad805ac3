use std::path::PathBuf;
use std::sync::Arc;

use fanoutd::persistence::SqliteStore;

/// Shared state for the HTTP layer.
///
/// `read_only` is set by the `dashboard` subcommand: the same router
/// is mounted but every command endpoint refuses to act.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<SqliteStore>,
    pub db_path: PathBuf,
    pub read_only: bool,
}

impl ApiState {
    pub fn new(store: Arc<SqliteStore>, db_path: PathBuf, read_only: bool) -> Self {
        Self {
            store,
            db_path,
            read_only,
        }
    }
}

//! Environment-driven configuration.

use std::env;
use std::path::PathBuf;

pub const DEFAULT_MAX_WORKERS: usize = 4;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_DASHBOARD_PORT: u16 = 3847;
pub const DEFAULT_WORKER_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_STORAGE_DIR: &str = ".fanout";
pub const DEFAULT_DB_FILENAME: &str = "batch.db";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: '{value}' ({reason})")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },
    #[error("cannot resolve home directory for the default storage path")]
    NoHomeDir,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub max_workers: usize,
    pub max_retries: u32,
    pub storage_path: PathBuf,
    pub dashboard_port: u16,
    pub skip_test: bool,
    pub worker_timeout_secs: u64,
}

impl Config {
    /// Load configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from an arbitrary lookup function. Split out
    /// so tests can exercise parsing without mutating the process
    /// environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let max_workers = match lookup("MAX_WORKERS") {
            Some(raw) => parse_positive_usize("MAX_WORKERS", &raw)?,
            None => DEFAULT_MAX_WORKERS,
        };
        let max_retries = match lookup("MAX_RETRIES") {
            Some(raw) => parse_u32("MAX_RETRIES", &raw)?,
            None => DEFAULT_MAX_RETRIES,
        };
        let storage_path = match lookup("STORAGE_PATH") {
            Some(raw) if !raw.trim().is_empty() => PathBuf::from(raw),
            _ => default_storage_path(&lookup)?,
        };
        let dashboard_port = match lookup("DASHBOARD_PORT") {
            Some(raw) => parse_port("DASHBOARD_PORT", &raw)?,
            None => DEFAULT_DASHBOARD_PORT,
        };
        let skip_test = lookup("SKIP_TEST")
            .map(|raw| matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        let worker_timeout_secs = match lookup("WORKER_TIMEOUT_SECS") {
            Some(raw) => parse_positive_u64("WORKER_TIMEOUT_SECS", &raw)?,
            None => DEFAULT_WORKER_TIMEOUT_SECS,
        };

        Ok(Self {
            max_workers,
            max_retries,
            storage_path,
            dashboard_port,
            skip_test,
            worker_timeout_secs,
        })
    }
}

fn default_storage_path(
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<PathBuf, ConfigError> {
    let home = lookup("HOME").ok_or(ConfigError::NoHomeDir)?;
    Ok(PathBuf::from(home)
        .join(DEFAULT_STORAGE_DIR)
        .join(DEFAULT_DB_FILENAME))
}

fn parse_positive_usize(name: &'static str, raw: &str) -> Result<usize, ConfigError> {
    match raw.trim().parse::<usize>() {
        Ok(value) if value > 0 => Ok(value),
        Ok(_) => Err(ConfigError::InvalidValue {
            name,
            value: raw.to_string(),
            reason: "must be greater than zero".to_string(),
        }),
        Err(err) => Err(ConfigError::InvalidValue {
            name,
            value: raw.to_string(),
            reason: err.to_string(),
        }),
    }
}

fn parse_positive_u64(name: &'static str, raw: &str) -> Result<u64, ConfigError> {
    match raw.trim().parse::<u64>() {
        Ok(value) if value > 0 => Ok(value),
        Ok(_) => Err(ConfigError::InvalidValue {
            name,
            value: raw.to_string(),
            reason: "must be greater than zero".to_string(),
        }),
        Err(err) => Err(ConfigError::InvalidValue {
            name,
            value: raw.to_string(),
            reason: err.to_string(),
        }),
    }
}

fn parse_u32(name: &'static str, raw: &str) -> Result<u32, ConfigError> {
    raw.trim()
        .parse::<u32>()
        .map_err(|err| ConfigError::InvalidValue {
            name,
            value: raw.to_string(),
            reason: err.to_string(),
        })
}

fn parse_port(name: &'static str, raw: &str) -> Result<u16, ConfigError> {
    raw.trim()
        .parse::<u16>()
        .map_err(|err| ConfigError::InvalidValue {
            name,
            value: raw.to_string(),
            reason: err.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from<'a>(map: &'a HashMap<&'a str, &'a str>) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| map.get(name).map(|value| value.to_string())
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let mut map = HashMap::new();
        map.insert("HOME", "/home/alice");
        let config = Config::from_lookup(lookup_from(&map)).expect("load config");

        assert_eq!(config.max_workers, DEFAULT_MAX_WORKERS);
        assert_eq!(config.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(config.dashboard_port, DEFAULT_DASHBOARD_PORT);
        assert!(!config.skip_test);
        assert_eq!(config.worker_timeout_secs, DEFAULT_WORKER_TIMEOUT_SECS);
        assert_eq!(
            config.storage_path,
            PathBuf::from("/home/alice/.fanout/batch.db")
        );
    }

    #[test]
    fn explicit_values_override_defaults() {
        let mut map = HashMap::new();
        map.insert("MAX_WORKERS", "8");
        map.insert("MAX_RETRIES", "0");
        map.insert("STORAGE_PATH", "/tmp/custom.db");
        map.insert("DASHBOARD_PORT", "9000");
        map.insert("SKIP_TEST", "true");
        map.insert("WORKER_TIMEOUT_SECS", "120");
        let config = Config::from_lookup(lookup_from(&map)).expect("load config");

        assert_eq!(config.max_workers, 8);
        assert_eq!(config.max_retries, 0);
        assert_eq!(config.storage_path, PathBuf::from("/tmp/custom.db"));
        assert_eq!(config.dashboard_port, 9000);
        assert!(config.skip_test);
        assert_eq!(config.worker_timeout_secs, 120);
    }

    #[test]
    fn zero_workers_is_rejected() {
        let mut map = HashMap::new();
        map.insert("HOME", "/home/alice");
        map.insert("MAX_WORKERS", "0");
        let err = Config::from_lookup(lookup_from(&map)).expect_err("zero workers must fail");
        assert!(matches!(err, ConfigError::InvalidValue { name, .. } if name == "MAX_WORKERS"));
    }

    #[test]
    fn garbage_port_is_rejected() {
        let mut map = HashMap::new();
        map.insert("HOME", "/home/alice");
        map.insert("DASHBOARD_PORT", "not-a-port");
        let err = Config::from_lookup(lookup_from(&map)).expect_err("bad port must fail");
        assert!(matches!(err, ConfigError::InvalidValue { name, .. } if name == "DASHBOARD_PORT"));
    }

    #[test]
    fn missing_home_without_storage_path_is_an_error() {
        let map = HashMap::new();
        let err = Config::from_lookup(lookup_from(&map)).expect_err("no home must fail");
        assert!(matches!(err, ConfigError::NoHomeDir));
    }
}

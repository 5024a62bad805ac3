//! Core types for the fanout batch orchestrator.

pub mod config;
pub mod render;
pub mod state;
pub mod types;

pub use config::{Config, ConfigError};
pub use render::render_template;
pub use state::{JobStatus, StateMachineError, UnitStatus, WorkerState};
pub use types::{Job, JobId, LogEntry, LogLevel, Payload, UnitId, WorkUnit, WorkerId, WorkerRecord};

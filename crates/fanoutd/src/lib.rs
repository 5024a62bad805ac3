//! Batch orchestrator daemon library.
//!
//! The pieces, leaves first: [`persistence::SqliteStore`] is the only
//! shared resource; [`worker_pool::WorkerPool`] dispatches units to an
//! agent worker with bounded parallelism; [`executor::JobExecutor`] is
//! the detached supervisor that owns a running job; and
//! [`orchestrator::Orchestrator`] is the front-facing API that creates
//! jobs and spawns supervisors.

pub mod enumerators;
pub mod executor;
pub mod job_log;
pub mod orchestrator;
pub mod persistence;
pub mod prompt;
pub mod signal;
pub mod worker_pool;

pub use executor::JobExecutor;
pub use orchestrator::Orchestrator;
pub use persistence::{SqliteStore, StoreError};
pub use worker_pool::{PoolError, WorkerPool};

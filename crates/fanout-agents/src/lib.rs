//! Agent subprocess runner: launches one agent CLI process per work
//! unit, streams its line-delimited JSON events, and enforces timeouts.

pub mod adapter;
pub mod process;
pub mod runner;
pub mod stream;
pub mod testing;
pub mod types;

pub use adapter::{AgentAdapter, AgentCommand, ClaudeAdapter};
pub use runner::ClaudeCliWorker;
pub use stream::{classify_event, parse_event_line, StreamEventKind, TerminalResult};
pub use types::{ExecuteRequest, ExecutionHooks, FailureKind, UnitOutcome, UnitWorker};

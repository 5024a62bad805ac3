//! HTTP layer over the store: the read/command API consumed by the
//! dashboard and MCP tools.

pub mod error;
pub mod model;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use routes::router;
pub use state::ApiState;

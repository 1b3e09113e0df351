//! Speech relay server: browser-facing WebSocket relay, credential issuance
//! for direct provider connections, and the operational endpoints around
//! them.
pub mod channel;
pub mod config;
pub mod error;
pub mod metrics;
pub mod registry;
pub mod relay;
pub mod routes;
pub mod state;
pub mod validation;

pub use config::{ServeMode, ServerConfig};
pub use routes::build_router;
pub use state::AppState;

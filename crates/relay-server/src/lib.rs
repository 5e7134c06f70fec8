//! HTTP surface of mcp-relay: per-service SSE and streamable-HTTP proxy
//! endpoints, the admin API and the serve loop.

pub mod admin;
pub mod handlers;
pub mod rewrite;
pub mod serve;

pub use handlers::HandlerCaches;
pub use serve::{AppState, build_router, build_state, run};

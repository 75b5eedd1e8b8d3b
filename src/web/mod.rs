//! HTTP front end
//!
//! The axum router, the control API surface and the shared server state.

pub mod http_server;
pub mod shared;

pub use shared::AppState;

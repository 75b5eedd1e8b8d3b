//! Message transport layer
//!
//! Carries the asynchronous signaling channel over WebSocket.

pub mod ws_server;

pub use ws_server::handle_socket;

//! WebRTC subsystem
//!
//! This module owns the WebRTC side of the server:
//! - peer adapter over the webrtc-rs engine
//! - per-connection state with the pause gate
//! - session registry (session id and connection id directories)
//! - signaling (async WebSocket transport and sync HTTP exchange)
//! - pause/resume control plane

pub mod candidates;
pub mod connection;
pub mod control;
pub mod peer;
pub mod registry;
pub mod sdp;
pub mod signaling;

pub use connection::Connection;
pub use registry::SessionRegistry;

use std::error::Error;
use std::fmt;

/// WebRTC-related errors
#[derive(Debug)]
pub enum WebRtcError {
    /// The named stream does not exist
    StreamNotFound,
    /// SDP parse or apply failed
    OfferInvalid(String),
    /// The stream graph rejected the connection
    AddConsumerFailed(String),
    /// Control call referenced an unknown session
    SessionNotFound(String),
    /// Malformed control body
    BadRequest(String),
    /// Peer adapter failure
    EngineInternal(String),
}

impl fmt::Display for WebRtcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WebRtcError::StreamNotFound => write!(f, "stream not found"),
            WebRtcError::OfferInvalid(msg) => write!(f, "invalid offer: {}", msg),
            WebRtcError::AddConsumerFailed(msg) => write!(f, "add consumer failed: {}", msg),
            WebRtcError::SessionNotFound(id) => write!(f, "session not found: {}", id),
            WebRtcError::BadRequest(msg) => write!(f, "bad request: {}", msg),
            WebRtcError::EngineInternal(msg) => write!(f, "engine error: {}", msg),
        }
    }
}

impl Error for WebRtcError {}

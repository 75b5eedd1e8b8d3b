//! Shared server state
//!
//! One injectable bundle of the process-wide services: configuration,
//! the session registry, the stream directory and the peer factory.
//! Built once in `main` (or per test) and handed around as `Arc`.

use crate::config::Config;
use crate::streams::Streams;
use crate::webrtc::peer::PeerFactory;
use crate::webrtc::registry::SessionRegistry;
use crate::webrtc::WebRtcError;
use std::time::{Duration, Instant};

pub struct AppState {
    pub config: Config,
    pub registry: SessionRegistry,
    pub streams: Streams,
    pub peers: PeerFactory,
    started_at: Instant,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self, WebRtcError> {
        let streams = Streams::from_config(&config.streams);
        let peers = PeerFactory::new(&config.webrtc)?;
        Ok(Self {
            config,
            registry: SessionRegistry::new(),
            streams,
            peers,
            started_at: Instant::now(),
        })
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

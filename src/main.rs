//! streamgate - Main entry point
//!
//! A media streaming server whose WebRTC egress sessions can be
//! selectively suspended and resumed at any time after negotiation:
//! - offer/answer signaling over WebSocket (trickle ICE) and HTTP
//! - per-session pause gate with keyframe-primed resume
//! - HTTP control plane addressing sessions, viewers or everything

mod args;
mod config;
mod streams;
mod transport;
mod web;
mod webrtc;

use args::Args;
use clap::Parser;
use config::Config;
use log::{info, warn};
use std::sync::Arc;
use web::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let (config, load_error) = match args.load_config() {
        Ok(config) => (config, None),
        Err(e) => (Config::default(), Some(e)),
    };

    env_logger::init_from_env(env_logger::Env::default().filter_or(
        "STREAMGATE_LOG",
        if args.verbose { "debug".to_string() } else { config.logging.level.clone() },
    ));

    info!("streamgate v{}", env!("CARGO_PKG_VERSION"));
    match load_error {
        Some(e) => warn!("failed to load config: {}, using defaults", e),
        None => info!("loaded configuration from {:?}", args.config),
    }

    config.validate()?;

    let state = Arc::new(AppState::new(config)?);
    if state.streams.is_empty() {
        warn!("no streams configured");
    } else {
        info!("{} streams configured", state.streams.len());
    }

    web::http_server::run(state).await
}

//! Command line arguments

use crate::config::Config;
use clap::Parser;
use std::path::PathBuf;

/// Media streaming server with a pause/resume control plane for WebRTC
/// egress sessions.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "streamgate.toml")]
    pub config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Override the HTTP API port
    #[arg(long)]
    pub http_port: Option<u16>,
}

impl Args {
    pub fn load_config(&self) -> Result<Config, Box<dyn std::error::Error>> {
        let mut config = Config::load(&self.config)?;
        if let Some(port) = self.http_port {
            config.http.port = port;
        }
        Ok(config)
    }
}

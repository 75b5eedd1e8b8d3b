//! Configuration management for streamgate

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// HTTP API configuration
    #[serde(default)]
    pub http: HttpConfig,

    /// WebRTC configuration
    #[serde(default)]
    pub webrtc: WebRtcConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Named streams: name -> source descriptor
    #[serde(default)]
    pub streams: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// HTTP bind address
    #[serde(default = "default_http_host")]
    pub host: String,

    /// HTTP port for the API and signaling
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { host: default_http_host(), port: default_http_port() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

/// ICE server entry for NAT traversal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServerConfig {
    /// STUN/TURN server URLs (e.g. "stun:stun.l.google.com:19302")
    pub urls: Vec<String>,

    /// Username for TURN authentication
    #[serde(default)]
    pub username: Option<String>,

    /// Credential for TURN authentication
    #[serde(default)]
    pub credential: Option<String>,
}

impl Default for IceServerConfig {
    fn default() -> Self {
        Self {
            urls: vec!["stun:stun.l.google.com:19302".to_string()],
            username: None,
            credential: None,
        }
    }
}

/// Candidate rules applied to everything exposed to remotes
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FiltersConfig {
    /// Admitted networks: "udp", "tcp", optionally family scoped
    /// ("udp4", "udp6", ...)
    #[serde(default)]
    pub networks: Vec<String>,

    /// Admitted candidate addresses
    #[serde(default)]
    pub ips: Vec<String>,

    /// Ephemeral UDP port range used when no listen address is set
    #[serde(default)]
    pub udp_ports: Option<[u16; 2]>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRtcConfig {
    /// Listen address for the passive side, optionally network scoped
    /// (":8555", "0.0.0.0:8555/udp"); empty disables port pinning
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Extra host candidates to advertise ("host:port" or
    /// "tcp:host:port")
    #[serde(default)]
    pub candidates: Vec<String>,

    /// ICE servers handed to every peer unless the offer overrides them
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServerConfig>,

    /// Candidate filter rules
    #[serde(default)]
    pub filters: FiltersConfig,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            candidates: Vec::new(),
            ice_servers: default_ice_servers(),
            filters: FiltersConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file; a missing file yields the
    /// defaults.
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if !self.webrtc.listen.is_empty() {
            let (address, network) = match self.webrtc.listen.split_once('/') {
                Some((address, network)) => (address, network),
                None => (self.webrtc.listen.as_str(), "udp"),
            };
            if network != "udp" && network != "tcp" {
                return Err("WebRTC listen network must be \"udp\" or \"tcp\"".into());
            }
            let port_ok = address
                .rsplit(':')
                .next()
                .and_then(|p| p.parse::<u16>().ok())
                .is_some();
            if !address.contains(':') || !port_ok {
                return Err("WebRTC listen must be a host:port address".into());
            }
        }

        for entry in &self.webrtc.candidates {
            let rest = entry
                .strip_prefix("udp:")
                .or_else(|| entry.strip_prefix("tcp:"))
                .unwrap_or(entry);
            let port_ok = rest
                .rsplit_once(':')
                .and_then(|(host, port)| {
                    if host.is_empty() {
                        None
                    } else {
                        port.parse::<u16>().ok()
                    }
                })
                .is_some();
            if !port_ok {
                return Err(format!("Invalid WebRTC candidate entry: {}", entry).into());
            }
        }

        for server in &self.webrtc.ice_servers {
            if server.urls.is_empty() {
                return Err("ICE server entry must carry at least one URL".into());
            }
        }

        if let Some([min, max]) = self.webrtc.filters.udp_ports {
            if min == 0 || max == 0 || min > max {
                return Err("Invalid WebRTC udp_ports range".into());
            }
        }

        Ok(())
    }
}

fn default_http_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    1984
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_listen() -> String {
    ":8555".to_string()
}

fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig::default()]
}

#[cfg(test)]
mod tests {
    use super::Config;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        assert_eq!(cfg.webrtc.listen, ":8555");
        assert_eq!(cfg.webrtc.ice_servers.len(), 1);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn parses_full_document() {
        let cfg: Config = toml::from_str(
            r#"
[http]
port = 8080

[webrtc]
listen = ":8555/udp"
candidates = ["192.168.1.2:8555", "tcp:example.com:8555"]

[[webrtc.ice_servers]]
urls = ["stun:stun.example.com:3478"]

[webrtc.filters]
networks = ["udp"]

[streams]
cam1 = "rtsp://camera.local/stream"
"#,
        )
        .unwrap();
        assert_eq!(cfg.http.port, 8080);
        assert_eq!(cfg.webrtc.candidates.len(), 2);
        assert_eq!(cfg.webrtc.filters.networks, vec!["udp"]);
        assert_eq!(cfg.streams["cam1"], "rtsp://camera.local/stream");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_listen() {
        let mut cfg = Config::default();
        cfg.webrtc.listen = "8555".to_string();
        assert!(cfg.validate().is_err());

        cfg.webrtc.listen = ":8555/sctp".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_candidate() {
        let mut cfg = Config::default();
        cfg.webrtc.candidates = vec!["no-port".to_string()];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_inverted_port_range() {
        let mut cfg = Config::default();
        cfg.webrtc.filters.udp_ports = Some([60000, 50000]);
        assert!(cfg.validate().is_err());
    }
}

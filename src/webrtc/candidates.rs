//! Manual ICE candidates and the candidate filter
//!
//! The `webrtc.candidates` config entries advertise extra host candidates
//! (typically the public address of a NAT'd deployment). Entries are
//! `host:port`, optionally prefixed with a network (`tcp:host:port`).
//! `webrtc.filters` restricts which candidates, gathered or manual, are
//! exposed to remotes.

use crate::config::FiltersConfig;

const UDP_HOST_PRIORITY: u32 = 2130706431;
const TCP_HOST_PRIORITY: u32 = 1671430143;

/// A manually configured candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManualCandidate {
    pub network: String,
    pub host: String,
    pub port: u16,
}

impl ManualCandidate {
    /// Parse a config entry: `host:port` or `network:host:port`.
    pub fn parse(entry: &str) -> Option<Self> {
        let (network, rest) = match entry.split_once(':') {
            Some(("udp", rest)) => ("udp", rest),
            Some(("tcp", rest)) => ("tcp", rest),
            _ => ("udp", entry),
        };
        let (host, port) = rest.rsplit_once(':')?;
        let port: u16 = port.parse().ok()?;
        if host.is_empty() {
            return None;
        }
        Some(Self { network: network.to_string(), host: host.to_string(), port })
    }

    /// Render as an SDP candidate attribute value (no `a=` prefix).
    pub fn to_line(&self, foundation: usize) -> String {
        if self.network == "tcp" {
            format!(
                "candidate:{} 1 tcp {} {} {} typ host tcptype passive",
                foundation, TCP_HOST_PRIORITY, self.host, self.port
            )
        } else {
            format!(
                "candidate:{} 1 udp {} {} {} typ host",
                foundation, UDP_HOST_PRIORITY, self.host, self.port
            )
        }
    }
}

/// Render every parseable config entry as a candidate line.
pub fn candidate_lines(entries: &[String]) -> Vec<String> {
    entries
        .iter()
        .filter_map(|e| ManualCandidate::parse(e))
        .enumerate()
        .map(|(i, c)| c.to_line(i + 1))
        .collect()
}

/// Decide whether a candidate may be exposed to the remote.
///
/// `candidate` is the attribute value form (`candidate:... 1 udp ...`).
/// An empty filter set admits everything; a malformed candidate is
/// always rejected once a rule exists.
pub fn filter_candidate(filters: &FiltersConfig, candidate: &str) -> bool {
    if filters.networks.is_empty() && filters.ips.is_empty() {
        return true;
    }

    let fields: Vec<&str> = candidate.split_whitespace().collect();
    if fields.len() < 6 {
        return false;
    }
    let proto = fields[2].to_ascii_lowercase();
    let addr = fields[4];
    let is_v6 = addr.contains(':');

    if !filters.networks.is_empty() {
        let admitted = filters.networks.iter().any(|rule| match rule.as_str() {
            "udp4" => proto == "udp" && !is_v6,
            "udp6" => proto == "udp" && is_v6,
            "tcp4" => proto == "tcp" && !is_v6,
            "tcp6" => proto == "tcp" && is_v6,
            other => proto == other,
        });
        if !admitted {
            return false;
        }
    }

    if !filters.ips.is_empty() && !filters.ips.iter().any(|ip| ip == addr) {
        return false;
    }

    true
}

//! Network-related types shared across crates

use crate::error::{CommonError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Transport protocol of a relay rule, socket or firewall rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkProtocol {
    Tcp,
    Udp,
}

impl NetworkProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkProtocol::Tcp => "tcp",
            NetworkProtocol::Udp => "udp",
        }
    }
}

impl std::fmt::Display for NetworkProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NetworkProtocol {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "tcp" => Ok(NetworkProtocol::Tcp),
            "udp" => Ok(NetworkProtocol::Udp),
            other => Err(CommonError::validation(format!(
                "Unknown protocol '{}', expected tcp or udp",
                other
            ))),
        }
    }
}

/// Port range for network services
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    /// Create a new port range
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// Create a single port range
    pub fn single(port: u16) -> Self {
        Self { start: port, end: port }
    }

    /// Check if a port is within this range
    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }

    /// Get the number of ports in this range
    pub fn count(&self) -> usize {
        if self.end < self.start {
            0
        } else {
            (self.end - self.start) as usize + 1
        }
    }
}

/// Ports requested by a scan: a contiguous range or an explicit set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortSelection {
    Range(PortRange),
    List(Vec<u16>),
}

impl PortSelection {
    /// Expand into a sorted, deduplicated list of ports.
    ///
    /// Port 0 and inverted or empty selections are rejected.
    pub fn expand(&self) -> Result<Vec<u16>> {
        let ports: Vec<u16> = match self {
            PortSelection::Range(range) => {
                if range.start == 0 || range.end == 0 {
                    return Err(CommonError::validation("Port numbers must be within 1-65535"));
                }
                if range.start > range.end {
                    return Err(CommonError::validation(format!(
                        "Invalid port range {}-{}: start is greater than end",
                        range.start, range.end
                    )));
                }
                (range.start..=range.end).collect()
            }
            PortSelection::List(list) => {
                if list.iter().any(|&p| p == 0) {
                    return Err(CommonError::validation("Port numbers must be within 1-65535"));
                }
                list.iter().copied().collect::<BTreeSet<u16>>().into_iter().collect()
            }
        };

        if ports.is_empty() {
            return Err(CommonError::validation("Port selection is empty"));
        }
        Ok(ports)
    }
}

impl From<PortRange> for PortSelection {
    fn from(range: PortRange) -> Self {
        PortSelection::Range(range)
    }
}

impl From<Vec<u16>> for PortSelection {
    fn from(list: Vec<u16>) -> Self {
        PortSelection::List(list)
    }
}

/// Firewall action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FirewallAction {
    Allow,
    Deny,
}

impl FirewallAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            FirewallAction::Allow => "allow",
            FirewallAction::Deny => "deny",
        }
    }
}

/// Firewall rule for a single (port, protocol) pair as read from the OS
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirewallRule {
    pub port: u16,
    pub protocol: NetworkProtocol,
    pub action: FirewallAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl FirewallRule {
    pub fn allow(port: u16, protocol: NetworkProtocol) -> Self {
        Self {
            port,
            protocol,
            action: FirewallAction::Allow,
            source: None,
        }
    }
}

/// Locally bound listening socket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListeningSocket {
    pub port: u16,
    pub protocol: NetworkProtocol,
    pub address: String,
    pub process: Option<String>,
    pub pid: Option<u32>,
}

/// Established connection on a local port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub protocol: NetworkProtocol,
    pub local_addr: String,
    pub local_port: u16,
    pub remote_addr: String,
    pub remote_port: u16,
    pub state: String,
}

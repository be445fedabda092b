//! Forward rule definitions and input validation

use crate::error::{ForwardError, Result};
use crate::stats::StatsSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use vpn_types::{HostValidator, NetworkProtocol};

pub const MAX_CONNECTIONS_LIMIT: u32 = 10_000;
const MAX_NAME_LEN: usize = 64;
const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    Stopped,
    Running,
    Error,
}

impl RuleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleStatus::Stopped => "stopped",
            RuleStatus::Running => "running",
            RuleStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for RuleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A forwarding rule as stored and as reported to callers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardRule {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub protocol: NetworkProtocol,
    pub listen_address: String,
    pub listen_port: u16,
    pub target_address: String,
    pub target_port: u16,
    /// Started automatically when the service starts
    pub enabled: bool,
    pub max_connections: u32,
    /// Bytes per second per connection, 0 = unlimited
    pub upload_limit: u64,
    pub download_limit: u64,
    /// Traffic of all finished runs
    #[serde(default)]
    pub total_upload: u64,
    #[serde(default)]
    pub total_download: u64,
    pub status: RuleStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub stats: StatsSnapshot,
}

impl ForwardRule {
    pub fn listen_ip(&self) -> Result<IpAddr> {
        parse_listen_address(&self.listen_address)
    }

    pub fn listen_endpoint(&self) -> String {
        match self.listen_ip() {
            Ok(IpAddr::V6(ip)) => format!("[{}]:{}", ip, self.listen_port),
            _ => format!("{}:{}", self.listen_address, self.listen_port),
        }
    }

    pub fn target_endpoint(&self) -> String {
        if self.target_address.contains(':') && !self.target_address.starts_with('[') {
            format!("[{}]:{}", self.target_address, self.target_port)
        } else {
            format!("{}:{}", self.target_address, self.target_port)
        }
    }

    /// Whether both rules would need the same listening socket.
    ///
    /// An unspecified address (`0.0.0.0`, `::`) overlaps every address of
    /// the same family, since the OS refuses the second bind.
    pub fn listens_like(&self, other: &ForwardRule) -> bool {
        if self.protocol != other.protocol || self.listen_port != other.listen_port {
            return false;
        }
        match (self.listen_ip(), other.listen_ip()) {
            (Ok(a), Ok(b)) => {
                a == b || (a.is_ipv4() == b.is_ipv4() && (a.is_unspecified() || b.is_unspecified()))
            }
            _ => self.listen_address == other.listen_address,
        }
    }
}

/// Input for creating a rule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRule {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub protocol: NetworkProtocol,
    #[serde(default)]
    pub listen_address: Option<String>,
    pub listen_port: u16,
    pub target_address: String,
    pub target_port: u16,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub max_connections: Option<u32>,
    #[serde(default)]
    pub upload_limit: Option<u64>,
    #[serde(default)]
    pub download_limit: Option<u64>,
}

impl CreateRule {
    pub fn tcp(listen_port: u16, target_address: impl Into<String>, target_port: u16) -> Self {
        Self::new(NetworkProtocol::Tcp, listen_port, target_address, target_port)
    }

    pub fn udp(listen_port: u16, target_address: impl Into<String>, target_port: u16) -> Self {
        Self::new(NetworkProtocol::Udp, listen_port, target_address, target_port)
    }

    pub fn new(
        protocol: NetworkProtocol,
        listen_port: u16,
        target_address: impl Into<String>,
        target_port: u16,
    ) -> Self {
        Self {
            name: None,
            description: None,
            protocol,
            listen_address: None,
            listen_port,
            target_address: target_address.into(),
            target_port,
            enabled: None,
            max_connections: None,
            upload_limit: None,
            download_limit: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_listen_address(mut self, address: impl Into<String>) -> Self {
        self.listen_address = Some(address.into());
        self
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = Some(max);
        self
    }

    pub fn with_limits(mut self, upload: u64, download: u64) -> Self {
        self.upload_limit = Some(upload);
        self.download_limit = Some(download);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    /// Validate and turn into a stopped rule
    pub(crate) fn into_rule(self, id: u64, default_max_connections: u32) -> Result<ForwardRule> {
        let now = Utc::now();
        let name = match self.name.map(|n| n.trim().to_string()) {
            Some(n) if !n.is_empty() => n,
            _ => format!("{}-{}", self.protocol, self.listen_port),
        };

        let rule = ForwardRule {
            id,
            name,
            description: self.description.unwrap_or_default(),
            protocol: self.protocol,
            listen_address: self
                .listen_address
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty())
                .unwrap_or_else(|| DEFAULT_LISTEN_ADDRESS.to_string()),
            listen_port: self.listen_port,
            target_address: self.target_address.trim().to_string(),
            target_port: self.target_port,
            enabled: self.enabled.unwrap_or(true),
            max_connections: self.max_connections.unwrap_or(default_max_connections),
            upload_limit: self.upload_limit.unwrap_or(0),
            download_limit: self.download_limit.unwrap_or(0),
            total_upload: 0,
            total_download: 0,
            status: RuleStatus::Stopped,
            last_error: None,
            created_at: now,
            updated_at: now,
            stats: StatsSnapshot::default(),
        };
        validate_rule(&rule)?;
        Ok(rule)
    }
}

/// Partial update; only permitted while the rule is not running
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRule {
    pub name: Option<String>,
    pub description: Option<String>,
    pub protocol: Option<NetworkProtocol>,
    pub listen_address: Option<String>,
    pub listen_port: Option<u16>,
    pub target_address: Option<String>,
    pub target_port: Option<u16>,
    pub enabled: Option<bool>,
    pub max_connections: Option<u32>,
    pub upload_limit: Option<u64>,
    pub download_limit: Option<u64>,
}

impl UpdateRule {
    /// Apply to a copy of `rule` and validate the result
    pub(crate) fn apply(self, rule: &ForwardRule) -> Result<ForwardRule> {
        let mut updated = rule.clone();
        if let Some(name) = self.name {
            updated.name = name.trim().to_string();
        }
        if let Some(description) = self.description {
            updated.description = description;
        }
        if let Some(protocol) = self.protocol {
            updated.protocol = protocol;
        }
        if let Some(address) = self.listen_address {
            updated.listen_address = address.trim().to_string();
        }
        if let Some(port) = self.listen_port {
            updated.listen_port = port;
        }
        if let Some(address) = self.target_address {
            updated.target_address = address.trim().to_string();
        }
        if let Some(port) = self.target_port {
            updated.target_port = port;
        }
        if let Some(enabled) = self.enabled {
            updated.enabled = enabled;
        }
        if let Some(max) = self.max_connections {
            updated.max_connections = max;
        }
        if let Some(limit) = self.upload_limit {
            updated.upload_limit = limit;
        }
        if let Some(limit) = self.download_limit {
            updated.download_limit = limit;
        }
        updated.updated_at = Utc::now();

        validate_rule(&updated)?;
        Ok(updated)
    }
}

/// List filter; all set fields must match
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleFilter {
    pub protocol: Option<NetworkProtocol>,
    pub status: Option<RuleStatus>,
    /// Case-insensitive substring of the rule name
    pub name: Option<String>,
}

impl RuleFilter {
    pub fn matches(&self, rule: &ForwardRule) -> bool {
        if let Some(protocol) = self.protocol {
            if rule.protocol != protocol {
                return false;
            }
        }
        if let Some(status) = self.status {
            if rule.status != status {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if !rule.name.to_lowercase().contains(&name.to_lowercase()) {
                return false;
            }
        }
        true
    }
}

fn parse_listen_address(address: &str) -> Result<IpAddr> {
    HostValidator::validate_listen_address(address)
        .map_err(|_| ForwardError::validation(format!("Invalid listen address '{}'", address)))
}

pub(crate) fn validate_rule(rule: &ForwardRule) -> Result<()> {
    if rule.name.is_empty() || rule.name.chars().count() > MAX_NAME_LEN {
        return Err(ForwardError::validation(format!(
            "Name must be 1-{} characters",
            MAX_NAME_LEN
        )));
    }
    if rule.listen_port == 0 {
        return Err(ForwardError::validation("Listen port must be within 1-65535"));
    }
    if rule.target_port == 0 {
        return Err(ForwardError::validation("Target port must be within 1-65535"));
    }
    parse_listen_address(&rule.listen_address)?;
    HostValidator
        .validate(&rule.target_address)
        .map_err(|_| {
            ForwardError::validation(format!("Invalid target address '{}'", rule.target_address))
        })?;
    if rule.max_connections == 0 || rule.max_connections > MAX_CONNECTIONS_LIMIT {
        return Err(ForwardError::validation(format!(
            "maxConnections must be within 1-{}",
            MAX_CONNECTIONS_LIMIT
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(protocol: NetworkProtocol, address: &str, port: u16) -> ForwardRule {
        CreateRule::new(protocol, port, "10.0.0.5", 22)
            .with_listen_address(address)
            .into_rule(1, 1000)
            .unwrap()
    }

    #[test]
    fn test_defaults_applied() {
        let rule = CreateRule::tcp(9000, "10.0.0.5", 22).into_rule(3, 1000).unwrap();
        assert_eq!(rule.name, "tcp-9000");
        assert_eq!(rule.listen_address, "0.0.0.0");
        assert_eq!(rule.max_connections, 1000);
        assert!(rule.enabled);
        assert_eq!(rule.status, RuleStatus::Stopped);
        assert_eq!(rule.target_endpoint(), "10.0.0.5:22");
    }

    #[test]
    fn test_invalid_input_rejected() {
        assert!(CreateRule::tcp(0, "10.0.0.5", 22).into_rule(1, 1000).is_err());
        assert!(CreateRule::tcp(9000, "10.0.0.5", 0).into_rule(1, 1000).is_err());
        assert!(CreateRule::tcp(9000, "bad host", 22).into_rule(1, 1000).is_err());
        assert!(CreateRule::tcp(9000, "10.0.0.5", 22)
            .with_listen_address("example.com")
            .into_rule(1, 1000)
            .is_err());
        assert!(CreateRule::tcp(9000, "10.0.0.5", 22)
            .with_max_connections(10_001)
            .into_rule(1, 1000)
            .is_err());
    }

    #[test]
    fn test_listen_overlap() {
        let any = rule(NetworkProtocol::Tcp, "0.0.0.0", 9000);
        let local = rule(NetworkProtocol::Tcp, "127.0.0.1", 9000);
        let other_port = rule(NetworkProtocol::Tcp, "127.0.0.1", 9001);
        let udp = rule(NetworkProtocol::Udp, "0.0.0.0", 9000);
        let v6 = rule(NetworkProtocol::Tcp, "::1", 9000);

        assert!(any.listens_like(&local));
        assert!(local.listens_like(&any));
        assert!(!local.listens_like(&other_port));
        assert!(!any.listens_like(&udp));
        assert!(!any.listens_like(&v6));
    }

    #[test]
    fn test_update_applies_and_validates() {
        let base = CreateRule::tcp(9000, "10.0.0.5", 22).into_rule(1, 1000).unwrap();

        let updated = UpdateRule {
            target_port: Some(2222),
            name: Some("ssh".into()),
            ..Default::default()
        }
        .apply(&base)
        .unwrap();
        assert_eq!(updated.target_port, 2222);
        assert_eq!(updated.name, "ssh");

        let invalid = UpdateRule {
            listen_port: Some(0),
            ..Default::default()
        };
        assert!(invalid.apply(&base).is_err());
    }

    #[test]
    fn test_filter() {
        let mut r = CreateRule::udp(53, "1.1.1.1", 53)
            .with_name("DNS relay")
            .into_rule(1, 1000)
            .unwrap();
        r.status = RuleStatus::Running;

        assert!(RuleFilter::default().matches(&r));
        assert!(RuleFilter {
            name: Some("dns".into()),
            ..Default::default()
        }
        .matches(&r));
        assert!(!RuleFilter {
            protocol: Some(NetworkProtocol::Tcp),
            ..Default::default()
        }
        .matches(&r));
        assert!(!RuleFilter {
            status: Some(RuleStatus::Stopped),
            ..Default::default()
        }
        .matches(&r));
    }

    #[test]
    fn test_v6_endpoints_are_bracketed() {
        let r = CreateRule::tcp(9000, "fd00::5", 22)
            .with_listen_address("::")
            .into_rule(1, 1000)
            .unwrap();
        assert_eq!(r.listen_endpoint(), "[::]:9000");
        assert_eq!(r.target_endpoint(), "[fd00::5]:22");
    }
}

//! Interface settings and supervisor runtime settings

use crate::error::{Result, WireGuardError};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use vpn_crypto::KeyPair;
use vpn_types::{CidrValidator, DnsValidator, HostValidator, InterfaceNameValidator, PortValidator};

pub const MIN_MTU: u16 = 1280;
pub const MAX_MTU: u16 = 1500;

/// Settings of the single tunnel interface, as persisted
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceConfig {
    pub name: String,
    pub listen_port: u16,
    pub private_key: String,
    pub public_key: String,
    /// Server address with prefix, e.g. `10.66.66.1/24`
    pub address: String,
    /// Comma-separated resolvers pushed to clients
    pub dns: String,
    pub mtu: u16,
    /// Public host clients dial; empty until configured
    #[serde(default)]
    pub endpoint_address: String,
    pub persistent_keepalive: u16,
    pub client_allowed_ips: String,
    #[serde(default)]
    pub auto_start: bool,
}

impl std::fmt::Debug for InterfaceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterfaceConfig")
            .field("name", &self.name)
            .field("listen_port", &self.listen_port)
            .field("private_key", &"<redacted>")
            .field("public_key", &self.public_key)
            .field("address", &self.address)
            .field("dns", &self.dns)
            .field("mtu", &self.mtu)
            .field("endpoint_address", &self.endpoint_address)
            .finish()
    }
}

impl InterfaceConfig {
    /// Defaults for a fresh install with the given server keys
    pub fn with_keys(name: impl Into<String>, listen_port: u16, keys: &KeyPair) -> Self {
        Self {
            name: name.into(),
            listen_port,
            private_key: keys.private_key_base64(),
            public_key: keys.public_key_base64(),
            address: "10.66.66.1/24".to_string(),
            dns: "223.5.5.5".to_string(),
            mtu: 1420,
            endpoint_address: String::new(),
            persistent_keepalive: 25,
            client_allowed_ips: "0.0.0.0/0, ::/0".to_string(),
            auto_start: false,
        }
    }

    pub fn network(&self) -> Result<IpNetwork> {
        Ok(CidrValidator::validate(&self.address)?)
    }

    pub fn validate(&self) -> Result<()> {
        InterfaceNameValidator.validate(&self.name)?;
        PortValidator::validate(self.listen_port)?;
        self.network()?;
        DnsValidator::validate(&self.dns)?;
        CidrValidator::validate_list(&self.client_allowed_ips)?;
        if !(MIN_MTU..=MAX_MTU).contains(&self.mtu) {
            return Err(WireGuardError::validation(format!(
                "MTU must be within {}-{}",
                MIN_MTU, MAX_MTU
            )));
        }
        if !self.endpoint_address.is_empty() {
            HostValidator.validate(&self.endpoint_address)?;
        }
        Ok(())
    }

    /// `host:port` clients dial
    pub fn endpoint(&self) -> Option<String> {
        if self.endpoint_address.is_empty() {
            return None;
        }
        if self.endpoint_address.contains(':') {
            Some(format!("[{}]:{}", self.endpoint_address, self.listen_port))
        } else {
            Some(format!("{}:{}", self.endpoint_address, self.listen_port))
        }
    }

    pub fn view(&self, restart_required: bool) -> InterfaceView {
        InterfaceView {
            name: self.name.clone(),
            listen_port: self.listen_port,
            public_key: self.public_key.clone(),
            address: self.address.clone(),
            dns: self.dns.clone(),
            mtu: self.mtu,
            endpoint_address: self.endpoint_address.clone(),
            persistent_keepalive: self.persistent_keepalive,
            client_allowed_ips: self.client_allowed_ips.clone(),
            auto_start: self.auto_start,
            restart_required,
        }
    }
}

/// Interface settings as exposed to callers; never carries the private key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceView {
    pub name: String,
    pub listen_port: u16,
    pub public_key: String,
    pub address: String,
    pub dns: String,
    pub mtu: u16,
    pub endpoint_address: String,
    pub persistent_keepalive: u16,
    pub client_allowed_ips: String,
    pub auto_start: bool,
    /// Settings changed while the interface was up
    pub restart_required: bool,
}

/// Partial replacement of interface settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateInterface {
    pub listen_port: Option<u16>,
    pub address: Option<String>,
    pub dns: Option<String>,
    pub mtu: Option<u16>,
    pub endpoint_address: Option<String>,
    pub persistent_keepalive: Option<u16>,
    pub client_allowed_ips: Option<String>,
    pub auto_start: Option<bool>,
}

impl UpdateInterface {
    pub(crate) fn apply(self, current: &InterfaceConfig) -> Result<InterfaceConfig> {
        let mut updated = current.clone();
        if let Some(port) = self.listen_port {
            updated.listen_port = port;
        }
        if let Some(address) = self.address {
            updated.address = address.trim().to_string();
        }
        if let Some(dns) = self.dns {
            updated.dns = dns.trim().to_string();
        }
        if let Some(mtu) = self.mtu {
            updated.mtu = mtu;
        }
        if let Some(endpoint) = self.endpoint_address {
            updated.endpoint_address = endpoint.trim().to_string();
        }
        if let Some(keepalive) = self.persistent_keepalive {
            updated.persistent_keepalive = keepalive;
        }
        if let Some(allowed) = self.client_allowed_ips {
            updated.client_allowed_ips = allowed.trim().to_string();
        }
        if let Some(auto_start) = self.auto_start {
            updated.auto_start = auto_start;
        }
        updated.validate()?;
        Ok(updated)
    }
}

/// Runtime settings of the supervisor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Interface created on first start
    pub interface_name: String,
    pub default_listen_port: u16,
    /// Where `<interface>.conf` is written
    pub config_dir: PathBuf,
    pub wg_binary: String,
    pub wg_quick_binary: String,
    /// Handshake refresh period while up
    pub poll_interval_secs: u64,
    pub confirm_interval_ms: u64,
    pub confirm_attempts: u32,
    /// A peer with a handshake newer than this is online
    pub online_window_secs: u64,
    /// Size of the in-memory connection log
    pub log_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            interface_name: "wg0".to_string(),
            default_listen_port: 51820,
            config_dir: PathBuf::from("/etc/wireguard"),
            wg_binary: "wg".to_string(),
            wg_quick_binary: "wg-quick".to_string(),
            poll_interval_secs: 10,
            confirm_interval_ms: 200,
            confirm_attempts: 10,
            online_window_secs: 180,
            log_capacity: 1000,
        }
    }
}

impl SupervisorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn confirm_interval(&self) -> Duration {
        Duration::from_millis(self.confirm_interval_ms)
    }

    pub fn online_window(&self) -> Duration {
        Duration::from_secs(self.online_window_secs)
    }

    pub fn config_path(&self, interface: &str) -> PathBuf {
        self.config_dir.join(format!("{}.conf", interface))
    }
}

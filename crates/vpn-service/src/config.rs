use crate::auth::AuthConfig;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use vpn_forward::ForwardConfig;
use vpn_network::ScannerConfig;
use vpn_wireguard::SupervisorConfig;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/vpn-netd/config.toml";

/// Daemon configuration, one TOML section per component
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub storage: StorageConfig,
    pub forward: ForwardConfig,
    pub wireguard: SupervisorConfig,
    pub scanner: ScannerConfig,
    pub sockets: SocketsConfig,
    pub firewall: FirewallConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding `forward_rules.json` and `wireguard.json`
    pub state_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/vpn-netd"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketsConfig {
    pub ss_binary: String,
}

impl Default for SocketsConfig {
    fn default() -> Self {
        Self {
            ss_binary: "ss".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewallConfig {
    pub iptables_binary: String,
    pub chain: String,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            iptables_binary: "iptables".to_string(),
            chain: "INPUT".to_string(),
        }
    }
}

impl ServiceConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join("config.toml");

        let config = ServiceConfig::default();
        config.save_to_file(&path).unwrap();

        let loaded = ServiceConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.wireguard.interface_name, "wg0");
        assert_eq!(loaded.forward.connect_timeout_ms, config.forward.connect_timeout_ms);
        assert_eq!(loaded.firewall.chain, "INPUT");
        assert!(loaded.auth.require_authorization);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[storage]\nstate_dir = \"/tmp/netd\"\n\n[wireguard]\npoll_interval_secs = 30\n",
        )
        .unwrap();

        let loaded = ServiceConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.storage.state_dir, PathBuf::from("/tmp/netd"));
        assert_eq!(loaded.wireguard.poll_interval_secs, 30);
        assert_eq!(loaded.wireguard.default_listen_port, 51820);
        assert_eq!(loaded.scanner.default_timeout_ms, 200);
    }

    #[test]
    fn test_malformed_file_is_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[forward\n").unwrap();

        let err = ServiceConfig::load_from_file(&path).unwrap_err();
        assert_eq!(err.kind(), vpn_types::ErrorKind::Validation);
    }
}

//! The tunnel itself is run by the kernel module and configured through the
//! `wg`/`wg-quick` tools; [`TunnelBackend`] is the seam the supervisor drives.

use crate::command::{self, stderr_of};
use crate::error::{Result, WireGuardError};
use crate::peer::PeerSpec;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::path::Path;
use tracing::{debug, info};

/// Live state of one peer as reported by `wg show <iface> dump`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDump {
    pub public_key: String,
    pub endpoint: Option<String>,
    pub allowed_ips: Vec<String>,
    pub last_handshake: Option<DateTime<Utc>>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

#[async_trait]
pub trait TunnelBackend: Send + Sync {
    /// Fails with `ToolUnavailable` when the tooling is not installed
    async fn check_available(&self) -> Result<()>;

    async fn interface_exists(&self, interface: &str) -> Result<bool>;

    async fn bring_up(&self, config_path: &Path) -> Result<()>;

    async fn bring_down(&self, config_path: &Path) -> Result<()>;

    /// Add or replace a peer on the running interface.
    ///
    /// Settings absent from `peer` are cleared on the interface.
    async fn set_peer(&self, interface: &str, peer: &PeerSpec) -> Result<()>;

    async fn remove_peer(&self, interface: &str, public_key: &str) -> Result<()>;

    async fn dump(&self, interface: &str) -> Result<Vec<PeerDump>>;
}

/// Backend shelling out to `wg` and `wg-quick`
#[derive(Debug, Clone)]
pub struct WgQuickBackend {
    wg: String,
    wg_quick: String,
}

impl Default for WgQuickBackend {
    fn default() -> Self {
        Self::new("wg", "wg-quick")
    }
}

impl WgQuickBackend {
    pub fn new(wg: impl Into<String>, wg_quick: impl Into<String>) -> Self {
        Self {
            wg: wg.into(),
            wg_quick: wg_quick.into(),
        }
    }
}

#[async_trait]
impl TunnelBackend for WgQuickBackend {
    async fn check_available(&self) -> Result<()> {
        let output = command::run(&self.wg, &["--version"]).await?;
        if !output.status.success() {
            return Err(WireGuardError::ToolUnavailable(format!(
                "{} --version failed: {}",
                self.wg,
                stderr_of(&output)
            )));
        }
        // wg-quick has no version flag; `-h` exits non-zero but proves it runs
        command::run(&self.wg_quick, &["-h"]).await?;
        Ok(())
    }

    async fn interface_exists(&self, interface: &str) -> Result<bool> {
        let output = command::run(&self.wg, &["show", interface]).await?;
        if output.status.success() {
            return Ok(true);
        }
        let stderr = stderr_of(&output).to_lowercase();
        if stderr.contains("operation not permitted") || stderr.contains("permission denied") {
            return Err(WireGuardError::PermissionDenied(stderr));
        }
        Ok(false)
    }

    async fn bring_up(&self, config_path: &Path) -> Result<()> {
        let path = config_path.to_string_lossy();
        let output = command::run(&self.wg_quick, &["up", path.as_ref()]).await?;
        if !output.status.success() {
            return Err(command::failure(&output, WireGuardError::Start));
        }
        info!(config = %path, "wg-quick up completed");
        Ok(())
    }

    async fn bring_down(&self, config_path: &Path) -> Result<()> {
        let path = config_path.to_string_lossy();
        let output = command::run(&self.wg_quick, &["down", path.as_ref()]).await?;
        if !output.status.success() {
            return Err(command::failure(&output, WireGuardError::Stop));
        }
        info!(config = %path, "wg-quick down completed");
        Ok(())
    }

    async fn set_peer(&self, interface: &str, peer: &PeerSpec) -> Result<()> {
        let allowed_ips = peer.allowed_ips.join(",");
        let keepalive = peer
            .persistent_keepalive
            .map_or_else(|| "off".to_string(), |k| k.to_string());

        let mut args = vec![
            "set",
            interface,
            "peer",
            peer.public_key.as_str(),
            "allowed-ips",
            allowed_ips.as_str(),
        ];
        if let Some(endpoint) = &peer.endpoint {
            args.extend(["endpoint", endpoint.as_str()]);
        }
        args.extend(["persistent-keepalive", keepalive.as_str()]);

        let output = match &peer.preshared_key {
            Some(psk) => {
                args.extend(["preshared-key", "/dev/stdin"]);
                command::run_with_stdin(&self.wg, &args, psk).await?
            }
            // An empty key file removes the preshared key
            None => {
                args.extend(["preshared-key", "/dev/null"]);
                command::run(&self.wg, &args).await?
            }
        };

        if !output.status.success() {
            return Err(command::failure(&output, WireGuardError::Sync));
        }
        debug!(interface, peer = %peer.public_key, "peer applied");
        Ok(())
    }

    async fn remove_peer(&self, interface: &str, public_key: &str) -> Result<()> {
        let output =
            command::run(&self.wg, &["set", interface, "peer", public_key, "remove"]).await?;
        if !output.status.success() {
            return Err(command::failure(&output, WireGuardError::Sync));
        }
        debug!(interface, peer = %public_key, "peer removed");
        Ok(())
    }

    async fn dump(&self, interface: &str) -> Result<Vec<PeerDump>> {
        let output = command::run(&self.wg, &["show", interface, "dump"]).await?;
        if !output.status.success() {
            return Err(command::failure(&output, WireGuardError::CommandError));
        }
        Ok(parse_dump(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parse `wg show <iface> dump`.
///
/// The first line describes the interface (4 fields) and is skipped; each
/// peer line has 8 tab-separated fields.
pub fn parse_dump(output: &str) -> Vec<PeerDump> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() != 8 {
                return None;
            }

            let endpoint = match fields[2] {
                "(none)" | "" => None,
                e => Some(e.to_string()),
            };
            let allowed_ips = match fields[3] {
                "(none)" | "" => Vec::new(),
                ips => ips.split(',').map(|s| s.trim().to_string()).collect(),
            };
            let last_handshake = fields[4]
                .parse::<i64>()
                .ok()
                .filter(|secs| *secs > 0)
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single());

            Some(PeerDump {
                public_key: fields[0].to_string(),
                endpoint,
                allowed_ips,
                last_handshake,
                rx_bytes: fields[5].parse().unwrap_or(0),
                tx_bytes: fields[6].parse().unwrap_or(0),
            })
        })
        .collect()
}

/// Write a configuration file readable by the owner only
pub async fn write_config(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    tokio::io::AsyncWriteExt::write_all(&mut file, contents.as_bytes()).await?;
    tokio::io::AsyncWriteExt::flush(&mut file).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }

    debug!(path = %path.display(), "tunnel config written");
    Ok(())
}

use crate::command;
use crate::error::{NetworkError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use vpn_types::{FirewallAction, FirewallRule, NetworkProtocol, PortValidator};

/// Protocol selector accepted by open/close requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FirewallProtocol {
    #[default]
    Tcp,
    Udp,
    Both,
}

impl FirewallProtocol {
    pub fn expand(&self) -> Vec<NetworkProtocol> {
        match self {
            FirewallProtocol::Tcp => vec![NetworkProtocol::Tcp],
            FirewallProtocol::Udp => vec![NetworkProtocol::Udp],
            FirewallProtocol::Both => vec![NetworkProtocol::Tcp, NetworkProtocol::Udp],
        }
    }
}

impl std::str::FromStr for FirewallProtocol {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "tcp" => Ok(FirewallProtocol::Tcp),
            "udp" => Ok(FirewallProtocol::Udp),
            "both" => Ok(FirewallProtocol::Both),
            other => Err(NetworkError::validation(format!(
                "Protocol must be tcp, udp or both, got '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirewallRequest {
    pub port: u16,
    #[serde(default)]
    pub protocol: FirewallProtocol,
}

impl FirewallRequest {
    pub fn new(port: u16, protocol: FirewallProtocol) -> Self {
        Self { port, protocol }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirewallStatus {
    pub enabled: bool,
    pub rules: Vec<FirewallRule>,
}

/// OS firewall operations used by [`FirewallManager`]
#[async_trait]
pub trait FirewallBackend: Send + Sync {
    /// Whether the firewall tool can be used at all
    async fn is_enabled(&self) -> bool;

    async fn list_rules(&self) -> Result<Vec<FirewallRule>>;

    async fn has_allow(&self, port: u16, protocol: NetworkProtocol) -> Result<bool>;

    async fn insert_allow(&self, port: u16, protocol: NetworkProtocol) -> Result<()>;

    async fn delete_allow(&self, port: u16, protocol: NetworkProtocol) -> Result<()>;
}

/// Manages `-j ACCEPT` rules in one iptables chain
#[derive(Debug, Clone)]
pub struct IptablesBackend {
    binary: String,
    chain: String,
}

impl Default for IptablesBackend {
    fn default() -> Self {
        Self::new("iptables", "INPUT")
    }
}

impl IptablesBackend {
    pub fn new(binary: impl Into<String>, chain: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            chain: chain.into(),
        }
    }

    fn rule_args<'a>(&'a self, op: &'a str, port: &'a str, protocol: NetworkProtocol) -> Vec<&'a str> {
        vec![
            "-w",
            op,
            self.chain.as_str(),
            "-p",
            protocol.as_str(),
            "--dport",
            port,
            "-j",
            "ACCEPT",
        ]
    }

    async fn mutate(&self, op: &str, port: u16, protocol: NetworkProtocol) -> Result<()> {
        let port_str = port.to_string();
        let output = command::run(&self.binary, &self.rule_args(op, &port_str, protocol)).await?;
        if output.status.success() {
            return Ok(());
        }
        Err(classify_failure(output.status.code(), &command::stderr_of(&output)))
    }
}

/// Map a failed iptables invocation onto an error
fn classify_failure(code: Option<i32>, stderr: &str) -> NetworkError {
    let lowered = stderr.to_lowercase();
    if code == Some(4)
        || lowered.contains("permission denied")
        || lowered.contains("you must be root")
        || lowered.contains("operation not permitted")
    {
        NetworkError::PermissionDenied(stderr.to_string())
    } else {
        NetworkError::FirewallError(format!(
            "iptables exited with {}: {}",
            code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()),
            stderr
        ))
    }
}

#[async_trait]
impl FirewallBackend for IptablesBackend {
    async fn is_enabled(&self) -> bool {
        match command::run(&self.binary, &["-w", "-S", self.chain.as_str()]).await {
            Ok(output) => output.status.success(),
            Err(e) => {
                debug!(error = %e, "iptables not usable");
                false
            }
        }
    }

    async fn list_rules(&self) -> Result<Vec<FirewallRule>> {
        let output = command::run(&self.binary, &["-w", "-S", self.chain.as_str()]).await?;
        if !output.status.success() {
            return Err(classify_failure(output.status.code(), &command::stderr_of(&output)));
        }
        Ok(parse_iptables_rules(
            &String::from_utf8_lossy(&output.stdout),
            &self.chain,
        ))
    }

    async fn has_allow(&self, port: u16, protocol: NetworkProtocol) -> Result<bool> {
        let port_str = port.to_string();
        let output = command::run(&self.binary, &self.rule_args("-C", &port_str, protocol)).await?;
        match output.status.code() {
            Some(0) => Ok(true),
            // `-C` exits 1 when no matching rule exists
            Some(1) => Ok(false),
            code => Err(classify_failure(code, &command::stderr_of(&output))),
        }
    }

    async fn insert_allow(&self, port: u16, protocol: NetworkProtocol) -> Result<()> {
        self.mutate("-I", port, protocol).await
    }

    async fn delete_allow(&self, port: u16, protocol: NetworkProtocol) -> Result<()> {
        self.mutate("-D", port, protocol).await
    }
}

/// Parse `iptables -S <chain>` output into per-port rules.
///
/// Rules without a single `--dport`, or with targets other than
/// ACCEPT/DROP/REJECT, are skipped.
pub fn parse_iptables_rules(output: &str, chain: &str) -> Vec<FirewallRule> {
    output
        .lines()
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() < 2 || tokens[0] != "-A" || tokens[1] != chain {
                return None;
            }

            let value_of = |flag: &str| {
                tokens
                    .iter()
                    .position(|t| *t == flag)
                    .and_then(|i| tokens.get(i + 1).copied())
            };

            let protocol = value_of("-p")?.parse::<NetworkProtocol>().ok()?;
            let port = value_of("--dport")?.parse::<u16>().ok()?;
            let action = match value_of("-j")? {
                "ACCEPT" => FirewallAction::Allow,
                "DROP" | "REJECT" => FirewallAction::Deny,
                _ => return None,
            };
            let source = value_of("-s").map(str::to_string);

            Some(FirewallRule {
                port,
                protocol,
                action,
                source,
            })
        })
        .collect()
}

type RuleKey = (u16, NetworkProtocol);

/// Opens and closes firewall ports.
///
/// Mutations on the same (port, protocol) key are serialized through a
/// per-key lock, so concurrent open/close calls apply in lock order and the
/// last one wins.
pub struct FirewallManager {
    backend: Arc<dyn FirewallBackend>,
    locks: DashMap<RuleKey, Arc<Mutex<()>>>,
}

impl FirewallManager {
    pub fn new(backend: Arc<dyn FirewallBackend>) -> Self {
        Self {
            backend,
            locks: DashMap::new(),
        }
    }

    pub fn iptables() -> Self {
        Self::new(Arc::new(IptablesBackend::default()))
    }

    fn lock_for(&self, key: RuleKey) -> Arc<Mutex<()>> {
        self.locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Current rules as read from the OS, never cached
    pub async fn rules(&self) -> Result<Vec<FirewallRule>> {
        self.backend.list_rules().await
    }

    pub async fn status(&self) -> Result<FirewallStatus> {
        if !self.backend.is_enabled().await {
            return Ok(FirewallStatus {
                enabled: false,
                rules: Vec::new(),
            });
        }
        Ok(FirewallStatus {
            enabled: true,
            rules: self.backend.list_rules().await?,
        })
    }

    /// Ensure an allow rule exists for every protocol in the request
    pub async fn open(&self, request: &FirewallRequest) -> Result<Vec<FirewallRule>> {
        PortValidator::validate(request.port)?;

        let mut applied = Vec::new();
        for protocol in request.protocol.expand() {
            let lock = self.lock_for((request.port, protocol));
            let _guard = lock.lock().await;

            if self.backend.has_allow(request.port, protocol).await? {
                debug!(port = request.port, %protocol, "allow rule already present");
            } else {
                self.backend.insert_allow(request.port, protocol).await?;
                info!(port = request.port, %protocol, "firewall port opened");
            }
            applied.push(FirewallRule::allow(request.port, protocol));
        }
        Ok(applied)
    }

    /// Remove every allow rule for the requested port and protocols
    pub async fn close(&self, request: &FirewallRequest) -> Result<Vec<FirewallRule>> {
        PortValidator::validate(request.port)?;

        // Bound on duplicate rules removed per call
        const MAX_DELETES: usize = 32;

        let mut removed = Vec::new();
        for protocol in request.protocol.expand() {
            let lock = self.lock_for((request.port, protocol));
            let _guard = lock.lock().await;

            let mut deleted = 0;
            while deleted < MAX_DELETES && self.backend.has_allow(request.port, protocol).await? {
                self.backend.delete_allow(request.port, protocol).await?;
                deleted += 1;
            }
            if deleted == MAX_DELETES {
                warn!(port = request.port, %protocol, "stopped removing duplicate allow rules");
            }

            if deleted > 0 {
                info!(port = request.port, %protocol, deleted, "firewall port closed");
            } else {
                debug!(port = request.port, %protocol, "no allow rule to remove");
            }
            removed.push(FirewallRule::allow(request.port, protocol));
        }
        Ok(removed)
    }
}

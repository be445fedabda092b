//! The [`NetworkService`] façade.
//!
//! Composes the forwarding engine, the tunnel supervisor, the port scanner
//! and the firewall manager behind one operation surface. Mutating
//! operations take a [`Caller`]; read-only ones do not.

use crate::auth::{AuthConfig, Caller};
use crate::config::ServiceConfig;
use crate::error::{Result, ServiceError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};
use vpn_forward::{CreateRule, ForwardManager, ForwardRule, RuleFilter, StatsSnapshot, UpdateRule};
use vpn_network::{
    FirewallBackend, FirewallManager, FirewallRequest, FirewallStatus, IptablesBackend, PortCheck,
    PortScanResult, PortScanner, ScanRequest, SocketInspector,
};
use vpn_types::{ConnectionInfo, FirewallRule, JsonFileStore, ListeningSocket, StateStore};
use vpn_wireguard::{
    ConnectionLog, CreatePeer, InterfaceStatus, InterfaceView, PeerInfo, TunnelBackend,
    TunnelState, UpdateInterface, UpdatePeer, WgQuickBackend, WireGuardError, WireGuardPeer,
    WireGuardSupervisor,
};

/// Counts shown on the dashboard landing page
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Overview {
    pub forward_rules: usize,
    pub running_rules: usize,
    pub active_connections: u64,
    pub tunnel_state: TunnelState,
    pub peer_count: usize,
}

pub struct NetworkService {
    auth: AuthConfig,
    forward: ForwardManager,
    wireguard: WireGuardSupervisor,
    scanner: PortScanner,
    firewall: FirewallManager,
}

impl NetworkService {
    /// Build the service on the OS tooling named in `config`
    pub async fn new(config: ServiceConfig) -> Result<Self> {
        let store: Arc<dyn StateStore> = Arc::new(JsonFileStore::new(&config.storage.state_dir)?);
        let tunnel: Arc<dyn TunnelBackend> = Arc::new(WgQuickBackend::new(
            config.wireguard.wg_binary.clone(),
            config.wireguard.wg_quick_binary.clone(),
        ));
        let firewall: Arc<dyn FirewallBackend> = Arc::new(IptablesBackend::new(
            config.firewall.iptables_binary.clone(),
            config.firewall.chain.clone(),
        ));
        Self::with_backends(config, store, tunnel, firewall).await
    }

    /// Build the service on explicit backends.
    ///
    /// Fails when the tunnel tooling is missing; that is not recoverable at
    /// runtime.
    pub async fn with_backends(
        config: ServiceConfig,
        store: Arc<dyn StateStore>,
        tunnel: Arc<dyn TunnelBackend>,
        firewall: Arc<dyn FirewallBackend>,
    ) -> Result<Self> {
        if let Err(e) = tunnel.check_available().await {
            error!(error = %e, "WireGuard tooling unavailable");
            return Err(match e {
                WireGuardError::ToolUnavailable(_) => e.into(),
                other => WireGuardError::ToolUnavailable(other.to_string()).into(),
            });
        }

        let forward = ForwardManager::new(config.forward.clone(), store.clone()).await?;
        let wireguard = WireGuardSupervisor::new(config.wireguard.clone(), tunnel, store).await?;
        let scanner = PortScanner::new(config.scanner.clone())
            .with_inspector(SocketInspector::new(config.sockets.ss_binary.clone()));

        Ok(Self {
            auth: config.auth,
            forward,
            wireguard,
            scanner,
            firewall: FirewallManager::new(firewall),
        })
    }

    /// Restart previously running rules and auto-start the tunnel
    pub async fn init(&self) {
        self.forward.restore().await;
        self.wireguard.init().await;
    }

    /// Stop every rule and the tunnel
    pub async fn shutdown(&self) {
        info!("Shutting down network service");
        self.forward.shutdown().await;
        self.wireguard.shutdown().await;
    }

    fn authorize(&self, caller: &Caller, action: &str) -> Result<()> {
        if caller.is_authorized() || !self.auth.require_authorization {
            return Ok(());
        }
        warn!(action, "Rejected anonymous caller");
        Err(ServiceError::Unauthorized(format!(
            "{} requires an authorized caller",
            action
        )))
    }

    pub async fn overview(&self) -> Overview {
        Overview {
            forward_rules: self.forward.rule_count().await,
            running_rules: self.forward.running_count().await,
            active_connections: self.forward.total_active_connections().await,
            tunnel_state: self.wireguard.state(),
            peer_count: self.wireguard.peer_count().await,
        }
    }

    // Forward

    pub async fn forward_list(&self, filter: &RuleFilter) -> Vec<ForwardRule> {
        self.forward.list(filter).await
    }

    pub async fn forward_get(&self, id: u64) -> Result<ForwardRule> {
        Ok(self.forward.get(id).await?)
    }

    pub async fn forward_create(&self, caller: &Caller, request: CreateRule) -> Result<ForwardRule> {
        self.authorize(caller, "forward.create")?;
        let rule = self.forward.create(request).await?;
        info!(rule_id = rule.id, by = caller.subject(), "Forward rule created");
        Ok(rule)
    }

    pub async fn forward_update(
        &self,
        caller: &Caller,
        id: u64,
        changes: UpdateRule,
    ) -> Result<ForwardRule> {
        self.authorize(caller, "forward.update")?;
        Ok(self.forward.update(id, changes).await?)
    }

    pub async fn forward_delete(&self, caller: &Caller, id: u64) -> Result<()> {
        self.authorize(caller, "forward.delete")?;
        self.forward.delete(id).await?;
        info!(rule_id = id, by = caller.subject(), "Forward rule deleted");
        Ok(())
    }

    pub async fn forward_start(&self, caller: &Caller, id: u64) -> Result<ForwardRule> {
        self.authorize(caller, "forward.start")?;
        Ok(self.forward.start(id).await?)
    }

    pub async fn forward_stop(&self, caller: &Caller, id: u64) -> Result<ForwardRule> {
        self.authorize(caller, "forward.stop")?;
        Ok(self.forward.stop(id).await?)
    }

    pub async fn forward_restart(&self, caller: &Caller, id: u64) -> Result<ForwardRule> {
        self.authorize(caller, "forward.restart")?;
        Ok(self.forward.restart(id).await?)
    }

    pub async fn forward_stats(&self, id: u64) -> Result<StatsSnapshot> {
        Ok(self.forward.stats(id).await?)
    }

    /// Prometheus text exposition of the relay metrics
    pub fn forward_metrics(&self) -> Result<String> {
        Ok(self.forward.metrics_text()?)
    }

    // WireGuard

    pub async fn wireguard_status(&self) -> Result<InterfaceStatus> {
        Ok(self.wireguard.status().await?)
    }

    pub async fn wireguard_start(&self, caller: &Caller) -> Result<InterfaceStatus> {
        self.authorize(caller, "wireguard.start")?;
        Ok(self.wireguard.start().await?)
    }

    pub async fn wireguard_stop(&self, caller: &Caller) -> Result<InterfaceStatus> {
        self.authorize(caller, "wireguard.stop")?;
        Ok(self.wireguard.stop().await?)
    }

    pub async fn wireguard_restart(&self, caller: &Caller) -> Result<InterfaceStatus> {
        self.authorize(caller, "wireguard.restart")?;
        Ok(self.wireguard.restart().await?)
    }

    pub async fn wireguard_config(&self) -> InterfaceView {
        self.wireguard.config().await
    }

    pub async fn wireguard_update_config(
        &self,
        caller: &Caller,
        changes: UpdateInterface,
    ) -> Result<InterfaceView> {
        self.authorize(caller, "wireguard.update_config")?;
        Ok(self.wireguard.update_config(changes).await?)
    }

    pub async fn wireguard_peers(&self) -> Vec<PeerInfo> {
        self.wireguard.peers().await
    }

    pub async fn wireguard_create_peer(
        &self,
        caller: &Caller,
        request: CreatePeer,
    ) -> Result<WireGuardPeer> {
        self.authorize(caller, "wireguard.create_peer")?;
        Ok(self.wireguard.create_peer(request).await?)
    }

    pub async fn wireguard_update_peer(
        &self,
        caller: &Caller,
        id: u64,
        changes: UpdatePeer,
    ) -> Result<WireGuardPeer> {
        self.authorize(caller, "wireguard.update_peer")?;
        Ok(self.wireguard.update_peer(id, changes).await?)
    }

    pub async fn wireguard_delete_peer(&self, caller: &Caller, id: u64) -> Result<()> {
        self.authorize(caller, "wireguard.delete_peer")?;
        Ok(self.wireguard.delete_peer(id).await?)
    }

    pub async fn wireguard_peer_config(&self, id: u64) -> Result<String> {
        Ok(self.wireguard.peer_config(id).await?)
    }

    pub async fn wireguard_peer_qrcode(&self, id: u64) -> Result<String> {
        Ok(self.wireguard.peer_qrcode(id).await?)
    }

    pub async fn wireguard_connection_logs(
        &self,
        peer_id: Option<u64>,
        limit: usize,
    ) -> Vec<ConnectionLog> {
        self.wireguard.connection_logs(peer_id, limit).await
    }

    // Ports

    pub async fn port_scan(&self, request: &ScanRequest) -> Result<Vec<PortScanResult>> {
        Ok(self.scanner.scan(request).await?)
    }

    pub async fn port_check(&self, port: u16) -> Result<PortCheck> {
        Ok(self.scanner.check(port).await?)
    }

    pub async fn port_listen(&self) -> Result<Vec<ListeningSocket>> {
        Ok(self.scanner.listen().await?)
    }

    pub async fn port_connections(&self, port: u16) -> Result<Vec<ConnectionInfo>> {
        Ok(self.scanner.connections(port).await?)
    }

    // Firewall

    pub async fn firewall_rules(&self) -> Result<Vec<FirewallRule>> {
        Ok(self.firewall.rules().await?)
    }

    pub async fn firewall_status(&self) -> Result<FirewallStatus> {
        Ok(self.firewall.status().await?)
    }

    pub async fn firewall_open(
        &self,
        caller: &Caller,
        request: &FirewallRequest,
    ) -> Result<Vec<FirewallRule>> {
        self.authorize(caller, "firewall.open")?;
        Ok(self.firewall.open(request).await?)
    }

    pub async fn firewall_close(
        &self,
        caller: &Caller,
        request: &FirewallRequest,
    ) -> Result<Vec<FirewallRule>> {
        self.authorize(caller, "firewall.close")?;
        Ok(self.firewall.close(request).await?)
    }
}

//! Lifecycle and peer management of the tunnel interface
//!
//! Lifecycle operations (start, stop, restart) and peer mutations are
//! serialized by the lifecycle lock. The interface settings and the peer
//! table sit behind a second lock that read paths take only briefly.

use crate::backend::{write_config, TunnelBackend};
use crate::config::{InterfaceConfig, InterfaceView, SupervisorConfig, UpdateInterface};
use crate::error::{Result, WireGuardError};
use crate::ipam;
use crate::monitor::{ConnectionLog, HandshakeMonitor, PeerLabel};
use crate::peer::{parse_allowed_ips, CreatePeer, PeerInfo, UpdatePeer, WireGuardPeer};
use crate::render::{render_client_config, render_server_config};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use vpn_crypto::{QrCodeGenerator, X25519KeyManager};
use vpn_types::{load_json, save_json, StateStore};

/// Store key of the interface and its peers
pub const STORE_KEY: &str = "wireguard";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelState {
    Down,
    Starting,
    Up,
    Stopping,
    Error,
}

impl TunnelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelState::Down => "down",
            TunnelState::Starting => "starting",
            TunnelState::Up => "up",
            TunnelState::Stopping => "stopping",
            TunnelState::Error => "error",
        }
    }
}

impl std::fmt::Display for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
struct StateInfo {
    state: TunnelState,
    last_error: Option<String>,
}

/// Interface state with per-peer live data
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceStatus {
    pub state: TunnelState,
    pub interface: String,
    pub listen_port: u16,
    pub public_key: String,
    pub address: String,
    pub peer_count: usize,
    pub online_peers: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub peers: Vec<PeerInfo>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedTunnel {
    interface: InterfaceConfig,
    next_peer_id: u64,
    peers: Vec<WireGuardPeer>,
}

struct PeerTable {
    interface: InterfaceConfig,
    restart_required: bool,
    next_id: u64,
    peers: BTreeMap<u64, WireGuardPeer>,
}

impl PeerTable {
    fn persisted(&self) -> PersistedTunnel {
        PersistedTunnel {
            interface: self.interface.clone(),
            next_peer_id: self.next_id,
            peers: self.peers.values().cloned().collect(),
        }
    }

    fn labels(&self) -> Vec<PeerLabel> {
        self.peers
            .values()
            .map(|p| PeerLabel {
                id: p.id,
                name: p.name.clone(),
                public_key: p.public_key.clone(),
            })
            .collect()
    }

    fn get(&self, id: u64) -> Result<&WireGuardPeer> {
        self.peers.get(&id).ok_or(WireGuardError::PeerNotFound(id))
    }
}

/// State reachable from the handshake poller
struct Shared {
    backend: Arc<dyn TunnelBackend>,
    monitor: HandshakeMonitor,
    table: Mutex<PeerTable>,
}

impl Shared {
    async fn refresh(&self, interface: &str) -> Result<()> {
        let dump = self.backend.dump(interface).await?;
        let labels = self.table.lock().await.labels();
        self.monitor.observe(dump, &labels).await;
        Ok(())
    }
}

struct PollerHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Lifecycle {
    poller: Option<PollerHandle>,
    /// Interface name the running tunnel was started with
    running_interface: Option<String>,
}

pub struct WireGuardSupervisor {
    settings: SupervisorConfig,
    store: Arc<dyn StateStore>,
    shared: Arc<Shared>,
    lifecycle: Mutex<Lifecycle>,
    state: watch::Sender<StateInfo>,
}

impl WireGuardSupervisor {
    /// Load the stored interface and peers, or create a fresh interface with
    /// a new server key pair
    pub async fn new(
        settings: SupervisorConfig,
        backend: Arc<dyn TunnelBackend>,
        store: Arc<dyn StateStore>,
    ) -> Result<Self> {
        let persisted: Option<PersistedTunnel> = load_json(store.as_ref(), STORE_KEY).await?;

        let table = match persisted {
            Some(p) => {
                let mut peers = BTreeMap::new();
                let mut next_id = p.next_peer_id;
                for peer in p.peers {
                    next_id = next_id.max(peer.id);
                    peers.insert(peer.id, peer);
                }
                info!(interface = %p.interface.name, peers = peers.len(), "WireGuard state loaded");
                PeerTable {
                    interface: p.interface,
                    restart_required: false,
                    next_id,
                    peers,
                }
            }
            None => {
                let keys = X25519KeyManager::new().generate_keypair()?;
                let interface = InterfaceConfig::with_keys(
                    settings.interface_name.clone(),
                    settings.default_listen_port,
                    &keys,
                );
                info!(interface = %interface.name, "Generated WireGuard server key pair");
                let table = PeerTable {
                    interface,
                    restart_required: false,
                    next_id: 0,
                    peers: BTreeMap::new(),
                };
                save_json(store.as_ref(), STORE_KEY, &table.persisted()).await?;
                table
            }
        };

        let monitor = HandshakeMonitor::new(settings.online_window(), settings.log_capacity);
        let (state, _) = watch::channel(StateInfo {
            state: TunnelState::Down,
            last_error: None,
        });

        Ok(Self {
            settings,
            store,
            shared: Arc::new(Shared {
                backend,
                monitor,
                table: Mutex::new(table),
            }),
            lifecycle: Mutex::new(Lifecycle::default()),
            state,
        })
    }

    /// Start the interface if configured to; a failure is logged only
    pub async fn init(&self) {
        let auto_start = self.shared.table.lock().await.interface.auto_start;
        if !auto_start {
            info!("WireGuard auto start disabled");
            return;
        }
        match self.start().await {
            Ok(_) => info!("WireGuard started automatically"),
            Err(e) => error!(error = %e, "WireGuard auto start failed"),
        }
    }

    pub fn state(&self) -> TunnelState {
        self.state.borrow().state
    }

    fn set_state(&self, state: TunnelState, last_error: Option<String>) {
        self.state.send_replace(StateInfo { state, last_error });
    }

    async fn persist(&self, table: &PeerTable) -> Result<()> {
        save_json(self.store.as_ref(), STORE_KEY, &table.persisted()).await?;
        Ok(())
    }

    pub async fn start(&self) -> Result<InterfaceStatus> {
        let mut lifecycle = self.lifecycle.lock().await;
        if self.state() == TunnelState::Up {
            return Err(WireGuardError::AlreadyRunning);
        }
        self.start_locked(&mut lifecycle).await?;
        drop(lifecycle);
        self.status().await
    }

    pub async fn stop(&self) -> Result<InterfaceStatus> {
        let mut lifecycle = self.lifecycle.lock().await;
        self.stop_locked(&mut lifecycle).await?;
        drop(lifecycle);
        self.status().await
    }

    /// Stop then start as one operation; a failed start leaves `error`
    pub async fn restart(&self) -> Result<InterfaceStatus> {
        let mut lifecycle = self.lifecycle.lock().await;
        if let Err(e) = self.stop_locked(&mut lifecycle).await {
            self.set_state(TunnelState::Error, Some(e.to_string()));
            return Err(e);
        }
        self.start_locked(&mut lifecycle).await?;
        drop(lifecycle);
        self.status().await
    }

    async fn start_locked(&self, lifecycle: &mut Lifecycle) -> Result<()> {
        self.set_state(TunnelState::Starting, None);

        match self.bring_up().await {
            Ok(interface) => {
                let token = CancellationToken::new();
                let handle = tokio::spawn(poll_handshakes(
                    self.shared.clone(),
                    interface.clone(),
                    self.settings.poll_interval(),
                    token.clone(),
                ));
                lifecycle.poller = Some(PollerHandle { token, handle });
                lifecycle.running_interface = Some(interface.clone());

                self.shared.table.lock().await.restart_required = false;
                if let Err(e) = self.shared.refresh(&interface).await {
                    warn!(error = %e, "Initial peer refresh failed");
                }
                self.set_state(TunnelState::Up, None);
                info!(interface = %interface, "WireGuard interface up");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "WireGuard start failed");
                self.set_state(TunnelState::Error, Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Write the config, run the bring-up tool and wait for the interface
    async fn bring_up(&self) -> Result<String> {
        let backend = &self.shared.backend;
        backend.check_available().await?;

        let (interface, config) = {
            let table = self.shared.table.lock().await;
            table.interface.validate()?;
            (
                table.interface.name.clone(),
                render_server_config(&table.interface, table.peers.values()),
            )
        };

        if backend.interface_exists(&interface).await? {
            return Err(WireGuardError::Start(format!(
                "interface {} already exists",
                interface
            )));
        }

        let path = self.settings.config_path(&interface);
        write_config(&path, &config).await?;
        backend.bring_up(&path).await.map_err(|e| match e {
            WireGuardError::Start(_) | WireGuardError::PermissionDenied(_) => e,
            other => WireGuardError::Start(other.to_string()),
        })?;

        for _ in 0..self.settings.confirm_attempts.max(1) {
            if backend.interface_exists(&interface).await.unwrap_or(false) {
                return Ok(interface);
            }
            tokio::time::sleep(self.settings.confirm_interval()).await;
        }

        if let Err(e) = backend.bring_down(&path).await {
            warn!(error = %e, "Cleanup after failed start did not succeed");
        }
        Err(WireGuardError::Start(format!(
            "interface {} did not come up",
            interface
        )))
    }

    async fn stop_locked(&self, lifecycle: &mut Lifecycle) -> Result<()> {
        let current = self.state();
        if current == TunnelState::Down {
            return Ok(());
        }

        self.set_state(TunnelState::Stopping, None);
        if let Some(poller) = lifecycle.poller.take() {
            poller.token.cancel();
            let _ = poller.handle.await;
        }

        let interface = match lifecycle.running_interface.take() {
            Some(name) => name,
            None => self.shared.table.lock().await.interface.name.clone(),
        };
        let path = self.settings.config_path(&interface);
        let backend = &self.shared.backend;

        let exists = backend.interface_exists(&interface).await.unwrap_or(true);
        if exists {
            if let Err(e) = backend.bring_down(&path).await {
                error!(error = %e, "WireGuard stop failed");
                self.set_state(TunnelState::Error, Some(e.to_string()));
                return Err(e);
            }
        }

        let mut gone = false;
        for _ in 0..self.settings.confirm_attempts.max(1) {
            if !backend.interface_exists(&interface).await.unwrap_or(true) {
                gone = true;
                break;
            }
            tokio::time::sleep(self.settings.confirm_interval()).await;
        }
        if !gone {
            let e = WireGuardError::Stop(format!("interface {} is still present", interface));
            self.set_state(TunnelState::Error, Some(e.to_string()));
            return Err(e);
        }

        let labels = self.shared.table.lock().await.labels();
        self.shared.monitor.clear(&labels).await;
        self.set_state(TunnelState::Down, None);
        info!(interface = %interface, "WireGuard interface down");
        Ok(())
    }

    /// Current state and peers; live counters are refreshed when up
    pub async fn status(&self) -> Result<InterfaceStatus> {
        let info = self.state.borrow().clone();
        if info.state == TunnelState::Up {
            let interface = self.shared.table.lock().await.interface.name.clone();
            if let Err(e) = self.shared.refresh(&interface).await {
                warn!(error = %e, "Peer refresh failed, using cached data");
            }
        }

        let peers = self.peer_infos(info.state == TunnelState::Up).await;
        let table = self.shared.table.lock().await;
        Ok(InterfaceStatus {
            state: info.state,
            interface: table.interface.name.clone(),
            listen_port: table.interface.listen_port,
            public_key: table.interface.public_key.clone(),
            address: table.interface.address.clone(),
            peer_count: peers.len(),
            online_peers: peers.iter().filter(|p| p.online).count(),
            last_error: info.last_error,
            peers,
        })
    }

    async fn peer_infos(&self, up: bool) -> Vec<PeerInfo> {
        let live = if up {
            self.shared.monitor.live().await
        } else {
            Default::default()
        };
        let now = Utc::now();
        let table = self.shared.table.lock().await;

        table
            .peers
            .values()
            .rev()
            .map(|peer| {
                let mut info = PeerInfo::offline(peer);
                if let Some(dump) = live.get(&peer.public_key) {
                    info.endpoint = dump.endpoint.clone().or(info.endpoint);
                    info.last_handshake = dump.last_handshake;
                    info.handshake_age = dump
                        .last_handshake
                        .and_then(|at| now.signed_duration_since(at).to_std().ok())
                        .map(|age| age.as_secs());
                    info.rx_bytes = Some(dump.rx_bytes);
                    info.tx_bytes = Some(dump.tx_bytes);
                    info.online = self.shared.monitor.is_online(dump.last_handshake, now);
                }
                info
            })
            .collect()
    }

    /// Peers, newest first
    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peer_infos(self.state() == TunnelState::Up).await
    }

    pub async fn peer(&self, id: u64) -> Result<WireGuardPeer> {
        Ok(self.shared.table.lock().await.get(id)?.clone())
    }

    pub async fn config(&self) -> InterfaceView {
        let table = self.shared.table.lock().await;
        table.interface.view(table.restart_required)
    }

    /// Replace interface settings; a running tunnel keeps its old settings
    /// until restarted
    pub async fn update_config(&self, changes: UpdateInterface) -> Result<InterfaceView> {
        let _lifecycle = self.lifecycle.lock().await;
        let mut table = self.shared.table.lock().await;
        let updated = changes.apply(&table.interface)?;

        let previous = std::mem::replace(&mut table.interface, updated);
        let previous_flag = table.restart_required;
        if self.state() == TunnelState::Up {
            table.restart_required = true;
        }

        if let Err(e) = self.persist(&table).await {
            table.interface = previous;
            table.restart_required = previous_flag;
            return Err(e);
        }

        if table.restart_required {
            info!("WireGuard config updated, restart required to apply");
        } else {
            info!("WireGuard config updated");
        }
        Ok(table.interface.view(table.restart_required))
    }

    /// Add a peer; pushed to the running tunnel before being committed
    pub async fn create_peer(&self, request: CreatePeer) -> Result<WireGuardPeer> {
        let _lifecycle = self.lifecycle.lock().await;
        let mut table = self.shared.table.lock().await;

        let public_key = request.public_key.trim().to_string();
        if let Some(existing) = table.peers.values().find(|p| p.public_key == public_key) {
            return Err(WireGuardError::Conflict(format!(
                "public key already used by peer {} ({})",
                existing.id, existing.name
            )));
        }

        let allowed_ips = match request.allowed_ips.as_deref().map(str::trim) {
            Some(list) if !list.is_empty() => parse_allowed_ips(list)?,
            _ => vec![ipam::allocate(
                &table.interface.address,
                table
                    .peers
                    .values()
                    .flat_map(|p| p.allowed_ips.iter().map(String::as_str)),
            )?],
        };

        let id = table.next_id + 1;
        let peer = request.into_peer(id, allowed_ips)?;
        let interface = table.interface.name.clone();
        let live = self.state() == TunnelState::Up && peer.enabled;

        if live {
            self.shared
                .backend
                .set_peer(&interface, &peer.spec(table.interface.persistent_keepalive))
                .await
                .map_err(into_sync)?;
        }

        table.peers.insert(id, peer.clone());
        let previous_next_id = table.next_id;
        table.next_id = id;

        if let Err(e) = self.persist(&table).await {
            table.peers.remove(&id);
            table.next_id = previous_next_id;
            if live {
                let _ = self.shared.backend.remove_peer(&interface, &peer.public_key).await;
            }
            return Err(e);
        }

        info!(peer_id = id, name = %peer.name, allowed_ips = %peer.allowed_ips_joined(), "Peer created");
        Ok(peer)
    }

    pub async fn update_peer(&self, id: u64, changes: UpdatePeer) -> Result<WireGuardPeer> {
        let _lifecycle = self.lifecycle.lock().await;
        let mut table = self.shared.table.lock().await;
        let current = table.get(id)?.clone();
        let updated = changes.apply(&current)?;

        let interface = table.interface.name.clone();
        let keepalive = table.interface.persistent_keepalive;
        let up = self.state() == TunnelState::Up;

        if up {
            self.push_change(&interface, keepalive, &current, &updated)
                .await
                .map_err(into_sync)?;
        }

        table.peers.insert(id, updated.clone());
        if let Err(e) = self.persist(&table).await {
            table.peers.insert(id, current.clone());
            if up {
                let _ = self.push_change(&interface, keepalive, &updated, &current).await;
            }
            return Err(e);
        }

        info!(peer_id = id, enabled = updated.enabled, "Peer updated");
        Ok(updated)
    }

    /// Bring the live tunnel from `from` to `to` for one peer
    async fn push_change(
        &self,
        interface: &str,
        keepalive: u16,
        from: &WireGuardPeer,
        to: &WireGuardPeer,
    ) -> Result<()> {
        let backend = &self.shared.backend;
        match (from.enabled, to.enabled) {
            (_, true) => backend.set_peer(interface, &to.spec(keepalive)).await,
            (true, false) => backend.remove_peer(interface, &from.public_key).await,
            (false, false) => Ok(()),
        }
    }

    pub async fn delete_peer(&self, id: u64) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let mut table = self.shared.table.lock().await;
        let peer = table.get(id)?.clone();
        let interface = table.interface.name.clone();
        let keepalive = table.interface.persistent_keepalive;
        let live = self.state() == TunnelState::Up && peer.enabled;

        if live {
            self.shared
                .backend
                .remove_peer(&interface, &peer.public_key)
                .await
                .map_err(into_sync)?;
        }

        table.peers.remove(&id);
        if let Err(e) = self.persist(&table).await {
            table.peers.insert(id, peer.clone());
            if live {
                let _ = self
                    .shared
                    .backend
                    .set_peer(&interface, &peer.spec(keepalive))
                    .await;
            }
            return Err(e);
        }

        info!(peer_id = id, name = %peer.name, "Peer deleted");
        Ok(())
    }

    /// Client configuration text for one peer
    pub async fn peer_config(&self, id: u64) -> Result<String> {
        let table = self.shared.table.lock().await;
        let peer = table.get(id)?;
        render_client_config(&table.interface, peer)
    }

    /// `data:image/png;base64,...` QR code of [`Self::peer_config`]
    pub async fn peer_qrcode(&self, id: u64) -> Result<String> {
        let config = self.peer_config(id).await?;
        Ok(QrCodeGenerator::new().generate_data_url(&config)?)
    }

    pub async fn connection_logs(&self, peer_id: Option<u64>, limit: usize) -> Vec<ConnectionLog> {
        self.shared.monitor.logs(peer_id, limit).await
    }

    pub async fn peer_count(&self) -> usize {
        self.shared.table.lock().await.peers.len()
    }

    /// Stop the tunnel on service exit
    pub async fn shutdown(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if let Err(e) = self.stop_locked(&mut lifecycle).await {
            warn!(error = %e, "WireGuard stop on shutdown failed");
        }
    }
}

/// Any rejected live push is a sync failure
fn into_sync(e: WireGuardError) -> WireGuardError {
    match e {
        WireGuardError::Sync(_) | WireGuardError::PermissionDenied(_) => e,
        other => WireGuardError::Sync(other.to_string()),
    }
}

async fn poll_handshakes(
    shared: Arc<Shared>,
    interface: String,
    period: std::time::Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if let Err(e) = shared.refresh(&interface).await {
            warn!(interface = %interface, error = %e, "Handshake refresh failed");
        }
    }
}

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use vpn_crypto::X25519KeyManager;
use vpn_types::{ErrorKind, MemoryStore, StateStore};
use vpn_wireguard::{
    parse_config, CreatePeer, PeerDump, PeerSpec, Result, SupervisorConfig, TunnelBackend,
    TunnelState, UpdateInterface, UpdatePeer, WireGuardError, WireGuardSupervisor,
};

/// In-memory tunnel; the interface "exists" between bring_up and bring_down
#[derive(Default)]
struct FakeTunnel {
    up: AtomicBool,
    missing_tool: AtomicBool,
    never_appears: AtomicBool,
    reject_peers: AtomicBool,
    bring_ups: AtomicUsize,
    peers: Mutex<HashMap<String, PeerSpec>>,
    last_config: Mutex<Option<String>>,
}

#[async_trait]
impl TunnelBackend for FakeTunnel {
    async fn check_available(&self) -> Result<()> {
        if self.missing_tool.load(Ordering::SeqCst) {
            return Err(WireGuardError::ToolUnavailable("wg".into()));
        }
        Ok(())
    }

    async fn interface_exists(&self, _interface: &str) -> Result<bool> {
        Ok(self.up.load(Ordering::SeqCst))
    }

    async fn bring_up(&self, config_path: &Path) -> Result<()> {
        self.bring_ups.fetch_add(1, Ordering::SeqCst);
        let text = tokio::fs::read_to_string(config_path).await?;
        let parsed = parse_config(&text)?;

        let mut peers = self.peers.lock().await;
        peers.clear();
        for section in parsed.peers {
            let public_key = section.get("PublicKey").unwrap_or_default().to_string();
            peers.insert(
                public_key.clone(),
                PeerSpec {
                    public_key,
                    preshared_key: section.get("PresharedKey").map(str::to_string),
                    allowed_ips: section.list("AllowedIPs"),
                    endpoint: section.get("Endpoint").map(str::to_string),
                    persistent_keepalive: None,
                },
            );
        }
        *self.last_config.lock().await = Some(text);

        if !self.never_appears.load(Ordering::SeqCst) {
            self.up.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn bring_down(&self, _config_path: &Path) -> Result<()> {
        self.up.store(false, Ordering::SeqCst);
        self.peers.lock().await.clear();
        Ok(())
    }

    async fn set_peer(&self, _interface: &str, peer: &PeerSpec) -> Result<()> {
        if self.reject_peers.load(Ordering::SeqCst) {
            return Err(WireGuardError::Sync("Invalid argument".into()));
        }
        self.peers
            .lock()
            .await
            .insert(peer.public_key.clone(), peer.clone());
        Ok(())
    }

    async fn remove_peer(&self, _interface: &str, public_key: &str) -> Result<()> {
        if self.reject_peers.load(Ordering::SeqCst) {
            return Err(WireGuardError::Sync("Invalid argument".into()));
        }
        self.peers.lock().await.remove(public_key);
        Ok(())
    }

    async fn dump(&self, _interface: &str) -> Result<Vec<PeerDump>> {
        Ok(self
            .peers
            .lock()
            .await
            .values()
            .map(|spec| PeerDump {
                public_key: spec.public_key.clone(),
                endpoint: spec.endpoint.clone(),
                allowed_ips: spec.allowed_ips.clone(),
                last_handshake: None,
                rx_bytes: 0,
                tx_bytes: 0,
            })
            .collect())
    }
}

impl FakeTunnel {
    async fn has_peer(&self, public_key: &str) -> bool {
        self.peers.lock().await.contains_key(public_key)
    }
}

fn settings(dir: &Path) -> SupervisorConfig {
    SupervisorConfig {
        config_dir: dir.to_path_buf(),
        confirm_interval_ms: 5,
        confirm_attempts: 3,
        ..SupervisorConfig::default()
    }
}

fn public_key() -> String {
    X25519KeyManager::new()
        .generate_keypair()
        .unwrap()
        .public_key_base64()
}

struct Harness {
    _dir: tempfile::TempDir,
    tunnel: Arc<FakeTunnel>,
    store: Arc<MemoryStore>,
    supervisor: WireGuardSupervisor,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let tunnel = Arc::new(FakeTunnel::default());
    let store = Arc::new(MemoryStore::new());
    let supervisor = WireGuardSupervisor::new(settings(dir.path()), tunnel.clone(), store.clone())
        .await
        .unwrap();
    Harness {
        _dir: dir,
        tunnel,
        store,
        supervisor,
    }
}

#[tokio::test]
async fn test_peer_config_round_trip() {
    let h = harness().await;
    h.supervisor
        .update_config(UpdateInterface {
            endpoint_address: Some("vpn.example.com".into()),
            ..Default::default()
        })
        .await
        .unwrap();

    let key = public_key();
    let peer = h
        .supervisor
        .create_peer(CreatePeer::new("laptop", key.clone()))
        .await
        .unwrap();
    assert_eq!(peer.allowed_ips, vec!["10.66.66.2/32"]);

    let text = h.supervisor.peer_config(peer.id).await.unwrap();
    let parsed = parse_config(&text).unwrap();
    let server = h.supervisor.config().await;

    assert_eq!(parsed.interface.get("Address"), Some("10.66.66.2/32"));
    assert_eq!(parsed.peers.len(), 1);
    assert_eq!(parsed.peers[0].get("PublicKey"), Some(server.public_key.as_str()));
    assert_eq!(parsed.peers[0].get("Endpoint"), Some("vpn.example.com:51820"));

    let qr = h.supervisor.peer_qrcode(peer.id).await.unwrap();
    assert!(qr.starts_with("data:image/png;base64,"));
}

#[tokio::test]
async fn test_peer_config_requires_endpoint() {
    let h = harness().await;
    let peer = h
        .supervisor
        .create_peer(CreatePeer::new("phone", public_key()))
        .await
        .unwrap();

    let err = h.supervisor.peer_config(peer.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn test_duplicate_public_key_conflicts() {
    let h = harness().await;
    let key = public_key();
    h.supervisor
        .create_peer(CreatePeer::new("a", key.clone()))
        .await
        .unwrap();

    let err = h
        .supervisor
        .create_peer(CreatePeer::new("b", key))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(h.supervisor.peer_count().await, 1);
}

#[tokio::test]
async fn test_allocation_skips_used_addresses() {
    let h = harness().await;
    h.supervisor
        .create_peer(CreatePeer::new("manual", public_key()).with_allowed_ips("10.66.66.2/32"))
        .await
        .unwrap();

    let auto = h
        .supervisor
        .create_peer(CreatePeer::new("auto", public_key()))
        .await
        .unwrap();
    assert_eq!(auto.allowed_ips, vec!["10.66.66.3/32"]);
}

#[tokio::test]
async fn test_start_renders_enabled_peers_and_stop() {
    let h = harness().await;
    let on = public_key();
    let off = public_key();
    h.supervisor
        .create_peer(CreatePeer::new("on", on.clone()))
        .await
        .unwrap();
    h.supervisor
        .create_peer(CreatePeer::new("off", off.clone()).with_enabled(false))
        .await
        .unwrap();

    let status = h.supervisor.start().await.unwrap();
    assert_eq!(status.state, TunnelState::Up);
    assert_eq!(status.peer_count, 2);
    assert!(h.tunnel.has_peer(&on).await);
    assert!(!h.tunnel.has_peer(&off).await);

    let config = h.tunnel.last_config.lock().await.clone().unwrap();
    assert!(config.contains("ListenPort = 51820"));

    let err = h.supervisor.start().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyRunning);

    let status = h.supervisor.stop().await.unwrap();
    assert_eq!(status.state, TunnelState::Down);
    assert!(status.peers.iter().all(|p| p.rx_bytes.is_none()));

    // Stop is idempotent
    h.supervisor.stop().await.unwrap();
    assert_eq!(h.supervisor.state(), TunnelState::Down);
}

#[tokio::test]
async fn test_start_without_tool_fails() {
    let h = harness().await;
    h.tunnel.missing_tool.store(true, Ordering::SeqCst);

    let err = h.supervisor.start().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unavailable);
    assert_eq!(h.supervisor.state(), TunnelState::Error);
    assert_eq!(h.tunnel.bring_ups.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unconfirmed_start_is_error() {
    let h = harness().await;
    h.tunnel.never_appears.store(true, Ordering::SeqCst);

    let err = h.supervisor.start().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Start);

    let status = h.supervisor.status().await.unwrap();
    assert_eq!(status.state, TunnelState::Error);
    assert!(status.last_error.is_some());
}

#[tokio::test]
async fn test_restart_failure_leaves_error_state() {
    let h = harness().await;
    h.supervisor.start().await.unwrap();

    h.tunnel.never_appears.store(true, Ordering::SeqCst);
    assert!(h.supervisor.restart().await.is_err());
    assert_eq!(h.supervisor.state(), TunnelState::Error);

    // Recovers once the interface comes up again
    h.tunnel.never_appears.store(false, Ordering::SeqCst);
    let status = h.supervisor.restart().await.unwrap();
    assert_eq!(status.state, TunnelState::Up);
}

#[tokio::test]
async fn test_rejected_live_push_commits_nothing() {
    let h = harness().await;
    h.supervisor.start().await.unwrap();
    h.tunnel.reject_peers.store(true, Ordering::SeqCst);

    let err = h
        .supervisor
        .create_peer(CreatePeer::new("rejected", public_key()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Sync);
    assert_eq!(h.supervisor.peer_count().await, 0);

    h.tunnel.reject_peers.store(false, Ordering::SeqCst);
    let key = public_key();
    let peer = h
        .supervisor
        .create_peer(CreatePeer::new("accepted", key.clone()))
        .await
        .unwrap();
    assert!(h.tunnel.has_peer(&key).await);

    h.tunnel.reject_peers.store(true, Ordering::SeqCst);
    let err = h.supervisor.delete_peer(peer.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Sync);
    assert!(h.supervisor.peer(peer.id).await.is_ok());
}

#[tokio::test]
async fn test_store_failure_reverts_live_change() {
    let h = harness().await;
    h.supervisor.start().await.unwrap();
    h.store.set_unavailable(true);

    let key = public_key();
    let err = h
        .supervisor
        .create_peer(CreatePeer::new("lost", key.clone()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Storage);
    assert_eq!(h.supervisor.peer_count().await, 0);
    assert!(!h.tunnel.has_peer(&key).await);
}

#[tokio::test]
async fn test_disable_removes_live_peer() {
    let h = harness().await;
    h.supervisor.start().await.unwrap();
    let key = public_key();
    let peer = h
        .supervisor
        .create_peer(CreatePeer::new("toggle", key.clone()))
        .await
        .unwrap();

    h.supervisor
        .update_peer(
            peer.id,
            UpdatePeer {
                enabled: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(!h.tunnel.has_peer(&key).await);

    h.supervisor
        .update_peer(
            peer.id,
            UpdatePeer {
                enabled: Some(true),
                allowed_ips: Some("10.66.66.20/32".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let live = h.tunnel.peers.lock().await.get(&key).cloned().unwrap();
    assert_eq!(live.allowed_ips, vec!["10.66.66.20/32"]);
    assert_eq!(live.persistent_keepalive, None);
}

#[tokio::test]
async fn test_config_change_while_up_needs_restart() {
    let h = harness().await;
    h.supervisor.start().await.unwrap();

    let view = h
        .supervisor
        .update_config(UpdateInterface {
            listen_port: Some(51999),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(view.restart_required);

    h.supervisor.restart().await.unwrap();
    assert!(!h.supervisor.config().await.restart_required);
    let config = h.tunnel.last_config.lock().await.clone().unwrap();
    assert!(config.contains("ListenPort = 51999"));
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let h = harness().await;
    let err = h
        .supervisor
        .update_config(UpdateInterface {
            mtu: Some(9000),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(h.supervisor.config().await.mtu, 1420);
}

#[tokio::test]
async fn test_state_survives_reload() {
    let dir = tempfile::tempdir().unwrap();
    let tunnel = Arc::new(FakeTunnel::default());
    let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());

    let first = WireGuardSupervisor::new(settings(dir.path()), tunnel.clone(), store.clone())
        .await
        .unwrap();
    let server_key = first.config().await.public_key;
    first
        .create_peer(CreatePeer::new("one", public_key()))
        .await
        .unwrap();
    let second = first
        .create_peer(CreatePeer::new("two", public_key()))
        .await
        .unwrap();
    first.delete_peer(second.id).await.unwrap();
    drop(first);

    let reloaded = WireGuardSupervisor::new(settings(dir.path()), tunnel, store)
        .await
        .unwrap();
    assert_eq!(reloaded.config().await.public_key, server_key);
    assert_eq!(reloaded.peer_count().await, 1);

    // Ids are never reused
    let third = reloaded
        .create_peer(CreatePeer::new("three", public_key()))
        .await
        .unwrap();
    assert_eq!(third.id, 3);
}

#[tokio::test]
async fn test_auto_start_on_init() {
    let h = harness().await;
    h.supervisor
        .update_config(UpdateInterface {
            auto_start: Some(true),
            ..Default::default()
        })
        .await
        .unwrap();

    h.supervisor.init().await;
    assert_eq!(h.supervisor.state(), TunnelState::Up);

    h.supervisor.shutdown().await;
    assert_eq!(h.supervisor.state(), TunnelState::Down);
    assert!(!h.tunnel.up.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_peers_listed_newest_first() {
    let h = harness().await;
    for name in ["first", "second", "third"] {
        h.supervisor
            .create_peer(CreatePeer::new(name, public_key()))
            .await
            .unwrap();
    }
    let names: Vec<_> = h
        .supervisor
        .peers()
        .await
        .into_iter()
        .map(|p| p.name)
        .collect();
    assert_eq!(names, vec!["third", "second", "first"]);
    assert!(h.supervisor.connection_logs(None, 10).await.is_empty());
}

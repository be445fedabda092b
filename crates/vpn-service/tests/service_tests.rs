use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use vpn_crypto::X25519KeyManager;
use vpn_forward::{CreateRule, RuleFilter, RuleStatus};
use vpn_network::{FirewallBackend, FirewallProtocol, FirewallRequest};
use vpn_service::{Caller, NetworkService, ServiceConfig};
use vpn_types::{ErrorKind, FirewallRule, MemoryStore, NetworkProtocol};
use vpn_wireguard::{
    CreatePeer, PeerDump, PeerSpec, TunnelBackend, TunnelState, UpdateInterface, WireGuardError,
};

#[derive(Default)]
struct FakeTunnel {
    missing: bool,
    up: AtomicBool,
}

#[async_trait]
impl TunnelBackend for FakeTunnel {
    async fn check_available(&self) -> vpn_wireguard::Result<()> {
        if self.missing {
            return Err(WireGuardError::ToolUnavailable("wg".into()));
        }
        Ok(())
    }

    async fn interface_exists(&self, _interface: &str) -> vpn_wireguard::Result<bool> {
        Ok(self.up.load(Ordering::SeqCst))
    }

    async fn bring_up(&self, _config_path: &Path) -> vpn_wireguard::Result<()> {
        self.up.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn bring_down(&self, _config_path: &Path) -> vpn_wireguard::Result<()> {
        self.up.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn set_peer(&self, _interface: &str, _peer: &PeerSpec) -> vpn_wireguard::Result<()> {
        Ok(())
    }

    async fn remove_peer(&self, _interface: &str, _public_key: &str) -> vpn_wireguard::Result<()> {
        Ok(())
    }

    async fn dump(&self, _interface: &str) -> vpn_wireguard::Result<Vec<PeerDump>> {
        Ok(Vec::new())
    }
}

#[derive(Default)]
struct FakeFirewall {
    rules: Mutex<Vec<FirewallRule>>,
}

#[async_trait]
impl FirewallBackend for FakeFirewall {
    async fn is_enabled(&self) -> bool {
        true
    }

    async fn list_rules(&self) -> vpn_network::Result<Vec<FirewallRule>> {
        Ok(self.rules.lock().await.clone())
    }

    async fn has_allow(&self, port: u16, protocol: NetworkProtocol) -> vpn_network::Result<bool> {
        Ok(self
            .rules
            .lock()
            .await
            .contains(&FirewallRule::allow(port, protocol)))
    }

    async fn insert_allow(&self, port: u16, protocol: NetworkProtocol) -> vpn_network::Result<()> {
        self.rules
            .lock()
            .await
            .push(FirewallRule::allow(port, protocol));
        Ok(())
    }

    async fn delete_allow(&self, port: u16, protocol: NetworkProtocol) -> vpn_network::Result<()> {
        let rule = FirewallRule::allow(port, protocol);
        self.rules.lock().await.retain(|r| *r != rule);
        Ok(())
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    store: Arc<MemoryStore>,
    service: NetworkService,
}

fn test_config(dir: &Path) -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.storage.state_dir = dir.join("state");
    config.wireguard.config_dir = dir.join("wireguard");
    config.wireguard.confirm_interval_ms = 5;
    config
}

async fn harness_with(config: impl FnOnce(&mut ServiceConfig)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path());
    config(&mut cfg);

    let store = Arc::new(MemoryStore::new());
    let service = NetworkService::with_backends(
        cfg,
        store.clone(),
        Arc::new(FakeTunnel::default()),
        Arc::new(FakeFirewall::default()),
    )
    .await
    .unwrap();
    Harness {
        _dir: dir,
        store,
        service,
    }
}

async fn harness() -> Harness {
    harness_with(|_| {}).await
}

fn admin() -> Caller {
    Caller::authorized("admin")
}

fn public_key() -> String {
    X25519KeyManager::new()
        .generate_keypair()
        .unwrap()
        .public_key_base64()
}

#[tokio::test]
async fn test_missing_tunnel_tool_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let result = NetworkService::with_backends(
        test_config(dir.path()),
        Arc::new(MemoryStore::new()),
        Arc::new(FakeTunnel {
            missing: true,
            ..Default::default()
        }),
        Arc::new(FakeFirewall::default()),
    )
    .await;

    let err = result.err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Unavailable);
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_anonymous_caller_cannot_mutate() {
    let h = harness().await;
    let anon = Caller::anonymous();

    let err = h
        .service
        .forward_create(&anon, CreateRule::tcp(9000, "10.0.0.5", 22))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);

    let err = h
        .service
        .wireguard_create_peer(&anon, CreatePeer::new("phone", public_key()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);

    let err = h
        .service
        .firewall_open(&anon, &FirewallRequest::new(8443, FirewallProtocol::Tcp))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);

    let err = h.service.wireguard_start(&anon).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);

    // Nothing happened, reads still work
    assert!(h.service.forward_list(&RuleFilter::default()).await.is_empty());
    assert!(h.service.wireguard_peers().await.is_empty());
    assert!(h.service.firewall_rules().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_authorization_can_be_disabled() {
    let h = harness_with(|c| c.auth.require_authorization = false).await;
    tokio_test::assert_ok!(
        h.service
            .forward_create(&Caller::anonymous(), CreateRule::tcp(9001, "10.0.0.5", 22))
            .await
    );
}

#[tokio::test]
async fn test_forward_scenario_through_service() {
    let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = echo.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = echo.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    let listen = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();

    let h = harness().await;
    let rule = h
        .service
        .forward_create(
            &admin(),
            CreateRule::tcp(listen, "127.0.0.1", target).with_listen_address("127.0.0.1"),
        )
        .await
        .unwrap();
    let started = h.service.forward_start(&admin(), rule.id).await.unwrap();
    assert_eq!(started.status, RuleStatus::Running);

    let mut client = TcpStream::connect(("127.0.0.1", listen)).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    let overview = h.service.overview().await;
    assert_eq!(overview.forward_rules, 1);
    assert_eq!(overview.running_rules, 1);
    assert_eq!(overview.active_connections, 1);
    assert_eq!(h.service.forward_stats(rule.id).await.unwrap().active_connections, 1);

    drop(client);
    let mut drained = false;
    for _ in 0..200 {
        if h.service.forward_stats(rule.id).await.unwrap().active_connections == 0 {
            drained = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(drained);

    assert!(h.service.forward_metrics().unwrap().contains("forward_rules_running"));

    let restarted = h.service.forward_restart(&admin(), rule.id).await.unwrap();
    assert_eq!(restarted.status, RuleStatus::Running);

    h.service.shutdown().await;
    let stopped = h.service.forward_get(rule.id).await.unwrap();
    assert_eq!(stopped.status, RuleStatus::Stopped);

    h.service.forward_delete(&admin(), rule.id).await.unwrap();
    assert_eq!(h.service.overview().await.forward_rules, 0);
}

#[tokio::test]
async fn test_firewall_open_then_close() {
    let h = harness().await;
    let request = FirewallRequest::new(8443, FirewallProtocol::Both);

    let opened = h.service.firewall_open(&admin(), &request).await.unwrap();
    assert_eq!(opened.len(), 2);
    assert_eq!(h.service.firewall_status().await.unwrap().rules.len(), 2);

    h.service.firewall_close(&admin(), &request).await.unwrap();
    assert!(h.service.firewall_rules().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_wireguard_through_service() {
    let h = harness().await;
    h.service
        .wireguard_update_config(
            &admin(),
            UpdateInterface {
                endpoint_address: Some("203.0.113.10".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let peer = h
        .service
        .wireguard_create_peer(&admin(), CreatePeer::new("laptop", public_key()))
        .await
        .unwrap();
    let text = h.service.wireguard_peer_config(peer.id).await.unwrap();
    assert!(text.contains("Endpoint = 203.0.113.10:51820"));
    assert!(h
        .service
        .wireguard_peer_qrcode(peer.id)
        .await
        .unwrap()
        .starts_with("data:image/png;base64,"));

    let status = h.service.wireguard_start(&admin()).await.unwrap();
    assert_eq!(status.state, TunnelState::Up);
    assert_eq!(h.service.overview().await.peer_count, 1);
    assert!(h.service.wireguard_connection_logs(None, 10).await.is_empty());

    h.service.wireguard_restart(&admin()).await.unwrap();
    let status = h.service.wireguard_stop(&admin()).await.unwrap();
    assert_eq!(status.state, TunnelState::Down);

    h.service
        .wireguard_delete_peer(&admin(), peer.id)
        .await
        .unwrap();
    let err = h.service.wireguard_peer_config(peer.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_lost_store_is_fatal() {
    let h = harness().await;
    h.store.set_unavailable(true);

    let err = h
        .service
        .forward_create(&admin(), CreateRule::tcp(9002, "10.0.0.5", 22))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Storage);
    assert!(err.is_fatal());
    assert!(h.service.forward_list(&RuleFilter::default()).await.is_empty());
}

//! Concurrent TCP port scanner
//!
//! Each probe is a TCP connect with a per-probe timeout. Probes run as tokio
//! tasks behind a semaphore so the number in flight never exceeds the
//! requested concurrency. Results land in a slot per port, so the returned
//! list is always in ascending port order regardless of completion order.

use crate::error::{NetworkError, Result};
use crate::sockets::SocketInspector;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use vpn_types::{ConnectionInfo, HostValidator, ListeningSocket, NetworkProtocol, PortSelection, PortValidator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortState {
    /// Connect succeeded
    Open,
    /// Connection actively refused
    Closed,
    /// No answer within the timeout, or the path is unreachable
    Filtered,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortScanResult {
    pub port: u16,
    pub state: PortState,
    /// Probe duration in milliseconds
    #[serde(rename = "latency")]
    pub latency_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRequest {
    pub target_host: String,
    pub ports: PortSelection,
    /// Per-probe timeout in milliseconds
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub concurrency: Option<usize>,
}

impl ScanRequest {
    pub fn new(target_host: impl Into<String>, ports: impl Into<PortSelection>) -> Self {
        Self {
            target_host: target_host.into(),
            ports: ports.into(),
            timeout: None,
            concurrency: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }
}

/// Result of a single local port check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortCheck {
    pub port: u16,
    pub state: PortState,
    pub in_use: bool,
    #[serde(rename = "latency")]
    pub latency_ms: f64,
    pub process: Option<String>,
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    pub default_timeout_ms: u64,
    pub default_concurrency: usize,
    pub max_concurrency: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 200,
            default_concurrency: 100,
            max_concurrency: 1000,
        }
    }
}

pub struct PortScanner {
    config: ScannerConfig,
    host_validator: HostValidator,
    inspector: SocketInspector,
}

impl PortScanner {
    pub fn new(config: ScannerConfig) -> Self {
        Self {
            config,
            host_validator: HostValidator,
            inspector: SocketInspector::default(),
        }
    }

    pub fn with_inspector(mut self, inspector: SocketInspector) -> Self {
        self.inspector = inspector;
        self
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    /// Probe every requested port; never fails because of a single probe
    pub async fn scan(&self, request: &ScanRequest) -> Result<Vec<PortScanResult>> {
        self.scan_cancellable(request, CancellationToken::new()).await
    }

    /// Like [`scan`](Self::scan) but abandons outstanding probes once `token`
    /// is cancelled, returning [`NetworkError::ScanCancelled`]
    pub async fn scan_cancellable(
        &self,
        request: &ScanRequest,
        token: CancellationToken,
    ) -> Result<Vec<PortScanResult>> {
        let ports = request
            .ports
            .expand()
            .map_err(|e| NetworkError::InvalidRange(e.to_string()))?;

        let timeout = match request.timeout {
            Some(0) => return Err(NetworkError::validation("Probe timeout must be positive")),
            Some(ms) => Duration::from_millis(ms),
            None => Duration::from_millis(self.config.default_timeout_ms),
        };

        let concurrency = request
            .concurrency
            .unwrap_or(self.config.default_concurrency)
            .clamp(1, self.config.max_concurrency.max(1));

        let target = self.resolve(&request.target_host).await?;
        let total = ports.len();

        info!(
            target = %target,
            ports = total,
            concurrency,
            timeout_ms = timeout.as_millis() as u64,
            "starting port scan"
        );
        let started = Instant::now();

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut slots: Vec<Option<PortScanResult>> = vec![None; total];
        let mut tasks = JoinSet::new();
        let mut completed = 0usize;

        for (index, &port) in ports.iter().enumerate() {
            let permit = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    tasks.abort_all();
                    return Err(NetworkError::ScanCancelled { completed, total });
                }
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            tasks.spawn(async move {
                let result = probe(SocketAddr::new(target, port), timeout).await;
                drop(permit);
                (index, result)
            });
        }

        loop {
            let joined = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    tasks.abort_all();
                    return Err(NetworkError::ScanCancelled { completed, total });
                }
                joined = tasks.join_next() => joined,
            };
            match joined {
                Some(Ok((index, result))) => {
                    slots[index] = Some(result);
                    completed += 1;
                }
                Some(Err(e)) => debug!(error = %e, "probe task failed"),
                None => break,
            }
        }

        // A probe task that panicked still yields a result for its port
        let results: Vec<PortScanResult> = slots
            .into_iter()
            .zip(ports.iter())
            .map(|(slot, &port)| {
                slot.unwrap_or(PortScanResult {
                    port,
                    state: PortState::Filtered,
                    latency_ms: 0.0,
                })
            })
            .collect();

        let open = results.iter().filter(|r| r.state == PortState::Open).count();
        info!(
            target = %target,
            ports = total,
            open,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "port scan finished"
        );

        Ok(results)
    }

    /// Probe one port on the local host and report the owning process
    pub async fn check(&self, port: u16) -> Result<PortCheck> {
        PortValidator::validate(port)?;

        let timeout = Duration::from_millis(self.config.default_timeout_ms);
        let result = probe(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port), timeout).await;

        let owner = self
            .inspector
            .listening()
            .await?
            .into_iter()
            .find(|s| s.port == port && s.protocol == NetworkProtocol::Tcp);

        Ok(PortCheck {
            port,
            state: result.state,
            in_use: result.state == PortState::Open || owner.is_some(),
            latency_ms: result.latency_ms,
            process: owner.as_ref().and_then(|s| s.process.clone()),
            pid: owner.and_then(|s| s.pid),
        })
    }

    pub async fn listen(&self) -> Result<Vec<ListeningSocket>> {
        self.inspector.listening().await
    }

    pub async fn connections(&self, port: u16) -> Result<Vec<ConnectionInfo>> {
        PortValidator::validate(port)?;
        self.inspector.connections(port).await
    }

    async fn resolve(&self, host: &str) -> Result<IpAddr> {
        self.host_validator.validate(host)?;
        let host = host.trim().trim_start_matches('[').trim_end_matches(']');

        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }

        let mut addrs = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|e| NetworkError::validation(format!("Cannot resolve '{}': {}", host, e)))?;
        addrs
            .next()
            .map(|addr| addr.ip())
            .ok_or_else(|| NetworkError::validation(format!("'{}' has no addresses", host)))
    }
}

async fn probe(addr: SocketAddr, timeout: Duration) -> PortScanResult {
    let started = Instant::now();
    let state = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => PortState::Open,
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => PortState::Closed,
        Ok(Err(_)) | Err(_) => PortState::Filtered,
    };
    let latency = started.elapsed().as_secs_f64() * 1000.0;

    PortScanResult {
        port: addr.port(),
        state,
        latency_ms: (latency * 1000.0).round() / 1000.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use vpn_types::PortRange;

    #[tokio::test]
    async fn test_open_and_closed_ports() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open_port = listener.local_addr().unwrap().port();

        // Bind and drop to find a port that is very likely refused
        let closed_port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };

        let scanner = PortScanner::new(ScannerConfig::default());
        let request = ScanRequest::new("127.0.0.1", vec![closed_port, open_port]);
        let results = scanner.scan(&request).await.unwrap();

        assert_eq!(results.len(), 2);
        let open = results.iter().find(|r| r.port == open_port).unwrap();
        assert_eq!(open.state, PortState::Open);
        let closed = results.iter().find(|r| r.port == closed_port).unwrap();
        assert_eq!(closed.state, PortState::Closed);
    }

    #[tokio::test]
    async fn test_results_are_ascending_and_complete() {
        let scanner = PortScanner::new(ScannerConfig::default());
        let request = ScanRequest::new("127.0.0.1", PortRange::new(40000, 40199))
            .with_concurrency(7)
            .with_timeout(Duration::from_millis(100));

        let results = scanner.scan(&request).await.unwrap();
        assert_eq!(results.len(), 200);
        assert!(results.windows(2).all(|w| w[0].port + 1 == w[1].port));
    }

    #[tokio::test]
    async fn test_invalid_ranges_rejected() {
        let scanner = PortScanner::new(ScannerConfig::default());

        let empty = ScanRequest::new("127.0.0.1", Vec::<u16>::new());
        let err = scanner.scan(&empty).await.unwrap_err();
        assert!(matches!(err, NetworkError::InvalidRange(_)));

        let inverted = ScanRequest::new("127.0.0.1", PortRange::new(100, 1));
        assert!(matches!(
            scanner.scan(&inverted).await,
            Err(NetworkError::InvalidRange(_))
        ));
    }

    #[tokio::test]
    async fn test_bad_target_rejected() {
        let scanner = PortScanner::new(ScannerConfig::default());
        let request = ScanRequest::new("not a host", vec![80]);
        assert_eq!(
            scanner.scan(&request).await.unwrap_err().kind(),
            vpn_types::ErrorKind::Validation
        );
    }

    #[tokio::test]
    async fn test_cancelled_scan() {
        let scanner = PortScanner::new(ScannerConfig::default());
        let token = CancellationToken::new();
        token.cancel();

        let request = ScanRequest::new("127.0.0.1", PortRange::new(1, 1024));
        let err = scanner.scan_cancellable(&request, token).await.unwrap_err();
        assert!(matches!(err, NetworkError::ScanCancelled { .. }));
    }

    #[tokio::test]
    async fn test_check_reports_listening_port_in_use() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let scanner = PortScanner::new(ScannerConfig::default());
        let check = scanner.check(port).await.unwrap();
        assert!(check.in_use);
        assert_eq!(check.state, PortState::Open);

        assert!(scanner.check(0).await.is_err());
    }
}

//! Running relays
//!
//! A [`RelayRule`] is one run of a forward rule: the bound socket, the
//! accept/receive loop and every per-connection task. All tasks are tracked
//! by a [`TaskTracker`] and observe one [`CancellationToken`], so stopping a
//! run waits until nothing of it is left.

mod tcp;
mod udp;

use crate::config::ForwardConfig;
use crate::error::{ForwardError, Result};
use crate::metrics::RuleMetrics;
use crate::rule::ForwardRule;
use crate::stats::{Direction, StatsCounter, StatsSnapshot};
use crate::throttle::Throttle;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};
use vpn_types::NetworkProtocol;

/// State shared by all tasks of one run
pub(crate) struct RelayContext {
    pub rule_id: u64,
    pub target: String,
    pub max_connections: u64,
    pub upload_limit: u64,
    pub download_limit: u64,
    pub config: ForwardConfig,
    pub stats: Arc<StatsCounter>,
    pub metrics: RuleMetrics,
    pub token: CancellationToken,
    pub tracker: TaskTracker,
}

impl RelayContext {
    pub fn record_bytes(&self, direction: Direction, n: usize) {
        if !self.stats.is_live() {
            return;
        }
        self.stats.add_bytes(direction, n as u64);
        self.metrics.bytes(direction, n as u64);
    }

    pub fn connection_opened(&self) {
        self.stats.connection_opened();
        self.metrics.connection_accepted();
    }

    pub fn connection_closed(&self) {
        self.stats.connection_closed();
        self.metrics.connection_closed();
    }

    pub fn connection_failed(&self) {
        self.stats.connection_failed();
        self.metrics.connection_failed();
    }

    pub fn connection_rejected(&self) {
        self.stats.connection_rejected();
        self.metrics.connection_rejected();
    }

    pub fn at_capacity(&self) -> bool {
        self.stats.active_connections() >= self.max_connections
    }
}

/// One running instance of a forward rule
pub struct RelayRule {
    rule_id: u64,
    local_addr: SocketAddr,
    ctx: Arc<RelayContext>,
}

impl RelayRule {
    /// Bind the rule's listening socket and start relaying.
    ///
    /// Binding happens before this returns, so a bind failure is reported
    /// synchronously and no task is left behind.
    pub async fn start(
        rule: &ForwardRule,
        config: &ForwardConfig,
        metrics: RuleMetrics,
    ) -> Result<Self> {
        let listen: SocketAddr = SocketAddr::new(rule.listen_ip()?, rule.listen_port);

        let ctx = Arc::new(RelayContext {
            rule_id: rule.id,
            target: rule.target_endpoint(),
            max_connections: rule.max_connections as u64,
            upload_limit: rule.upload_limit,
            download_limit: rule.download_limit,
            config: config.clone(),
            stats: Arc::new(StatsCounter::new()),
            metrics,
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
        });

        let bind_error = |source: std::io::Error| ForwardError::Bind {
            address: rule.listen_endpoint(),
            source,
        };

        let local_addr = match rule.protocol {
            NetworkProtocol::Tcp => {
                let listener = tokio::net::TcpListener::bind(listen)
                    .await
                    .map_err(bind_error)?;
                let local_addr = listener.local_addr()?;
                ctx.tracker.spawn(tcp::accept_loop(listener, ctx.clone()));
                local_addr
            }
            NetworkProtocol::Udp => {
                let socket = tokio::net::UdpSocket::bind(listen)
                    .await
                    .map_err(bind_error)?;
                let local_addr = socket.local_addr()?;
                ctx.tracker.spawn(udp::receive_loop(Arc::new(socket), ctx.clone()));
                local_addr
            }
        };

        ctx.tracker.spawn(speed_sampler(ctx.clone()));

        info!(
            rule_id = rule.id,
            protocol = %rule.protocol,
            listen = %local_addr,
            target = %ctx.target,
            "relay started"
        );

        Ok(Self {
            rule_id: rule.id,
            local_addr,
            ctx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> Arc<StatsCounter> {
        self.ctx.stats.clone()
    }

    /// Cancel every task of this run and wait until all have exited.
    ///
    /// Returns the final counters; nothing is recorded after this returns.
    pub async fn stop(self) -> StatsSnapshot {
        self.ctx.stats.freeze();
        self.ctx.token.cancel();
        self.ctx.tracker.close();
        self.ctx.tracker.wait().await;

        self.ctx.stats.finish();
        self.ctx.metrics.reset_active();

        let snapshot = self.ctx.stats.snapshot();
        info!(
            rule_id = self.rule_id,
            bytes_in = snapshot.bytes_in,
            bytes_out = snapshot.bytes_out,
            connections = snapshot.total_connections,
            "relay stopped"
        );
        snapshot
    }
}

/// Copy one direction of a connection until EOF, error or cancellation.
///
/// Returns the number of bytes moved. The writer is shut down on EOF so the
/// other side sees the half-close.
pub(crate) async fn pipe<R, W>(
    mut reader: R,
    mut writer: W,
    direction: Direction,
    limit: u64,
    ctx: &RelayContext,
    token: &CancellationToken,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; ctx.config.buffer_size.max(1024)];
    let mut throttle = Throttle::new(limit);
    let mut total = 0u64;

    loop {
        let chunk = throttle.chunk_limit(buf.len());
        let n = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            read = reader.read(&mut buf[..chunk]) => read?,
        };

        if n == 0 {
            let _ = writer.shutdown().await;
            break;
        }

        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            written = writer.write_all(&buf[..n]) => written?,
        }

        total += n as u64;
        ctx.record_bytes(direction, n);

        if let Some(wait) = throttle.record(n as u64) {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    debug!(rule_id = ctx.rule_id, direction = direction.as_str(), bytes = total, "pipe finished");
    Ok(total)
}

/// Samples upload/download speed once per interval while the run is live
async fn speed_sampler(ctx: Arc<RelayContext>) {
    let period = ctx.config.speed_sample_interval();
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let (mut last_in, mut last_out) = ctx.stats.bytes();

    loop {
        tokio::select! {
            _ = ctx.token.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let (bytes_in, bytes_out) = ctx.stats.bytes();
        let secs = period.as_secs_f64();
        ctx.stats.set_speeds(
            ((bytes_in - last_in) as f64 / secs) as u64,
            ((bytes_out - last_out) as f64 / secs) as u64,
        );
        last_in = bytes_in;
        last_out = bytes_out;
    }
}

//! UDP relaying
//!
//! Each client address gets a session with its own connected upstream
//! socket. Sessions idle longer than the configured timeout are reclaimed by
//! a sweeper task.

use super::RelayContext;
use crate::stats::Direction;
use crate::throttle::Throttle;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const MAX_DATAGRAM: usize = 65535;
const SESSION_QUEUE: usize = 256;

struct Session {
    uplink: mpsc::Sender<Vec<u8>>,
    last_seen: Arc<AtomicU64>,
    token: CancellationToken,
}

type Sessions = Arc<Mutex<HashMap<SocketAddr, Session>>>;

/// Milliseconds since the run's epoch
#[derive(Clone, Copy)]
struct Clock(Instant);

impl Clock {
    fn now_ms(&self) -> u64 {
        self.0.elapsed().as_millis() as u64
    }
}

pub(super) async fn receive_loop(listener: Arc<UdpSocket>, ctx: Arc<RelayContext>) {
    let sessions: Sessions = Arc::new(Mutex::new(HashMap::new()));
    let clock = Clock(Instant::now());
    ctx.tracker
        .spawn(sweeper(sessions.clone(), clock, ctx.clone()));

    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let received = tokio::select! {
            biased;
            _ = ctx.token.cancelled() => break,
            received = listener.recv_from(&mut buf) => received,
        };

        let (n, client) = match received {
            Ok(pair) => pair,
            Err(e) => {
                // ICMP errors from earlier sends surface here on some platforms
                debug!(rule_id = ctx.rule_id, error = %e, "udp receive error");
                continue;
            }
        };

        let datagram = buf[..n].to_vec();
        let mut table = sessions.lock().await;

        if let Some(session) = table.get(&client) {
            if !session.token.is_cancelled() {
                session.last_seen.store(clock.now_ms(), Ordering::Relaxed);
                if session.uplink.try_send(datagram).is_err() {
                    debug!(rule_id = ctx.rule_id, %client, "session queue full, dropping datagram");
                }
                continue;
            }
            table.remove(&client);
        }

        if ctx.at_capacity() {
            debug!(rule_id = ctx.rule_id, %client, "session limit reached, dropping datagram");
            ctx.connection_rejected();
            continue;
        }

        let (tx, rx) = mpsc::channel(SESSION_QUEUE);
        let last_seen = Arc::new(AtomicU64::new(clock.now_ms()));
        let token = ctx.token.child_token();
        let _ = tx.try_send(datagram);
        // Counted before the session is visible to the sweeper
        ctx.connection_opened();
        table.insert(
            client,
            Session {
                uplink: tx,
                last_seen: last_seen.clone(),
                token: token.clone(),
            },
        );
        drop(table);

        ctx.tracker.spawn(run_session(
            listener.clone(),
            client,
            rx,
            last_seen,
            clock,
            token,
            sessions.clone(),
            ctx.clone(),
        ));
    }

    let mut table = sessions.lock().await;
    for (_, session) in table.drain() {
        session.token.cancel();
        ctx.connection_closed();
    }
}

async fn open_upstream(ctx: &RelayContext) -> std::io::Result<UdpSocket> {
    let target = tokio::net::lookup_host(ctx.target.as_str())
        .await?
        .next()
        .ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "target did not resolve")
        })?;

    let bind: SocketAddr = if target.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(target).await?;
    Ok(socket)
}

/// Open the session's upstream, then relay both directions.
///
/// Datagrams arriving while the upstream is being opened wait in the
/// session queue; the receive loop and other sessions carry on.
#[allow(clippy::too_many_arguments)]
async fn run_session(
    listener: Arc<UdpSocket>,
    client: SocketAddr,
    rx: mpsc::Receiver<Vec<u8>>,
    last_seen: Arc<AtomicU64>,
    clock: Clock,
    token: CancellationToken,
    sessions: Sessions,
    ctx: Arc<RelayContext>,
) {
    let open = tokio::time::timeout(ctx.config.connect_timeout(), open_upstream(&ctx));
    let opened = tokio::select! {
        biased;
        // Whoever cancelled the session also closed it
        _ = token.cancelled() => return,
        opened = open => opened,
    };

    let upstream = match opened {
        Ok(Ok(socket)) => Arc::new(socket),
        Ok(Err(e)) => {
            warn!(rule_id = ctx.rule_id, %client, target = %ctx.target, error = %e, "udp upstream failed");
            discard_session(&sessions, client, &last_seen, &token, &ctx).await;
            return;
        }
        Err(_) => {
            warn!(rule_id = ctx.rule_id, %client, target = %ctx.target, "udp upstream timed out");
            discard_session(&sessions, client, &last_seen, &token, &ctx).await;
            return;
        }
    };
    debug!(rule_id = ctx.rule_id, %client, "udp session opened");

    tokio::join!(
        uplink(rx, upstream.clone(), token.clone(), ctx.clone()),
        downlink(upstream, listener, client, last_seen.clone(), clock, token.clone(), ctx.clone()),
    );
}

/// Drop a session whose upstream could not be opened
async fn discard_session(
    sessions: &Sessions,
    client: SocketAddr,
    last_seen: &Arc<AtomicU64>,
    token: &CancellationToken,
    ctx: &RelayContext,
) {
    ctx.connection_failed();
    let mut table = sessions.lock().await;
    let ours = table
        .get(&client)
        .is_some_and(|session| Arc::ptr_eq(&session.last_seen, last_seen));
    if ours {
        table.remove(&client);
        token.cancel();
        ctx.connection_closed();
    }
}

async fn uplink(
    mut rx: mpsc::Receiver<Vec<u8>>,
    upstream: Arc<UdpSocket>,
    token: CancellationToken,
    ctx: Arc<RelayContext>,
) {
    let mut throttle = Throttle::new(ctx.upload_limit);
    loop {
        let datagram = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            datagram = rx.recv() => match datagram {
                Some(d) => d,
                None => break,
            },
        };

        match upstream.send(&datagram).await {
            Ok(n) => ctx.record_bytes(Direction::Upload, n),
            Err(e) => debug!(rule_id = ctx.rule_id, error = %e, "udp upstream send failed"),
        }

        if let Some(wait) = throttle.record(datagram.len() as u64) {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

async fn downlink(
    upstream: Arc<UdpSocket>,
    listener: Arc<UdpSocket>,
    client: SocketAddr,
    last_seen: Arc<AtomicU64>,
    clock: Clock,
    token: CancellationToken,
    ctx: Arc<RelayContext>,
) {
    let mut throttle = Throttle::new(ctx.download_limit);
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let received = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            received = upstream.recv(&mut buf) => received,
        };

        let n = match received {
            Ok(n) => n,
            Err(e) => {
                debug!(rule_id = ctx.rule_id, %client, error = %e, "udp upstream receive failed");
                continue;
            }
        };

        last_seen.store(clock.now_ms(), Ordering::Relaxed);
        match listener.send_to(&buf[..n], client).await {
            Ok(sent) => ctx.record_bytes(Direction::Download, sent),
            Err(e) => debug!(rule_id = ctx.rule_id, %client, error = %e, "udp reply failed"),
        }

        if let Some(wait) = throttle.record(n as u64) {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

async fn sweeper(sessions: Sessions, clock: Clock, ctx: Arc<RelayContext>) {
    let idle_ms = ctx.config.udp_idle_timeout().as_millis() as u64;
    let mut ticker = tokio::time::interval(ctx.config.udp_sweep_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = ctx.token.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let now = clock.now_ms();
        let mut table = sessions.lock().await;
        table.retain(|client, session| {
            let idle = now.saturating_sub(session.last_seen.load(Ordering::Relaxed));
            if idle < idle_ms {
                return true;
            }
            session.token.cancel();
            ctx.connection_closed();
            debug!(rule_id = ctx.rule_id, %client, idle_ms = idle, "udp session reclaimed");
            false
        });
    }
}

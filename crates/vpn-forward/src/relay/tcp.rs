use super::{pipe, RelayContext};
use crate::stats::Direction;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

pub(super) async fn accept_loop(listener: TcpListener, ctx: Arc<RelayContext>) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = ctx.token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (client, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!(rule_id = ctx.rule_id, error = %e, "accept failed");
                tokio::select! {
                    _ = ctx.token.cancelled() => break,
                    _ = tokio::time::sleep(std::time::Duration::from_millis(50)) => continue,
                }
            }
        };

        if ctx.at_capacity() {
            debug!(rule_id = ctx.rule_id, %peer, "connection limit reached, rejecting");
            ctx.connection_rejected();
            drop(client);
            continue;
        }

        // Counted before the task runs so the cap holds under bursts
        ctx.connection_opened();
        ctx.tracker.spawn(handle_connection(client, peer, ctx.clone()));
    }
    debug!(rule_id = ctx.rule_id, "accept loop exited");
}

async fn handle_connection(client: TcpStream, peer: SocketAddr, ctx: Arc<RelayContext>) {
    let connect = tokio::time::timeout(
        ctx.config.connect_timeout(),
        TcpStream::connect(ctx.target.as_str()),
    );

    let upstream = tokio::select! {
        biased;
        _ = ctx.token.cancelled() => {
            ctx.connection_closed();
            return;
        }
        result = connect => result,
    };

    let upstream = match upstream {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!(rule_id = ctx.rule_id, %peer, target = %ctx.target, error = %e, "upstream connect failed");
            ctx.connection_failed();
            ctx.connection_closed();
            return;
        }
        Err(_) => {
            warn!(rule_id = ctx.rule_id, %peer, target = %ctx.target, "upstream connect timed out");
            ctx.connection_failed();
            ctx.connection_closed();
            return;
        }
    };

    let _ = client.set_nodelay(true);
    let _ = upstream.set_nodelay(true);

    let (client_read, client_write) = client.into_split();
    let (upstream_read, upstream_write) = upstream.into_split();
    let token = ctx.token.child_token();

    let upload = async {
        let result = pipe(
            client_read,
            upstream_write,
            Direction::Upload,
            ctx.upload_limit,
            &ctx,
            &token,
        )
        .await;
        if result.is_err() {
            token.cancel();
        }
        result
    };
    let download = async {
        let result = pipe(
            upstream_read,
            client_write,
            Direction::Download,
            ctx.download_limit,
            &ctx,
            &token,
        )
        .await;
        if result.is_err() {
            token.cancel();
        }
        result
    };

    let (up, down) = tokio::join!(upload, download);
    if let Err(e) = up.as_ref().and(down.as_ref()) {
        debug!(rule_id = ctx.rule_id, %peer, error = %e, "connection ended with error");
    }

    ctx.connection_closed();
}

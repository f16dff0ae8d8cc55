//! Public-entry role: the client side of a route
//!
//! A freshly accepted user connection gets a flow with a random connection
//! ID, and a tunnel connection to the peer node is dialed for it. The
//! preamble re-identifies the flow on every (re)dial, so a dropped tunnel
//! leg reconnects behind the user's back while their bytes queue.

use super::{Context, READ_BUFFER_SIZE};
use crate::dialer::DialHandler;
use crate::flow::Flow;
use crate::routes::SharedRoute;
use crate::tunnel::Preamble;
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub(super) async fn handle_ingress(
    route: SharedRoute,
    ctx: Arc<Context>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let local = match stream.local_addr() {
        Ok(addr) => addr,
        Err(_) => return,
    };
    let route_id = route.read().unwrap().route_id.clone();

    debug!(%peer, listener = %route_id, "New user connection");

    let flow = Arc::new(Flow::accept(&route_id, peer, local));
    let (mut ingress_read, ingress_write) = stream.into_split();

    let handler = PeerEgressHandler {
        flow: Arc::clone(&flow),
        ingress: Arc::new(Mutex::new(Some(ingress_write))),
        route,
        ctx,
    };

    // First tunnel leg. The preamble goes out inside on_open, before the
    // ingress pump below can race any user bytes past it.
    dial_peer(handler).await;

    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match ingress_read.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                flow.forward_or_queue(&buf[..n]).await;
            }
            Err(e) => {
                debug!(connection_id = %flow.connection_id, "Ingress read error: {}", e);
                break;
            }
        }
    }

    // User went away: abandon any reconnect and drop the tunnel leg
    flow.mark_ingress_closed();
    flow.shutdown_egress().await;
    debug!(connection_id = %flow.connection_id, "User connection closed");
}

/// Egress-side callbacks for the tunnel leg of one flow
#[derive(Clone)]
struct PeerEgressHandler {
    flow: Arc<Flow>,
    ingress: Arc<Mutex<Option<OwnedWriteHalf>>>,
    route: SharedRoute,
    ctx: Arc<Context>,
}

#[async_trait]
impl DialHandler for PeerEgressHandler {
    async fn on_open(&self, writer: OwnedWriteHalf) {
        let preamble = Preamble::new(self.flow.connection_id.clone(), self.flow.proxy_info());

        match self.flow.attach_egress(writer, &preamble.encode()).await {
            Ok(()) => {
                info!(
                    connection_id = %self.flow.connection_id,
                    listener = %self.flow.route_id,
                    "Tunnel connected, sent connection ID"
                );
            }
            Err(e) => {
                // The read pump will observe the dead socket and drive the
                // reconnect from on_close
                warn!(
                    connection_id = %self.flow.connection_id,
                    "Failed to send preamble: {}", e
                );
            }
        }
    }

    async fn on_bytes(&self, data: Bytes) -> bool {
        let mut guard = self.ingress.lock().await;
        match guard.as_mut() {
            Some(writer) => match writer.write_all(&data).await {
                Ok(()) => true,
                Err(e) => {
                    debug!(
                        connection_id = %self.flow.connection_id,
                        "User-side write failed: {}", e
                    );
                    guard.take();
                    false
                }
            },
            None => false,
        }
    }

    async fn on_close(&self, error: Option<std::io::Error>) {
        self.flow.detach_egress().await;

        if self.flow.is_ingress_open() {
            debug!(
                connection_id = %self.flow.connection_id,
                error = ?error,
                "Tunnel leg lost, keeping user alive and reconnecting"
            );
            schedule_reconnect(self.clone());
        }
    }
}

async fn dial_peer(handler: PeerEgressHandler) {
    // Re-read the route on every dial so a backend IP pushed by the
    // control plane applies to this attempt
    let peer_addr = handler.route.read().unwrap().backend_addr();

    let dial_handler: Arc<dyn DialHandler> = Arc::new(handler.clone());
    if let Err(e) = handler.ctx.dialer.dial(&peer_addr, dial_handler).await {
        warn!(
            connection_id = %handler.flow.connection_id,
            listener = %handler.flow.route_id,
            "Failed to connect tunnel to {}: {}", peer_addr, e
        );
        if handler.flow.is_ingress_open() {
            schedule_reconnect(handler);
        }
    }
}

fn schedule_reconnect(handler: PeerEgressHandler) {
    tokio::spawn(async move {
        let delay = handler.flow.begin_reconnect_attempt();
        info!(
            connection_id = %handler.flow.connection_id,
            listener = %handler.flow.route_id,
            attempt = handler.flow.reconnect_attempts(),
            delay = ?delay,
            "Scheduling tunnel reconnect"
        );

        tokio::time::sleep(delay).await;

        if !handler.flow.is_ingress_open() {
            debug!(
                connection_id = %handler.flow.connection_id,
                "Ingress gone, abandoning reconnect"
            );
            return;
        }

        dial_peer(handler).await;
    });
}

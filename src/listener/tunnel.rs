//! Tunnel-entry role: the server side of a route
//!
//! An accepted connection comes from the peer node, not from a user. It
//! must identify itself with a preamble line before anything is dialed;
//! only then is the flow registered and the local backend connected. There
//! is no reconnection in this role: if the backend goes away the tunnel
//! connection is torn down and the peer redials with the same flow ID.

use super::{Context, READ_BUFFER_SIZE};
use crate::dialer::DialHandler;
use crate::flow::{Flow, FlowState};
use crate::routes::{ProxyMode, SharedRoute};
use crate::tunnel::Preamble;
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub(super) async fn handle_ingress(
    route: SharedRoute,
    ctx: Arc<Context>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let route_id = route.read().unwrap().route_id.clone();
    debug!(%peer, listener = %route_id, "New tunnel connection, awaiting connection ID");

    let (mut ingress_read, ingress_write) = stream.into_split();

    // awaiting_id: accumulate until the preamble line is complete
    let mut pending = Vec::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let (preamble, first_payload) = loop {
        let n = match ingress_read.read(&mut buf).await {
            Ok(0) => {
                debug!(%peer, "Tunnel connection closed before identifying");
                return;
            }
            Ok(n) => n,
            Err(e) => {
                debug!(%peer, "Tunnel read error while awaiting ID: {}", e);
                return;
            }
        };

        pending.extend_from_slice(&buf[..n]);
        match Preamble::parse(&pending) {
            Ok(Some((preamble, consumed))) => {
                let payload = pending.split_off(consumed);
                break (preamble, payload);
            }
            Ok(None) => continue,
            Err(e) => {
                warn!(%peer, listener = %route_id, "Rejecting tunnel connection: {}", e);
                return;
            }
        }
    };

    info!(
        connection_id = %preamble.connection_id,
        listener = %route_id,
        "Received connection ID from peer"
    );

    let flow = Arc::new(Flow::identified(
        preamble.connection_id.clone(),
        &route_id,
        preamble.proxy_info,
    ));

    if !ctx.flows.register(Arc::clone(&flow)) {
        warn!(
            connection_id = %flow.connection_id,
            "Connection ID already live, closing tunnel connection"
        );
        return;
    }

    // The ingress task owns the registration; every exit below funnels
    // through this single unregister
    relay(route, &ctx, &flow, &mut ingress_read, ingress_write, first_payload, &mut buf).await;

    ctx.flows.unregister(&flow.connection_id);
    flow.mark_ingress_closed();
    flow.shutdown_egress().await;
    debug!(connection_id = %flow.connection_id, "Tunnel connection closed");
}

async fn relay(
    route: SharedRoute,
    ctx: &Arc<Context>,
    flow: &Arc<Flow>,
    ingress_read: &mut OwnedReadHalf,
    ingress_write: OwnedWriteHalf,
    first_payload: Vec<u8>,
    buf: &mut [u8],
) {
    let (backend_addr, proxy_mode) = {
        let route = route.read().unwrap();
        (route.backend_addr(), route.haproxy)
    };

    // The backend sees a PROXY header ahead of any forwarded bytes when
    // the route asks for one and the peer supplied the client tuple
    let prefix = match (proxy_mode, flow.proxy_info()) {
        (ProxyMode::V1, Some(info)) => info.emit_v1(),
        (ProxyMode::V2, Some(info)) => info.emit_v2(),
        _ => Vec::new(),
    };

    let handler: Arc<dyn DialHandler> = Arc::new(BackendEgressHandler {
        flow: Arc::clone(flow),
        ingress: Arc::new(Mutex::new(Some(ingress_write))),
        prefix,
    });

    if let Err(e) = ctx.dialer.dial(&backend_addr, handler).await {
        warn!(
            connection_id = %flow.connection_id,
            "Failed to connect to backend {}: {}", backend_addr, e
        );
        return;
    }

    flow.set_state(FlowState::Relaying);

    if !first_payload.is_empty() {
        flow.forward_or_queue(&first_payload).await;
    }

    loop {
        tokio::select! {
            result = ingress_read.read(buf) => match result {
                Ok(0) => break,
                Ok(n) => {
                    flow.forward_or_queue(&buf[..n]).await;
                }
                Err(e) => {
                    debug!(connection_id = %flow.connection_id, "Tunnel read error: {}", e);
                    break;
                }
            },
            _ = flow.closed() => {
                debug!(
                    connection_id = %flow.connection_id,
                    "Backend gone, tearing down tunnel connection"
                );
                break;
            }
        }
    }
}

/// Egress-side callbacks for the backend leg of one flow
struct BackendEgressHandler {
    flow: Arc<Flow>,
    ingress: Arc<Mutex<Option<OwnedWriteHalf>>>,
    prefix: Vec<u8>,
}

#[async_trait]
impl DialHandler for BackendEgressHandler {
    async fn on_open(&self, writer: OwnedWriteHalf) {
        match self.flow.attach_egress(writer, &self.prefix).await {
            Ok(()) => {
                info!(
                    connection_id = %self.flow.connection_id,
                    listener = %self.flow.route_id,
                    "Backend connected"
                );
            }
            Err(e) => {
                warn!(
                    connection_id = %self.flow.connection_id,
                    "Failed to write backend prefix: {}", e
                );
                self.flow.request_close();
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
                        "Tunnel-side write failed: {}", e
                    );
                    guard.take();
                    false
                }
            },
            None => false,
        }
    }

    async fn on_close(&self, error: Option<std::io::Error>) {
        debug!(
            connection_id = %self.flow.connection_id,
            error = ?error,
            "Backend disconnected"
        );
        self.flow.detach_egress().await;
        self.flow.request_close();
    }
}

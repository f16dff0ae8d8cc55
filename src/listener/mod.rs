//! Dual-mode listener
//!
//! A listener is bound to one route and runs one of two roles:
//!
//! - `PublicEntry` (client side): accepts end users, opens a tunnel
//!   connection to the peer node per flow, and prepends the connection-ID
//!   preamble.
//! - `TunnelEntry` (server side): accepts peer-node connections, consumes
//!   the preamble, registers the flow, and dials the final backend.
//!
//! Each accepted connection runs on its own task; all shared state travels
//! through an explicit [`Context`] rather than process globals.

mod public;
mod tunnel;

use crate::dialer::Dialer;
use crate::flow::FlowRegistry;
use crate::routes::{RouteStore, SharedRoute};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Read buffer size for ingress pumps
pub(crate) const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Shared runtime state handed to every listener
pub struct Context {
    pub routes: Arc<RouteStore>,
    pub flows: Arc<FlowRegistry>,
    pub dialer: Dialer,
}

impl Context {
    pub fn new(routes: Arc<RouteStore>) -> Arc<Self> {
        Arc::new(Self {
            routes,
            flows: Arc::new(FlowRegistry::new()),
            dialer: Dialer::new(),
        })
    }
}

/// Which side of the tunnel this listener serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerRole {
    /// Client side: accepts end users
    PublicEntry,
    /// Server side: accepts peer-node tunnel connections
    TunnelEntry,
}

/// A bound, route-scoped TCP listener
pub struct Listener {
    route: SharedRoute,
    role: ListenerRole,
    ctx: Arc<Context>,
    socket: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    /// Bind the route's address. A failed bind is fatal to startup, so the
    /// error propagates instead of being retried.
    pub async fn bind(
        route: SharedRoute,
        role: ListenerRole,
        ctx: Arc<Context>,
    ) -> std::io::Result<Self> {
        let (route_id, bind_addr) = {
            let route = route.read().unwrap();
            (route.route_id.clone(), route.bind_addr())
        };

        let socket = TcpListener::bind(&bind_addr).await?;
        let local_addr = socket.local_addr()?;

        info!(
            listener = %route_id,
            addr = %local_addr,
            role = ?role,
            "Listener is now listening"
        );

        Ok(Self {
            route,
            role,
            ctx,
            socket,
            local_addr,
        })
    }

    /// The actually bound address (relevant when the route binds port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections forever, spawning a pump task per connection
    pub async fn serve(self) {
        loop {
            match self.socket.accept().await {
                Ok((stream, peer)) => {
                    stream.set_nodelay(true).ok();

                    let route = Arc::clone(&self.route);
                    let ctx = Arc::clone(&self.ctx);
                    match self.role {
                        ListenerRole::PublicEntry => {
                            tokio::spawn(public::handle_ingress(route, ctx, stream, peer));
                        }
                        ListenerRole::TunnelEntry => {
                            tokio::spawn(tunnel::handle_ingress(route, ctx, stream, peer));
                        }
                    }
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }
}

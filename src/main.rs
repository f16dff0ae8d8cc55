//! Backhaul node
//!
//! One binary, two roles:
//! - `--type client`: runs next to the backends, opens the user-facing
//!   listeners, tunnels flows out to the server, and serves the HTTP
//!   control plane.
//! - `--type server`: runs at the stable public address, accepts tunnel
//!   connections, dials the final backends, and pushes public-IP changes
//!   back to the client.

use anyhow::{Context as AnyhowContext, Result};
use backhaul::config::{ClientConfig, ServerConfig, CONFIG_FILE};
use backhaul::control::{self, TOKEN_FILE};
use backhaul::ip::{Discovery, IpMonitor, Notifier};
use backhaul::listener::{Context, Listener, ListenerRole};
use backhaul::routes::{RouteStore, SharedRoute, ROUTES_FILE};
use clap::{Parser, ValueEnum};
use std::sync::Arc;
use tracing::{error, info};

/// Fixed worker pool servicing all sockets
const WORKER_THREADS: usize = 16;

/// Backhaul - bidirectional TCP tunnel for backends behind NAT
#[derive(Parser, Debug)]
#[command(name = "backhaul")]
#[command(about = "Bidirectional TCP tunnel for backends behind NAT")]
#[command(version)]
struct Args {
    /// Node role
    #[arg(long = "type", value_enum)]
    node_type: NodeType,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum NodeType {
    Client,
    Server,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&args.log_level))
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(WORKER_THREADS)
        .enable_all()
        .build()
        .context("Failed to build runtime")?;

    runtime.block_on(run(args))
}

async fn run(args: Args) -> Result<()> {
    info!("Backhaul v{} starting as {:?}", backhaul::VERSION, args.node_type);

    let store = Arc::new(RouteStore::load(ROUTES_FILE).context("Failed to load routes")?);
    info!("Loaded {} routes", store.len());

    let ctx = Context::new(Arc::clone(&store));

    let role = match args.node_type {
        NodeType::Client => ListenerRole::PublicEntry,
        NodeType::Server => ListenerRole::TunnelEntry,
    };

    // Bind every listener up front: a route we cannot bind is fatal,
    // not something to limp along without
    let mut routes: Vec<SharedRoute> = Vec::new();
    store.each(|route| routes.push(Arc::clone(route)));

    let mut listeners = Vec::new();
    for route in routes {
        let route_id = route.read().unwrap().route_id.clone();
        let listener = Listener::bind(route, role, Arc::clone(&ctx))
            .await
            .with_context(|| format!("Failed to start listener {}", route_id))?;
        listeners.push(listener);
    }

    for listener in listeners {
        tokio::spawn(listener.serve());
    }

    let token = control::read_token(TOKEN_FILE).context("Failed to read bearer token")?;

    match args.node_type {
        NodeType::Client => {
            let config = ClientConfig::load(CONFIG_FILE).context("Failed to load client config")?;

            let control_plane =
                tokio::spawn(control::serve(store, token, config.http_port));

            tokio::select! {
                result = control_plane => {
                    // The control plane only returns on failure
                    result
                        .context("Control plane task panicked")?
                        .context("Control plane failed")?;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutting down...");
                }
            }
        }
        NodeType::Server => {
            let config = ServerConfig::load(CONFIG_FILE).context("Failed to load server config")?;

            let notifier = Notifier::new(&config.client_endpoint, &token);
            if let Err(e) = notifier.probe().await {
                error!("Client control plane not reachable yet: {}", e);
            }

            let monitor = IpMonitor::new(Discovery::new(), notifier, config.ip_check_interval);
            tokio::spawn(monitor.run(store));

            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for shutdown signal")?;
            info!("Shutting down...");
        }
    }

    Ok(())
}

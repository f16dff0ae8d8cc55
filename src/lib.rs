//! # Backhaul
//!
//! A bidirectional TCP tunnel with a paired client/server topology.
//!
//! The *client* runs next to the backend services it fronts (typically
//! behind NAT with a dynamic IP); the *server* runs at a stable public
//! address. End users connect to the public-side listeners; their byte
//! streams travel through client-initiated TCP connections, identified by
//! per-flow connection IDs, and are delivered to backends only reachable
//! from the client side.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Control Plane                       │
//! │      (route updates, IP-change notifications)        │
//! ├─────────────────────────────────────────────────────┤
//! │                  Listener Layer                      │
//! │     (public entry / tunnel entry, flow registry)     │
//! ├─────────────────────────────────────────────────────┤
//! │                  Tunnel Layer                        │
//! │      (connection-ID preamble, PROXY protocol)        │
//! ├─────────────────────────────────────────────────────┤
//! │                  Transport Layer                     │
//! │            (plain TCP, outbound dialer)              │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod control;
pub mod dialer;
pub mod flow;
pub mod ip;
pub mod listener;
pub mod proxy_protocol;
pub mod routes;
pub mod tunnel;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Route store error: {0}")]
    Routes(#[from] routes::RouteError),

    #[error("PROXY protocol error: {0}")]
    ProxyProtocol(#[from] proxy_protocol::ProxyProtocolError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Dial error: {0}")]
    Dial(#[from] dialer::DialError),

    #[error("IP monitor error: {0}")]
    Ip(#[from] ip::IpError),

    #[error("Control plane error: {0}")]
    Control(#[from] control::ControlError),
}

//! Public-IP monitoring (server role)
//!
//! The server periodically discovers its own public IP and, whenever it
//! changes, pushes the new address plus the full route-ID set to the
//! client's control plane. The client rewrites its tunnel targets so the
//! next dials land on the server's new address.
//!
//! The first successful reading always counts as a change, and a change is
//! only considered delivered once the client acknowledged it, so a failed
//! push is retried on the next tick. No failure stops the loop.

mod discovery;
mod notifier;

pub use discovery::{Discovery, DISCOVERY_ENDPOINT};
pub use notifier::{IpUpdateRequest, IpUpdateResponse, Notifier};

use crate::routes::RouteStore;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

/// IP monitoring errors
#[derive(Debug, Error)]
pub enum IpError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("discovery endpoint returned status {0}")]
    DiscoveryStatus(u16),

    #[error("empty IP response from discovery endpoint")]
    EmptyResponse,

    #[error("no routes found to update")]
    NoRoutes,

    #[error("client returned status {0} for IP update")]
    NotifyStatus(u16),

    #[error("client rejected IP update: {0}")]
    Rejected(String),
}

/// Periodic discovery + notification loop
pub struct IpMonitor {
    discovery: Discovery,
    notifier: Notifier,
    check_interval: Duration,
    /// Last IP the client acknowledged
    acknowledged_ip: Option<String>,
}

impl IpMonitor {
    pub fn new(discovery: Discovery, notifier: Notifier, check_interval_secs: u64) -> Self {
        Self {
            discovery,
            notifier,
            check_interval: Duration::from_secs(check_interval_secs),
            acknowledged_ip: None,
        }
    }

    /// One discovery/notify round. Returns the new IP if a change was
    /// delivered to the client.
    pub async fn tick(&mut self, store: &RouteStore) -> Result<Option<String>, IpError> {
        let current = self.discovery.public_ip().await?;

        if self.acknowledged_ip.as_deref() == Some(current.as_str()) {
            return Ok(None);
        }

        info!(
            old = self.acknowledged_ip.as_deref().unwrap_or("<none>"),
            new = %current,
            "Public IP changed"
        );

        self.notifier.notify_ip_change(store, &current).await?;
        self.acknowledged_ip = Some(current.clone());
        Ok(Some(current))
    }

    /// Run forever: an immediate initial check, then one per interval.
    /// Failures are logged and retried next tick.
    pub async fn run(mut self, store: Arc<RouteStore>) {
        let mut interval = tokio::time::interval(self.check_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            if let Err(e) = self.tick(&store).await {
                error!("IP check failed: {}", e);
            }
        }
    }
}

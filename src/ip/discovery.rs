//! Public-IP discovery

use super::IpError;
use std::time::Duration;
use tracing::debug;

/// External discovery endpoint; returns the caller's public IPv4 address
/// as a bare text line
pub const DISCOVERY_ENDPOINT: &str = "https://checkip.amazonaws.com";

/// Per-attempt discovery timeout
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Fetches the public IP from an external endpoint
pub struct Discovery {
    client: reqwest::Client,
    endpoint: String,
}

impl Default for Discovery {
    fn default() -> Self {
        Self::new()
    }
}

impl Discovery {
    pub fn new() -> Self {
        Self::with_endpoint(DISCOVERY_ENDPOINT)
    }

    /// Point discovery at a different endpoint (tests use a local one)
    pub fn with_endpoint(endpoint: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(DISCOVERY_TIMEOUT)
            .build()
            .expect("failed to build HTTP client");

        Self {
            client,
            endpoint: endpoint.to_string(),
        }
    }

    /// One discovery attempt
    pub async fn public_ip(&self) -> Result<String, IpError> {
        let response = self.client.get(&self.endpoint).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(IpError::DiscoveryStatus(status.as_u16()));
        }

        let body = response.text().await?;
        let ip = body.trim();
        if ip.is_empty() {
            return Err(IpError::EmptyResponse);
        }

        debug!(ip = %ip, "Discovered public IP");
        Ok(ip.to_string())
    }
}

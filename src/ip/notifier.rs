//! IP-change notification to the paired client

use super::IpError;
use crate::routes::RouteStore;
use reqwest::header::AUTHORIZATION;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

/// Per-attempt notify timeout
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(15);

/// Body of `POST /api/ip/update`
#[derive(Debug, Serialize, Deserialize)]
pub struct IpUpdateRequest {
    pub endpoints: Vec<String>,
    #[serde(rename = "new-ip")]
    pub new_ip: String,
}

/// Response body of `POST /api/ip/update`
#[derive(Debug, Serialize, Deserialize)]
pub struct IpUpdateResponse {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

/// Pushes IP updates to the client's control plane
pub struct Notifier {
    client: reqwest::Client,
    client_endpoint: String,
    bearer_token: String,
}

impl Notifier {
    pub fn new(client_endpoint: &str, token: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(NOTIFY_TIMEOUT)
            .build()
            .expect("failed to build HTTP client");

        Self {
            client,
            client_endpoint: client_endpoint.trim_end_matches('/').to_string(),
            bearer_token: format!("Bearer {}", token),
        }
    }

    /// Tell the client about a new public IP, listing every route it
    /// should repoint
    pub async fn notify_ip_change(&self, store: &RouteStore, new_ip: &str) -> Result<(), IpError> {
        let endpoints = store.route_ids();
        if endpoints.is_empty() {
            return Err(IpError::NoRoutes);
        }

        let request = IpUpdateRequest {
            endpoints: endpoints.clone(),
            new_ip: new_ip.to_string(),
        };

        let url = format!("{}/api/ip/update", self.client_endpoint);
        let response = self
            .client
            .post(&url)
            .header(AUTHORIZATION, &self.bearer_token)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(IpError::NotifyStatus(status.as_u16()));
        }

        let body: IpUpdateResponse = response.json().await?;
        if !body.success {
            return Err(IpError::Rejected(body.message));
        }

        info!(
            new_ip = %new_ip,
            endpoints = ?endpoints,
            "Notified client of IP change"
        );
        Ok(())
    }

    /// Reachability probe against the client's health endpoint
    pub async fn probe(&self) -> Result<(), IpError> {
        let url = format!("{}/api/health", self.client_endpoint);
        let response = self.client.get(&url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(IpError::NotifyStatus(status.as_u16()));
        }
        Ok(())
    }
}

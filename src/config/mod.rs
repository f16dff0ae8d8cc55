//! Configuration management
//!
//! Both roles read `config.json` from the working directory. A missing
//! file is not an error: the defaults are written out and used, so a fresh
//! deployment starts with a file the operator can edit.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Default config file name, relative to the working directory
pub const CONFIG_FILE: &str = "config.json";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[source] std::io::Error),

    #[error("failed to write config: {0}")]
    Write(#[source] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Client-role configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Port the control-plane HTTP server listens on
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
        }
    }
}

/// Server-role configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP endpoint of the paired client's control plane
    #[serde(default = "default_client_endpoint")]
    pub client_endpoint: String,
    /// Public-IP polling interval in seconds
    #[serde(default = "default_ip_check_interval")]
    pub ip_check_interval: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            client_endpoint: default_client_endpoint(),
            ip_check_interval: default_ip_check_interval(),
        }
    }
}

fn default_http_port() -> u16 {
    8080
}

fn default_client_endpoint() -> String {
    // Placeholder the operator must replace with the client's address
    "http://YOUR_VPS_IP:8080".to_string()
}

fn default_ip_check_interval() -> u64 {
    300
}

impl ClientConfig {
    /// Load client configuration, writing defaults if the file is missing
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        load_or_default(path)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        save(self, path)
    }
}

impl ServerConfig {
    /// Load server configuration, writing defaults if the file is missing
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        load_or_default(path)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        save(self, path)
    }
}

fn load_or_default<T, P>(path: P) -> Result<T, ConfigError>
where
    T: Default + Serialize + for<'de> Deserialize<'de>,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    if !path.exists() {
        let config = T::default();
        save(&config, path)?;
        return Ok(config);
    }

    let content = std::fs::read_to_string(path).map_err(ConfigError::Read)?;
    Ok(serde_json::from_str(&content)?)
}

fn save<T: Serialize, P: AsRef<Path>>(config: &T, path: P) -> Result<(), ConfigError> {
    let content = serde_json::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(ConfigError::Write)
}

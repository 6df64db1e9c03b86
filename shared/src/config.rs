//! Configuration file parser for burrow.
//!
//! Both binaries read the same YAML shape; the server validates the
//! `tunnel_server` section and the client validates `tunnel_client`.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub app: AppConfig,

    #[serde(default)]
    pub tunnel_server: TunnelServerConfig,

    #[serde(default)]
    pub tunnel_client: TunnelClientConfig,
}

/// Application identity and environment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_app_name")]
    pub name: String,

    #[serde(default)]
    pub version: String,

    /// "production" drops the default log level from debug to info
    #[serde(default = "default_env")]
    pub env: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            version: String::new(),
            env: default_env(),
        }
    }
}

impl AppConfig {
    pub fn is_production(&self) -> bool {
        self.env == "production"
    }
}

/// Public server settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TunnelServerConfig {
    /// Public HTTP port; required on the server
    #[serde(default)]
    pub port: u16,

    /// Public raw-TCP port; 0 disables TCP ingress
    #[serde(default)]
    pub tcp_port: u16,

    /// Route every request to the first tunnel instead of requiring
    /// the /tunnel/{id}/ prefix
    #[serde(default)]
    pub private_use: bool,
}

/// Private-side client settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TunnelClientConfig {
    /// WebSocket URL of the server control endpoint, e.g. ws://host:8080/ws
    #[serde(default)]
    pub server_url: String,

    /// Proposed tunnel ID; the server generates one when absent
    pub tunnel_id: Option<String>,

    /// Local HTTP base for web/SSE/WebSocket traffic, e.g. http://localhost:3000
    #[serde(default)]
    pub target_url: String,

    /// Local host:port for raw TCP bridging
    pub tcp_target: Option<String>,
}

fn default_app_name() -> String {
    "burrow".to_string()
}

fn default_env() -> String {
    "development".to_string()
}

impl Config {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading {}: {e}", path.display())))?;
        serde_yaml::from_str(&content)
            .map_err(|e| Error::Config(format!("parsing {}: {e}", path.display())))
    }

    /// Validate the fields the server needs
    pub fn validate_server(&self) -> Result<()> {
        if self.tunnel_server.port == 0 {
            return Err(Error::Config("tunnel_server.port is not set".into()));
        }
        Ok(())
    }

    /// Validate the fields the client needs
    pub fn validate_client(&self) -> Result<()> {
        if self.tunnel_client.server_url.is_empty() {
            return Err(Error::Config("tunnel_client.server_url is not set".into()));
        }
        if self.tunnel_client.target_url.is_empty() {
            return Err(Error::Config("tunnel_client.target_url is not set".into()));
        }
        Ok(())
    }
}

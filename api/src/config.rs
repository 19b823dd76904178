//! Service configuration

use ispgate_billing::WebhookConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Config file consulted when `ISPGATE_CONFIG` is unset
pub const DEFAULT_CONFIG_PATH: &str = "/etc/ispgate/ispgate.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
}

/// Service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// HTTP listen address
    pub listen_addr: String,
    /// Log filter used when `RUST_LOG` is unset
    pub log_filter: String,
    /// Public base URL the provider calls back on
    pub callback_base_url: String,
    /// Bound on every provider request
    pub gateway_timeout_secs: u64,
    /// Billing event webhook; events are only logged when absent
    pub notifications: Option<WebhookConfig>,
    /// JSON fixture of tenants, packages and subscribers
    pub seed_path: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".into(),
            log_filter: "info".into(),
            callback_base_url: "http://localhost:8080".into(),
            gateway_timeout_secs: 30,
            notifications: None,
            seed_path: None,
        }
    }
}

impl ServiceConfig {
    /// Path from `ISPGATE_CONFIG`, else [`DEFAULT_CONFIG_PATH`]
    pub fn path() -> String {
        std::env::var("ISPGATE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into())
    }

    /// Load from file
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        Self::parse(path, &content)
    }

    fn parse(path: &str, content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// Apply `ISPGATE_LISTEN_ADDR` and `ISPGATE_SEED_PATH`
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(
            std::env::var("ISPGATE_LISTEN_ADDR").ok(),
            std::env::var("ISPGATE_SEED_PATH").ok(),
        )
    }

    fn with_overrides(mut self, listen_addr: Option<String>, seed_path: Option<String>) -> Self {
        if let Some(addr) = listen_addr.filter(|a| !a.trim().is_empty()) {
            self.listen_addr = addr;
        }
        if let Some(path) = seed_path.filter(|p| !p.trim().is_empty()) {
            self.seed_path = Some(path);
        }
        self
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway_timeout_secs.max(1))
    }
}

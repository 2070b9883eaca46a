use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub gateway: GatewaySection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct GatewaySection {
    /// Robustness fallback: emit full member-list SYNCs instead of
    /// incremental edits.
    #[serde(default)]
    pub sync_only_member_lists: bool,
}

impl Config {
    /// Load from a TOML file; a missing file yields the defaults.
    pub fn load(path: &str) -> Result<Self> {
        if !Path::new(path).exists() {
            tracing::info!(path, "config file not found, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {path}"))?;
        toml::from_str(&raw).with_context(|| format!("failed to parse config file {path}"))
    }

    pub fn gateway_config(&self) -> halyard_core::GatewayConfig {
        let sync_only_env = std::env::var("HALYARD_SYNC_ONLY_MEMBER_LISTS")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        halyard_core::GatewayConfig {
            sync_only_member_lists: self.gateway.sync_only_member_lists || sync_only_env,
            ..halyard_core::GatewayConfig::default()
        }
    }
}

//! Agent configuration
//!
//! Read from TOML: `MESH_AGENT_CONFIG` when set, otherwise
//! `<config dir>/mesh-agent/config.toml`. A missing file means defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_ENV: &str = "MESH_AGENT_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub coordinator_url: String,
    /// Hostname when absent.
    pub node_id: Option<String>,
    pub role: Option<String>,
    pub capabilities: Vec<String>,
    pub vpn_ip: Option<String>,
    pub ssh_user: Option<String>,
    /// Address the coordinator should use for SSH; the detected IP otherwise.
    pub management_address: Option<String>,
    pub interval_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            coordinator_url: "http://127.0.0.1:8004".to_string(),
            node_id: None,
            role: None,
            capabilities: Vec::new(),
            vpn_ip: None,
            ssh_user: None,
            management_address: None,
            interval_secs: 30,
            request_timeout_secs: 10,
        }
    }
}

impl AgentConfig {
    /// Load config from `MESH_AGENT_CONFIG` or the OS-specific location
    pub async fn load() -> Result<Self> {
        let path = match std::env::var_os(CONFIG_ENV) {
            Some(p) => PathBuf::from(p),
            None => Self::config_file_path()?,
        };
        Self::load_from(&path).await
    }

    pub async fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::warn!("no agent config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: AgentConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !(self.coordinator_url.starts_with("http://") || self.coordinator_url.starts_with("https://")) {
            anyhow::bail!("coordinator_url must be an http(s) URL, got {:?}", self.coordinator_url);
        }
        if self.interval_secs == 0 {
            anyhow::bail!("interval_secs must be at least 1");
        }
        if self.request_timeout_secs == 0 {
            anyhow::bail!("request_timeout_secs must be at least 1");
        }
        Ok(())
    }

    /// Get OS-specific config file path
    pub fn config_file_path() -> Result<PathBuf> {
        let mut path = dirs::config_dir().ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        path.push("mesh-agent");
        path.push("config.toml");
        Ok(path)
    }

    pub fn node_id_or(&self, hostname: &str) -> String {
        match self.node_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => hostname.to_string(),
        }
    }

    pub fn handshake_url(&self) -> String {
        format!("{}/handshake", self.coordinator_url.trim_end_matches('/'))
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

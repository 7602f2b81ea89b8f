/**
 * CONFIGURATION KERNEL - Objet statique chargé au démarrage
 *
 * RÔLE : Plages de scan, ports de services, timeouts, fenêtre de liveness,
 * limites de débit, table des acteurs autorisés et paramètres du contrôleur
 * d'alimentation (SSH + Wake-on-LAN).
 *
 * FONCTIONNEMENT :
 * - YAML lu depuis $MESH_KERNEL_CONFIG (défaut : kernel.yaml)
 * - Fichier absent → configuration par défaut (loopback uniquement)
 * - Fichier invalide ou validation échouée → erreur fatale
 */

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;
use tokio::fs;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid CIDR '{range}': {reason}")]
    InvalidCidr { range: String, reason: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub listen: String,
    pub scan_ranges: Vec<String>,
    pub service_ports: BTreeMap<String, u16>,
    pub health_path: String,
    pub scan_timeout_ms: u64,
    pub probe_request_timeout_ms: u64,
    pub scan_concurrency: usize,
    pub scan_interval_secs: u64,
    pub health_interval_secs: u64,
    pub selection_cache_ttl_secs: u64,
    pub liveness_timeout_secs: u64,
    pub node_report_interval_secs: u64,
    pub approval_window_secs: u64,
    pub rate_limit_hourly: usize,
    pub rate_limit_daily: usize,
    pub actors: Vec<ActorConf>,
    pub action_levels: HashMap<String, u8>,
    pub require_approval: Vec<String>,
    pub power: PowerConf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorConf {
    pub actor_id: String,
    pub role: String,
    pub level: u8,
    pub allowed_actions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerConf {
    pub ssh_user: String,
    pub ssh_key: Option<String>,
    pub ssh_connect_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
    pub status_timeout_secs: u64,
    pub broadcast: Ipv4Addr,
    pub wol_port: u16,
    /// Inventaire statique utilisé quand le nœud n'a jamais fait de handshake.
    pub hosts: HashMap<String, HostConf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConf {
    pub mac: Option<String>,
    pub address: Option<String>,
    pub broadcast: Option<Ipv4Addr>,
}

fn default_service_ports() -> BTreeMap<String, u16> {
    [
        ("llm-server", 8001),
        ("stt-service", 8002),
        ("tts-service", 8003),
        ("mesh-coordinator", 8004),
        ("web-interface", 8080),
    ]
    .into_iter()
    .map(|(name, port)| (name.to_string(), port))
    .collect()
}

fn default_action_levels() -> HashMap<String, u8> {
    [
        ("shutdown", 80),
        ("wakeup", 50),
        ("status", 10),
        ("approve", 80),
        ("cancel", 50),
        ("audit", 90),
    ]
    .into_iter()
    .map(|(action, level)| (action.to_string(), level))
    .collect()
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8004".into(),
            scan_ranges: Vec::new(),
            service_ports: default_service_ports(),
            health_path: "/health".into(),
            scan_timeout_ms: 2_000,
            probe_request_timeout_ms: 1_500,
            scan_concurrency: 50,
            scan_interval_secs: 300,
            health_interval_secs: 30,
            selection_cache_ttl_secs: 300,
            liveness_timeout_secs: 300,
            node_report_interval_secs: 60,
            approval_window_secs: 300,
            rate_limit_hourly: 10,
            rate_limit_daily: 50,
            actors: Vec::new(),
            action_levels: default_action_levels(),
            require_approval: vec!["shutdown".into()],
            power: PowerConf::default(),
        }
    }
}

impl Default for PowerConf {
    fn default() -> Self {
        Self {
            ssh_user: "mesh".into(),
            ssh_key: None,
            ssh_connect_timeout_secs: 10,
            shutdown_timeout_secs: 15,
            status_timeout_secs: 5,
            broadcast: Ipv4Addr::BROADCAST,
            wol_port: 9,
            hosts: HashMap::new(),
        }
    }
}

/// Trente jours.
pub const MAX_LIVENESS_TIMEOUT_SECS: u64 = 30 * 24 * 3600;

impl MeshConfig {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn probe_request_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_request_timeout_ms)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn selection_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.selection_cache_ttl_secs)
    }

    pub fn liveness_timeout(&self) -> time::Duration {
        time::Duration::seconds(i64::try_from(self.liveness_timeout_secs).unwrap_or(i64::MAX))
    }

    pub fn node_report_interval(&self) -> Duration {
        Duration::from_secs(self.node_report_interval_secs)
    }

    pub fn approval_window(&self) -> Duration {
        Duration::from_secs(self.approval_window_secs)
    }

    /// Parse toutes les plages configurées ; la première invalide est fatale.
    pub fn parsed_ranges(&self) -> Result<Vec<Ipv4Net>, ConfigError> {
        self.scan_ranges.iter().map(|r| parse_cidr(r)).collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.parsed_ranges()?;

        if self.scan_concurrency == 0 {
            return Err(ConfigError::Invalid("scan_concurrency must be > 0".into()));
        }
        if self.rate_limit_hourly == 0 || self.rate_limit_daily == 0 {
            return Err(ConfigError::Invalid("rate limits must be > 0".into()));
        }
        if self.probe_request_timeout_ms > self.scan_timeout_ms {
            return Err(ConfigError::Invalid(
                "probe_request_timeout_ms must not exceed scan_timeout_ms".into(),
            ));
        }
        for (key, secs) in [
            ("scan_interval_secs", self.scan_interval_secs),
            ("health_interval_secs", self.health_interval_secs),
            ("node_report_interval_secs", self.node_report_interval_secs),
            ("approval_window_secs", self.approval_window_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::Invalid(format!("{key} must be > 0")));
            }
        }
        if self.liveness_timeout_secs == 0 || self.liveness_timeout_secs > MAX_LIVENESS_TIMEOUT_SECS {
            return Err(ConfigError::Invalid(format!(
                "liveness_timeout_secs must be between 1 and {MAX_LIVENESS_TIMEOUT_SECS}"
            )));
        }
        if !self.health_path.starts_with('/') {
            return Err(ConfigError::Invalid("health_path must start with '/'".into()));
        }

        let mut seen = HashSet::new();
        for actor in &self.actors {
            if actor.actor_id.trim().is_empty() {
                return Err(ConfigError::Invalid("actor_id must not be empty".into()));
            }
            if !seen.insert(actor.actor_id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate actor '{}'",
                    actor.actor_id
                )));
            }
        }
        Ok(())
    }
}

pub fn parse_cidr(range: &str) -> Result<Ipv4Net, ConfigError> {
    range
        .trim()
        .parse::<Ipv4Net>()
        .map_err(|e| ConfigError::InvalidCidr {
            range: range.to_string(),
            reason: e.to_string(),
        })
}

pub fn parse_config(txt: &str, origin: &str) -> Result<MeshConfig, ConfigError> {
    if txt.trim().is_empty() {
        return Ok(MeshConfig::default());
    }
    let cfg: MeshConfig = serde_yaml::from_str(txt).map_err(|source| ConfigError::Yaml {
        path: origin.to_string(),
        source,
    })?;
    cfg.validate()?;
    Ok(cfg)
}

pub async fn load_config() -> Result<MeshConfig, ConfigError> {
    let path = std::env::var("MESH_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    if !Path::new(&path).exists() {
        tracing::warn!("no {} found, using default configuration (loopback scan only)", path);
        return Ok(MeshConfig::default());
    }
    let txt = fs::read_to_string(&path).await.map_err(|source| ConfigError::Io {
        path: path.clone(),
        source,
    })?;
    parse_config(&txt, &path)
}

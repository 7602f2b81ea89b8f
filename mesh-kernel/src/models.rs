use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::power::parse_mac;

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Discovered,
    Healthy,
    Unhealthy,
    Unreachable,
}

impl ServiceStatus {
    /// `discovered` n'est qu'un état initial : on en sort, on n'y revient jamais.
    pub fn can_transition_to(self, next: ServiceStatus) -> bool {
        next != ServiceStatus::Discovered
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceStatus::Discovered => "discovered",
            ServiceStatus::Healthy => "healthy",
            ServiceStatus::Unhealthy => "unhealthy",
            ServiceStatus::Unreachable => "unreachable",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Localhost,
    Network,
}

/// Vue par adresse des instances vues par le scan (`GET /mesh/nodes`).
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredHost {
    pub address: IpAddr,
    pub origin: Origin,
    /// Noms des services sains sur cette adresse.
    pub available_services: Vec<String>,
    /// Tous les noms connus, quel que soit l'état.
    pub known_services: Vec<String>,
    /// Dernière vérification réussie d'une de ses instances.
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_seen: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceKey {
    pub name: String,
    pub address: IpAddr,
    pub port: u16,
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.name, self.address, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceInstance {
    pub name: String,
    pub address: IpAddr,
    pub port: u16,
    pub url: String,
    pub status: ServiceStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub last_check: OffsetDateTime,
    #[serde(rename = "latency_ms", with = "duration_ms")]
    pub latency: Duration,
    pub origin: Origin,
    #[serde(with = "time::serde::rfc3339")]
    pub discovered_at: OffsetDateTime,
}

impl ServiceInstance {
    pub fn new(name: &str, address: IpAddr, port: u16, origin: Origin, now: OffsetDateTime) -> Self {
        Self {
            name: name.to_string(),
            address,
            port,
            url: format!("http://{}", std::net::SocketAddr::new(address, port)),
            status: ServiceStatus::Discovered,
            last_check: now,
            latency: Duration::ZERO,
            origin,
            discovered_at: now,
        }
    }

    pub fn key(&self) -> InstanceKey {
        InstanceKey {
            name: self.name.clone(),
            address: self.address,
            port: self.port,
        }
    }
}

/// Latences exposées en millisecondes (f64) dans l'API JSON.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64() * 1000.0)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = f64::deserialize(d)?;
        if !ms.is_finite() || ms < 0.0 {
            return Err(serde::de::Error::custom("latency must be a positive number"));
        }
        Ok(Duration::from_secs_f64(ms / 1000.0))
    }
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeRecord {
    pub node_id: String,
    pub status: String,
    pub ip: Option<IpAddr>,
    pub vpn_ip: Option<IpAddr>,
    pub role: Option<String>,
    pub capabilities: BTreeSet<String>,
    pub system_info: serde_json::Value,
    pub mac: Option<String>,
    pub management_address: Option<String>,
    pub ssh_user: Option<String>,
    /// Horodatage annoncé par le nœud lui-même (informatif).
    #[serde(with = "time::serde::rfc3339")]
    pub reported_at: OffsetDateTime,
    /// Heure de réception côté coordinateur ; seule base de la liveness.
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub registered_at: OffsetDateTime,
}

impl NodeRecord {
    /// Adresse de gestion (SSH) : explicite, sinon IP LAN, sinon IP VPN.
    pub fn management_target(&self) -> Option<String> {
        self.management_address
            .clone()
            .or_else(|| self.ip.map(|ip| ip.to_string()))
            .or_else(|| self.vpn_ip.map(|ip| ip.to_string()))
    }
}

/// Corps brut de POST /handshake : tout est optionnel ici, la validation
/// décide ensuite de ce qui est requis.
#[derive(Debug, Default, Deserialize)]
pub struct HandshakeRequest {
    pub node_id: Option<String>,
    pub timestamp: Option<String>,
    pub status: Option<String>,
    pub ip: Option<String>,
    pub vpn_ip: Option<String>,
    pub role: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub system_info: Option<serde_json::Value>,
    pub mac: Option<String>,
    pub management_address: Option<String>,
    pub ssh_user: Option<String>,
}

/// Handshake dont les champs requis sont présents et bien formés.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub node_id: String,
    pub reported_at: OffsetDateTime,
    pub status: String,
    pub ip: Option<IpAddr>,
    pub vpn_ip: Option<IpAddr>,
    pub role: Option<String>,
    pub capabilities: BTreeSet<String>,
    pub system_info: serde_json::Value,
    pub mac: Option<String>,
    pub management_address: Option<String>,
    pub ssh_user: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("malformed body: {0}")]
    MalformedBody(String),
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error("invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl ValidationError {
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::MalformedBody(_) => "malformed_body",
            ValidationError::MissingField(_) => "missing_field",
            ValidationError::InvalidField { .. } => "invalid_field",
        }
    }
}

fn required(value: Option<String>, field: &'static str) -> Result<String, ValidationError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(ValidationError::MissingField(field)),
    }
}

fn optional_ip(value: Option<String>, field: &'static str) -> Result<Option<IpAddr>, ValidationError> {
    value
        .filter(|v| !v.trim().is_empty())
        .map(|v| {
            v.trim().parse::<IpAddr>().map_err(|e| ValidationError::InvalidField {
                field,
                reason: e.to_string(),
            })
        })
        .transpose()
}

/// Nom d'utilisateur SSH : `[A-Za-z0-9._][A-Za-z0-9._-]*`, jamais d'option ssh.
fn optional_ssh_user(value: Option<String>) -> Result<Option<String>, ValidationError> {
    let Some(user) = value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-');
    if user.len() > 64 || user.starts_with('-') || !user.chars().all(allowed) {
        return Err(ValidationError::InvalidField {
            field: "ssh_user",
            reason: format!("not a valid user name: {user:?}"),
        });
    }
    Ok(Some(user))
}

/// Adresse d'administration : une IP, ou un nom d'hôte (labels alphanumériques et '-').
fn optional_host(value: Option<String>) -> Result<Option<String>, ValidationError> {
    let Some(host) = value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    if host.parse::<IpAddr>().is_ok() {
        return Ok(Some(host));
    }
    let label_ok = |l: &str| {
        !l.is_empty()
            && l.len() <= 63
            && !l.starts_with('-')
            && !l.ends_with('-')
            && l.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    };
    if host.len() > 253 || !host.split('.').all(label_ok) {
        return Err(ValidationError::InvalidField {
            field: "management_address",
            reason: format!("not an IP address or host name: {host:?}"),
        });
    }
    Ok(Some(host))
}

impl HandshakeRequest {
    pub fn from_slice(body: &[u8]) -> Result<Self, ValidationError> {
        serde_json::from_slice(body).map_err(|e| ValidationError::MalformedBody(e.to_string()))
    }

    pub fn validate(self) -> Result<Handshake, ValidationError> {
        let node_id = required(self.node_id, "node_id")?;
        let timestamp = required(self.timestamp, "timestamp")?;
        let status = required(self.status, "status")?;

        let reported_at = OffsetDateTime::parse(&timestamp, &Rfc3339).map_err(|e| {
            ValidationError::InvalidField {
                field: "timestamp",
                reason: format!("expected RFC 3339 timestamp: {e}"),
            }
        })?;

        let ip = optional_ip(self.ip, "ip")?;
        let vpn_ip = optional_ip(self.vpn_ip, "vpn_ip")?;
        let ssh_user = optional_ssh_user(self.ssh_user)?;
        let management_address = optional_host(self.management_address)?;

        let mac = match self.mac.filter(|m| !m.trim().is_empty()) {
            Some(m) => {
                parse_mac(&m).map_err(|reason| ValidationError::InvalidField {
                    field: "mac",
                    reason: reason.to_string(),
                })?;
                Some(m)
            }
            None => None,
        };

        Ok(Handshake {
            node_id,
            reported_at,
            status,
            ip,
            vpn_ip,
            role: self.role,
            capabilities: self.capabilities.into_iter().collect(),
            system_info: self.system_info.unwrap_or_else(|| serde_json::json!({})),
            mac,
            management_address,
            ssh_user,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeAck {
    pub status: String,
    pub message: String,
    #[serde(with = "time::serde::rfc3339")]
    pub server_timestamp: OffsetDateTime,
    pub cluster_nodes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body(v: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&v).unwrap()
    }

    #[test]
    fn test_status_never_returns_to_discovered() {
        assert!(ServiceStatus::Discovered.can_transition_to(ServiceStatus::Healthy));
        assert!(ServiceStatus::Healthy.can_transition_to(ServiceStatus::Unreachable));
        assert!(ServiceStatus::Unreachable.can_transition_to(ServiceStatus::Healthy));
        assert!(!ServiceStatus::Healthy.can_transition_to(ServiceStatus::Discovered));
    }

    #[test]
    fn test_instance_url_and_json_shape() {
        let now = OffsetDateTime::UNIX_EPOCH;
        let mut inst = ServiceInstance::new("llm-server", "10.0.0.5".parse().unwrap(), 8001, Origin::Network, now);
        inst.latency = Duration::from_millis(50);
        assert_eq!(inst.url, "http://10.0.0.5:8001");

        let v = serde_json::to_value(&inst).unwrap();
        assert_eq!(v["status"], "discovered");
        assert_eq!(v["origin"], "network");
        assert_eq!(v["latency_ms"], 50.0);
        assert_eq!(v["last_check"], "1970-01-01T00:00:00Z");
    }

    #[test]
    fn test_handshake_missing_status_rejected() {
        let req = HandshakeRequest::from_slice(&body(json!({
            "node_id": "rx-node",
            "timestamp": "2025-01-01T00:00:00Z"
        })))
        .unwrap();
        assert_eq!(req.validate().unwrap_err(), ValidationError::MissingField("status"));
    }

    #[test]
    fn test_handshake_blank_node_id_rejected() {
        let req = HandshakeRequest::from_slice(&body(json!({
            "node_id": "  ",
            "timestamp": "2025-01-01T00:00:00Z",
            "status": "active"
        })))
        .unwrap();
        assert_eq!(req.validate().unwrap_err(), ValidationError::MissingField("node_id"));
    }

    #[test]
    fn test_handshake_epoch_timestamp_is_malformed() {
        let err = HandshakeRequest::from_slice(&body(json!({
            "node_id": "rx-node",
            "timestamp": 1735689600.5,
            "status": "active"
        })))
        .unwrap_err();
        assert_eq!(err.code(), "malformed_body");
    }

    #[test]
    fn test_handshake_full_record() {
        let hs = HandshakeRequest::from_slice(&body(json!({
            "node_id": "rx-node",
            "timestamp": "2025-01-01T10:00:00+01:00",
            "status": "active",
            "ip": "192.168.68.117",
            "vpn_ip": "10.0.0.3",
            "role": "gpu",
            "capabilities": ["llm", "stt", "llm"],
            "mac": "30:9c:23:5f:44:a8"
        })))
        .unwrap()
        .validate()
        .unwrap();

        assert_eq!(hs.node_id, "rx-node");
        assert_eq!(hs.capabilities.len(), 2);
        assert_eq!(hs.ip, Some("192.168.68.117".parse().unwrap()));
        assert_eq!(hs.reported_at.offset().whole_hours(), 1);
    }

    #[test]
    fn test_handshake_bad_mac_rejected() {
        let err = HandshakeRequest::from_slice(&body(json!({
            "node_id": "rx-node",
            "timestamp": "2025-01-01T00:00:00Z",
            "status": "active",
            "mac": "zz:zz"
        })))
        .unwrap()
        .validate()
        .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidField { field: "mac", .. }));
    }

    fn with_field(field: &str, value: &str) -> Result<Handshake, ValidationError> {
        HandshakeRequest::from_slice(&body(json!({
            "node_id": "rx-node",
            "timestamp": "2025-01-01T00:00:00Z",
            "status": "active",
            field: value
        })))
        .unwrap()
        .validate()
    }

    #[test]
    fn test_ssh_user_cannot_carry_ssh_options() {
        let err = with_field("ssh_user", "-oProxyCommand=touch /tmp/x").unwrap_err();
        assert!(matches!(err, ValidationError::InvalidField { field: "ssh_user", .. }));
        assert!(with_field("ssh_user", "pi user").is_err());
        assert_eq!(with_field("ssh_user", "svc.mesh_01").unwrap().ssh_user.as_deref(), Some("svc.mesh_01"));
    }

    #[test]
    fn test_management_address_must_be_ip_or_hostname() {
        let err = with_field("management_address", "-oProxyCommand=id").unwrap_err();
        assert!(matches!(err, ValidationError::InvalidField { field: "management_address", .. }));
        assert!(with_field("management_address", "host;reboot").is_err());
        assert!(with_field("management_address", "user@host").is_err());
        assert!(with_field("management_address", "rx-node.lan").is_ok());
        assert!(with_field("management_address", "fe80::1").is_ok());
    }
}

//! Coordinator client
//!
//! Builds the handshake body and posts it to `<coordinator>/handshake`.
//! `Heartbeat` keeps the consecutive-failure count and the last success.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::discovery::SystemInfo;
use crate::metrics::SystemSnapshot;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("coordinator unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("coordinator rejected handshake ({status}): {body}")]
    Rejected { status: u16, body: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct HandshakePayload {
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vpn_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub capabilities: Vec<String>,
    pub system_info: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub management_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_user: Option<String>,
}

impl HandshakePayload {
    pub fn build(config: &AgentConfig, host: &SystemInfo, snapshot: &SystemSnapshot, now: DateTime<Utc>) -> Self {
        let system_info = serde_json::json!({
            "hostname": host.hostname,
            "os": host.os,
            "architecture": host.architecture,
            "interfaces": host.network.interfaces,
            "metrics": snapshot,
        });
        let ip = host.network.primary_ip.clone();

        Self {
            node_id: config.node_id_or(&host.hostname),
            timestamp: now,
            status: "active".to_string(),
            management_address: config.management_address.clone().or_else(|| ip.clone()),
            ip,
            vpn_ip: config.vpn_ip.clone(),
            role: config.role.clone(),
            capabilities: config.capabilities.clone(),
            system_info,
            mac: host.network.primary_mac.clone(),
            ssh_user: config.ssh_user.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HandshakeAck {
    pub status: String,
    pub message: String,
    pub server_timestamp: DateTime<Utc>,
    pub cluster_nodes: usize,
}

pub struct CoordinatorClient {
    http: reqwest::Client,
    url: String,
}

impl CoordinatorClient {
    pub fn new(config: &AgentConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .no_proxy()
            .build()?;
        Ok(Self {
            http,
            url: config.handshake_url(),
        })
    }

    pub async fn send(&self, payload: &HandshakePayload) -> Result<HandshakeAck, ClientError> {
        let resp = self.http.post(&self.url).json(payload).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp.json::<HandshakeAck>().await?)
    }
}

/// Outcome bookkeeping across handshake attempts.
#[derive(Debug, Default)]
pub struct Heartbeat {
    consecutive_failures: u32,
    last_success: Option<DateTime<Utc>>,
}

impl Heartbeat {
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        self.last_success
    }

    pub fn record(&mut self, outcome: &Result<HandshakeAck, ClientError>, now: DateTime<Utc>) {
        match outcome {
            Ok(ack) => {
                if self.consecutive_failures > 0 {
                    info!(
                        "coordinator reachable again after {} failed handshake(s)",
                        self.consecutive_failures
                    );
                }
                self.consecutive_failures = 0;
                self.last_success = Some(now);
                info!("handshake accepted: {} ({} active node(s))", ack.message, ack.cluster_nodes);
                debug!("ack status {} at coordinator time {}", ack.status, ack.server_timestamp);
            }
            Err(e) => {
                self.consecutive_failures += 1;
                let last = self
                    .last_success
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string());
                warn!(
                    "handshake failed ({} in a row, last success: {}): {}",
                    self.consecutive_failures, last, e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{InterfaceType, NetworkInfo, NetworkInterface};
    use crate::metrics::Collector;
    use mesh_devkit::StubService;

    fn host() -> SystemInfo {
        SystemInfo {
            hostname: "pi-4".into(),
            os: "linux".into(),
            architecture: "aarch64".into(),
            network: NetworkInfo {
                primary_ip: Some("192.168.1.20".into()),
                primary_mac: Some("b8:27:eb:00:00:01".into()),
                interfaces: vec![NetworkInterface {
                    name: "eth0".into(),
                    mac: Some("b8:27:eb:00:00:01".into()),
                    ip: "192.168.1.20".into(),
                    interface_type: InterfaceType::Ethernet,
                }],
            },
        }
    }

    fn config_for(url: String) -> AgentConfig {
        AgentConfig {
            coordinator_url: url,
            role: Some("worker".into()),
            capabilities: vec!["llm".into()],
            ssh_user: Some("pi".into()),
            request_timeout_secs: 2,
            ..AgentConfig::default()
        }
    }

    #[test]
    fn test_payload_defaults_management_address_to_ip() {
        let snapshot = Collector::new().collect();
        let payload = HandshakePayload::build(&AgentConfig::default(), &host(), &snapshot, Utc::now());
        assert_eq!(payload.node_id, "pi-4");
        assert_eq!(payload.management_address.as_deref(), Some("192.168.1.20"));

        let v = serde_json::to_value(&payload).unwrap();
        assert_eq!(v["status"], "active");
        assert_eq!(v["mac"], "b8:27:eb:00:00:01");
        assert!(v.get("vpn_ip").is_none());
        assert!(DateTime::parse_from_rfc3339(v["timestamp"].as_str().unwrap()).is_ok());
    }

    #[tokio::test]
    async fn test_handshake_reaches_coordinator() {
        let stub = StubService::spawn(200).await.unwrap();
        let config = config_for(stub.url());
        let client = CoordinatorClient::new(&config).unwrap();
        let payload = HandshakePayload::build(&config, &host(), &Collector::new().collect(), Utc::now());

        let ack = client.send(&payload).await.unwrap();
        assert_eq!(ack.status, "success");
        assert_eq!(ack.cluster_nodes, 1);

        let received = stub.handshakes();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0]["node_id"], "pi-4");
        assert_eq!(received[0]["role"], "worker");
        assert_eq!(received[0]["ssh_user"], "pi");
    }

    #[tokio::test]
    async fn test_failures_counted_until_success() {
        let stub = StubService::spawn(503).await.unwrap();
        let config = config_for(stub.url());
        let client = CoordinatorClient::new(&config).unwrap();
        let payload = HandshakePayload::build(&config, &host(), &Collector::new().collect(), Utc::now());
        let mut heartbeat = Heartbeat::default();

        for _ in 0..2 {
            let outcome = client.send(&payload).await;
            assert!(matches!(outcome, Err(ClientError::Rejected { status: 503, .. })));
            heartbeat.record(&outcome, Utc::now());
        }
        assert_eq!(heartbeat.consecutive_failures(), 2);
        assert!(heartbeat.last_success().is_none());

        stub.set_status(200);
        let outcome = client.send(&payload).await;
        heartbeat.record(&outcome, Utc::now());
        assert_eq!(heartbeat.consecutive_failures(), 0);
        assert!(heartbeat.last_success().is_some());
    }

    #[tokio::test]
    async fn test_unreachable_coordinator_is_transport_error() {
        let port = {
            let stub = StubService::spawn(200).await.unwrap();
            stub.port()
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let config = config_for(format!("http://127.0.0.1:{port}"));
        let client = CoordinatorClient::new(&config).unwrap();
        let payload = HandshakePayload::build(&config, &host(), &Collector::new().collect(), Utc::now());

        assert!(matches!(client.send(&payload).await, Err(ClientError::Transport(_))));
    }
}

/**
 * REGISTRE DE NŒUDS - Handshakes des membres du cluster
 *
 * RÔLE : Upsert des enregistrements de nœuds (clé : node_id), classement
 * actif/inactif selon l'âge du dernier handshake, rapport périodique.
 *
 * FONCTIONNEMENT :
 * - Un seul verrou : les handshakes d'un même nœud s'appliquent dans l'ordre de réception
 * - `last_seen` = heure de réception côté coordinateur ; `registered_at` figé
 * - Les nœuds inactifs restent en mémoire (soft-state) jusqu'au redémarrage
 * - Alerte "offline" une seule fois par transition (front montant), puis
 *   "back online" au handshake suivant
 */

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::models::{Handshake, HandshakeAck, NodeRecord};
use crate::state::SharedClock;

#[derive(Debug, Clone, Serialize)]
pub struct NodeSummary {
    pub total_nodes: usize,
    pub active_nodes: usize,
    pub nodes: BTreeMap<String, NodeRecord>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Sweep {
    pub went_offline: Vec<String>,
    pub active: usize,
    pub total: usize,
}

#[derive(Default)]
struct Inner {
    nodes: HashMap<String, NodeRecord>,
    // nœuds déjà signalés offline, pour ne pas répéter l'alerte
    offline: HashSet<String>,
}

pub struct NodeRegistry {
    inner: Mutex<Inner>,
    clock: SharedClock,
    liveness_timeout: time::Duration,
}

pub type SharedNodeRegistry = Arc<NodeRegistry>;

impl NodeRegistry {
    pub fn new(liveness_timeout: time::Duration, clock: SharedClock) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock,
            liveness_timeout,
        }
    }

    fn is_active(&self, record: &NodeRecord, now: OffsetDateTime) -> bool {
        now - record.last_seen < self.liveness_timeout
    }

    pub fn heartbeat(&self, hs: Handshake) -> HandshakeAck {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        let registered_at = match inner.nodes.get(&hs.node_id) {
            Some(existing) => existing.registered_at,
            None => {
                tracing::info!("node {} registered (role: {:?})", hs.node_id, hs.role);
                now
            }
        };
        if inner.offline.remove(&hs.node_id) {
            tracing::info!("node {} back online", hs.node_id);
        }

        let management_address = hs
            .management_address
            .or_else(|| hs.ip.map(|ip| ip.to_string()));
        let record = NodeRecord {
            node_id: hs.node_id.clone(),
            status: hs.status,
            ip: hs.ip,
            vpn_ip: hs.vpn_ip,
            role: hs.role,
            capabilities: hs.capabilities,
            system_info: hs.system_info,
            mac: hs.mac,
            management_address,
            ssh_user: hs.ssh_user,
            reported_at: hs.reported_at,
            last_seen: now,
            registered_at,
        };
        tracing::debug!("handshake from {}", record.node_id);
        inner.nodes.insert(hs.node_id, record);

        let active = inner.nodes.values().filter(|n| self.is_active(n, now)).count();
        HandshakeAck {
            status: "success".into(),
            message: "handshake received".into(),
            server_timestamp: now,
            cluster_nodes: active,
        }
    }

    pub fn get(&self, node_id: &str) -> Option<NodeRecord> {
        self.inner.lock().nodes.get(node_id).cloned()
    }

    pub fn active_nodes(&self) -> BTreeMap<String, NodeRecord> {
        let now = self.clock.now();
        self.inner
            .lock()
            .nodes
            .iter()
            .filter(|(_, n)| self.is_active(n, now))
            .map(|(id, n)| (id.clone(), n.clone()))
            .collect()
    }

    pub fn all(&self) -> Vec<NodeRecord> {
        let mut all: Vec<NodeRecord> = self.inner.lock().nodes.values().cloned().collect();
        all.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        all
    }

    pub fn summary(&self) -> NodeSummary {
        let total_nodes = self.inner.lock().nodes.len();
        let nodes = self.active_nodes();
        NodeSummary {
            total_nodes,
            active_nodes: nodes.len(),
            nodes,
            timestamp: self.clock.now(),
        }
    }

    /// Détecte les nœuds devenus inactifs depuis le dernier passage.
    /// Chaque transition n'est signalée qu'une fois.
    pub fn sweep_offline(&self) -> Sweep {
        let now = self.clock.now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let mut sweep = Sweep {
            total: inner.nodes.len(),
            ..Sweep::default()
        };

        for (id, node) in &inner.nodes {
            if self.is_active(node, now) {
                sweep.active += 1;
                continue;
            }
            if inner.offline.insert(id.clone()) {
                let age = (now - node.last_seen).whole_seconds();
                tracing::warn!("node {} offline (last seen {}s ago)", id, age);
                sweep.went_offline.push(id.clone());
            }
        }
        sweep.went_offline.sort();
        sweep
    }

    pub fn spawn_reporter(self: Arc<Self>, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let sweep = self.sweep_offline();
                        tracing::info!("nodes: {}/{} active", sweep.active, sweep.total);
                    }
                }
            }
            tracing::info!("node reporter stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HandshakeRequest;
    use crate::state::{Clock, ManualClock};
    use serde_json::json;
    use time::macros::datetime;

    fn setup() -> (ManualClock, NodeRegistry) {
        let clock = ManualClock::new(datetime!(2025-03-01 08:00 UTC));
        let registry = NodeRegistry::new(time::Duration::seconds(300), Arc::new(clock.clone()));
        (clock, registry)
    }

    fn handshake(node_id: &str, ip: &str) -> Handshake {
        let body = serde_json::to_vec(&json!({
            "node_id": node_id,
            "timestamp": "2025-03-01T08:00:00Z",
            "status": "active",
            "ip": ip,
            "role": "worker",
            "capabilities": ["stt"]
        }))
        .unwrap();
        HandshakeRequest::from_slice(&body).unwrap().validate().unwrap()
    }

    #[test]
    fn test_repeated_heartbeats_keep_one_record() {
        let (clock, reg) = setup();
        reg.heartbeat(handshake("pi-node", "192.168.1.20"));
        let first = reg.get("pi-node").unwrap();

        clock.advance(time::Duration::seconds(30));
        let ack = reg.heartbeat(handshake("pi-node", "192.168.1.21"));

        let rec = reg.get("pi-node").unwrap();
        assert_eq!(reg.all().len(), 1);
        assert_eq!(rec.registered_at, first.registered_at);
        assert_eq!(rec.last_seen, clock.now());
        assert_eq!(rec.ip, Some("192.168.1.21".parse().unwrap()));
        assert_eq!(ack.cluster_nodes, 1);
        assert_eq!(ack.status, "success");
    }

    #[test]
    fn test_management_address_defaults_to_ip() {
        let (_clock, reg) = setup();
        reg.heartbeat(handshake("rx-node", "192.168.1.30"));
        let rec = reg.get("rx-node").unwrap();
        assert_eq!(rec.management_address.as_deref(), Some("192.168.1.30"));
    }

    #[test]
    fn test_active_iff_younger_than_timeout() {
        let (clock, reg) = setup();
        reg.heartbeat(handshake("pi-node", "192.168.1.20"));

        clock.advance(time::Duration::seconds(299));
        assert_eq!(reg.active_nodes().len(), 1);

        clock.advance(time::Duration::seconds(1));
        assert!(reg.active_nodes().is_empty());
        // toujours connu
        assert!(reg.get("pi-node").is_some());
        assert_eq!(reg.summary().total_nodes, 1);
    }

    #[test]
    fn test_offline_is_edge_triggered() {
        let (clock, reg) = setup();
        reg.heartbeat(handshake("pi-node", "192.168.1.20"));
        reg.heartbeat(handshake("rx-node", "192.168.1.30"));

        clock.advance(time::Duration::seconds(200));
        reg.heartbeat(handshake("rx-node", "192.168.1.30"));
        clock.advance(time::Duration::seconds(150));

        let first = reg.sweep_offline();
        assert_eq!(first.went_offline, vec!["pi-node".to_string()]);
        assert_eq!(first.active, 1);

        // plusieurs cycles plus tard : pas de nouvelle alerte
        assert!(reg.sweep_offline().went_offline.is_empty());
        clock.advance(time::Duration::seconds(160));
        assert_eq!(reg.sweep_offline().went_offline, vec!["rx-node".to_string()]);
        clock.advance(time::Duration::seconds(60));
        assert!(reg.sweep_offline().went_offline.is_empty());
    }

    #[test]
    fn test_back_online_rearms_edge() {
        let (clock, reg) = setup();
        reg.heartbeat(handshake("pi-node", "192.168.1.20"));
        clock.advance(time::Duration::seconds(400));
        assert_eq!(reg.sweep_offline().went_offline.len(), 1);

        reg.heartbeat(handshake("pi-node", "192.168.1.20"));
        assert!(reg.sweep_offline().went_offline.is_empty());

        clock.advance(time::Duration::seconds(400));
        assert_eq!(reg.sweep_offline().went_offline, vec!["pi-node".to_string()]);
    }

    #[test]
    fn test_summary_lists_only_active_nodes() {
        let (clock, reg) = setup();
        reg.heartbeat(handshake("old-node", "192.168.1.10"));
        clock.advance(time::Duration::seconds(301));
        reg.heartbeat(handshake("new-node", "192.168.1.11"));

        let summary = reg.summary();
        assert_eq!(summary.total_nodes, 2);
        assert_eq!(summary.active_nodes, 1);
        assert!(summary.nodes.contains_key("new-node"));
    }
}

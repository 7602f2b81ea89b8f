use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::nodes::NodeRegistry;
use crate::registry::ServiceRegistry;

/// Corps de GET /health.
#[derive(Debug, Serialize, Deserialize)]
pub struct KernelHealth {
    pub status: String,
    pub uptime_seconds: u64,
    pub services_count: usize,
    pub healthy_services: usize,
    pub nodes_active: usize,
}

/// Corps de GET /mesh/status.
#[derive(Debug, Serialize, Deserialize)]
pub struct MeshStatus {
    pub uptime_seconds: u64,
    pub network_scans: u64,
    pub health_cycles: u64,
    pub services_known: usize,
    pub services_healthy: usize,
    pub nodes_known: usize,
    pub nodes_active: usize,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    network_scans: Arc<AtomicU64>,
    health_cycles: Arc<AtomicU64>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            network_scans: Arc::new(AtomicU64::new(0)),
            health_cycles: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn record_scan(&self) {
        self.network_scans.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_health_cycle(&self) {
        self.health_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn network_scans(&self) -> u64 {
        self.network_scans.load(Ordering::Relaxed)
    }

    pub fn health_cycles(&self) -> u64 {
        self.health_cycles.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn get_health(&self, services: &ServiceRegistry, nodes: &NodeRegistry) -> KernelHealth {
        let (services_count, healthy_services) = services.counts();
        KernelHealth {
            status: "healthy".into(),
            uptime_seconds: self.uptime_seconds(),
            services_count,
            healthy_services,
            nodes_active: nodes.summary().active_nodes,
        }
    }

    pub fn mesh_status(&self, services: &ServiceRegistry, nodes: &NodeRegistry) -> MeshStatus {
        let (services_known, services_healthy) = services.counts();
        let summary = nodes.summary();
        MeshStatus {
            uptime_seconds: self.uptime_seconds(),
            network_scans: self.network_scans(),
            health_cycles: self.health_cycles(),
            services_known,
            services_healthy,
            nodes_known: summary.total_nodes,
            nodes_active: summary.active_nodes,
        }
    }
}

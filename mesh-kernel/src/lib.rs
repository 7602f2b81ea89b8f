/**
 * MESH KERNEL - Cœur de coordination du cluster
 *
 * RÔLE : Découverte active des services, registre de services avec sélection
 * de la meilleure instance, registre de nœuds (handshakes), commandes
 * privilégiées autorisées (arrêt SSH, Wake-on-LAN).
 *
 * `MeshKernel` assemble les composants à partir de la configuration ; le
 * binaire n'a plus qu'à démarrer les boucles et servir le router.
 */

pub mod auth;
pub mod commands;
pub mod config;
#[cfg(any(test, feature = "test-support"))]
pub mod fixtures;
pub mod health;
pub mod http;
pub mod models;
pub mod monitor;
pub mod nodes;
pub mod power;
pub mod probe;
pub mod registry;
pub mod scanner;
pub mod state;
pub mod supervisor;

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use crate::auth::Authorizer;
use crate::commands::CommandBook;
use crate::config::MeshConfig;
use crate::health::HealthTracker;
use crate::http::AppState;
use crate::monitor::HealthMonitor;
use crate::nodes::NodeRegistry;
use crate::power::{PowerController, SharedExecutor, SshExecutor};
use crate::probe::{HttpProbe, SharedProbe};
use crate::registry::ServiceRegistry;
use crate::scanner::{local_addresses, ScanPlan, Scanner};
use crate::state::{system_clock, SharedClock};
use crate::supervisor::Supervisor;

/// Points d'injection : tout ce qui touche le réseau ou l'heure.
pub struct Collaborators {
    pub probe: SharedProbe,
    pub executor: SharedExecutor,
    pub clock: SharedClock,
    pub own_addresses: HashSet<IpAddr>,
}

impl Collaborators {
    /// Probe HTTP réel, SSH réel, horloge système, interfaces locales.
    pub fn production(cfg: &MeshConfig) -> Result<Self, reqwest::Error> {
        let probe = HttpProbe::new(&cfg.health_path, cfg.scan_timeout(), cfg.probe_request_timeout())?;
        Ok(Self {
            probe: Arc::new(probe),
            executor: Arc::new(SshExecutor::new(&cfg.power)),
            clock: system_clock(),
            own_addresses: local_addresses(),
        })
    }
}

pub struct MeshKernel {
    state: AppState,
    monitor: Arc<HealthMonitor>,
    supervisor: Supervisor,
}

impl MeshKernel {
    pub fn new(cfg: MeshConfig, deps: Collaborators) -> Self {
        let cfg = Arc::new(cfg);
        let supervisor = Supervisor::new();
        let health_tracker = HealthTracker::new();

        let services = Arc::new(ServiceRegistry::new(cfg.selection_cache_ttl(), deps.clock.clone()));
        let nodes = Arc::new(NodeRegistry::new(cfg.liveness_timeout(), deps.clock.clone()));
        let auth = Arc::new(Authorizer::new(&cfg, deps.clock.clone()));
        let commands = Arc::new(CommandBook::new(cfg.approval_window(), deps.clock.clone()));
        let power = Arc::new(PowerController::new(nodes.clone(), cfg.power.clone(), deps.executor));
        let scanner = Arc::new(Scanner::new(
            deps.probe.clone(),
            services.clone(),
            health_tracker.clone(),
            deps.own_addresses,
        ));
        let monitor = Arc::new(HealthMonitor::new(
            deps.probe,
            services.clone(),
            health_tracker.clone(),
            cfg.scan_concurrency,
        ));

        let state = AppState {
            cfg,
            services,
            nodes,
            auth,
            commands,
            power,
            scanner,
            health_tracker,
            shutdown: supervisor.token(),
        };
        Self {
            state,
            monitor,
            supervisor,
        }
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    pub fn router(&self) -> axum::Router {
        http::build_router(self.state())
    }

    pub fn scan_plan(&self) -> ScanPlan {
        let cfg = &self.state.cfg;
        ScanPlan {
            ranges: cfg.scan_ranges.clone(),
            service_ports: cfg.service_ports.clone(),
            concurrency: cfg.scan_concurrency,
            min_prefix_len: 0,
        }
    }

    /// Démarre découverte périodique, health monitor et rapport des nœuds.
    pub fn start(&mut self) {
        let cfg = self.state.cfg.clone();
        let token = self.supervisor.token();

        let discovery = self
            .state
            .scanner
            .clone()
            .spawn_periodic(self.scan_plan(), cfg.scan_interval(), token.clone());
        self.supervisor.track("discovery", discovery);

        let health = self.monitor.clone().spawn(cfg.health_interval(), token.clone());
        self.supervisor.track("health-monitor", health);

        let reporter = self
            .state
            .nodes
            .clone()
            .spawn_reporter(cfg.node_report_interval(), token);
        self.supervisor.track("node-reporter", reporter);

        tracing::info!(
            "background loops started (scan every {:?}, health every {:?})",
            cfg.scan_interval(),
            cfg.health_interval()
        );
    }

    pub async fn shutdown(self) {
        self.supervisor.shutdown().await;
    }
}

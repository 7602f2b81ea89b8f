/**
 * SCANNER - Découverte active des services sur le réseau local
 *
 * RÔLE : Énumère les hôtes des plages CIDR configurées (plus 127.0.0.1, toujours
 * scanné en premier) et lance un Probe par couple (hôte, port de service).
 *
 * FONCTIONNEMENT :
 * - Lots de `concurrency` probes, barrière de fin de lot avant le suivant
 * - Nos propres adresses sont exclues (pas d'auto-découverte)
 * - Plage CIDR invalide : journalisée et ignorée, le scan continue
 * - Idempotent : ajoute les nouvelles instances, rafraîchit les autres,
 *   n'évince jamais une instance non retrouvée (rôle du Health Monitor)
 */

use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::parse_cidr;
use crate::health::HealthTracker;
use crate::models::{Origin, ServiceInstance};
use crate::probe::{ProbeOutcome, SharedProbe};
use crate::registry::{SharedServiceRegistry, Sighting};

#[derive(Debug, Clone)]
pub struct ScanPlan {
    pub ranges: Vec<String>,
    pub service_ports: BTreeMap<String, u16>,
    pub concurrency: usize,
    /// Plages plus larges que ce préfixe ignorées (0 : aucune limite).
    pub min_prefix_len: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedRange {
    pub range: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DiscoveryReport {
    pub found: Vec<ServiceInstance>,
    pub new_instances: usize,
    pub skipped_ranges: Vec<SkippedRange>,
    pub probes_issued: usize,
    pub cancelled: bool,
    pub duration_ms: u128,
}

#[derive(Debug, Clone)]
struct Target {
    name: String,
    address: IpAddr,
    port: u16,
    origin: Origin,
}

pub struct Scanner {
    probe: SharedProbe,
    registry: SharedServiceRegistry,
    stats: HealthTracker,
    own_addresses: HashSet<IpAddr>,
    // un seul passage de découverte à la fois (périodique ou déclenché via l'API)
    pass: tokio::sync::Mutex<()>,
}

/// Adresses des interfaces locales (hors loopback).
pub fn local_addresses() -> HashSet<IpAddr> {
    match if_addrs::get_if_addrs() {
        Ok(ifaces) => ifaces
            .into_iter()
            .filter(|i| !i.is_loopback())
            .map(|i| i.ip())
            .collect(),
        Err(e) => {
            tracing::warn!("cannot enumerate local interfaces: {}", e);
            HashSet::new()
        }
    }
}

impl Scanner {
    pub fn new(
        probe: SharedProbe,
        registry: SharedServiceRegistry,
        stats: HealthTracker,
        own_addresses: HashSet<IpAddr>,
    ) -> Self {
        Self {
            probe,
            registry,
            stats,
            own_addresses,
            pass: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn discover(&self, plan: &ScanPlan, cancel: &CancellationToken) -> DiscoveryReport {
        let _pass = self.pass.lock().await;
        let started = Instant::now();
        let concurrency = plan.concurrency.max(1);
        let mut report = DiscoveryReport::default();

        tracing::info!(
            "starting discovery: loopback + {} range(s), {} service port(s)",
            plan.ranges.len(),
            plan.service_ports.len()
        );

        let loopback: Vec<Target> = plan
            .service_ports
            .iter()
            .map(|(name, port)| Target {
                name: name.clone(),
                address: IpAddr::V4(Ipv4Addr::LOCALHOST),
                port: *port,
                origin: Origin::Localhost,
            })
            .collect();
        for chunk in loopback.chunks(concurrency) {
            if !self.run_batch(chunk, &mut report, cancel).await {
                return self.finish(report, started);
            }
        }

        for range in &plan.ranges {
            let net = match parse_cidr(range) {
                Ok(net) => net,
                Err(e) => {
                    tracing::warn!("skipping range: {}", e);
                    report.skipped_ranges.push(SkippedRange {
                        range: range.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            if net.prefix_len() < plan.min_prefix_len {
                tracing::warn!("skipping range {}: wider than /{}", net, plan.min_prefix_len);
                report.skipped_ranges.push(SkippedRange {
                    range: range.clone(),
                    reason: format!("wider than /{}", plan.min_prefix_len),
                });
                continue;
            }
            tracing::debug!("scanning {}", net);

            let mut batch = Vec::with_capacity(concurrency);
            for host in net.hosts() {
                let address = IpAddr::V4(host);
                if host.is_loopback() || self.own_addresses.contains(&address) {
                    continue;
                }
                for (name, port) in &plan.service_ports {
                    batch.push(Target {
                        name: name.clone(),
                        address,
                        port: *port,
                        origin: Origin::Network,
                    });
                    if batch.len() >= concurrency {
                        if !self.run_batch(&batch, &mut report, cancel).await {
                            return self.finish(report, started);
                        }
                        batch.clear();
                    }
                }
            }
            if !batch.is_empty() && !self.run_batch(&batch, &mut report, cancel).await {
                return self.finish(report, started);
            }
        }

        self.finish(report, started)
    }

    /// Lance un lot et attend sa fin. `false` si l'annulation a été demandée
    /// avant le lot.
    async fn run_batch(
        &self,
        batch: &[Target],
        report: &mut DiscoveryReport,
        cancel: &CancellationToken,
    ) -> bool {
        if cancel.is_cancelled() {
            report.cancelled = true;
            return false;
        }
        report.probes_issued += batch.len();

        let outcomes = join_all(batch.iter().map(|t| self.probe.probe(t.address, t.port))).await;

        for (target, outcome) in batch.iter().zip(outcomes) {
            if let ProbeOutcome::Reachable { latency } = outcome {
                let sighting = self.registry.record_sighting(
                    &target.name,
                    target.address,
                    target.port,
                    target.origin,
                    latency,
                );
                if sighting == Sighting::New {
                    report.new_instances += 1;
                }
                report.found.extend(
                    self.registry
                        .all_instances(&target.name)
                        .into_iter()
                        .filter(|i| i.address == target.address && i.port == target.port),
                );
            }
        }
        true
    }

    fn finish(&self, mut report: DiscoveryReport, started: Instant) -> DiscoveryReport {
        report.duration_ms = started.elapsed().as_millis();
        self.stats.record_scan();
        if report.cancelled {
            tracing::info!("discovery cancelled after {} probes", report.probes_issued);
        } else {
            tracing::info!(
                "discovery complete: {} found ({} new), {} probes, {} range(s) skipped in {}ms",
                report.found.len(),
                report.new_instances,
                report.probes_issued,
                report.skipped_ranges.len(),
                report.duration_ms
            );
        }
        report
    }

    /// Boucle de découverte périodique ; le premier passage est immédiat.
    pub fn spawn_periodic(
        self: Arc<Self>,
        plan: ScanPlan,
        every: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        self.discover(&plan, &cancel).await;
                    }
                }
            }
            tracing::info!("discovery loop stopped");
        })
    }
}

/**
 * HEALTH MONITOR - Rafraîchissement périodique de l'état des instances
 *
 * RÔLE : Re-probe toutes les instances connues à intervalle fixe (30s par
 * défaut), indépendamment du scanner (5 min), et applique la transition.
 *
 * FONCTIONNEMENT :
 * - 200 sur /health → healthy + latence mesurée
 * - listener qui répond autre chose que 200 → unhealthy
 * - tout le reste (refus, timeout, erreur HTTP) → unreachable
 * - Un seul échec suffit : détection rapide plutôt qu'anti-flapping
 */

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::health::HealthTracker;
use crate::models::ServiceStatus;
use crate::probe::{ProbeFailure, ProbeOutcome, SharedProbe};
use crate::registry::SharedServiceRegistry;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleSummary {
    pub checked: usize,
    pub healthy: usize,
    pub demoted: usize,
    pub recovered: usize,
}

pub struct HealthMonitor {
    probe: SharedProbe,
    registry: SharedServiceRegistry,
    stats: HealthTracker,
    concurrency: usize,
}

fn classify(outcome: &ProbeOutcome) -> (ServiceStatus, Duration) {
    match outcome {
        ProbeOutcome::Reachable { latency } => (ServiceStatus::Healthy, *latency),
        ProbeOutcome::Unreachable(ProbeFailure::Status(_)) => (ServiceStatus::Unhealthy, Duration::ZERO),
        ProbeOutcome::Unreachable(_) => (ServiceStatus::Unreachable, Duration::ZERO),
    }
}

impl HealthMonitor {
    pub fn new(
        probe: SharedProbe,
        registry: SharedServiceRegistry,
        stats: HealthTracker,
        concurrency: usize,
    ) -> Self {
        Self {
            probe,
            registry,
            stats,
            concurrency: concurrency.max(1),
        }
    }

    /// Un cycle complet sur l'ensemble des instances enregistrées.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> CycleSummary {
        let keys = self.registry.keys();
        let mut summary = CycleSummary::default();

        for chunk in keys.chunks(self.concurrency) {
            if cancel.is_cancelled() {
                break;
            }
            let outcomes = join_all(chunk.iter().map(|k| self.probe.probe(k.address, k.port))).await;

            for (key, outcome) in chunk.iter().zip(outcomes) {
                let (status, latency) = classify(&outcome);
                let Some(transition) = self.registry.apply_health(key, status, latency) else {
                    continue;
                };
                summary.checked += 1;
                if transition.to == ServiceStatus::Healthy {
                    summary.healthy += 1;
                }
                if transition.from == transition.to {
                    continue;
                }
                if transition.from == ServiceStatus::Healthy {
                    summary.demoted += 1;
                    match &outcome {
                        ProbeOutcome::Unreachable(reason) => {
                            tracing::warn!("{} is {} ({:?})", key, transition.to, reason)
                        }
                        ProbeOutcome::Reachable { .. } => {}
                    }
                } else if transition.to == ServiceStatus::Healthy {
                    summary.recovered += 1;
                    tracing::info!("{} recovered ({} → healthy)", key, transition.from);
                }
            }
        }

        self.stats.record_health_cycle();
        tracing::debug!(
            "health cycle: {}/{} healthy, {} demoted, {} recovered",
            summary.healthy,
            summary.checked,
            summary.demoted,
            summary.recovered
        );
        summary
    }

    pub fn spawn(self: Arc<Self>, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // le premier tick est immédiat ; on laisse le scanner peupler le registre d'abord
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        self.run_cycle(&cancel).await;
                    }
                }
            }
            tracing::info!("health monitor stopped");
        })
    }
}

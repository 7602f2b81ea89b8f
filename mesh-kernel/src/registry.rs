/**
 * REGISTRE DE SERVICES - Carte nom logique → instances connues
 *
 * RÔLE : Source de vérité locale des instances découvertes (jamais supprimées),
 * de leur état de santé et de leur latence. Sélection de la meilleure instance.
 *
 * SÉLECTION :
 * - Uniquement les instances `healthy` (sinon : service indisponible)
 * - Tri par latence croissante, puis localhost avant réseau, puis adresse
 * - Cache court par nom, invalidé dès que l'instance en cache est rétrogradée
 */

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::models::{DiscoveredHost, InstanceKey, Origin, ServiceInstance, ServiceStatus};
use crate::state::SharedClock;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("no instance of '{0}' is known")]
    UnknownService(String),
    #[error("no healthy instance of '{0}' is available")]
    NoHealthyInstance(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sighting {
    New,
    Refreshed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ServiceStatus,
    pub to: ServiceStatus,
}

struct CachedSelection {
    key: InstanceKey,
    expires_at: Instant,
}

#[derive(Default)]
struct Inner {
    instances: BTreeMap<InstanceKey, ServiceInstance>,
    selection: HashMap<String, CachedSelection>,
}

pub struct ServiceRegistry {
    inner: Mutex<Inner>,
    cache_ttl: Duration,
    clock: SharedClock,
}

pub type SharedServiceRegistry = Arc<ServiceRegistry>;

fn selection_order(a: &ServiceInstance, b: &ServiceInstance) -> std::cmp::Ordering {
    a.latency
        .cmp(&b.latency)
        .then(a.origin.cmp(&b.origin))
        .then_with(|| a.address.to_string().cmp(&b.address.to_string()))
        .then(a.port.cmp(&b.port))
}

impl ServiceRegistry {
    pub fn new(cache_ttl: Duration, clock: SharedClock) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            cache_ttl,
            clock,
        }
    }

    /// Insère une instance ou met à jour l'état d'une instance existante.
    /// Retourne `true` si l'instance est nouvelle.
    pub fn register(&self, instance: ServiceInstance) -> bool {
        let key = instance.key();
        let mut inner = self.inner.lock();
        match inner.instances.get_mut(&key) {
            Some(existing) => {
                if existing.status.can_transition_to(instance.status) {
                    existing.status = instance.status;
                }
                existing.last_check = instance.last_check;
                existing.latency = instance.latency;
                if existing.status != ServiceStatus::Healthy {
                    Self::invalidate_if_cached(&mut inner, &key);
                }
                false
            }
            None => {
                inner.selection.remove(&key.name);
                inner.instances.insert(key, instance);
                true
            }
        }
    }

    /// Instance vue par le scanner avec un /health 200 : créée si besoin
    /// (discovered → healthy), sinon rafraîchie et ressuscitée.
    pub fn record_sighting(
        &self,
        name: &str,
        address: IpAddr,
        port: u16,
        origin: Origin,
        latency: Duration,
    ) -> Sighting {
        let now = self.clock.now();
        let key = InstanceKey {
            name: name.to_string(),
            address,
            port,
        };
        let mut inner = self.inner.lock();

        if let Some(existing) = inner.instances.get_mut(&key) {
            let previous = existing.status;
            existing.status = ServiceStatus::Healthy;
            existing.last_check = now;
            existing.latency = latency;
            if previous != ServiceStatus::Healthy {
                tracing::info!("service {} is back ({} → healthy)", key, previous);
            }
            return Sighting::Refreshed;
        }

        let mut instance = ServiceInstance::new(name, address, port, origin, now);
        instance.status = ServiceStatus::Healthy;
        instance.latency = latency;
        tracing::info!("discovered {} ({:?}, {:?})", key, origin, latency);
        inner.selection.remove(name);
        inner.instances.insert(key, instance);
        Sighting::New
    }

    /// Résultat d'un cycle de santé pour une instance. `None` si l'instance
    /// est inconnue ; sinon la transition appliquée (éventuellement identique).
    pub fn apply_health(
        &self,
        key: &InstanceKey,
        status: ServiceStatus,
        latency: Duration,
    ) -> Option<Transition> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let instance = inner.instances.get_mut(key)?;
        let from = instance.status;
        if !from.can_transition_to(status) {
            return Some(Transition { from, to: from });
        }
        instance.status = status;
        instance.last_check = now;
        instance.latency = latency;

        if status != ServiceStatus::Healthy {
            Self::invalidate_if_cached(&mut inner, key);
        }
        Some(Transition { from, to: status })
    }

    fn invalidate_if_cached(inner: &mut Inner, key: &InstanceKey) {
        let cached = inner
            .selection
            .get(&key.name)
            .map(|c| &c.key == key)
            .unwrap_or(false);
        if cached {
            inner.selection.remove(&key.name);
            tracing::debug!("selection cache for '{}' invalidated", key.name);
        }
    }

    pub fn all_instances(&self, name: &str) -> Vec<ServiceInstance> {
        self.inner
            .lock()
            .instances
            .values()
            .filter(|i| i.name == name)
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> Vec<ServiceInstance> {
        self.inner.lock().instances.values().cloned().collect()
    }

    pub fn keys(&self) -> Vec<InstanceKey> {
        self.inner.lock().instances.keys().cloned().collect()
    }

    /// (total, healthy)
    pub fn counts(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        let healthy = inner
            .instances
            .values()
            .filter(|i| i.status == ServiceStatus::Healthy)
            .count();
        (inner.instances.len(), healthy)
    }

    /// Regroupe les instances par adresse, triées par adresse.
    pub fn hosts(&self) -> Vec<DiscoveredHost> {
        let inner = self.inner.lock();
        let mut hosts: BTreeMap<IpAddr, DiscoveredHost> = BTreeMap::new();
        for inst in inner.instances.values() {
            let host = hosts.entry(inst.address).or_insert_with(|| DiscoveredHost {
                address: inst.address,
                origin: inst.origin,
                available_services: Vec::new(),
                known_services: Vec::new(),
                last_seen: None,
            });
            if !host.known_services.contains(&inst.name) {
                host.known_services.push(inst.name.clone());
            }
            if inst.status == ServiceStatus::Healthy {
                if !host.available_services.contains(&inst.name) {
                    host.available_services.push(inst.name.clone());
                }
                host.last_seen = host.last_seen.max(Some(inst.last_check));
            }
        }
        hosts.into_values().collect()
    }

    /// Instances saines de `name`, dans l'ordre de sélection.
    pub fn ranked(&self, name: &str) -> Vec<ServiceInstance> {
        let inner = self.inner.lock();
        Self::ranked_locked(&inner, name)
    }

    fn ranked_locked(inner: &Inner, name: &str) -> Vec<ServiceInstance> {
        let mut healthy: Vec<ServiceInstance> = inner
            .instances
            .values()
            .filter(|i| i.name == name && i.status == ServiceStatus::Healthy)
            .cloned()
            .collect();
        healthy.sort_by(selection_order);
        healthy
    }

    pub fn best_instance(&self, name: &str) -> Result<ServiceInstance, RegistryError> {
        let mut inner = self.inner.lock();

        if let Some(cached) = inner.selection.get(name) {
            if cached.expires_at > Instant::now() {
                if let Some(instance) = inner.instances.get(&cached.key) {
                    if instance.status == ServiceStatus::Healthy {
                        return Ok(instance.clone());
                    }
                }
            }
        }
        inner.selection.remove(name);

        let ranked = Self::ranked_locked(&inner, name);
        match ranked.into_iter().next() {
            Some(best) => {
                inner.selection.insert(
                    name.to_string(),
                    CachedSelection {
                        key: best.key(),
                        expires_at: Instant::now() + self.cache_ttl,
                    },
                );
                Ok(best)
            }
            None if inner.instances.values().any(|i| i.name == name) => {
                Err(RegistryError::NoHealthyInstance(name.to_string()))
            }
            None => Err(RegistryError::UnknownService(name.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::system_clock;

    fn registry() -> ServiceRegistry {
        ServiceRegistry::new(Duration::from_secs(300), system_clock())
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn key(name: &str, addr: &str, port: u16) -> InstanceKey {
        InstanceKey {
            name: name.into(),
            address: ip(addr),
            port,
        }
    }

    #[test]
    fn test_best_instance_prefers_lowest_latency() {
        let reg = registry();
        reg.record_sighting("stt-service", ip("10.0.0.7"), 8002, Origin::Network, Duration::from_millis(120));
        reg.record_sighting("stt-service", ip("10.0.0.8"), 8002, Origin::Network, Duration::from_millis(50));

        let best = reg.best_instance("stt-service").unwrap();
        assert_eq!(best.address, ip("10.0.0.8"));
        assert_eq!(best.latency, Duration::from_millis(50));
    }

    #[test]
    fn test_ties_prefer_localhost_then_address() {
        let reg = registry();
        let same = Duration::from_millis(10);
        reg.record_sighting("tts-service", ip("10.0.0.9"), 8003, Origin::Network, same);
        reg.record_sighting("tts-service", ip("10.0.0.2"), 8003, Origin::Network, same);
        reg.record_sighting("tts-service", ip("127.0.0.1"), 8003, Origin::Localhost, same);

        let ranked = reg.ranked("tts-service");
        let order: Vec<_> = ranked.iter().map(|i| i.address.to_string()).collect();
        assert_eq!(order, vec!["127.0.0.1", "10.0.0.2", "10.0.0.9"]);
    }

    #[test]
    fn test_never_selects_unhealthy() {
        let reg = registry();
        reg.record_sighting("llm-server", ip("10.0.0.5"), 8001, Origin::Network, Duration::from_millis(5));
        reg.apply_health(&key("llm-server", "10.0.0.5", 8001), ServiceStatus::Unreachable, Duration::ZERO);

        assert_eq!(
            reg.best_instance("llm-server"),
            Err(RegistryError::NoHealthyInstance("llm-server".into()))
        );
        assert_eq!(
            reg.best_instance("nope"),
            Err(RegistryError::UnknownService("nope".into()))
        );
    }

    #[test]
    fn test_discovered_instances_are_not_selectable() {
        let reg = registry();
        let inst = ServiceInstance::new("web-interface", ip("10.0.0.3"), 8080, Origin::Network, time::OffsetDateTime::now_utc());
        assert!(reg.register(inst));
        assert!(reg.best_instance("web-interface").is_err());
    }

    #[test]
    fn test_cache_invalidated_on_demotion() {
        let reg = registry();
        reg.record_sighting("llm-server", ip("10.0.0.5"), 8001, Origin::Network, Duration::from_millis(5));
        reg.record_sighting("llm-server", ip("10.0.0.6"), 8001, Origin::Network, Duration::from_millis(40));

        assert_eq!(reg.best_instance("llm-server").unwrap().address, ip("10.0.0.5"));
        reg.apply_health(&key("llm-server", "10.0.0.5", 8001), ServiceStatus::Unhealthy, Duration::from_millis(5));
        assert_eq!(reg.best_instance("llm-server").unwrap().address, ip("10.0.0.6"));
    }

    #[test]
    fn test_new_instance_clears_name_cache() {
        let reg = registry();
        reg.record_sighting("llm-server", ip("10.0.0.5"), 8001, Origin::Network, Duration::from_millis(30));
        assert_eq!(reg.best_instance("llm-server").unwrap().address, ip("10.0.0.5"));

        reg.apply_health(&key("llm-server", "10.0.0.5", 8001), ServiceStatus::Healthy, Duration::from_millis(30));
        reg.register({
            let mut other = ServiceInstance::new("llm-server", ip("10.0.0.6"), 8001, Origin::Network, time::OffsetDateTime::now_utc());
            other.status = ServiceStatus::Healthy;
            other.latency = Duration::from_millis(1);
            other
        });
        // une nouvelle instance vide le cache du nom
        assert_eq!(reg.best_instance("llm-server").unwrap().address, ip("10.0.0.6"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_expires_after_ttl() {
        let reg = ServiceRegistry::new(Duration::from_secs(300), system_clock());
        reg.record_sighting("llm-server", ip("10.0.0.5"), 8001, Origin::Network, Duration::from_millis(30));
        reg.record_sighting("llm-server", ip("10.0.0.6"), 8001, Origin::Network, Duration::from_millis(60));
        assert_eq!(reg.best_instance("llm-server").unwrap().address, ip("10.0.0.5"));

        // 10.0.0.6 devient plus rapide sans que l'instance en cache soit rétrogradée
        reg.apply_health(&key("llm-server", "10.0.0.6", 8001), ServiceStatus::Healthy, Duration::from_millis(2));
        assert_eq!(reg.best_instance("llm-server").unwrap().address, ip("10.0.0.5"));

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(reg.best_instance("llm-server").unwrap().address, ip("10.0.0.6"));
    }

    #[test]
    fn test_sighting_is_idempotent_and_resurrects() {
        let reg = registry();
        assert_eq!(
            reg.record_sighting("llm-server", ip("10.0.0.5"), 8001, Origin::Network, Duration::from_millis(5)),
            Sighting::New
        );
        reg.apply_health(&key("llm-server", "10.0.0.5", 8001), ServiceStatus::Unreachable, Duration::ZERO);
        assert_eq!(
            reg.record_sighting("llm-server", ip("10.0.0.5"), 8001, Origin::Network, Duration::from_millis(7)),
            Sighting::Refreshed
        );
        let all = reg.all_instances("llm-server");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, ServiceStatus::Healthy);
    }

    #[test]
    fn test_unknown_instance_health_is_ignored() {
        let reg = registry();
        assert!(reg
            .apply_health(&key("ghost", "10.0.0.1", 1), ServiceStatus::Healthy, Duration::ZERO)
            .is_none());
        assert_eq!(reg.counts(), (0, 0));
    }

    #[test]
    fn test_hosts_group_instances_by_address() {
        let reg = registry();
        let fast = Duration::from_millis(5);
        reg.record_sighting("llm-server", ip("10.0.0.5"), 8001, Origin::Network, fast);
        reg.record_sighting("stt-service", ip("10.0.0.5"), 8002, Origin::Network, fast);
        reg.record_sighting("tts-service", ip("10.0.0.6"), 8003, Origin::Network, fast);
        reg.apply_health(&key("tts-service", "10.0.0.6", 8003), ServiceStatus::Unreachable, fast);

        let hosts = reg.hosts();
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts[0].address, ip("10.0.0.5"));
        assert_eq!(hosts[0].available_services, vec!["llm-server", "stt-service"]);
        assert!(hosts[0].last_seen.is_some());

        assert!(hosts[1].available_services.is_empty());
        assert_eq!(hosts[1].known_services, vec!["tts-service"]);
        assert!(hosts[1].last_seen.is_none());
    }
}

/*!
Doublures de test du noyau (feature `test-support`)
*/

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::probe::{Probe, ProbeFailure, ProbeOutcome};

/// Probe déterministe : réponses fixées par (adresse, port), `Unreachable`
/// pour tout le reste. Sert aux tests et aux démonstrations hors réseau.
#[derive(Default)]
pub struct StaticProbe {
    answers: Mutex<HashMap<(IpAddr, u16), ProbeOutcome>>,
    delay: Mutex<Duration>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl StaticProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn healthy(&self, address: IpAddr, port: u16, latency: Duration) {
        self.answers
            .lock()
            .insert((address, port), ProbeOutcome::Reachable { latency });
    }

    pub fn set(&self, address: IpAddr, port: u16, outcome: ProbeOutcome) {
        self.answers.lock().insert((address, port), outcome);
    }

    pub fn remove(&self, address: IpAddr, port: u16) {
        self.answers.lock().remove(&(address, port));
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl Probe for StaticProbe {
    fn probe(&self, address: IpAddr, port: u16) -> BoxFuture<'_, ProbeOutcome> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);

            let delay = *self.delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let outcome = self
                .answers
                .lock()
                .get(&(address, port))
                .cloned()
                .unwrap_or(ProbeOutcome::Unreachable(ProbeFailure::Connect(
                    "connection refused".into(),
                )));

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            outcome
        })
    }
}

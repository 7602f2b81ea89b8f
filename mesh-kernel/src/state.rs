/**
 * ÉTAT PARTAGÉ - Primitives communes aux registres du coordinateur
 *
 * RÔLE : Verrou unique par registre (Arc<Mutex<T>>) + horloge injectable.
 * Les registres de nœuds et le limiteur de débit lisent l'heure via `Clock`
 * pour que les tests puissent avancer le temps sans dormir.
 */

use parking_lot::Mutex;
use std::sync::Arc;
use time::OffsetDateTime;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Source de temps mur (UTC).
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

pub type SharedClock = Arc<dyn Clock>;

pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

/// Horloge manuelle pour les tests : le temps n'avance que via `advance`.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Shared<OffsetDateTime>,
}

impl ManualClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self { now: new_state(start) }
    }

    pub fn advance(&self, by: time::Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    pub fn set(&self, at: OffsetDateTime) {
        *self.now.lock() = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock()
    }
}

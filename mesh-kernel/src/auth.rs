/**
 * COMMAND AUTHORIZER - Contrôle d'accès des actions privilégiées
 *
 * RÔLE : Décide si un acteur peut lancer une action (shutdown, wakeup...) et
 * trace chaque tentative dans un journal d'audit en ajout seul.
 *
 * ORDRE DES VÉRIFICATIONS (court-circuit au premier échec) :
 * 1. acteur présent dans la table statique
 * 2. action dans ses `allowed_actions`
 * 3. niveau de l'acteur >= niveau requis par l'action
 * 4. limites de débit (N/heure, M/jour), fenêtre glissante purgée à 24h ;
 *    approve, cancel et audit ne sont pas décomptés
 */

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use time::OffsetDateTime;

use crate::config::{ActorConf, MeshConfig};
use crate::state::SharedClock;

/// Niveau exigé pour une action absente de `action_levels`.
pub const UNKNOWN_ACTION_LEVEL: u8 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RateWindow {
    Hourly,
    Daily,
}

impl fmt::Display for RateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateWindow::Hourly => f.write_str("hourly"),
            RateWindow::Daily => f.write_str("daily"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DenyReason {
    #[error("unknown actor '{0}'")]
    UnknownActor(String),
    #[error("action '{action}' is not permitted for '{actor}'")]
    ActionNotPermitted { actor: String, action: String },
    #[error("insufficient level: {actual} < {required}")]
    InsufficientLevel { required: u8, actual: u8 },
    #[error("{window} rate limit of {limit} reached")]
    RateLimited { window: RateWindow, limit: usize },
}

impl DenyReason {
    pub fn code(&self) -> &'static str {
        match self {
            DenyReason::UnknownActor(_) => "unauthorized_actor",
            DenyReason::ActionNotPermitted { .. } => "action_not_permitted",
            DenyReason::InsufficientLevel { .. } => "insufficient_level",
            DenyReason::RateLimited { .. } => "rate_limited",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AuditEntry {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub actor: String,
    pub action: String,
    pub target: Option<String>,
    pub result: String,
}

#[derive(Default)]
pub struct AuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl AuditLog {
    pub fn append(&self, entry: AuditEntry) {
        tracing::info!(
            target: "audit",
            actor = %entry.actor,
            action = %entry.action,
            target_node = entry.target.as_deref().unwrap_or("-"),
            result = %entry.result,
            "audit"
        );
        self.entries.lock().push(entry);
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Actions d'administration du canal lui-même : hors quota.
pub const UNMETERED_ACTIONS: &[&str] = &["approve", "cancel", "audit"];

pub struct Authorizer {
    actors: HashMap<String, ActorConf>,
    action_levels: HashMap<String, u8>,
    hourly_limit: usize,
    daily_limit: usize,
    windows: Mutex<HashMap<String, VecDeque<OffsetDateTime>>>,
    clock: SharedClock,
    audit: AuditLog,
}

impl Authorizer {
    pub fn new(cfg: &MeshConfig, clock: SharedClock) -> Self {
        Self {
            actors: cfg
                .actors
                .iter()
                .map(|a| (a.actor_id.clone(), a.clone()))
                .collect(),
            action_levels: cfg.action_levels.clone(),
            hourly_limit: cfg.rate_limit_hourly,
            daily_limit: cfg.rate_limit_daily,
            windows: Mutex::new(HashMap::new()),
            clock,
            audit: AuditLog::default(),
        }
    }

    pub fn required_level(&self, action: &str) -> u8 {
        self.action_levels
            .get(action)
            .copied()
            .unwrap_or(UNKNOWN_ACTION_LEVEL)
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Vérifie puis journalise la tentative, qu'elle réussisse ou non.
    pub fn authorize(
        &self,
        actor_id: &str,
        action: &str,
        target: Option<&str>,
    ) -> Result<ActorConf, DenyReason> {
        let now = self.clock.now();
        let decision = self.check(actor_id, action, now);

        let result = match &decision {
            Ok(_) => "authorized".to_string(),
            Err(reason) => {
                tracing::warn!("denied {} for {}: {}", action, actor_id, reason);
                format!("denied:{}", reason.code())
            }
        };
        self.audit.append(AuditEntry {
            timestamp: now,
            actor: actor_id.to_string(),
            action: action.to_string(),
            target: target.map(str::to_string),
            result,
        });
        decision
    }

    /// Trace le résultat d'une action déjà autorisée.
    pub fn record_outcome(&self, actor_id: &str, action: &str, target: Option<&str>, result: &str) {
        self.audit.append(AuditEntry {
            timestamp: self.clock.now(),
            actor: actor_id.to_string(),
            action: action.to_string(),
            target: target.map(str::to_string),
            result: result.to_string(),
        });
    }

    fn check(&self, actor_id: &str, action: &str, now: OffsetDateTime) -> Result<ActorConf, DenyReason> {
        let actor = self
            .actors
            .get(actor_id)
            .ok_or_else(|| DenyReason::UnknownActor(actor_id.to_string()))?;

        if !actor.allowed_actions.iter().any(|a| a == action) {
            return Err(DenyReason::ActionNotPermitted {
                actor: actor_id.to_string(),
                action: action.to_string(),
            });
        }

        let required = self.required_level(action);
        if actor.level < required {
            return Err(DenyReason::InsufficientLevel {
                required,
                actual: actor.level,
            });
        }

        if UNMETERED_ACTIONS.contains(&action) {
            return Ok(actor.clone());
        }

        let mut windows = self.windows.lock();
        let window = windows.entry(actor_id.to_string()).or_default();
        while window
            .front()
            .is_some_and(|t| now - *t >= time::Duration::hours(24))
        {
            window.pop_front();
        }
        let last_hour = window
            .iter()
            .filter(|t| now - **t < time::Duration::hours(1))
            .count();
        if last_hour >= self.hourly_limit {
            return Err(DenyReason::RateLimited {
                window: RateWindow::Hourly,
                limit: self.hourly_limit,
            });
        }
        if window.len() >= self.daily_limit {
            return Err(DenyReason::RateLimited {
                window: RateWindow::Daily,
                limit: self.daily_limit,
            });
        }
        window.push_back(now);

        Ok(actor.clone())
    }
}

/**
 * COMMANDES EN ATTENTE - Machine à états des actions soumises à approbation
 *
 * pending → approved | cancelled | expired
 * approved → executed | failed
 *
 * Un minuteur par commande fait passer `pending → expired` à la fin de la
 * fenêtre d'approbation. Il est annulé dès qu'on approuve ou qu'on annule,
 * et ne touche jamais une commande qui n'est plus `pending`.
 */

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::state::{new_state, Shared, SharedClock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Approved,
    Executed,
    Failed,
    Cancelled,
    Expired,
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Approved => "approved",
            CommandStatus::Executed => "executed",
            CommandStatus::Failed => "failed",
            CommandStatus::Cancelled => "cancelled",
            CommandStatus::Expired => "expired",
        };
        f.write_str(s)
    }
}

impl CommandStatus {
    pub fn can_transition_to(self, next: CommandStatus) -> bool {
        use CommandStatus::*;
        matches!(
            (self, next),
            (Pending, Approved)
                | (Pending, Cancelled)
                | (Pending, Expired)
                | (Approved, Executed)
                | (Approved, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CommandStatus::Executed | CommandStatus::Failed | CommandStatus::Cancelled | CommandStatus::Expired
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingCommand {
    pub id: Uuid,
    pub action: String,
    pub target: String,
    pub requester: String,
    pub parameters: serde_json::Value,
    pub status: CommandStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    pub decided_by: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("unknown command {0}")]
    NotFound(Uuid),
    #[error("command {id} is {from}, cannot become {to}")]
    InvalidTransition {
        id: Uuid,
        from: CommandStatus,
        to: CommandStatus,
    },
}

#[derive(Default)]
struct Book {
    commands: HashMap<Uuid, PendingCommand>,
    timers: HashMap<Uuid, JoinHandle<()>>,
}

pub struct CommandBook {
    book: Shared<Book>,
    approval_window: Duration,
    clock: SharedClock,
}

pub type SharedCommandBook = Arc<CommandBook>;

impl CommandBook {
    pub fn new(approval_window: Duration, clock: SharedClock) -> Self {
        Self {
            book: new_state(Book::default()),
            approval_window,
            clock,
        }
    }

    pub fn approval_window(&self) -> Duration {
        self.approval_window
    }

    /// Enregistre une commande `pending` et arme son expiration.
    pub fn submit(
        &self,
        action: &str,
        target: &str,
        requester: &str,
        parameters: serde_json::Value,
    ) -> PendingCommand {
        let now = self.clock.now();
        let cmd = PendingCommand {
            id: Uuid::new_v4(),
            action: action.to_string(),
            target: target.to_string(),
            requester: requester.to_string(),
            parameters,
            status: CommandStatus::Pending,
            created_at: now,
            updated_at: now,
            decided_by: None,
            error: None,
        };
        let id = cmd.id;

        let mut book = self.book.lock();
        book.commands.insert(id, cmd.clone());

        let shared = self.book.clone();
        let clock = self.clock.clone();
        let window = self.approval_window;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let mut book = shared.lock();
            if let Some(cmd) = book.commands.get_mut(&id) {
                if cmd.status == CommandStatus::Pending {
                    cmd.status = CommandStatus::Expired;
                    cmd.updated_at = clock.now();
                    tracing::warn!("command {} ({} on {}) expired without approval", id, cmd.action, cmd.target);
                }
            }
            book.timers.remove(&id);
        });
        book.timers.insert(id, timer);
        tracing::info!("command {} submitted: {} on {} by {}", id, action, target, requester);
        cmd
    }

    fn transition(
        &self,
        id: Uuid,
        to: CommandStatus,
        actor: Option<&str>,
        error: Option<String>,
    ) -> Result<PendingCommand, CommandError> {
        let now = self.clock.now();
        let mut book = self.book.lock();
        let cmd = book.commands.get_mut(&id).ok_or(CommandError::NotFound(id))?;
        if !cmd.status.can_transition_to(to) {
            return Err(CommandError::InvalidTransition {
                id,
                from: cmd.status,
                to,
            });
        }
        cmd.status = to;
        cmd.updated_at = now;
        if let Some(actor) = actor {
            cmd.decided_by = Some(actor.to_string());
        }
        if error.is_some() {
            cmd.error = error;
        }
        let snapshot = cmd.clone();

        if let Some(timer) = book.timers.remove(&id) {
            timer.abort();
        }
        tracing::info!("command {} → {}", id, to);
        Ok(snapshot)
    }

    pub fn approve(&self, id: Uuid, actor: &str) -> Result<PendingCommand, CommandError> {
        self.transition(id, CommandStatus::Approved, Some(actor), None)
    }

    pub fn cancel(&self, id: Uuid, actor: &str) -> Result<PendingCommand, CommandError> {
        self.transition(id, CommandStatus::Cancelled, Some(actor), None)
    }

    /// Résultat de l'exécution d'une commande approuvée.
    pub fn complete(&self, id: Uuid, outcome: Result<(), String>) -> Result<PendingCommand, CommandError> {
        match outcome {
            Ok(()) => self.transition(id, CommandStatus::Executed, None, None),
            Err(e) => self.transition(id, CommandStatus::Failed, None, Some(e)),
        }
    }

    pub fn get(&self, id: Uuid) -> Option<PendingCommand> {
        self.book.lock().commands.get(&id).cloned()
    }

    pub fn list(&self) -> Vec<PendingCommand> {
        let mut all: Vec<PendingCommand> = self.book.lock().commands.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::system_clock;
    use serde_json::json;

    fn book() -> CommandBook {
        CommandBook::new(Duration::from_secs(300), system_clock())
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_expires_after_window() {
        let book = book();
        let cmd = book.submit("shutdown", "rx-node", "@admin:lan", json!({"delay_minutes": 1}));
        assert_eq!(cmd.status, CommandStatus::Pending);

        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(book.get(cmd.id).unwrap().status, CommandStatus::Expired);

        // jamais ressuscitée
        let err = book.approve(cmd.id, "@admin:lan").unwrap_err();
        assert_eq!(
            err,
            CommandError::InvalidTransition { id: cmd.id, from: CommandStatus::Expired, to: CommandStatus::Approved }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_approved_just_before_window_never_expires() {
        let book = book();
        let cmd = book.submit("shutdown", "rx-node", "@admin:lan", json!({}));

        tokio::time::sleep(Duration::from_secs(299)).await;
        book.approve(cmd.id, "@ops:lan").unwrap();

        tokio::time::sleep(Duration::from_secs(60)).await;
        let cmd = book.get(cmd.id).unwrap();
        assert_eq!(cmd.status, CommandStatus::Approved);
        assert_eq!(cmd.decided_by.as_deref(), Some("@ops:lan"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_terminal() {
        let book = book();
        let cmd = book.submit("shutdown", "pi-node", "@admin:lan", json!({}));
        book.cancel(cmd.id, "@admin:lan").unwrap();

        assert!(book.cancel(cmd.id, "@admin:lan").is_err());
        assert!(book.approve(cmd.id, "@admin:lan").is_err());

        tokio::time::sleep(Duration::from_secs(400)).await;
        assert_eq!(book.get(cmd.id).unwrap().status, CommandStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_completion_requires_approval() {
        let book = book();
        let cmd = book.submit("shutdown", "pi-node", "@admin:lan", json!({}));
        assert!(book.complete(cmd.id, Ok(())).is_err());

        book.approve(cmd.id, "@admin:lan").unwrap();
        let done = book.complete(cmd.id, Err("ssh: connection refused".into())).unwrap();
        assert_eq!(done.status, CommandStatus::Failed);
        assert_eq!(done.error.as_deref(), Some("ssh: connection refused"));
        assert!(done.status.is_terminal());
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let book = book();
        let id = Uuid::new_v4();
        assert_eq!(book.approve(id, "@admin:lan").unwrap_err(), CommandError::NotFound(id));
    }

    #[tokio::test]
    async fn test_list_in_submission_order() {
        let book = book();
        let a = book.submit("shutdown", "a", "@admin:lan", json!({}));
        let b = book.submit("shutdown", "b", "@admin:lan", json!({}));
        let ids: Vec<_> = book.list().into_iter().map(|c| c.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&a.id) && ids.contains(&b.id));
    }
}

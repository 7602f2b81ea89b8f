use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Tâches de fond du coordinateur : un jeton d'annulation commun, arrêt
/// explicite et attente de chaque boucle.
pub struct Supervisor {
    cancel: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn track(&mut self, name: &'static str, handle: JoinHandle<()>) {
        tracing::debug!("supervising {}", name);
        self.tasks.push((name, handle));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Annule le jeton puis attend que chaque boucle termine son lot courant.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for (name, handle) in self.tasks {
            match handle.await {
                Ok(()) => tracing::debug!("{} stopped", name),
                Err(e) => tracing::error!("{} ended abnormally: {}", name, e),
            }
        }
        tracing::info!("background tasks stopped");
    }
}

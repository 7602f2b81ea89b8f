/*!
Service HTTP factice pour les tests de probe et de découverte

Écoute sur 127.0.0.1 (port éphémère) et répond à `/health` avec un statut
modifiable à chaud. Compte les requêtes reçues. S'arrête au drop.

Accepte aussi `POST /handshake` comme un coordinateur minimal : les corps
reçus sont conservés et un accusé est renvoyé (ou le statut courant s'il
n'est pas 2xx).
*/

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

#[derive(Clone)]
struct StubState {
    status: Arc<AtomicU16>,
    hits: Arc<AtomicUsize>,
    handshakes: Arc<Mutex<Vec<Value>>>,
}

pub struct StubService {
    addr: SocketAddr,
    state: StubState,
    stop: Option<oneshot::Sender<()>>,
}

async fn health(State(state): State<StubState>) -> (StatusCode, &'static str) {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let code = current_status(&state);
    (code, if code.is_success() { "ok" } else { "degraded" })
}

fn current_status(state: &StubState) -> StatusCode {
    StatusCode::from_u16(state.status.load(Ordering::SeqCst)).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

async fn handshake(State(state): State<StubState>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    let code = current_status(&state);
    if !code.is_success() {
        return (code, Json(json!({ "error": "stub_unavailable", "reason": "stub set to fail" })));
    }
    let count = {
        let mut received = state.handshakes.lock().unwrap_or_else(|e| e.into_inner());
        received.push(body);
        received.len()
    };
    (
        StatusCode::OK,
        Json(json!({
            "status": "success",
            "message": "handshake received",
            "server_timestamp": chrono::Utc::now().to_rfc3339(),
            "cluster_nodes": count,
        })),
    )
}

impl StubService {
    /// Démarre un stub dont `/health` répond `status`.
    pub async fn spawn(status: u16) -> Result<Self> {
        let state = StubState {
            status: Arc::new(AtomicU16::new(status)),
            hits: Arc::new(AtomicUsize::new(0)),
            handshakes: Arc::new(Mutex::new(Vec::new())),
        };
        let app = Router::new()
            .route("/health", get(health))
            .route("/handshake", post(handshake))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let (stop, stopped) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    stopped.await.ok();
                })
                .await;
            if let Err(e) = served {
                log::warn!("stub service on {} failed: {}", addr, e);
            }
        });
        log::debug!("stub service listening on {} (health {})", addr, status);

        Ok(Self {
            addr,
            state,
            stop: Some(stop),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Nombre de requêtes /health reçues.
    pub fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }

    /// Corps JSON reçus sur /handshake, dans l'ordre d'arrivée.
    pub fn handshakes(&self) -> Vec<Value> {
        self.state
            .handshakes
            .lock()
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn set_status(&self, status: u16) {
        self.state.status.store(status, Ordering::SeqCst);
    }
}

impl Drop for StubService {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop.send(()).ok();
        }
    }
}

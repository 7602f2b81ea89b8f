/**
 * API REST MESH - Serveur HTTP du coordinateur
 *
 * RÔLE :
 * Expose le registre de services, le registre de nœuds (handshakes) et le
 * canal de commandes privilégiées aux autres composants du cluster.
 *
 * FONCTIONNEMENT :
 * - Serveur Axum, état unique `AppState` partagé par toutes les routes
 * - Routes : /health, /mesh/..., /handshake, /nodes, /status, /admin/...
 * - Erreurs : corps JSON `{error, reason}` avec un code stable
 *
 * SÉCURITÉ :
 * - Routes /admin/... : identité dans l'en-tête x-actor-id, chaque appel passe
 *   par le Command Authorizer et finit dans le journal d'audit
 * - 401 acteur inconnu, 403 action interdite ou niveau insuffisant, 429 débit
 */

use axum::body::Bytes;
use axum::extract::{FromRequestParts, Path, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::auth::{Authorizer, DenyReason};
use crate::commands::{CommandError, SharedCommandBook};
use crate::config::MeshConfig;
use crate::health::HealthTracker;
use crate::models::{HandshakeRequest, ServiceInstance, ValidationError};
use crate::nodes::SharedNodeRegistry;
use crate::power::{PowerController, PowerError};
use crate::registry::{RegistryError, SharedServiceRegistry};
use crate::scanner::{ScanPlan, Scanner};

pub const ACTOR_HEADER: &str = "x-actor-id";
const ANONYMOUS: &str = "anonymous";

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<MeshConfig>,
    pub services: SharedServiceRegistry,
    pub nodes: SharedNodeRegistry,
    pub auth: Arc<Authorizer>,
    pub commands: SharedCommandBook,
    pub power: Arc<PowerController>,
    pub scanner: Arc<Scanner>,
    pub health_tracker: HealthTracker,
    pub shutdown: CancellationToken,
}

// ---------------------------------------------------------------------------
// Erreurs
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    reason: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, reason: impl Into<String>) -> Self {
        Self {
            status,
            code,
            reason: reason.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "error": self.code, "reason": self.reason })),
        )
            .into_response()
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        ApiError::new(StatusCode::BAD_REQUEST, e.code(), e.to_string())
    }
}

impl From<DenyReason> for ApiError {
    fn from(e: DenyReason) -> Self {
        let status = match e {
            DenyReason::UnknownActor(_) => StatusCode::UNAUTHORIZED,
            DenyReason::ActionNotPermitted { .. } | DenyReason::InsufficientLevel { .. } => {
                StatusCode::FORBIDDEN
            }
            DenyReason::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        };
        ApiError::new(status, e.code(), e.to_string())
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        let code = match e {
            RegistryError::UnknownService(_) => "unknown_service",
            RegistryError::NoHealthyInstance(_) => "no_healthy_instance",
        };
        ApiError::new(StatusCode::NOT_FOUND, code, e.to_string())
    }
}

impl From<CommandError> for ApiError {
    fn from(e: CommandError) -> Self {
        match e {
            CommandError::NotFound(_) => ApiError::new(StatusCode::NOT_FOUND, "unknown_command", e.to_string()),
            CommandError::InvalidTransition { .. } => {
                ApiError::new(StatusCode::CONFLICT, "invalid_transition", e.to_string())
            }
        }
    }
}

impl From<PowerError> for ApiError {
    fn from(e: PowerError) -> Self {
        let status = match e {
            PowerError::UnknownNode(_) => StatusCode::NOT_FOUND,
            PowerError::NoMac(_) | PowerError::InvalidMac { .. } | PowerError::NoManagementAddress(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            PowerError::UnsupportedAction(_) => StatusCode::BAD_REQUEST,
            PowerError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            PowerError::Remote(_) | PowerError::Io(_) => StatusCode::BAD_GATEWAY,
        };
        ApiError::new(status, e.code(), e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Identité de l'appelant
// ---------------------------------------------------------------------------

/// Acteur déclaré par l'en-tête x-actor-id ("anonymous" si absent).
#[derive(Debug, Clone)]
pub struct Actor(pub String);

impl<S: Send + Sync> FromRequestParts<S> for Actor {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = parts
            .headers
            .get(ACTOR_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(ANONYMOUS);
        Ok(Actor(id.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/mesh/services", get(list_services))
        .route("/mesh/service/{name}", get(get_service))
        .route("/mesh/find/{name}", get(find_service))
        .route("/mesh/discover", post(discover))
        .route("/mesh/status", get(mesh_status))
        .route("/mesh/nodes", get(list_discovered_hosts))
        .route("/handshake", post(handshake))
        .route("/nodes", get(list_nodes))
        .route("/nodes/{id}", get(get_node))
        .route("/status", get(cluster_status))
        .route("/admin/commands", get(list_commands))
        .route("/admin/commands/{id}/approve", post(approve_command))
        .route("/admin/commands/{id}/cancel", post(cancel_command))
        .route("/admin/audit", get(get_audit))
        .route("/admin/{node}/shutdown", post(shutdown_node))
        .route("/admin/{node}/wakeup", post(wakeup_node))
        .route("/admin/{node}/status", get(node_power_status))
        .with_state(app_state)
}

// GET /health
async fn get_health(State(app): State<AppState>) -> Json<crate::health::KernelHealth> {
    Json(app.health_tracker.get_health(&app.services, &app.nodes))
}

// GET /mesh/status
async fn mesh_status(State(app): State<AppState>) -> Json<crate::health::MeshStatus> {
    Json(app.health_tracker.mesh_status(&app.services, &app.nodes))
}

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

async fn list_services(State(app): State<AppState>) -> Json<BTreeMap<String, Vec<ServiceInstance>>> {
    let mut by_name: BTreeMap<String, Vec<ServiceInstance>> = BTreeMap::new();
    for inst in app.services.snapshot() {
        by_name.entry(inst.name.clone()).or_default().push(inst);
    }
    Json(by_name)
}

/// Hôtes vus par le scan, avec leurs services disponibles.
async fn list_discovered_hosts(State(app): State<AppState>) -> Json<Value> {
    Json(json!({ "nodes": app.services.hosts() }))
}

async fn get_service(
    State(app): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Vec<ServiceInstance>>, ApiError> {
    let all = app.services.all_instances(&name);
    if all.is_empty() {
        return Err(RegistryError::UnknownService(name).into());
    }
    Ok(Json(all))
}

#[derive(Debug, Serialize)]
struct FindResponse {
    service: ServiceInstance,
    alternatives: Vec<ServiceInstance>,
}

async fn find_service(
    State(app): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<FindResponse>, ApiError> {
    let best = app.services.best_instance(&name)?;
    let alternatives = app
        .services
        .ranked(&name)
        .into_iter()
        .filter(|i| i.key() != best.key())
        .collect();
    Ok(Json(FindResponse {
        service: best,
        alternatives,
    }))
}

/// Préfixe minimal d'une plage passée à `POST /mesh/discover`.
const MIN_REQUESTED_PREFIX: u8 = 16;

#[derive(Debug, Default, Deserialize)]
struct DiscoverRequest {
    ranges: Option<Vec<String>>,
}

// POST /mesh/discover (corps optionnel)
async fn discover(State(app): State<AppState>, body: Bytes) -> Result<Json<Value>, ApiError> {
    let req: DiscoverRequest = if body.iter().all(u8::is_ascii_whitespace) {
        DiscoverRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ValidationError::MalformedBody(e.to_string()))?
    };

    // Les plages fournies par l'appelant sont bornées ; celles de la config non.
    let (ranges, min_prefix_len) = match req.ranges {
        Some(ranges) => (ranges, MIN_REQUESTED_PREFIX),
        None => (app.cfg.scan_ranges.clone(), 0),
    };
    let plan = ScanPlan {
        ranges,
        service_ports: app.cfg.service_ports.clone(),
        concurrency: app.cfg.scan_concurrency,
        min_prefix_len,
    };
    let report = app.scanner.discover(&plan, &app.shutdown).await;
    let (total, healthy) = app.services.counts();
    Ok(Json(json!({
        "report": report,
        "services_count": total,
        "healthy_services": healthy,
    })))
}

// ---------------------------------------------------------------------------
// Nœuds
// ---------------------------------------------------------------------------

// POST /handshake : corps lu brut pour que toute erreur de forme soit un 400
async fn handshake(State(app): State<AppState>, body: Bytes) -> Result<Json<Value>, ApiError> {
    let hs = HandshakeRequest::from_slice(&body)?.validate()?;
    let ack = app.nodes.heartbeat(hs);
    Ok(Json(json!(ack)))
}

async fn list_nodes(State(app): State<AppState>) -> Json<Value> {
    Json(json!(app.nodes.active_nodes()))
}

async fn get_node(State(app): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    match app.nodes.get(&id) {
        Some(node) => Ok(Json(json!(node))),
        None => Err(ApiError::new(StatusCode::NOT_FOUND, "unknown_node", format!("unknown node '{id}'"))),
    }
}

async fn cluster_status(State(app): State<AppState>) -> Json<Value> {
    Json(json!(app.nodes.summary()))
}

// ---------------------------------------------------------------------------
// Commandes privilégiées
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct ShutdownRequest {
    delay_minutes: Option<u32>,
}

fn parse_optional<T: Default + serde::de::DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ValidationError::MalformedBody(e.to_string()).into())
}

/// Exécute une action déjà autorisée (et approuvée si nécessaire).
async fn execute(app: &AppState, action: &str, node: &str, params: &Value) -> Result<Value, PowerError> {
    match action {
        "shutdown" => {
            let delay = params
                .get("delay_minutes")
                .and_then(Value::as_u64)
                .unwrap_or(1) as u32;
            app.power.shutdown(node, delay).await?;
            Ok(json!({ "scheduled_in_minutes": delay }))
        }
        "wakeup" => Ok(json!(app.power.wake(node).await?)),
        "status" => Ok(json!({ "state": app.power.status(node).await })),
        other => Err(PowerError::UnsupportedAction(other.to_string())),
    }
}

/// Autorise, puis met en attente d'approbation ou exécute immédiatement.
async fn request_action(
    app: &AppState,
    actor: &str,
    action: &str,
    node: &str,
    params: Value,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    app.auth.authorize(actor, action, Some(node))?;

    if app.cfg.require_approval.iter().any(|a| a == action) {
        let cmd = app.commands.submit(action, node, actor, params);
        return Ok((
            StatusCode::ACCEPTED,
            Json(json!({
                "status": "pending_approval",
                "expires_in_secs": app.commands.approval_window().as_secs(),
                "command": cmd,
            })),
        ));
    }

    match execute(app, action, node, &params).await {
        Ok(result) => {
            app.auth.record_outcome(actor, action, Some(node), "executed");
            Ok((
                StatusCode::OK,
                Json(json!({ "status": "executed", "action": action, "node_id": node, "result": result })),
            ))
        }
        Err(e) => {
            app.auth
                .record_outcome(actor, action, Some(node), &format!("failed:{}", e.code()));
            Err(e.into())
        }
    }
}

async fn shutdown_node(
    State(app): State<AppState>,
    Actor(actor): Actor,
    Path(node): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let req: ShutdownRequest = parse_optional(&body)?;
    let params = json!({ "delay_minutes": req.delay_minutes.unwrap_or(1) });
    request_action(&app, &actor, "shutdown", &node, params).await
}

async fn wakeup_node(
    State(app): State<AppState>,
    Actor(actor): Actor,
    Path(node): Path<String>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    request_action(&app, &actor, "wakeup", &node, json!({})).await
}

async fn node_power_status(
    State(app): State<AppState>,
    Actor(actor): Actor,
    Path(node): Path<String>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    request_action(&app, &actor, "status", &node, json!({})).await
}

fn parse_command_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|e| {
        ApiError::from(ValidationError::InvalidField {
            field: "id",
            reason: e.to_string(),
        })
    })
}

async fn approve_command(
    State(app): State<AppState>,
    Actor(actor): Actor,
    Path(raw): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_command_id(&raw)?;
    let target = app.commands.get(id).map(|c| c.target);
    app.auth.authorize(&actor, "approve", target.as_deref())?;

    let cmd = app.commands.approve(id, &actor)?;
    let outcome = execute(&app, &cmd.action, &cmd.target, &cmd.parameters).await;
    let (result, done) = match outcome {
        Ok(result) => (result, app.commands.complete(id, Ok(()))?),
        Err(e) => {
            let done = app.commands.complete(id, Err(e.to_string()))?;
            (json!({ "error": e.code(), "reason": e.to_string() }), done)
        }
    };
    app.auth
        .record_outcome(&actor, &cmd.action, Some(&cmd.target), &done.status.to_string());
    Ok(Json(json!({ "command": done, "result": result })))
}

async fn cancel_command(
    State(app): State<AppState>,
    Actor(actor): Actor,
    Path(raw): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_command_id(&raw)?;
    let target = app.commands.get(id).map(|c| c.target);
    app.auth.authorize(&actor, "cancel", target.as_deref())?;
    let cmd = app.commands.cancel(id, &actor)?;
    Ok(Json(json!({ "command": cmd })))
}

async fn list_commands(State(app): State<AppState>, Actor(actor): Actor) -> Result<Json<Value>, ApiError> {
    app.auth.authorize(&actor, "audit", None)?;
    Ok(Json(json!(app.commands.list())))
}

async fn get_audit(State(app): State<AppState>, Actor(actor): Actor) -> Result<Json<Value>, ApiError> {
    app.auth.authorize(&actor, "audit", None)?;
    Ok(Json(json!(app.auth.audit().entries())))
}

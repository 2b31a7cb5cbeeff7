//! [`CompanionServer`] – HTTP + WebSocket surface of the companion.
//!
//! Listens on `127.0.0.1:8080` by default (see [`CompanionServer::with_port`]
//! and [`CompanionServer::with_host`]).
//!
//! | Method | Path | Body / query | Response |
//! |---|---|---|---|
//! | `POST` | `/message` | `{session_id, text}` | `{reply, affect, plan?}` |
//! | `GET` | `/history` | `?session_id=` | `[Turn]` |
//! | `GET` | `/affect` | `?session_id=` | `AffectVector` |
//! | `GET` | `/affect/history` | `?session_id=` | `[AffectSnapshot]` |
//! | `POST` | `/event` | `{session_id, key?}` | `Turn` |
//! | `POST` | `/reindex` | `{session_id}` | `{repaired}` |
//! | `DELETE` | `/session` | `?session_id=` | `{closed}` |
//! | `GET` | `/sessions` | | `{open, logged}` |
//! | `GET` | `/events` | | `{keys}` |
//! | `POST` | `/plan` | `{task}` | `{steps, text}` |
//! | `GET` | `/health` | | status, open sessions, memory counters |
//! | `GET` | `/ws` | | bus events as JSON frames |
//!
//! Validation failures are `400`; a missing or failing planner is `503`; a
//! turn that cannot be persisted is `500`.

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use kindred_middleware::EventBus;
use kindred_runtime::extensions::format_plan;
use kindred_runtime::{Orchestrator, Reply};
use kindred_types::{AffectSnapshot, AffectVector, SessionId, Turn};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::ServerError;
use crate::ws::ws_handler;

/// Default TCP port.
pub const DEFAULT_PORT: u16 = 8080;

// ─────────────────────────────────────────────────────────────────────────────
// State and request shapes
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub bus: EventBus,
}

#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    pub session_id: String,
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
pub struct EventRequest {
    pub session_id: String,
    /// Catalog key; defaults to the current time of day.
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReindexResponse {
    pub repaired: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CloseResponse {
    pub closed: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionsResponse {
    /// Sessions held in memory right now.
    pub open: Vec<SessionId>,
    /// Sessions with durable turns.
    pub logged: Vec<SessionId>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EventKeysResponse {
    pub keys: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct PlanRequest {
    pub task: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PlanResponse {
    pub steps: Vec<String>,
    /// Steps rendered as a numbered list.
    pub text: String,
}

fn session_id(raw: String) -> Result<SessionId, ServerError> {
    Ok(SessionId::parse(raw)?)
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// `POST /message`
///
/// The exchange runs on its own task so that a client hanging up cannot
/// cancel it between the user and assistant writes.
async fn post_message(
    State(state): State<AppState>,
    Json(req): Json<MessageRequest>,
) -> Result<Json<Reply>, ServerError> {
    let sid = session_id(req.session_id)?;
    let text = req.text;
    let orchestrator = Arc::clone(&state.orchestrator);
    let reply = tokio::spawn(async move { orchestrator.handle_message(&sid, &text).await })
        .await
        .map_err(|e| ServerError::Internal(format!("exchange task failed: {e}")))??;
    Ok(Json(reply))
}

/// `GET /history`
async fn get_history(
    State(state): State<AppState>,
    Query(q): Query<SessionQuery>,
) -> Result<Json<Vec<Turn>>, ServerError> {
    let sid = session_id(q.session_id)?;
    Ok(Json(state.orchestrator.history(&sid)?))
}

/// `GET /affect`
async fn get_affect(
    State(state): State<AppState>,
    Query(q): Query<SessionQuery>,
) -> Result<Json<AffectVector>, ServerError> {
    let sid = session_id(q.session_id)?;
    Ok(Json(state.orchestrator.affect(&sid).await))
}

/// `GET /affect/history`
async fn get_affect_history(
    State(state): State<AppState>,
    Query(q): Query<SessionQuery>,
) -> Result<Json<Vec<AffectSnapshot>>, ServerError> {
    let sid = session_id(q.session_id)?;
    Ok(Json(state.orchestrator.affect_history(&sid).await))
}

/// `POST /event`
async fn post_event(
    State(state): State<AppState>,
    Json(req): Json<EventRequest>,
) -> Result<Json<Turn>, ServerError> {
    let sid = session_id(req.session_id)?;
    let orchestrator = Arc::clone(&state.orchestrator);
    let key = req.key;
    let turn = tokio::spawn(async move {
        match key {
            Some(key) => orchestrator.trigger_keyed_event(&sid, &key).await,
            None => orchestrator.trigger_event_now(&sid).await,
        }
    })
    .await
    .map_err(|e| ServerError::Internal(format!("event task failed: {e}")))??;
    turn.map(Json)
        .ok_or_else(|| ServerError::NotFound("no event available for this context".into()))
}

/// `POST /reindex`
async fn post_reindex(
    State(state): State<AppState>,
    Json(q): Json<SessionQuery>,
) -> Result<Json<ReindexResponse>, ServerError> {
    let sid = session_id(q.session_id)?;
    let repaired = state.orchestrator.reindex(&sid).await?;
    Ok(Json(ReindexResponse { repaired }))
}

/// `DELETE /session`
async fn delete_session(
    State(state): State<AppState>,
    Query(q): Query<SessionQuery>,
) -> Result<Json<CloseResponse>, ServerError> {
    let sid = session_id(q.session_id)?;
    Ok(Json(CloseResponse {
        closed: state.orchestrator.close_session(&sid).await,
    }))
}

/// `GET /sessions`
async fn get_sessions(State(state): State<AppState>) -> Result<Json<SessionsResponse>, ServerError> {
    Ok(Json(SessionsResponse {
        open: state.orchestrator.sessions(),
        logged: state.orchestrator.logged_sessions()?,
    }))
}

/// `GET /events`
async fn get_event_keys(State(state): State<AppState>) -> Json<EventKeysResponse> {
    Json(EventKeysResponse {
        keys: state.orchestrator.event_keys(),
    })
}

/// `POST /plan`
async fn post_plan(
    State(state): State<AppState>,
    Json(req): Json<PlanRequest>,
) -> Result<Json<PlanResponse>, ServerError> {
    let steps = state.orchestrator.plan(&req.task).await?;
    let text = format_plan(&steps);
    Ok(Json(PlanResponse { steps, text }))
}

/// `GET /health`
async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "open_sessions": state.orchestrator.sessions().len(),
        "memory": state.orchestrator.memory_stats(),
    }))
}

/// All routes over `state`, with HTTP tracing.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/message", post(post_message))
        .route("/history", get(get_history))
        .route("/affect", get(get_affect))
        .route("/affect/history", get(get_affect_history))
        .route("/event", post(post_event))
        .route("/reindex", post(post_reindex))
        .route("/session", axum::routing::delete(delete_session))
        .route("/sessions", get(get_sessions))
        .route("/events", get(get_event_keys))
        .route("/plan", post(post_plan))
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─────────────────────────────────────────────────────────────────────────────
// CompanionServer
// ─────────────────────────────────────────────────────────────────────────────

/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use kindred_memory::{InMemoryVectorIndex, MemoryCoordinator, SqliteTurnLog};
/// use kindred_middleware::EventBus;
/// use kindred_runtime::{Orchestrator, OrchestratorConfig};
/// use kindred_server::CompanionServer;
///
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let memory = MemoryCoordinator::new(
///     Arc::new(SqliteTurnLog::open_in_memory()?),
///     Arc::new(InMemoryVectorIndex::new()),
/// );
/// let bus = EventBus::default();
/// let orchestrator = Orchestrator::new(Arc::new(memory), OrchestratorConfig::default())
///     .with_bus(bus.clone());
/// CompanionServer::new(Arc::new(orchestrator), bus).with_port(8080).run().await?;
/// # Ok(())
/// # }
/// ```
pub struct CompanionServer {
    state: AppState,
    host: IpAddr,
    port: u16,
}

impl CompanionServer {
    pub fn new(orchestrator: Arc<Orchestrator>, bus: EventBus) -> Self {
        Self {
            state: AppState { orchestrator, bus },
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_PORT,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_host(mut self, host: IpAddr) -> Self {
        self.host = host;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn router(&self) -> Router {
        router(self.state.clone())
    }

    /// Serve until the process is stopped.
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves, then finish in-flight requests.
    ///
    /// # Errors
    ///
    /// [`ServerError::Bind`] if the address is unavailable.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::new(self.host, self.port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        info!(%addr, "companion server listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;
        info!("companion server stopped");
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

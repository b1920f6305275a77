//! Operator dashboard HTTP API.
//!
//! A JSON API over the snapshot store, the user registry, the log file,
//! and the supervised worker process. It runs as its own process
//! (`swatch serve`) and controls the `swatch run` worker through
//! [`WorkerSupervisor`].
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/schedules` | History entries, newest first |
//! | `GET`  | `/schedules/current` | Current snapshot |
//! | `GET`  | `/schedules/{name}` | One history snapshot |
//! | `GET`  | `/schedules/{name}/text` | Snapshot rendered as the bot shows it |
//! | `GET`  | `/users` | All user records |
//! | `POST` | `/users/{id}/ban` | Block a user, body `{"reason": "..."}` is optional |
//! | `POST` | `/users/{id}/unban` | Unblock a user |
//! | `POST` | `/broadcast` | Send `{"message", "user_id"?}` |
//! | `GET`  | `/logs` | Last `?lines=N` lines of the log file |
//! | `DELETE` | `/logs` | Truncate the log file |
//! | `GET`  | `/worker` | Worker status |
//! | `POST` | `/worker/start`, `/worker/stop`, `/worker/restart` | Worker lifecycle |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "snapshot not found: ..." } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `conflict` (409),
//! `not_configured` (503), `internal` (500).

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use schedule_watch_core::format::render_schedule;
use schedule_watch_core::models::Snapshot;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};

use crate::config::{Config, TransportConfig};
use crate::error::{ModerationError, PersistenceError, SupervisorError};
use crate::moderation::{self, ModerationOutcome};
use crate::notify::{Audience, DeliveryReport, Notifier};
use crate::pipeline::display_time;
use crate::recipients::{FileRecipientRegistry, Recipient, RecipientRegistry};
use crate::snapshot::{SnapshotEntry, SnapshotStore};
use crate::supervisor::{WorkerStatus, WorkerSupervisor};
use crate::transport::{TelegramTransport, Transport};

const DEFAULT_LOG_LINES: usize = 200;

/// Shared state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    store: SnapshotStore,
    registry: Arc<dyn RecipientRegistry>,
    supervisor: Arc<WorkerSupervisor>,
    log_path: PathBuf,
    transport: Option<Arc<dyn Transport>>,
    notifier: Option<Arc<Notifier>>,
}

impl AppState {
    pub fn new(
        store: SnapshotStore,
        registry: Arc<dyn RecipientRegistry>,
        supervisor: Arc<WorkerSupervisor>,
        log_path: PathBuf,
    ) -> Self {
        Self {
            store,
            registry,
            supervisor,
            log_path,
            transport: None,
            notifier: None,
        }
    }

    /// Enables broadcasts and moderation notices.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>, config: &TransportConfig) -> Self {
        let notifier = Notifier::new(
            transport.clone(),
            self.registry.clone(),
            Duration::from_secs(config.timeout_secs),
            config.concurrency,
        );
        self.transport = Some(transport);
        self.notifier = Some(Arc::new(notifier));
        self
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/schedules", get(handle_list_schedules))
        .route("/schedules/current", get(handle_current_schedule))
        .route("/schedules/{name}", get(handle_get_schedule))
        .route("/schedules/{name}/text", get(handle_schedule_text))
        .route("/users", get(handle_list_users))
        .route("/users/{id}/ban", post(handle_ban))
        .route("/users/{id}/unban", post(handle_unban))
        .route("/broadcast", post(handle_broadcast))
        .route("/logs", get(handle_get_logs).delete(handle_clear_logs))
        .route("/worker", get(handle_worker_status))
        .route("/worker/start", post(handle_worker_start))
        .route("/worker/stop", post(handle_worker_stop))
        .route("/worker/restart", post(handle_worker_restart))
        .layer(cors)
        .with_state(state)
}

/// Starts the dashboard on `[server].bind`. Runs until the process ends.
pub async fn run_server(config: &Config, config_path: &std::path::Path) -> anyhow::Result<()> {
    let registry: Arc<dyn RecipientRegistry> =
        Arc::new(FileRecipientRegistry::new(&config.storage.users_dir));
    let mut state = AppState::new(
        SnapshotStore::new(&config.storage.snapshots_dir, config.storage.history_limit),
        registry,
        Arc::new(WorkerSupervisor::for_current_exe(config_path)?),
        config.logging.path(),
    );
    match TelegramTransport::new(&config.transport) {
        Ok(transport) => state = state.with_transport(Arc::new(transport), &config.transport),
        Err(e) => tracing::warn!(error = %e, "broadcast and moderation notices disabled"),
    }

    let supervisor = state.supervisor.clone();
    let app = router(state);

    let bind_addr = config.server.bind.clone();
    println!("Dashboard listening on http://{}", bind_addr);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    supervisor.stop().await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn error(status: StatusCode, code: &str, message: impl Into<String>) -> AppError {
    AppError {
        status,
        code: code.to_string(),
        message: message.into(),
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    error(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn not_found(message: impl Into<String>) -> AppError {
    error(StatusCode::NOT_FOUND, "not_found", message)
}

fn not_configured(message: impl Into<String>) -> AppError {
    error(StatusCode::SERVICE_UNAVAILABLE, "not_configured", message)
}

fn internal(message: impl Into<String>) -> AppError {
    error(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
}

impl From<PersistenceError> for AppError {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::InvalidName(_) => bad_request(err.to_string()),
            PersistenceError::NotFound(_) => not_found(err.to_string()),
            _ => {
                tracing::error!(error = %err, "snapshot store error");
                internal(err.to_string())
            }
        }
    }
}

impl From<ModerationError> for AppError {
    fn from(err: ModerationError) -> Self {
        match err {
            ModerationError::UnknownUser(_) => not_found(err.to_string()),
            ModerationError::Registry(_) => internal(err.to_string()),
        }
    }
}

impl From<SupervisorError> for AppError {
    fn from(err: SupervisorError) -> Self {
        match err {
            SupervisorError::AlreadyRunning(_) => error(StatusCode::CONFLICT, "conflict", err.to_string()),
            _ => internal(err.to_string()),
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ /schedules ============

#[derive(Serialize)]
struct ScheduleListResponse {
    snapshots: Vec<SnapshotEntry>,
}

async fn handle_list_schedules(
    State(state): State<AppState>,
) -> Result<Json<ScheduleListResponse>, AppError> {
    Ok(Json(ScheduleListResponse {
        snapshots: state.store.list()?,
    }))
}

async fn handle_current_schedule(State(state): State<AppState>) -> Result<Json<Snapshot>, AppError> {
    state
        .store
        .current()?
        .map(Json)
        .ok_or_else(|| not_found("no schedule has been captured yet"))
}

async fn handle_get_schedule(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Snapshot>, AppError> {
    Ok(Json(state.store.load(&name)?))
}

async fn handle_schedule_text(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<String, AppError> {
    let snapshot = state.store.load(&name)?;
    Ok(render_schedule(
        &snapshot.document,
        &display_time(&snapshot.captured_at),
    ))
}

// ============ /users ============

#[derive(Serialize)]
struct UserListResponse {
    users: Vec<Recipient>,
}

async fn handle_list_users(State(state): State<AppState>) -> Result<Json<UserListResponse>, AppError> {
    let users = state
        .registry
        .all()
        .await
        .map_err(|e| internal(e.to_string()))?;
    Ok(Json(UserListResponse { users }))
}

#[derive(Deserialize, Default)]
struct BanRequest {
    #[serde(default)]
    reason: Option<String>,
}

/// The body is optional; an empty one means the default reason.
async fn handle_ban(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    body: Bytes,
) -> Result<Json<ModerationOutcome>, AppError> {
    let request: BanRequest = if body.is_empty() {
        BanRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| bad_request(format!("invalid body: {}", e)))?
    };
    let outcome = moderation::block(
        state.registry.as_ref(),
        state.transport.as_deref(),
        id,
        request.reason.as_deref(),
    )
    .await?;
    Ok(Json(outcome))
}

async fn handle_unban(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ModerationOutcome>, AppError> {
    let outcome =
        moderation::unblock(state.registry.as_ref(), state.transport.as_deref(), id).await?;
    Ok(Json(outcome))
}

// ============ POST /broadcast ============

#[derive(Deserialize)]
struct BroadcastRequest {
    message: String,
    #[serde(default)]
    user_id: Option<i64>,
}

async fn handle_broadcast(
    State(state): State<AppState>,
    Json(req): Json<BroadcastRequest>,
) -> Result<Json<DeliveryReport>, AppError> {
    if req.message.trim().is_empty() {
        return Err(bad_request("message must not be empty"));
    }
    let notifier = state
        .notifier
        .as_ref()
        .ok_or_else(|| not_configured("transport token is not configured"))?;
    let recipients = state
        .registry
        .all()
        .await
        .map_err(|e| internal(e.to_string()))?;
    let audience = match req.user_id {
        Some(id) => {
            if !recipients.iter().any(|r| r.id == id) {
                return Err(not_found(format!("user {} not found", id)));
            }
            Audience::One(id)
        }
        None => Audience::All,
    };
    Ok(Json(notifier.broadcast(&recipients, &req.message, audience).await))
}

// ============ /logs ============

#[derive(Deserialize)]
struct LogsQuery {
    lines: Option<usize>,
}

#[derive(Serialize)]
struct LogsResponse {
    path: String,
    lines: Vec<String>,
}

async fn handle_get_logs(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<LogsResponse>, AppError> {
    let wanted = query.lines.unwrap_or(DEFAULT_LOG_LINES);
    let content = match tokio::fs::read(&state.log_path).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(internal(format!("cannot read log file: {}", e))),
    };
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(wanted);
    Ok(Json(LogsResponse {
        path: state.log_path.display().to_string(),
        lines: all[start..].iter().map(|l| l.to_string()).collect(),
    }))
}

async fn handle_clear_logs(State(state): State<AppState>) -> Result<StatusCode, AppError> {
    match tokio::fs::OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(&state.log_path)
        .await
    {
        Ok(_) => {
            tracing::info!("log file cleared");
            Ok(StatusCode::NO_CONTENT)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StatusCode::NO_CONTENT),
        Err(e) => Err(internal(format!("cannot clear log file: {}", e))),
    }
}

// ============ /worker ============

async fn handle_worker_status(State(state): State<AppState>) -> Json<WorkerStatus> {
    Json(state.supervisor.status().await)
}

async fn handle_worker_start(State(state): State<AppState>) -> Result<Json<WorkerStatus>, AppError> {
    Ok(Json(state.supervisor.start().await?))
}

async fn handle_worker_stop(State(state): State<AppState>) -> Result<Json<WorkerStatus>, AppError> {
    Ok(Json(state.supervisor.stop().await?))
}

async fn handle_worker_restart(
    State(state): State<AppState>,
) -> Result<Json<WorkerStatus>, AppError> {
    Ok(Json(state.supervisor.restart().await?))
}

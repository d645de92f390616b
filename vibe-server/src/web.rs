//! HTTP surface: JSON API, the SSE chat stream, and tenant hosting.
//!
//! Requests for `<project>.<base-domain>` are answered by the tenant
//! middleware before routing; everything else is the application API.
//! The chat endpoint runs one generation per request on its own task and
//! streams its events back as server-sent events. Dropping the response
//! closes the channel, which stops the run before its next model call.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;

use vibe_agent::llm::{CompletionClient, Message};
use vibe_agent::orchestrator::{self, GenerationContext, StreamEvent};
use vibe_agent::store::{Lifecycle, StoreError};
use vibe_agent::tools::ToolRegistry;

use crate::config::ServerConfig;
use crate::db::{Db, DbError, Project};
use crate::project_id;
use crate::tenant::{self, TenantRouter};

/// Events buffered between the generation task and the response.
const EVENT_BUFFER: usize = 64;

/// Longest project name derived from a prompt.
const MAX_DERIVED_NAME: usize = 60;

/// Shared state for every request.
pub struct AppState {
    pub config: ServerConfig,
    pub db: Db,
    pub tenants: Arc<TenantRouter>,
    pub llm: Arc<dyn CompletionClient>,
}

impl AppState {
    pub fn new(config: ServerConfig, db: Db, llm: Arc<dyn CompletionClient>) -> anyhow::Result<Self> {
        let tenants = TenantRouter::new(config.apps_dir.clone(), &config.base_domain)
            .with_context(|| format!("Invalid base domain {:?}", config.base_domain))?;
        Ok(Self {
            config,
            db,
            tenants: Arc::new(tenants),
            llm,
        })
    }
}

// ── Errors ─────────────────────────────────────────────────────────────

/// An error answered as `{"error": message}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn internal(error: impl std::fmt::Display) -> Self {
        tracing::error!(%error, "Request failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(serde_json::json!({ "error": self.message }))).into_response()
    }
}

impl From<DbError> for ApiError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::Conflict(_) => Self::new(StatusCode::CONFLICT, e.to_string()),
            DbError::Sql(_) => Self::internal(e),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self::internal(e)
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ── Router ─────────────────────────────────────────────────────────────

pub fn router(state: Arc<AppState>) -> Router {
    let tenants = Arc::clone(&state.tenants);
    let cors = cors_layer(&state.config);

    Router::new()
        .route("/api/health", get(api_health))
        .route("/api/users", post(api_create_user))
        .route("/api/projects", get(api_list_projects).post(api_create_project))
        .route("/api/projects/{id}", get(api_project))
        .route("/api/projects/{id}/files", get(api_project_files))
        .route("/api/projects/{id}/chat", post(api_chat))
        .fallback(api_not_found)
        .layer(axum::extract::DefaultBodyLimit::max(2 * 1024 * 1024))
        .layer(cors)
        .layer(axum::middleware::from_fn(security_headers))
        .with_state(state)
        // Outermost, so tenant hosts never reach the API routes.
        .layer(axum::middleware::from_fn_with_state(tenants, tenant::route))
}

fn cors_layer(config: &ServerConfig) -> CorsLayer {
    use axum::http::{Method, header};
    use tower_http::cors::AllowOrigin;

    let origins = [
        format!("https://{}", config.base_domain),
        format!("http://{}", config.base_domain),
        "http://127.0.0.1:5173".to_string(), // vite dev
        "http://localhost:5173".to_string(),
    ];
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(
            origins.iter().filter_map(|o| o.parse().ok()),
        ))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
}

/// Start serving on the configured address.
pub async fn start(state: Arc<AppState>) -> anyhow::Result<(SocketAddr, JoinHandle<anyhow::Result<()>>)> {
    let listener = TcpListener::bind(&state.config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", state.config.listen_addr))?;
    let addr = listener.local_addr()?;
    tracing::info!(
        %addr,
        base_domain = %state.config.base_domain,
        apps_dir = %state.config.apps_dir.display(),
        "HTTP listening"
    );

    let app = router(state);
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await?;
        Ok(())
    });
    Ok((addr, handle))
}

// ── API handlers ───────────────────────────────────────────────────────

async fn api_health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "projects_dir": state.config.apps_dir.display().to_string(),
        "base_domain": state.config.base_domain,
    }))
}

async fn api_not_found() -> ApiError {
    ApiError::not_found("no such endpoint")
}

#[derive(Deserialize)]
struct CreateUser {
    email: String,
}

async fn api_create_user(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateUser>,
) -> ApiResult<impl IntoResponse> {
    let email = req.email.trim().to_ascii_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(ApiError::bad_request("invalid email"));
    }
    let user = state.db.ensure_user(&email)?;
    Ok(Json(user))
}

#[derive(Deserialize)]
struct CreateProject {
    owner_id: i64,
    name: Option<String>,
}

#[derive(Serialize)]
struct ProjectView {
    #[serde(flatten)]
    project: Project,
    lifecycle: Lifecycle,
    preview_url: String,
}

impl ProjectView {
    async fn build(state: &AppState, project: Project) -> Self {
        let lifecycle = state.tenants.store(&project.id).lifecycle().await;
        let preview_url = state.tenants.preview_url(&project.id);
        Self {
            project,
            lifecycle,
            preview_url,
        }
    }
}

/// Ids are random, so a collision is retried rather than reported.
const CREATE_ATTEMPTS: usize = 3;

async fn api_create_project(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateProject>,
) -> ApiResult<impl IntoResponse> {
    if state.db.user(req.owner_id)?.is_none() {
        return Err(ApiError::not_found("unknown user"));
    }
    let name = req
        .name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .unwrap_or("Untitled");

    let mut attempt = 0;
    let project = loop {
        attempt += 1;
        match state.db.create_project(&project_id::generate(), req.owner_id, name) {
            Ok(project) => break project,
            Err(DbError::Conflict(id)) if attempt < CREATE_ATTEMPTS => {
                tracing::debug!(%id, "Project id collision, retrying");
            }
            Err(e) => return Err(e.into()),
        }
    };
    tracing::info!(project = %project.id, owner = project.owner_id, "Project created");
    Ok((StatusCode::CREATED, Json(ProjectView::build(&state, project).await)))
}

#[derive(Deserialize)]
struct OwnerQuery {
    owner_id: i64,
}

async fn api_list_projects(
    State(state): State<Arc<AppState>>,
    Query(q): Query<OwnerQuery>,
) -> ApiResult<Json<Vec<Project>>> {
    Ok(Json(state.db.projects_for_owner(q.owner_id)?))
}

fn checked_id(id: &str) -> ApiResult<()> {
    if project_id::is_valid(id) {
        Ok(())
    } else {
        Err(ApiError::bad_request("invalid project id"))
    }
}

async fn api_project(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<ProjectView>> {
    checked_id(&id)?;
    let project = state
        .db
        .project(&id)?
        .ok_or_else(|| ApiError::not_found("unknown project"))?;
    Ok(Json(ProjectView::build(&state, project).await))
}

async fn api_project_files(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<serde_json::Value>> {
    checked_id(&id)?;
    if state.db.project(&id)?.is_none() {
        return Err(ApiError::not_found("unknown project"));
    }
    let files = match state.tenants.store(&id).list(None).await {
        Ok(files) => files,
        // Nothing generated yet.
        Err(StoreError::NotFound(_)) => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    Ok(Json(serde_json::json!({ "files": files })))
}

// ── Chat stream ────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatRequest {
    owner_id: i64,
    messages: Vec<ChatMessage>,
}

fn history(messages: Vec<ChatMessage>) -> ApiResult<Vec<Message>> {
    if messages.is_empty() {
        return Err(ApiError::bad_request("messages must not be empty"));
    }
    messages
        .into_iter()
        .map(|m| {
            if m.content.trim().is_empty() {
                return Err(ApiError::bad_request("message content must not be empty"));
            }
            match m.role.as_str() {
                "user" => Ok(Message::user(m.content)),
                "assistant" => Ok(Message::assistant(m.content)),
                other => Err(ApiError::bad_request(format!("unknown role: {other}"))),
            }
        })
        .collect()
}

/// A project name from the opening prompt: its first line, shortened.
fn derive_name(history: &[Message]) -> String {
    let prompt = history
        .iter()
        .find(|m| m.role == "user")
        .map(|m| m.content.text())
        .unwrap_or_default();
    let first_line = prompt.lines().next().unwrap_or_default().trim();
    if first_line.is_empty() {
        return "Untitled".to_string();
    }
    first_line.chars().take(MAX_DERIVED_NAME).collect()
}

async fn api_chat(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatRequest>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    checked_id(&id)?;
    let history = history(req.messages)?;
    if state.db.user(req.owner_id)?.is_none() {
        return Err(ApiError::not_found("unknown user"));
    }

    match state.db.project(&id)? {
        Some(project) if project.owner_id != req.owner_id => {
            tracing::warn!(project = %id, owner = req.owner_id, "Chat refused: not the owner");
            return Err(ApiError::new(StatusCode::FORBIDDEN, "project belongs to another user"));
        }
        Some(_) => {
            state.db.touch_project(&id)?;
        }
        None => {
            state.db.create_project(&id, req.owner_id, &derive_name(&history))?;
            tracing::info!(project = %id, owner = req.owner_id, "Project created from chat");
        }
    }

    let ctx = GenerationContext::new(
        id.clone(),
        ToolRegistry::new(state.tenants.store(&id)),
        history,
    )
    .with_max_steps(state.config.max_steps);

    let (tx, rx) = mpsc::channel::<StreamEvent>(EVENT_BUFFER);
    let task_state = Arc::clone(&state);
    tokio::spawn(async move {
        let llm = Arc::clone(&task_state.llm);
        let summary = orchestrator::run(llm.as_ref(), ctx, &tx).await;
        if let Err(e) = task_state.db.touch_project(&id) {
            tracing::warn!(project = %id, error = %e, "Failed to touch project");
        }
        let lifecycle = task_state.tenants.store(&id).lifecycle().await;
        tracing::info!(
            project = %id,
            steps = summary.steps,
            tool_calls = summary.tool_calls,
            outcome = ?summary.outcome,
            ?lifecycle,
            "Generation ended"
        );
    });

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        let event = rx.recv().await?;
        Some((Ok(to_sse_event(&event)), rx))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn to_sse_event(event: &StreamEvent) -> Event {
    Event::default()
        .json_data(event)
        .unwrap_or_else(|_| Event::default().data("{}"))
}

// ── Security headers middleware ────────────────────────────────────────

async fn security_headers(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    let mut resp = next.run(req).await;
    let headers = resp.headers_mut();
    headers.insert("X-Content-Type-Options", HeaderValue::from_static("nosniff"));
    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    headers.insert(
        "Referrer-Policy",
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    if !headers.contains_key("content-security-policy") {
        headers.insert(
            "Content-Security-Policy",
            HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
        );
    }
    resp
}

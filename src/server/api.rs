//! HTTP API: route table, request payloads, and handlers.
//!
//! Enum-ish request fields (column, priority, ref type) travel as strings and
//! are parsed with `FromStr`, so invalid values come back as a 400 with
//! `{"error": ...}` instead of a serde rejection.

use std::path::Path;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path as UrlPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::board::store::BoardStore;
use crate::board::{Comment, FileContext, RefType, Task, TaskColumn, TaskRef};
use crate::delivery::EventDelivery;
use crate::errors::{StoreError, SupervisorError};
use crate::logs::{LogStore, MAX_TAIL_LINES};
use crate::paths::{ClambanPaths, normalize_lexically, resolve_under};
use crate::supervisor::{CycleConfig, CycleState, Supervisor};
use crate::team::{DEFAULT_MAX_TURNS, TeamConfig, discover_teams};
use crate::watcher::ResilientWatcher;

use super::sse::{self, SseEvent, SseSender};

/// Default number of log lines returned by the logs endpoint.
const DEFAULT_LOG_LINES: usize = 200;

/// Search result limit: default and hard cap.
const DEFAULT_SEARCH_LIMIT: usize = 20;
const MAX_SEARCH_LIMIT: usize = 100;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub store: Mutex<BoardStore>,
    pub sse_tx: SseSender,
    pub supervisor: Supervisor,
    pub logs: LogStore,
    pub paths: ClambanPaths,
    pub claude_cmd: String,
    pub port: u16,
    /// Watcher over the connected team's external directory.
    pub team_watcher: std::sync::Mutex<Option<ResilientWatcher>>,
    /// Retrying fan-out used by the watcher callback.
    pub watcher_delivery: Arc<EventDelivery>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateTaskRequest {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub column: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default, rename = "type")]
    pub task_type: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub assignee: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdateTaskRequest {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub column: Option<String>,
    #[serde(default)]
    pub order: Option<f64>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default, rename = "type")]
    pub task_type: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub assignee: Option<String>,
}

#[derive(Deserialize)]
pub struct CommentRequest {
    pub text: String,
    #[serde(default)]
    pub author: Option<String>,
}

#[derive(Deserialize)]
pub struct ContextRequest {
    pub path: String,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefRequest {
    pub task_id: String,
    #[serde(rename = "type")]
    pub ref_type: String,
}

#[derive(Deserialize)]
pub struct BulkParams {
    #[serde(default)]
    pub ids: Option<String>,
}

#[derive(Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub q: Option<String>,
    #[serde(default)]
    pub column: Option<String>,
    #[serde(default)]
    pub limit: Option<String>,
}

#[derive(Deserialize)]
pub struct LogsParams {
    #[serde(default)]
    pub lines: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    pub name: String,
    pub project_dir: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_turns: Option<u32>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamStatusResponse {
    pub connected: bool,
    pub team: Option<TeamConfig>,
    pub running: bool,
    pub state: String,
    pub turns_used: u32,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::TaskNotFound { .. } => ApiError::NotFound(err.to_string()),
            StoreError::UnknownColumn { .. }
            | StoreError::PathEscape { .. }
            | StoreError::NoTeamConnected => ApiError::BadRequest(err.to_string()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<SupervisorError> for ApiError {
    fn from(err: SupervisorError) -> Self {
        match err {
            SupervisorError::AlreadyRunning => ApiError::Conflict(err.to_string()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/board", get(get_board))
        .route("/api/tasks", get(bulk_tasks).post(create_task))
        .route("/api/tasks/search", get(search_tasks))
        .route(
            "/api/tasks/:id",
            axum::routing::patch(update_task).delete(delete_task),
        )
        .route("/api/tasks/:id/comments", post(add_comment))
        .route("/api/tasks/:id/context", post(add_context))
        .route("/api/tasks/:id/refs", post(add_ref))
        .route("/api/tasks/:id/refs/:target", axum::routing::delete(remove_ref))
        .route("/api/team", get(get_team))
        .route("/api/team/connect", post(team_connect))
        .route("/api/team/disconnect", post(team_disconnect))
        .route("/api/team/start", post(team_start))
        .route("/api/team/stop", post(team_stop))
        .route("/api/team/logs", get(team_logs))
        .route("/api/teams/available", get(teams_available))
        .route("/api/events", get(sse::sse_handler))
        .route("/health", get(health_check))
}

// ── Helpers ───────────────────────────────────────────────────────────

/// Every successful mutation fans out over SSE and feeds the supervisor's
/// debounce input.
fn notify_board_change(state: &SharedState) {
    sse::broadcast_event(&state.sse_tx, SseEvent::BoardChanged);
    state.supervisor.notify_board_changed();
}

fn parse_column(value: &str) -> Result<TaskColumn, ApiError> {
    value
        .parse::<TaskColumn>()
        .map_err(|e| ApiError::BadRequest(e.to_string()))
}

/// Forgiving numeric query param: non-numeric input falls back to the
/// default rather than erroring.
fn parse_limit(raw: Option<&str>, default: usize, cap: usize) -> usize {
    raw.and_then(|s| s.parse::<usize>().ok()).unwrap_or(default).min(cap)
}

fn task_matches(task: &Task, needle: &str) -> bool {
    if needle.is_empty() {
        return true;
    }
    task.title.to_lowercase().contains(needle)
        || task.description.to_lowercase().contains(needle)
        || task.tags.iter().any(|t| t.to_lowercase().contains(needle))
}

// ── Board & task handlers ─────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn get_board(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let store = state.store.lock().await;
    let board = store.read()?;
    Ok(Json(board))
}

async fn create_task(
    State(state): State<SharedState>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.title.trim().is_empty() {
        return Err(ApiError::BadRequest("title must not be empty".into()));
    }
    let column = match req.column.as_deref() {
        Some(raw) => parse_column(raw)?,
        None => TaskColumn::Backlog,
    };
    let priority = match req.priority.as_deref() {
        Some(raw) => raw.parse().map_err(ApiError::BadRequest)?,
        None => Default::default(),
    };
    let task_type = match req.task_type.as_deref() {
        Some(raw) => raw.parse().map_err(ApiError::BadRequest)?,
        None => Default::default(),
    };

    let store = state.store.lock().await;
    let mut board = store.read()?;

    let mut task = Task::new(
        Uuid::new_v4().to_string(),
        req.title.trim(),
        column,
        board.next_order(column),
    );
    task.description = req.description.unwrap_or_default();
    task.priority = priority;
    task.task_type = task_type;
    task.tags = req.tags.unwrap_or_default();
    task.assignee = req.assignee;

    board.tasks.insert(task.id.clone(), task.clone());
    store.write(&board)?;
    drop(store);

    notify_board_change(&state);
    Ok((StatusCode::CREATED, Json(task)))
}

async fn update_task(
    State(state): State<SharedState>,
    UrlPath(id): UrlPath<String>,
    Json(req): Json<UpdateTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    // Parse before mutating so a bad field leaves the board untouched.
    let column = req.column.as_deref().map(parse_column).transpose()?;
    let priority = req
        .priority
        .as_deref()
        .map(|raw| raw.parse().map_err(ApiError::BadRequest))
        .transpose()?;
    let task_type = req
        .task_type
        .as_deref()
        .map(|raw| raw.parse().map_err(ApiError::BadRequest))
        .transpose()?;

    let store = state.store.lock().await;
    let mut board = store.read()?;
    let task = board
        .tasks
        .get_mut(&id)
        .ok_or_else(|| ApiError::NotFound(format!("Task {} not found", id)))?;

    if let Some(title) = req.title {
        if title.trim().is_empty() {
            return Err(ApiError::BadRequest("title must not be empty".into()));
        }
        task.title = title;
    }
    if let Some(description) = req.description {
        task.description = description;
    }
    if let Some(column) = column {
        task.column = column;
    }
    if let Some(order) = req.order {
        task.order = order;
    }
    if let Some(priority) = priority {
        task.priority = priority;
    }
    if let Some(task_type) = task_type {
        task.task_type = task_type;
    }
    if let Some(tags) = req.tags {
        task.tags = tags;
    }
    if let Some(assignee) = req.assignee {
        task.assignee = Some(assignee);
    }
    task.touch();
    let updated = task.clone();

    store.write(&board)?;
    drop(store);

    notify_board_change(&state);
    Ok(Json(updated))
}

async fn delete_task(
    State(state): State<SharedState>,
    UrlPath(id): UrlPath<String>,
) -> Result<impl IntoResponse, ApiError> {
    let store = state.store.lock().await;
    let mut board = store.read()?;
    if board.remove_task(&id).is_none() {
        return Err(ApiError::NotFound(format!("Task {} not found", id)));
    }
    store.write(&board)?;
    drop(store);

    notify_board_change(&state);
    Ok(Json(json!({"deleted": id})))
}

async fn add_comment(
    State(state): State<SharedState>,
    UrlPath(id): UrlPath<String>,
    Json(req): Json<CommentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.text.trim().is_empty() {
        return Err(ApiError::BadRequest("comment text must not be empty".into()));
    }

    let store = state.store.lock().await;
    let mut board = store.read()?;
    let task = board
        .tasks
        .get_mut(&id)
        .ok_or_else(|| ApiError::NotFound(format!("Task {} not found", id)))?;

    let comment = Comment {
        id: Uuid::new_v4().to_string(),
        author: req.author,
        text: req.text,
        created_at: chrono::Utc::now(),
    };
    task.comments.push(comment.clone());
    task.touch();

    store.write(&board)?;
    drop(store);

    notify_board_change(&state);
    Ok((StatusCode::CREATED, Json(comment)))
}

async fn add_context(
    State(state): State<SharedState>,
    UrlPath(id): UrlPath<String>,
    Json(req): Json<ContextRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let store = state.store.lock().await;
    let mut board = store.read()?;

    let project_dir = board
        .meta
        .team
        .as_ref()
        .map(|t| t.project_dir.clone())
        .ok_or_else(|| ApiError::from(StoreError::NoTeamConnected))?;

    if Path::new(&req.path).is_absolute() {
        return Err(ApiError::BadRequest(
            "context paths must be relative to the project directory".into(),
        ));
    }
    let resolved = resolve_under(&project_dir, Path::new(&req.path)).ok_or_else(|| {
        ApiError::from(StoreError::PathEscape {
            path: req.path.clone(),
        })
    })?;
    let resolved = resolved.to_string_lossy().to_string();

    let task = board
        .tasks
        .get_mut(&id)
        .ok_or_else(|| ApiError::NotFound(format!("Task {} not found", id)))?;

    // Dedupe by resolved path.
    if let Some(existing) = task.context.iter().find(|c| c.path == resolved) {
        return Ok((StatusCode::CREATED, Json(existing.clone())));
    }

    let entry = FileContext {
        path: resolved,
        note: req.note,
    };
    task.context.push(entry.clone());
    task.touch();

    store.write(&board)?;
    drop(store);

    notify_board_change(&state);
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn add_ref(
    State(state): State<SharedState>,
    UrlPath(id): UrlPath<String>,
    Json(req): Json<RefRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let ref_type: RefType = req.ref_type.parse().map_err(ApiError::BadRequest)?;

    let store = state.store.lock().await;
    let mut board = store.read()?;
    let added = board.add_ref(&id, &req.task_id, ref_type)?;
    if added {
        store.write(&board)?;
    }
    drop(store);

    if added {
        notify_board_change(&state);
    }
    Ok((
        StatusCode::CREATED,
        Json(TaskRef {
            task_id: req.task_id,
            ref_type,
        }),
    ))
}

async fn remove_ref(
    State(state): State<SharedState>,
    UrlPath((id, target)): UrlPath<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let store = state.store.lock().await;
    let mut board = store.read()?;
    let removed = board.remove_refs_between(&id, &target)?;
    if removed {
        store.write(&board)?;
    }
    drop(store);

    if removed {
        notify_board_change(&state);
    }
    Ok(Json(json!({"removed": removed})))
}

async fn bulk_tasks(
    State(state): State<SharedState>,
    Query(params): Query<BulkParams>,
) -> Result<impl IntoResponse, ApiError> {
    let ids: Vec<String> = params
        .ids
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if ids.is_empty() {
        return Err(ApiError::BadRequest("ids query parameter is required".into()));
    }

    let store = state.store.lock().await;
    let board = store.read()?;
    let tasks: Vec<Task> = ids.iter().filter_map(|id| board.tasks.get(id).cloned()).collect();
    Ok(Json(tasks))
}

async fn search_tasks(
    State(state): State<SharedState>,
    Query(params): Query<SearchParams>,
) -> Result<impl IntoResponse, ApiError> {
    let needle = params.q.unwrap_or_default().to_lowercase();
    let column = params.column.as_deref().map(parse_column).transpose()?;
    let limit = parse_limit(params.limit.as_deref(), DEFAULT_SEARCH_LIMIT, MAX_SEARCH_LIMIT);

    let store = state.store.lock().await;
    let board = store.read()?;

    let mut results: Vec<Task> = Vec::new();
    for col in TaskColumn::all() {
        if let Some(filter) = column
            && col != filter
        {
            continue;
        }
        for task in board.tasks_in_column(col) {
            if task_matches(task, &needle) {
                results.push(task.clone());
                if results.len() >= limit {
                    return Ok(Json(results));
                }
            }
        }
    }
    Ok(Json(results))
}

// ── Team handlers ─────────────────────────────────────────────────────

async fn get_team(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let store = state.store.lock().await;
    let board = store.read()?;
    drop(store);

    let team = board.meta.team;
    let status = state.supervisor.status();
    let running = team
        .as_ref()
        .map(|t| state.supervisor.is_running(&t.name))
        .unwrap_or(false);

    Ok(Json(TeamStatusResponse {
        connected: team.is_some(),
        team,
        running,
        state: status.state.as_str().to_string(),
        turns_used: status.turns_used,
    }))
}

async fn team_connect(
    State(state): State<SharedState>,
    Json(req): Json<ConnectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let name = req.name.trim().to_string();
    if name.is_empty() || name.contains('/') || name.contains("..") {
        return Err(ApiError::BadRequest("invalid team name".into()));
    }
    let project_dir = Path::new(&req.project_dir);
    if !project_dir.is_absolute() {
        return Err(ApiError::BadRequest("projectDir must be an absolute path".into()));
    }

    let config = TeamConfig {
        name: name.clone(),
        project_dir: normalize_lexically(project_dir),
        model: req.model,
        max_turns: req.max_turns.unwrap_or(DEFAULT_MAX_TURNS),
    };

    // One supervisor per process: a still-running previous team stops first.
    if state.supervisor.status().state != CycleState::Stopped {
        state.supervisor.stop().await;
    }

    let mut store = state.store.lock().await;
    store.set_active_team(Some(&name))?;
    let mut board = store.read()?;
    board.meta.team = Some(config.clone());
    store.write(&board)?;
    drop(store);

    if let Err(err) = super::start_team_watcher(&state, &name) {
        tracing::warn!(team = %name, error = %err, "failed to start team watcher");
    }

    sse::broadcast_event(&state.sse_tx, SseEvent::TeamChanged);
    Ok(Json(config))
}

async fn team_disconnect(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    // Stop the agent before dropping the binding.
    if state.supervisor.status().state != CycleState::Stopped {
        state.supervisor.stop().await;
    }
    super::stop_team_watcher(&state);

    let mut store = state.store.lock().await;
    let mut board = store.read()?;
    if board.meta.team.take().is_some() {
        store.write(&board)?;
    }
    store.set_active_team(None)?;
    drop(store);

    sse::broadcast_event(&state.sse_tx, SseEvent::TeamChanged);
    Ok(Json(json!({"disconnected": true})))
}

async fn team_start(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let store = state.store.lock().await;
    let board = store.read()?;
    drop(store);

    let team = board
        .meta
        .team
        .ok_or_else(|| ApiError::from(StoreError::NoTeamConnected))?;
    if state.supervisor.is_running(&team.name) {
        return Err(ApiError::Conflict("team is already running".into()));
    }

    state
        .supervisor
        .start(CycleConfig {
            team,
            port: state.port,
            claude_cmd: state.claude_cmd.clone(),
        })
        .await?;

    sse::broadcast_event(&state.sse_tx, SseEvent::TeamChanged);
    Ok(Json(json!({"started": true})))
}

async fn team_stop(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    state.supervisor.stop().await;
    sse::broadcast_event(&state.sse_tx, SseEvent::TeamChanged);
    Ok(Json(json!({"stopped": true})))
}

async fn team_logs(
    State(state): State<SharedState>,
    Query(params): Query<LogsParams>,
) -> Result<impl IntoResponse, ApiError> {
    let store = state.store.lock().await;
    let team = store
        .active_team()
        .map(str::to_string)
        .ok_or_else(|| ApiError::from(StoreError::NoTeamConnected))?;
    drop(store);

    let lines = parse_limit(params.lines.as_deref(), DEFAULT_LOG_LINES, MAX_TAIL_LINES);
    let tail = state
        .logs
        .read_tail(&team, lines)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(tail))
}

async fn teams_available(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(discover_teams(&state.paths)))
}

//! Server assembly: state construction, router, listener, and the wiring
//! between the HTTP layer, the SSE hub, the supervisor, and the team
//! watcher.

pub mod api;
pub mod sse;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::board::store::BoardStore;
use crate::delivery::{DeliveryConfig, EventDelivery};
use crate::logs::LogStore;
use crate::paths::ClambanPaths;
use crate::supervisor::{Supervisor, SupervisorTimings};
use crate::watcher::{ResilientWatcher, WatcherConfig};

use api::{AppState, SharedState};
use sse::SseEvent;

/// Default port for the local HTTP API.
pub const DEFAULT_PORT: u16 = 4417;

/// Heartbeat for the external team-directory watcher. The directory is
/// managed by an outside tool and may vanish; this is how fast we notice.
const TEAM_WATCH_HEARTBEAT: Duration = Duration::from_secs(30);

pub struct ServerConfig {
    pub port: u16,
    pub data_dir: Option<PathBuf>,
    pub teams_dir: Option<PathBuf>,
    pub claude_cmd: String,
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            data_dir: None,
            teams_dir: None,
            claude_cmd: std::env::var("CLAMBAN_CLAUDE_CMD").unwrap_or_else(|_| "claude".to_string()),
            dev_mode: false,
        }
    }
}

/// Build the shared state. Must run inside a tokio runtime (the supervisor
/// task spawns here).
pub fn build_state(config: &ServerConfig) -> SharedState {
    let defaults = ClambanPaths::new();
    let root = config
        .data_dir
        .clone()
        .unwrap_or_else(|| defaults.root().to_path_buf());
    let teams_root = config
        .teams_dir
        .clone()
        .unwrap_or_else(|| defaults.teams_root().to_path_buf());
    let paths = ClambanPaths::with_roots(root, teams_root);

    let store = BoardStore::open(paths.clone());
    let logs = LogStore::new(paths.clone());
    let sse_tx = sse::channel();

    let exit_tx = sse_tx.clone();
    let supervisor = Supervisor::spawn(
        paths.clone(),
        logs.clone(),
        SupervisorTimings::default(),
        Arc::new(move || {
            sse::broadcast_event(&exit_tx, SseEvent::TeamChanged);
        }),
    );

    Arc::new(AppState {
        store: tokio::sync::Mutex::new(store),
        sse_tx,
        supervisor,
        logs,
        paths,
        claude_cmd: config.claude_cmd.clone(),
        port: config.port,
        team_watcher: std::sync::Mutex::new(None),
        watcher_delivery: Arc::new(EventDelivery::new(DeliveryConfig {
            max_retries: 2,
            base_delay: Duration::from_millis(50),
        })),
    })
}

pub fn build_router(state: SharedState) -> Router {
    api::api_router().with_state(state)
}

/// Watch the connected team's external directory. Events fan out as
/// `team-changed` (through the retrying delivery primitive) and feed the
/// supervisor's debounce input. Replaces any previous watcher.
pub(crate) fn start_team_watcher(state: &SharedState, team: &str) -> Result<(), notify::Error> {
    let config = WatcherConfig {
        directories: vec![state.paths.team_dir(team)],
        heartbeat_timeout: TEAM_WATCH_HEARTBEAT,
        recursive: true,
    };

    let sse_tx = state.sse_tx.clone();
    let supervisor = state.supervisor.clone();
    let delivery = Arc::clone(&state.watcher_delivery);
    let mut watcher = ResilientWatcher::new(
        config,
        Arc::new(move |_path| {
            let sse_tx = sse_tx.clone();
            let supervisor = supervisor.clone();
            let delivery = Arc::clone(&delivery);
            tokio::spawn(async move {
                delivery
                    .deliver(|| {
                        let sse_tx = sse_tx.clone();
                        let supervisor = supervisor.clone();
                        async move {
                            sse::broadcast_event(&sse_tx, SseEvent::TeamChanged);
                            supervisor.notify_board_changed();
                            Ok(())
                        }
                    })
                    .await;
            });
        }),
    );
    watcher.start()?;

    if let Ok(mut guard) = state.team_watcher.lock() {
        if let Some(mut previous) = guard.take() {
            previous.stop();
        }
        *guard = Some(watcher);
    }
    Ok(())
}

pub(crate) fn stop_team_watcher(state: &SharedState) {
    if let Ok(mut guard) = state.team_watcher.lock()
        && let Some(mut watcher) = guard.take()
    {
        watcher.stop();
    }
}

/// Start the server and block until shutdown.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    let state = build_state(&config);

    // A team binding persisted by a previous run comes back watched.
    let active = {
        let store = state.store.lock().await;
        store.active_team().map(str::to_string)
    };
    if let Some(team) = active {
        tracing::info!(team = %team, "rehydrated active team");
        if let Err(err) = start_team_watcher(&state, &team) {
            tracing::warn!(team = %team, error = %err, "failed to watch team directory");
        }
    }

    let mut app = build_router(Arc::clone(&state));
    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    // Local tool: bind loopback unless explicitly in dev mode.
    let host = if config.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    tracing::info!(addr = %listener.local_addr()?, "clamban listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Leave no lead process behind.
    state.supervisor.stop().await;
    stop_team_watcher(&state);
    tracing::info!("server shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to install Ctrl+C handler");
    }
}

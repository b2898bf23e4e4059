/**
 * HTTP surface
 *
 * `/ws` upgrades browsers into hub clients, `/api/status` reports hub and
 * watcher health, `/healthz` answers liveness probes and everything else is
 * served from the static asset directory.
 */
use crate::config::ConnectionConfig;
use crate::error::Result;
use crate::hub::{ClientConnection, HubHandle, HubStats};
use crate::k8s::WatchStats;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub connection: ConnectionConfig,
    pub client_queue_capacity: usize,
    pub watchers: Vec<watch::Receiver<WatchStats>>,
    pub in_cluster: bool,
    /// Every upgraded socket, so shutdown can wait for their close frames
    pub connections: TaskTracker,
}

impl AppState {
    #[must_use]
    pub fn new(hub: HubHandle, client_queue_capacity: usize) -> Self {
        Self {
            hub,
            connection: ConnectionConfig::default(),
            client_queue_capacity,
            watchers: Vec::new(),
            in_cluster: false,
            connections: TaskTracker::new(),
        }
    }

    #[must_use]
    pub fn with_watchers(mut self, watchers: Vec<watch::Receiver<WatchStats>>) -> Self {
        self.watchers = watchers;
        self
    }

    #[must_use]
    pub const fn in_cluster(mut self, in_cluster: bool) -> Self {
        self.in_cluster = in_cluster;
        self
    }
}

/// Body of `GET /api/status`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub is_running_in_cluster: bool,
    #[serde(flatten)]
    pub hub: HubStats,
    pub watchers: Vec<WatchStats>,
}

pub fn router(state: AppState, static_dir: impl AsRef<Path>) -> Router {
    Router::new()
        .route("/ws", get(upgrade))
        .route("/api/status", get(status))
        .route("/healthz", get(healthz))
        .fallback_service(ServeDir::new(static_dir.as_ref()))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let max_message_size = state.connection.max_message_size;
    let connections = state.connections.clone();
    ws.max_message_size(max_message_size).on_upgrade(move |socket| {
        connections.track_future(async move {
            let connection =
                ClientConnection::new(state.hub, state.connection, state.client_queue_capacity);
            let id = connection.id();
            let reason = connection.serve(socket).await;
            debug!("Client {} finished: {:?}", id, reason);
        })
    })
}

async fn status(
    State(state): State<AppState>,
) -> std::result::Result<Json<StatusResponse>, StatusCode> {
    let hub = state
        .hub
        .stats()
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    let watchers = state
        .watchers
        .iter()
        .map(|rx| rx.borrow().clone())
        .collect();

    Ok(Json(StatusResponse {
        is_running_in_cluster: state.in_cluster,
        hub,
        watchers,
    }))
}

async fn healthz() -> &'static str {
    "ok"
}

/// Serve `app` on `listener` until `shutdown` fires
///
/// # Errors
///
/// Returns an error if the listener fails
pub async fn serve(listener: TcpListener, app: Router, shutdown: CancellationToken) -> Result<()> {
    let addr = listener.local_addr()?;
    info!("🌐 Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    info!("✅ Server stopped");
    Ok(())
}

/// Wait up to `limit` for every tracked connection to finish closing.
///
/// Returns `false` if some were still open when the limit passed.
pub async fn drain(connections: &TaskTracker, limit: Duration) -> bool {
    connections.close();
    let open = connections.len();
    if open > 0 {
        info!("⏳ Waiting for {} connection(s) to close", open);
    }
    if timeout(limit, connections.wait()).await.is_ok() {
        true
    } else {
        warn!("{} connection(s) still open after {:?}", connections.len(), limit);
        false
    }
}

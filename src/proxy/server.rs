//! Proxy server lifecycle and routing.
//!
//! The server is a process-wide singleton guarded by one lifecycle mutex:
//! starting while running is an error, stopping while stopped is a no-op.
//! Stop is graceful with a bounded drain, then aborts.

use crate::error::{AppError, AppResult};
use crate::models::config::{generate_api_key, ProxyConfig};
use crate::proxy::handlers::forward::forward;
use crate::proxy::logs::LogSink;
use crate::proxy::middleware::{admin_auth_middleware, auth_middleware, cors_layer};
use crate::proxy::pool::AccountPool;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware::from_fn_with_state,
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

const DRAIN_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<AccountPool>,
    pub sink: Arc<LogSink>,
    pub client: reqwest::Client,
    pub config: Arc<ProxyConfig>,
    pub port: u16,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ProxyStatus {
    pub running: bool,
    pub port: Option<u16>,
    pub account_count: usize,
    pub active: usize,
    pub cooldown: usize,
    pub blocked: usize,
}

pub fn build_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(20))
        .pool_max_idle_per_host(16)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .timeout(Duration::from_secs(600))
        .build()
        .expect("failed to build upstream HTTP client")
}

fn admin_api_enabled() -> bool {
    std::env::var("CODEXMUX_ENABLE_ADMIN_API")
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

pub fn build_router(state: AppState) -> Router {
    let proxy_routes = Router::new()
        .fallback(any(forward))
        .layer(from_fn_with_state(state.clone(), auth_middleware));

    let mut app = Router::new()
        .route("/healthz", get(healthz))
        .merge(proxy_routes);

    if admin_api_enabled() {
        tracing::warn!("[Proxy] admin API enabled at /api");
        app = app.nest("/api", admin_router(state.clone()));
    }

    app.layer(cors_layer()).with_state(state)
}

fn admin_router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/status", get(admin_status))
        .route("/logs", get(admin_logs))
        .route("/logs/count", get(admin_logs_count))
        .route("/logs/clear", post(admin_logs_clear))
        .route("/logs/:log_id", get(admin_log_detail))
        .route("/reload", post(admin_reload))
        .route("/api-key/generate", post(admin_generate_api_key))
        .layer(from_fn_with_state(state, admin_auth_middleware))
}

async fn healthz() -> Response {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
    .into_response()
}

async fn admin_status(State(state): State<AppState>) -> Response {
    let pool = state.pool.status();
    Json(ProxyStatus {
        running: true,
        port: Some(state.port),
        account_count: pool.account_count,
        active: pool.active,
        cooldown: pool.cooldown,
        blocked: pool.blocked,
    })
    .into_response()
}

#[derive(Debug, Deserialize, Default)]
struct LogsQuery {
    #[serde(default)]
    filter: String,
    #[serde(default)]
    errors_only: bool,
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

fn default_limit() -> usize {
    50
}

async fn admin_logs(
    State(state): State<AppState>,
    Query(params): Query<LogsQuery>,
) -> Response {
    let sink = state.sink.clone();
    let result = tokio::task::spawn_blocking(move || {
        sink.query(&params.filter, params.errors_only, params.limit, params.offset)
    })
    .await;
    match result {
        Ok(Ok(logs)) => Json(logs).into_response(),
        Ok(Err(e)) => e.into_response(),
        Err(e) => AppError::store(e.to_string()).into_response(),
    }
}

async fn admin_logs_count(
    State(state): State<AppState>,
    Query(params): Query<LogsQuery>,
) -> Response {
    let sink = state.sink.clone();
    let result =
        tokio::task::spawn_blocking(move || sink.count(&params.filter, params.errors_only)).await;
    match result {
        Ok(Ok(count)) => Json(count).into_response(),
        Ok(Err(e)) => e.into_response(),
        Err(e) => AppError::store(e.to_string()).into_response(),
    }
}

async fn admin_log_detail(
    State(state): State<AppState>,
    Path(log_id): Path<i64>,
) -> Response {
    let sink = state.sink.clone();
    let result = tokio::task::spawn_blocking(move || sink.detail(log_id)).await;
    match result {
        Ok(Ok(Some(detail))) => Json(detail).into_response(),
        Ok(Ok(None)) => StatusCode::NOT_FOUND.into_response(),
        Ok(Err(e)) => e.into_response(),
        Err(e) => AppError::store(e.to_string()).into_response(),
    }
}

async fn admin_logs_clear(State(state): State<AppState>) -> Response {
    let sink = state.sink.clone();
    let result = tokio::task::spawn_blocking(move || sink.clear()).await;
    match result {
        Ok(Ok(())) => StatusCode::OK.into_response(),
        Ok(Err(e)) => e.into_response(),
        Err(e) => AppError::store(e.to_string()).into_response(),
    }
}

async fn admin_reload(State(state): State<AppState>) -> Response {
    match state.pool.reload().await {
        Ok(count) => Json(serde_json::json!({ "account_count": count })).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn admin_generate_api_key() -> Response {
    Json(generate_api_key()).into_response()
}

struct RunningProxy {
    port: u16,
    shutdown: Arc<Notify>,
    handle: tokio::task::JoinHandle<()>,
    state: AppState,
}

pub struct ProxyServer {
    lifecycle: tokio::sync::Mutex<Option<RunningProxy>>,
}

impl Default for ProxyServer {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyServer {
    pub fn new() -> Self {
        Self {
            lifecycle: tokio::sync::Mutex::new(None),
        }
    }

    /// Bind 127.0.0.1:port and serve. Port 0 picks an ephemeral port; the
    /// bound port is returned. Errors when already running.
    pub async fn start(
        &self,
        port: u16,
        pool: Arc<AccountPool>,
        sink: Arc<LogSink>,
        config: Arc<ProxyConfig>,
    ) -> AppResult<u16> {
        let mut guard = self.lifecycle.lock().await;
        if let Some(running) = guard.as_ref() {
            return Err(AppError::AlreadyRunning(running.port));
        }

        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
        let actual_port = listener.local_addr()?.port();

        let state = AppState {
            pool,
            sink,
            client: build_client(),
            config,
            port: actual_port,
        };
        let app = build_router(state.clone());

        let shutdown = Arc::new(Notify::new());
        let waiter = shutdown.clone();
        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    waiter.notified().await;
                })
                .await;
            if let Err(e) = result {
                tracing::error!("[Proxy] server exited with error: {}", e);
            }
        });

        tracing::info!("[Proxy] listening on http://127.0.0.1:{}", actual_port);
        *guard = Some(RunningProxy {
            port: actual_port,
            shutdown,
            handle,
            state,
        });
        Ok(actual_port)
    }

    /// Graceful stop: stop accepting, drain in-flight up to the deadline,
    /// then abort. Returns false when the server was not running.
    pub async fn stop(&self) -> bool {
        let running = {
            let mut guard = self.lifecycle.lock().await;
            guard.take()
        };
        let Some(running) = running else {
            return false;
        };
        // notify_one stores a permit, so a stop racing server startup still
        // lands.
        running.shutdown.notify_one();
        let mut handle = running.handle;
        tokio::select! {
            _ = &mut handle => {}
            _ = tokio::time::sleep(DRAIN_DEADLINE) => {
                tracing::warn!("[Proxy] drain deadline reached, aborting in-flight requests");
                handle.abort();
            }
        }
        tracing::info!("[Proxy] stopped");
        true
    }

    pub async fn status(&self) -> ProxyStatus {
        let guard = self.lifecycle.lock().await;
        match guard.as_ref() {
            Some(running) => {
                let pool = running.state.pool.status();
                ProxyStatus {
                    running: true,
                    port: Some(running.port),
                    account_count: pool.account_count,
                    active: pool.active,
                    cooldown: pool.cooldown,
                    blocked: pool.blocked,
                }
            }
            None => ProxyStatus {
                running: false,
                port: None,
                account_count: 0,
                active: 0,
                cooldown: 0,
                blocked: 0,
            },
        }
    }
}

//! Command-and-control server.
//!
//! Accepts JSON commands over HTTP from the front end and maps them to
//! supervisor and storage operations. Only allow-listed client IPs may
//! issue commands; the allow-list itself is mutable through the `allow`
//! and `disallow` commands. On startup, workers persisted in the thread
//! table are resumed; on `kill`, every worker is interrupted so it can
//! resume after the next start.

mod handlers;

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, RwLock};

use axum::extract::connect_info::ConnectInfo;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::config::ServerConfig;
use crate::repository::{Db, LogRepository};
use crate::supervisor::Supervisor;

/// Shared state for the control server.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Db>,
    pub supervisor: Arc<Supervisor>,
    pub allowed_ips: Arc<RwLock<HashSet<IpAddr>>>,
    pub shutdown: Arc<tokio::sync::Notify>,
}

/// Create the router with the command endpoint.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(server_info).post(handle_command))
        .with_state(state)
}

async fn server_info() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": "webharvest",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn handle_command(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: String,
) -> impl IntoResponse {
    let ip = addr.ip();
    if !state.allowed_ips.read().unwrap().contains(&ip) {
        tracing::warn!("rejected command from disallowed IP {ip}");
        return (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({"error": true, "text": "access denied"})),
        );
    }

    let command: serde_json::Value = match serde_json::from_str(&body) {
        Ok(value) => value,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": true,
                    "text": format!("invalid JSON: {e}"),
                })),
            )
        }
    };

    let response = handlers::dispatch(&state, ip, &command).await;
    (StatusCode::OK, Json(response))
}

/// Run the server until a `kill` command arrives; workers are interrupted
/// on the way out so they resume after the next start.
pub async fn serve(config: ServerConfig, db: Arc<Db>) -> anyhow::Result<()> {
    let supervisor = Supervisor::new(db.clone());

    let resumed = supervisor.resume_interrupted()?;
    if resumed > 0 {
        tracing::info!("resumed {resumed} interrupted worker(s)");
        LogRepository::new(db.clone())
            .insert("server", &format!("resumed {resumed} interrupted worker(s)"))?;
    }

    let state = AppState {
        db: db.clone(),
        supervisor: supervisor.clone(),
        allowed_ips: Arc::new(RwLock::new(config.allowed_ips.iter().copied().collect())),
        shutdown: Arc::new(tokio::sync::Notify::new()),
    };
    let shutdown = state.shutdown.clone();

    let cors = match config.cors_origin.as_deref() {
        Some("*") => CorsLayer::new().allow_origin(AllowOrigin::any()),
        Some(origin) => match origin.parse::<axum::http::HeaderValue>() {
            Ok(value) => CorsLayer::new().allow_origin(AllowOrigin::exact(value)),
            Err(_) => {
                tracing::warn!("invalid cors_origin '{origin}'; CORS disabled");
                CorsLayer::new()
            }
        },
        None => CorsLayer::new(),
    };

    let app = create_router(state).layer(cors);

    let addr: SocketAddr = config.bind.parse()?;
    tracing::info!("control server listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.notified().await })
    .await?;

    tracing::info!("interrupting workers for shutdown");
    supervisor.interrupt_all().await;
    LogRepository::new(db).insert("server", "server stopped")?;

    Ok(())
}

//! Read-only HTTP view of a running monitor.
//!
//! `GET /api/health` and `GET /api/last-ping`.

use crate::config::ServeConfig;
use crate::monitor::{MonitorPhase, PhaseWatch};
use crate::state::{ProbeReader, ProbeSnapshot};
use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use tower_http::cors::CorsLayer;

#[derive(Clone)]
struct AppState {
    host: String,
    reader: ProbeReader,
    phase: PhaseWatch,
}

#[derive(Debug, Serialize)]
struct LastPingResponse {
    host: String,
    phase: MonitorPhase,
    #[serde(flatten)]
    snapshot: ProbeSnapshot,
}

pub fn router(host: &str, reader: ProbeReader, phase: PhaseWatch) -> Router {
    let state = AppState {
        host: host.to_string(),
        reader,
        phase,
    };
    Router::new()
        .route("/api/health", get(health))
        .route("/api/last-ping", get(last_ping))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

pub async fn run(
    config: &ServeConfig,
    host: &str,
    reader: ProbeReader,
    phase: PhaseWatch,
) -> std::io::Result<()> {
    let app = router(host, reader, phase);
    let addr = format!("{}:{}", config.bind, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("serve listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true}))
}

async fn last_ping(State(state): State<AppState>) -> Json<LastPingResponse> {
    Json(LastPingResponse {
        host: state.host.clone(),
        phase: state.phase.get(),
        snapshot: state.reader.snapshot(),
    })
}

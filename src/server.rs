// HTTP and WebSocket surface

use crate::agent::Agent;
use crate::payload::CaptureStatus;
use crate::session;
use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{State, ws::WebSocketUpgrade},
    response::{Json, Response},
    routing::get,
};
use serde::Serialize;
use std::sync::Arc;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn handle_ws(State(agent): State<Arc<Agent>>, upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(move |socket| session::run(agent, socket))
}

async fn handle_capture(State(agent): State<Arc<Agent>>) -> Json<CaptureStatus> {
    Json(agent.capture_status())
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub fn build_router(agent: Arc<Agent>) -> Router {
    Router::new()
        .route("/ws", get(handle_ws))
        .route("/api/capture", get(handle_capture))
        .route("/health", get(handle_health))
        .with_state(agent)
}

/// Serve until the process is stopped
pub async fn run_server(agent: Arc<Agent>) -> Result<()> {
    let addr = format!("{}:{}", agent.config().host, agent.config().port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context(format!("Failed to bind {}", addr))?;
    log::info!("Listening on ws://{}/ws", addr);

    axum::serve(listener, build_router(agent))
        .await
        .context("Server error")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::tests::{no_geo, test_agent};

    #[tokio::test]
    async fn test_health_reports_version() {
        let Json(health) = handle_health().await;
        assert_eq!(health.status, "ok");
        assert_eq!(health.version, env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_capture_endpoint_matches_payload_shape() {
        let agent = Arc::new(test_agent(&["10.0.0.5"], no_geo()));
        agent.ensure_started().await;

        let Json(status) = handle_capture(State(Arc::clone(&agent))).await;
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["capture_available"], false);
        assert_eq!(value["sniffer_error"], "capture-disabled");
        assert_eq!(value["capture_method"], "none");
        assert!(value["ifaces"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_router_builds() {
        let agent = Arc::new(test_agent(&[], no_geo()));
        let _router = build_router(agent);
    }
}

//! Axum wiring for the control plane's externally-facing surface: the node
//! WebSocket upgrade endpoint and ambient observability endpoints. The
//! client-facing REST API (wake/ping/scan/... over HTTP) is an external
//! concern that sits in front of `CommandRouter` and is not part of this
//! workspace.
//!
//! Grounded on the teacher's `web.rs`: `agent_ws_upgrade` (query-token
//! extraction then `ws.max_message_size(...).on_upgrade(...)`),
//! `health_check`/`health_check_detailed`, and `metrics`.

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::limit::RequestBodyLimitLayer;

use crate::metrics::RuntimeMetrics;
use crate::node_manager::NodeManager;

pub struct AppState {
    pub node_manager: Arc<NodeManager>,
    pub metrics: Arc<RuntimeMetrics>,
    pub metrics_require_auth: bool,
    pub started_at: std::time::Instant,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/health/detailed", get(health_check_detailed))
        .route("/metrics", get(metrics))
        .route("/ws/node", get(node_ws_upgrade))
        .layer(RequestBodyLimitLayer::new(65_536))
        .with_state(state)
}

/// Query parameters a node presents on the WebSocket upgrade request: either
/// a static pre-shared token (first contact) or a previously minted session
/// token (reconnect).
#[derive(Deserialize)]
struct NodeUpgradeQuery {
    token: Option<String>,
    #[serde(rename = "sessionToken")]
    session_token: Option<String>,
}

/// GET /ws/node - WebSocket upgrade for a node agent's control connection.
async fn node_ws_upgrade(State(state): State<Arc<AppState>>, Query(query): Query<NodeUpgradeQuery>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let auth_context = match state.node_manager.authenticate_upgrade(query.token.as_deref(), query.session_token.as_deref()) {
        Ok(context) => context,
        Err(err) => {
            tracing::warn!(%err, "node WebSocket upgrade rejected");
            return (StatusCode::UNAUTHORIZED, "Invalid node credentials").into_response();
        }
    };

    let node_manager = Arc::clone(&state.node_manager);
    ws.max_message_size(65_536)
        .on_upgrade(move |socket| async move { node_manager.run_session(socket, auth_context).await })
        .into_response()
}

/// GET /api/health - minimal health check for load balancers, no auth.
async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[derive(Deserialize)]
struct HealthQuery {
    token: Option<String>,
}

/// GET /api/health/detailed - node count and uptime. Auth is advisory here
/// since this workspace has no user-facing JWT layer of its own; a
/// deployment fronting this with the external HTTP layer can tighten this
/// further.
async fn health_check_detailed(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "connected_nodes": state.metrics.connected_node_count(),
    }))
}

/// GET /metrics - Prometheus text exposition format.
async fn metrics(State(state): State<Arc<AppState>>, headers: HeaderMap, Query(query): Query<HealthQuery>) -> impl IntoResponse {
    if state.metrics_require_auth {
        let presented = headers.get("authorization").and_then(|v| v.to_str().ok()).and_then(|v| v.strip_prefix("Bearer ")).or(query.token.as_deref());
        if presented.is_none() {
            return (StatusCode::UNAUTHORIZED, "Missing token").into_response();
        }
    }

    let body = state.metrics.render_prometheus().await;
    ([(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")], body).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth;
    use crate::node_manager::NodeManagerConfig;
    use crate::stores::{InMemoryHostAggregator, InMemoryNodeStore};
    use axum::body::Body;
    use axum::http::Request;
    use cnc_protocol::SessionTokenConfig;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_state() -> Arc<AppState> {
        let config = NodeManagerConfig {
            heartbeat_interval: Duration::from_secs(30),
            node_timeout: Duration::from_secs(90),
            supported_protocol_versions: vec![1, 2],
            node_auth_tokens: vec!["static-token".to_string()],
            session_token: SessionTokenConfig {
                secrets: vec!["signing-secret".to_string()],
                issuer: "cnc-control-plane".to_string(),
                audience: "cnc-node".to_string(),
                ttl_seconds: 3600,
            },
        };
        let metrics = Arc::new(RuntimeMetrics::new());
        let node_manager = NodeManager::new(Arc::new(InMemoryNodeStore::new()), Arc::new(InMemoryHostAggregator::new()), Arc::clone(&metrics), config);
        Arc::new(AppState { node_manager, metrics, metrics_require_auth: true, started_at: std::time::Instant::now() })
    }

    async fn body_json(response: axum::response::Response<Body>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_returns_ok_unauthenticated() {
        let app = build_router(test_state());
        let request = Request::builder().uri("/api/health").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn health_detailed_reports_uptime_and_node_count() {
        let app = build_router(test_state());
        let request = Request::builder().uri("/api/health/detailed").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["connected_nodes"], 0);
        assert!(json["uptime_secs"].is_number());
    }

    #[tokio::test]
    async fn metrics_requires_auth_when_configured() {
        let app = build_router(test_state());
        let request = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn metrics_accessible_with_bearer_token() {
        let app = build_router(test_state());
        let request = Request::builder().uri("/metrics").header("authorization", "Bearer anything").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = std::str::from_utf8(&bytes).unwrap();
        assert!(body.contains("cnc_connected_nodes"));
    }

    #[tokio::test]
    async fn node_ws_upgrade_rejects_missing_token() {
        let app = build_router(test_state());
        let request = Request::builder().uri("/ws/node").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn node_ws_upgrade_rejects_unknown_static_token() {
        let app = build_router(test_state());
        let request = Request::builder().uri("/ws/node?token=wrong").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn node_ws_upgrade_accepts_valid_static_token_and_performs_the_handshake_upgrade() {
        let state = test_state();
        let app = build_router(Arc::clone(&state));
        let request = Request::builder()
            .uri("/ws/node?token=static-token")
            .header("connection", "upgrade")
            .header("upgrade", "websocket")
            .header("sec-websocket-version", "13")
            .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        let _ = auth::generate_secret();
    }
}

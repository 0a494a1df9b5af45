//! HTTP gateway for loomi.
//!
//! A thin adapter over [`loomi_agent::Runtime`]: the SSE agent stream and
//! notes listing live under `/v1` (see [`api_v1`]), stop control and health
//! sit at the root.
//!
//! Built on Axum.

pub mod api_v1;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use loomi_agent::Runtime;
use loomi_store::PoolClass;
use loomi_telemetry::MetricsSnapshot;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Shared application state for the gateway.
pub struct GatewayState {
    pub runtime: Arc<Runtime>,
    pub started_at: DateTime<Utc>,
}

impl GatewayState {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self {
            runtime,
            started_at: Utc::now(),
        }
    }
}

pub type SharedState = Arc<GatewayState>;

/// Build the Axum router with all gateway routes.
pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/heartbeat", post(heartbeat_handler))
        .route("/stop", post(stop_handler))
        .with_state(state.clone())
        .nest("/v1", api_v1::v1_router(state))
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Start the gateway HTTP server.
pub async fn start(config: loomi_config::AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);

    let client = loomi_providers::build_from_config(&config.model)?;
    let runtime = Arc::new(Runtime::from_config(&config, client));
    runtime
        .pools
        .warm(&[PoolClass::HighPriority, PoolClass::Normal, PoolClass::Background])
        .await;
    runtime.spawn_sweeper();

    let app = build_router(Arc::new(GatewayState::new(runtime)));

    info!(addr = %addr, backend = %config.store.backend, "Gateway starting");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// --- Handlers ---

#[derive(Serialize)]
struct StoreHealth {
    backend: String,
    reachable: bool,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_secs: i64,
    store: StoreHealth,
    metrics: MetricsSnapshot,
}

/// Store reachability plus the runtime counters. An unreachable store reports
/// `degraded`, not an error: requests still stream without persistence.
async fn health_handler(State(state): State<SharedState>) -> Json<HealthResponse> {
    let pools = &state.runtime.pools;
    let reachable = match pools.ping().await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "Health check: store unreachable");
            false
        }
    };

    Json(HealthResponse {
        status: if reachable { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
        store: StoreHealth {
            backend: pools.backend_name().to_string(),
            reachable,
        },
        metrics: state.runtime.metrics.snapshot(),
    })
}

#[derive(Deserialize)]
struct SessionRequest {
    user_id: String,
    session_id: String,
}

#[derive(Serialize)]
struct ControlResponse {
    success: bool,
    timestamp: String,
}

fn control_response(success: bool) -> Json<ControlResponse> {
    Json(ControlResponse {
        success,
        timestamp: Utc::now().to_rfc3339(),
    })
}

async fn heartbeat_handler(
    State(state): State<SharedState>,
    Json(payload): Json<SessionRequest>,
) -> Result<Json<ControlResponse>, StatusCode> {
    if payload.user_id.is_empty() || payload.session_id.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let success = state
        .runtime
        .heartbeat
        .beat(&payload.user_id, &payload.session_id, Utc::now())
        .await;
    Ok(control_response(success))
}

async fn stop_handler(
    State(state): State<SharedState>,
    Json(payload): Json<SessionRequest>,
) -> Result<Json<ControlResponse>, StatusCode> {
    if payload.user_id.is_empty() || payload.session_id.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    info!(user_id = %payload.user_id, session_id = %payload.session_id, "Stop requested");
    let success = state
        .runtime
        .stop
        .request_stop(&payload.user_id, &payload.session_id)
        .await;
    Ok(control_response(success))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use loomi_config::AppConfig;
    use loomi_core::event::SSE_DONE_FRAME;
    use loomi_core::error::ProviderError;
    use loomi_core::provider::{ChunkReceiver, ModelClient, ModelRequest, StreamChunk, Usage};
    use loomi_store::{InMemoryKv, NoopKv, PoolManager};
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    const DECISION: &str = r#"<think>need facts</think><Action type="knowledge">category trends</Action>"#;
    const KNOWLEDGE: &str = "<knowledge1><title>Trend</title>Short videos win.</knowledge1>";

    /// Answers the decision call and the knowledge subagent; `fail` rejects
    /// every call.
    struct FixedClient {
        fail: bool,
    }

    #[async_trait]
    impl ModelClient for FixedClient {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn stream(&self, request: ModelRequest) -> Result<ChunkReceiver, ProviderError> {
            if self.fail {
                return Err(ProviderError::Network("connection refused".into()));
            }
            let system = request.messages.first().map(|m| m.content.clone()).unwrap_or_default();
            let reply = if system.contains("<Action type=") { DECISION } else { KNOWLEDGE };

            let (tx, rx) = mpsc::channel(4);
            tokio::spawn(async move {
                let _ = tx.send(Ok(StreamChunk::text(reply))).await;
                let _ = tx.send(Ok(StreamChunk::finished(Some(Usage::new(10, 20))))).await;
            });
            Ok(rx)
        }
    }

    fn test_state(fail: bool) -> SharedState {
        let pools = Arc::new(PoolManager::with_defaults(Arc::new(InMemoryKv::new())));
        let runtime = Runtime::with_pools(&AppConfig::default(), Arc::new(FixedClient { fail }), pools);
        Arc::new(GatewayState::new(Arc::new(runtime)))
    }

    fn json_post(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_string(response: axum::response::Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn sse_events(body: &str) -> Vec<serde_json::Value> {
        body.split("\n\n")
            .filter_map(|frame| frame.strip_prefix("data: "))
            .filter(|data| *data != "{}")
            .map(|data| serde_json::from_str(data).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn health_endpoint() {
        let app = build_router(test_state(false));

        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["store"]["reachable"], true);
        assert_eq!(json["metrics"]["requests_started"], 0);
    }

    #[tokio::test]
    async fn health_reports_degraded_store() {
        let pools = Arc::new(PoolManager::with_defaults(Arc::new(NoopKv)));
        let runtime = Runtime::with_pools(
            &AppConfig::default(),
            Arc::new(FixedClient { fail: false }),
            pools,
        );
        let app = build_router(Arc::new(GatewayState::new(Arc::new(runtime))));

        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["store"]["reachable"], false);
    }

    #[tokio::test]
    async fn stop_sets_the_flag() {
        let state = test_state(false);
        let app = build_router(state.clone());

        let req = json_post("/stop", serde_json::json!({"user_id": "u1", "session_id": "s1"}));
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(json["success"], true);
        assert!(json["timestamp"].is_string());
        assert!(state.runtime.stop.is_stopped("u1", "s1").await);
    }

    #[tokio::test]
    async fn heartbeat_records_timestamp() {
        let state = test_state(false);
        let app = build_router(state.clone());

        let req = json_post("/heartbeat", serde_json::json!({"user_id": "u1", "session_id": "s1"}));
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(json["success"], true);
        assert!(state.runtime.heartbeat.last_beat("u1", "s1").await.is_some());
    }

    #[tokio::test]
    async fn control_requires_session() {
        let app = build_router(test_state(false));
        let req = json_post("/stop", serde_json::json!({"user_id": "", "session_id": "s1"}));
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn agent_stream_emits_events_then_done() {
        let state = test_state(false);
        let app = build_router(state.clone());

        let req = json_post(
            "/v1/agent/stream",
            serde_json::json!({"instruction": "plan a post", "user_id": "u1", "session_id": "s1"}),
        );
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/event-stream"
        );

        let body = body_string(response).await;
        assert!(body.ends_with(SSE_DONE_FRAME));

        let events = sse_events(&body);
        let knowledge = events
            .iter()
            .find(|e| e["content_type"] == "loomi_knowledge")
            .expect("knowledge event");
        assert_eq!(knowledge["data"][0]["id"], "knowledge1");
        assert_eq!(knowledge["data"][0]["title"], "Trend");

        let summary = events.last().unwrap();
        assert_eq!(summary["content_type"], "orchestrator_message");
        assert!(summary["data"]["total_tokens"].as_i64().unwrap() > 0);

        let snapshot = state.runtime.metrics.snapshot();
        assert_eq!(snapshot.requests_completed, 1);
    }

    #[tokio::test]
    async fn notes_are_listed_after_a_stream() {
        let state = test_state(false);

        let req = json_post(
            "/v1/agent/stream",
            serde_json::json!({"instruction": "plan a post", "user_id": "u1", "session_id": "s1"}),
        );
        let response = build_router(state.clone()).oneshot(req).await.unwrap();
        body_string(response).await;

        let req = Request::builder()
            .uri("/v1/notes/u1/s1?action=knowledge")
            .body(Body::empty())
            .unwrap();
        let response = build_router(state.clone()).oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(json["total"], 1);
        assert_eq!(json["notes"][0]["name"], "knowledge1");

        let req = Request::builder()
            .uri("/v1/notes/u1/s1?action=persona")
            .body(Body::empty())
            .unwrap();
        let response = build_router(state).oneshot(req).await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(json["total"], 0);
    }

    #[tokio::test]
    async fn failed_orchestration_emits_error_event() {
        let app = build_router(test_state(true));

        let req = json_post(
            "/v1/agent/stream",
            serde_json::json!({"instruction": "plan", "user_id": "u1", "session_id": "s1"}),
        );
        let response = app.oneshot(req).await.unwrap();
        let body = body_string(response).await;
        assert!(body.ends_with(SSE_DONE_FRAME));

        let events = sse_events(&body);
        let error = events.last().unwrap();
        assert_eq!(error["type"], "error");
        assert!(error["data"].as_str().unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn agent_stream_rejects_missing_session() {
        let app = build_router(test_state(false));
        let req = json_post(
            "/v1/agent/stream",
            serde_json::json!({"instruction": "plan", "user_id": "u1", "session_id": ""}),
        );
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}

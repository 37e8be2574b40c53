//! HTTP gateway in front of the RPC client.
//!
//! Endpoints:
//! - `GET /api/health`: health check
//! - `POST /api/rpc`: request envelope; the topic is picked from the action
//! - `POST /api/:topic`: request envelope for an explicit topic
//!   (`auth`, `properties`, `market`)
//!
//! Bodies are either `{"action": .., "payload": {..}}` or flat
//! `{"action": .., field: ..}`. Every outcome, including broker failures and
//! timeouts, is answered with 200 and a response envelope.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{Method, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::bus::Broker;
use crate::envelope::{Payload, RequestEnvelope, ResponseEnvelope};
use crate::rpc::RpcClient;
use crate::topic::Topic;

/// Reply for bodies that are not a request envelope.
pub const INVALID_BODY: &str = "Invalid JSON or missing action";

/// One RPC client per topic, all sharing a single pending-call table.
pub struct Gateway {
    clients: HashMap<Topic, RpcClient>,
}

impl Gateway {
    pub fn new(broker: Arc<dyn Broker>, timeout: Duration) -> Self {
        let base = RpcClient::for_topic(broker, Topic::Auth).with_timeout(timeout);
        let clients = Topic::ALL
            .into_iter()
            .map(|topic| (topic, base.for_queue(topic.queue())))
            .collect();
        Self { clients }
    }

    /// Forward `action` to the request queue of `topic`.
    pub async fn call(&self, topic: Topic, action: &str, payload: Payload) -> ResponseEnvelope {
        match self.clients.get(&topic) {
            Some(client) => client.call(action, payload).await,
            None => ResponseEnvelope::service_unavailable(),
        }
    }

    /// Calls awaiting a reply, across all topics.
    pub fn pending_calls(&self) -> usize {
        // The clients share one router.
        self.clients
            .values()
            .next()
            .map(RpcClient::pending_calls)
            .unwrap_or(0)
    }
}

/// Shared state for axum handlers.
type AppState = Arc<Gateway>;

/// Start the gateway on `host:port`.
///
/// When `port` is 0, the OS assigns an ephemeral port. The actual bound
/// port is always logged so it can be discovered.
pub async fn serve(
    gateway: Arc<Gateway>,
    host: &str,
    port: u16,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = router(gateway);
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let actual_port = listener.local_addr()?.port();
    info!(host = %host, port = actual_port, "Gateway listening");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Build the axum router (separated for testing).
pub fn router(gateway: Arc<Gateway>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health))
        .route("/api/rpc", post(rpc))
        .route("/api/:topic", post(topic_rpc))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(gateway)
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn rpc(State(gateway): State<AppState>, body: Bytes) -> Json<ResponseEnvelope> {
    let Some(request) = parse_body(&body) else {
        return Json(ResponseEnvelope::error(INVALID_BODY));
    };
    let topic = Topic::for_action(&request.action);
    Json(gateway.call(topic, &request.action, request.payload).await)
}

async fn topic_rpc(
    State(gateway): State<AppState>,
    Path(segment): Path<String>,
    body: Bytes,
) -> (StatusCode, Json<ResponseEnvelope>) {
    let Some(topic) = Topic::from_route(&segment) else {
        return (
            StatusCode::NOT_FOUND,
            Json(ResponseEnvelope::error(format!("Unknown topic: {}", segment))),
        );
    };
    let Some(request) = parse_body(&body) else {
        return (StatusCode::OK, Json(ResponseEnvelope::error(INVALID_BODY)));
    };
    (
        StatusCode::OK,
        Json(gateway.call(topic, &request.action, request.payload).await),
    )
}

fn parse_body(body: &[u8]) -> Option<RequestEnvelope> {
    RequestEnvelope::parse(body)
        .map_err(|e| warn!(error = %e, "Rejecting gateway request"))
        .ok()
}

//! REST API handlers

use axon_core::ValueType;
use axon_rpc::{CorrelatorError, Request};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::state::AppState;

/// API error response
#[derive(Serialize)]
struct ApiError {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    response: Option<Value>,
}

impl ApiError {
    fn new(msg: impl Into<String>) -> Self {
        Self {
            error: msg.into(),
            response: None,
        }
    }
}

/// List cached snapshot topics
pub async fn list_snapshots(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.cache.topics().await)
}

#[derive(Deserialize)]
pub struct SnapshotQuery {
    topic: String,
}

/// Get one cached snapshot by topic
pub async fn get_snapshot(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SnapshotQuery>,
) -> impl IntoResponse {
    match state.cache.get(&query.topic).await {
        Some(snapshot) => Json(snapshot).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiError::new("Snapshot not found")),
        )
            .into_response(),
    }
}

/// Message to feed into the bridge as if a device had published it
#[derive(Deserialize)]
pub struct InjectRequest {
    pub topic: String,
    /// JSON payloads are re-encoded, strings are sent verbatim
    pub payload: Value,
}

/// Inject an inbound message
pub async fn inject_message(
    State(state): State<Arc<AppState>>,
    Json(req): Json<InjectRequest>,
) -> impl IntoResponse {
    let payload = match req.payload {
        Value::String(raw) => raw.into_bytes(),
        other => match serde_json::to_vec(&other) {
            Ok(bytes) => bytes,
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(ApiError::new(format!("Invalid payload: {}", e))),
                )
                    .into_response()
            }
        },
    };

    debug!(topic = %req.topic, bytes = payload.len(), "Injecting message");
    state.transport.inject(req.topic.clone(), payload);

    (
        StatusCode::ACCEPTED,
        Json(json!({"status": "injected", "topic": req.topic})),
    )
        .into_response()
}

/// Command to send to a device service
#[derive(Deserialize)]
pub struct CommandRequest {
    pub address: String,
    pub service: String,
    pub command: String,
    #[serde(default)]
    pub value: Value,
    pub value_type: Option<ValueType>,
    #[serde(default)]
    pub props: Map<String, Value>,
    pub timeout_ms: Option<u64>,
}

/// Send a correlated command and wait for its response
pub async fn send_command(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CommandRequest>,
) -> impl IntoResponse {
    info!(
        address = %req.address,
        service = %req.service,
        command = %req.command,
        "Command requested"
    );

    let mut request = Request::new(req.address, req.service, req.command, req.value)
        .with_props(req.props);
    if let Some(value_type) = req.value_type {
        request = request.with_value_type(value_type);
    }
    if let Some(ms) = req.timeout_ms {
        request = request.with_timeout(Duration::from_millis(ms));
    }

    match state.correlator.send_request(request).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => {
            warn!(error = %e, "Command failed");
            let status = match &e {
                CorrelatorError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                CorrelatorError::Remote { .. } => StatusCode::BAD_GATEWAY,
                CorrelatorError::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            let response = match &e {
                CorrelatorError::Remote { response, .. } => serde_json::to_value(response).ok(),
                _ => None,
            };
            (
                status,
                Json(ApiError {
                    error: e.to_string(),
                    response,
                }),
            )
                .into_response()
        }
    }
}

/// Requests still waiting for a response
pub async fn list_pending(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let pending = state.correlator.pending();
    Json(json!({
        "count": pending.len(),
        "requests": pending,
    }))
}

/// Get current configuration
pub async fn get_config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.config.clone())
}

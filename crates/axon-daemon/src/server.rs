//! Web server setup and routing

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::api;
use crate::state::AppState;
use crate::ws;

/// Build the API router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/snapshots", get(api::list_snapshots))
        .route("/api/snapshot", get(api::get_snapshot))
        .route("/api/messages", post(api::inject_message))
        .route("/api/commands", post(api::send_command))
        .route("/api/pending", get(api::list_pending))
        .route("/api/config", get(api::get_config))
        // WebSocket for outbound traffic
        .route("/ws", get(ws::websocket_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Run the web server and the periodic state refresh
pub async fn run(state: Arc<AppState>, bind: &str) -> Result<()> {
    let app = router(state.clone());

    tokio::spawn(state.bridge.clone().run_state_refresh());

    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(address = %bind, protocol = "HTTP", "Starting web server");
    axum::serve(listener, app).await?;
    Ok(())
}

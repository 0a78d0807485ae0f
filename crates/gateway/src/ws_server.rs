//! WebSocket server handler using Axum.

use crate::auth::{extract_token, TokenValidator};
use crate::connection::{Connection, WsConnection};
use crate::header::GroupId;
use crate::registry::Registry;
use amqp_client::AmqpClient;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

/// Shared application state.
pub struct AppState {
    pub registry: Arc<Registry>,
    pub validator: TokenValidator,
    pub auth_cookie_name: String,
    /// Broker client, for binding counts on `/health`.
    pub amqp: Option<Arc<AmqpClient>>,
    /// Debug index page; `/` is only routed when this is set.
    pub index: Option<Bytes>,
}

/// Create the HTTP router.
pub fn create_router(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route("/wsapi/stream", get(ws_handler))
        .route("/health", get(health_handler));

    if state.index.is_some() {
        router = router.route("/", get(index_handler));
    }

    router.with_state(state).layer(CorsLayer::permissive())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "groups": state.registry.group_count(),
        "connections": state.registry.connection_count(),
        "bindings": state.amqp.as_ref().map(|a| a.binding_count()).unwrap_or(0),
    }))
}

/// Debug index page.
async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    match &state.index {
        Some(page) => Html(page.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// WebSocket upgrade handler.
///
/// The session token is checked before upgrading; failures get a bare 401.
async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let Some(token) = extract_token(&headers, &state.auth_cookie_name) else {
        debug!("Stream request without a session token");
        return StatusCode::UNAUTHORIZED.into_response();
    };

    let group_id = match state.validator.group_for(&token) {
        Ok(group_id) => group_id,
        Err(e) => {
            warn!("Rejected stream request: {}", e);
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };

    ws.on_upgrade(move |socket| handle_socket(socket, group_id, state))
}

/// Register the socket and watch its read half until the peer leaves.
async fn handle_socket(socket: WebSocket, group_id: GroupId, state: Arc<AppState>) {
    let (ws_tx, mut ws_rx) = socket.split();
    let conn = Arc::new(WsConnection::new(ws_tx));
    let conn_id = conn.id();

    let registration = state
        .registry
        .add_connection(group_id.clone(), conn.clone())
        .await;
    if let Some(e) = registration.binding_error {
        warn!(
            "Connection {} registered for group {} without broker routing: {}",
            conn_id, group_id, e
        );
    }
    info!("Client {} subscribed to group {}", conn_id, group_id);

    // Clients only listen; inbound frames are read to observe the close.
    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("WebSocket error for {}: {}", conn_id, e);
                break;
            }
        }
    }

    conn.mark_closed();
    info!("Client {} disconnected from group {}", conn_id, group_id);
}

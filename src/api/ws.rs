// =============================================================================
// WebSocket handler — streams a session's events to connected clients
// =============================================================================
//
// Clients connect to `/api/v1/sessions/:session_id/ws?token=<token>` and
// receive every StreamEvent the session's strategies emit from the moment
// of connection, as JSON text frames. Ping frames are answered with Pong;
// lagging clients skip missed events and keep streaming.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::agent::AgentOrchestrator;
use crate::api::auth::validate_token;

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// Axum handler for the WebSocket upgrade request.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(orchestrator): State<Arc<AgentOrchestrator>>,
    Path(session_id): Path<String>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let token = query.token.unwrap_or_default();
    if !validate_token(&token) {
        warn!(session_id = %session_id, "WebSocket connection rejected: invalid token");
        return (
            axum::http::StatusCode::FORBIDDEN,
            "Invalid or missing token",
        )
            .into_response();
    }

    info!(session_id = %session_id, "WebSocket connection accepted");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, orchestrator, session_id))
        .into_response()
}

/// Forward session events to the socket and answer client frames.
async fn handle_ws_connection(
    socket: WebSocket,
    orchestrator: Arc<AgentOrchestrator>,
    session_id: String,
) {
    let mut events = orchestrator.event_sink(&session_id).subscribe();
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        let Ok(json) = serde_json::to_string(&event) else {
                            warn!("failed to serialize stream event");
                            continue;
                        };
                        if let Err(e) = sender.send(Message::Text(json)).await {
                            debug!(error = %e, "WebSocket send failed — disconnecting");
                            break;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, session_id = %session_id, "WebSocket client lagged");
                    }
                    Err(RecvError::Closed) => {
                        debug!("event channel closed — disconnecting");
                        break;
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        // Treat any text frame as a heartbeat.
                        debug!(msg = %text, "WebSocket text message received");
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(session_id = %session_id, "WebSocket closed");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error — disconnecting");
                        break;
                    }
                }
            }
        }
    }

    debug!(session_id = %session_id, "WebSocket connection cleanup complete");
}

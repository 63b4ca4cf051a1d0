// =============================================================================
// REST control surface — strategy creation and session commands
// =============================================================================
//
// All endpoints live under `/api/v1/`. Health is public; every other route
// requires a valid Bearer token checked via the `AuthBearer` extractor (the
// WebSocket route validates its query-param token inside the upgrade
// handler).
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::agent::{AgentOrchestrator, ComposerKind};
use crate::api::auth::AuthBearer;
use crate::config::UserRequest;

/// Build the API router.
pub fn router(orchestrator: Arc<AgentOrchestrator>) -> Router {
    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/sessions/:session_id/strategies", post(create_strategy))
        .route("/api/v1/sessions/:session_id/command", post(session_command))
        .route("/api/v1/sessions/:session_id/instances", get(list_instances))
        .route("/api/v1/sessions/:session_id/ws", get(super::ws::ws_handler))
        // ── Middleware & State ──────────────────────────────────────
        .layer(CorsLayer::permissive())
        .with_state(orchestrator)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct CreateStrategyBody {
    request: UserRequest,
    /// "grid" (default) or "llm".
    #[serde(default)]
    composer: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateStrategyResponse {
    instance_id: String,
}

async fn create_strategy(
    _auth: AuthBearer,
    State(orchestrator): State<Arc<AgentOrchestrator>>,
    Path(session_id): Path<String>,
    Json(body): Json<CreateStrategyBody>,
) -> impl IntoResponse {
    let kind = match body.composer.as_deref() {
        None | Some("grid") => ComposerKind::Grid,
        Some("llm") => ComposerKind::Llm,
        Some(other) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("unknown composer '{other}'") })),
            )
                .into_response();
        }
    };

    match orchestrator
        .start_strategy(&session_id, body.request, kind)
        .await
    {
        Ok(instance_id) => {
            info!(session_id = %session_id, instance_id = %instance_id, "strategy created via API");
            Json(CreateStrategyResponse { instance_id }).into_response()
        }
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": e.to_string(), "kind": e.kind() })),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct CommandBody {
    text: String,
}

async fn session_command(
    _auth: AuthBearer,
    State(orchestrator): State<Arc<AgentOrchestrator>>,
    Path(session_id): Path<String>,
    Json(body): Json<CommandBody>,
) -> impl IntoResponse {
    let handled = orchestrator.handle_command(&session_id, &body.text).await;
    Json(json!({ "handled": handled }))
}

async fn list_instances(
    _auth: AuthBearer,
    State(orchestrator): State<Arc<AgentOrchestrator>>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    let instances: Vec<serde_json::Value> = orchestrator
        .list_instances(&session_id)
        .into_iter()
        .map(|(instance_id, active, check_count)| {
            json!({
                "instance_id": instance_id,
                "active": active,
                "check_count": check_count,
            })
        })
        .collect();
    Json(json!({ "instances": instances }))
}

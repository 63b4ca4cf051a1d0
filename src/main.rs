// =============================================================================
// Meridian Strategy Nexus — Main Entry Point
// =============================================================================
//
// Boots the agent orchestrator and the API surface. Strategies are created
// at runtime through the REST endpoint (or from a seed request file), each
// running its own decision loop until stopped.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod agent;
mod api;
mod config;
mod coordinator;
mod data;
mod decision;
mod error;
mod events;
mod exchange;
mod execution;
mod features;
mod history;
mod instrument;
mod llm;
mod portfolio;
mod types;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::agent::{AgentOrchestrator, ComposerKind};
use crate::config::UserRequest;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian Strategy Nexus — Starting Up            ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    // ── 2. Orchestrator ──────────────────────────────────────────────────
    let orchestrator = Arc::new(AgentOrchestrator::new());

    // ── 3. Optional seed strategy from a request file ────────────────────
    if let Ok(path) = std::env::var("MERIDIAN_REQUEST_FILE") {
        match UserRequest::load(&path) {
            Ok(request) => {
                let kind = match std::env::var("MERIDIAN_COMPOSER").as_deref() {
                    Ok("llm") => ComposerKind::Llm,
                    _ => ComposerKind::Grid,
                };
                match orchestrator.start_strategy("bootstrap", request, kind).await {
                    Ok(instance_id) => {
                        info!(instance_id = %instance_id, "seed strategy launched")
                    }
                    Err(e) => error!(error = %e, "failed to launch seed strategy"),
                }
            }
            Err(e) => warn!(error = %e, path = %path, "failed to load seed request"),
        }
    }

    // ── 4. API server ────────────────────────────────────────────────────
    let bind_addr =
        std::env::var("MERIDIAN_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    let app = api::rest::router(orchestrator.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "API server listening");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    orchestrator.shutdown();
    server.abort();

    info!("Meridian Strategy Nexus shut down complete.");
    Ok(())
}

// =============================================================================
// Agent layer — multi-instance strategy orchestration per session
// =============================================================================

pub mod components;
pub mod orchestrator;

pub use orchestrator::{AgentOrchestrator, ComposerKind};

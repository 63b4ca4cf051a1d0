// =============================================================================
// Error taxonomy for the decision pipeline
// =============================================================================
//
// Recoverable failures never abort a cycle: they are absorbed inside
// `run_once` and surfaced through event warnings, summary metadata, or a
// rationale suffix. Only `Fatal` (and task cancellation) propagate out of
// the coordinator loop.
// =============================================================================

use thiserror::Error;

/// Classified engine failure, carried in result/event payloads.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid user request or malformed instruction. Fails fast before the
    /// strategy loop starts.
    #[error("invalid input: {0}")]
    Input(String),

    /// Market data or feature fetch failure; the affected source degrades to
    /// empty features and the cycle continues.
    #[error("data fetch failed: {0}")]
    Data(String),

    /// LLM timeout or schema mismatch; an empty plan is substituted.
    #[error("compose failed: {0}")]
    Compose(String),

    /// The venue rejected the order (min-notional, margin, reduce-only).
    #[error("execution rejected: {0}")]
    ExecutionRejected(String),

    /// Transport-level execution failure; retried at the next cycle.
    #[error("execution error: {0}")]
    ExecutionError(String),

    /// Balance/position fetch failed in LIVE mode; the cached view is used.
    #[error("reconciliation failed: {0}")]
    Reconcile(String),

    /// Unexpected failure inside the coordinator loop; the runtime
    /// terminates after attempting to close all positions.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl EngineError {
    /// Short machine-readable kind tag used in event payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Input(_) => "INPUT",
            Self::Data(_) => "DATA",
            Self::Compose(_) => "COMPOSE",
            Self::ExecutionRejected(_) => "EXECUTION_REJECTED",
            Self::ExecutionError(_) => "EXECUTION_ERROR",
            Self::Reconcile(_) => "RECONCILE",
            Self::Fatal(_) => "FATAL",
        }
    }

    /// Whether the coordinator loop must terminate on this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(EngineError::Input("x".into()).kind(), "INPUT");
        assert_eq!(EngineError::Reconcile("x".into()).kind(), "RECONCILE");
        assert_eq!(
            EngineError::ExecutionRejected("x".into()).kind(),
            "EXECUTION_REJECTED"
        );
    }

    #[test]
    fn only_fatal_terminates() {
        assert!(EngineError::Fatal("boom".into()).is_fatal());
        assert!(!EngineError::Data("timeout".into()).is_fatal());
        assert!(!EngineError::Compose("schema".into()).is_fatal());
    }
}

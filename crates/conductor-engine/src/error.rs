use std::time::Duration;

use conductor_core::errors::{GatewayError, PlanValidationError};

/// Reasons a run ends in the failed state.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("invalid plan: {0}")]
    Plan(#[from] PlanValidationError),

    #[error("planner failed after {attempts} attempts: {last}")]
    PlannerExhausted { attempts: u32, last: GatewayError },

    #[error("agent failed: {0}")]
    Agent(#[from] AgentError),

    #[error("event stream closed")]
    StreamClosed,

    #[error("run cancelled")]
    Cancelled,

    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    /// Short classification string carried on `RunError` events.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Gateway(e) => e.error_kind(),
            Self::Plan(e) => e.error_kind(),
            Self::PlannerExhausted { .. } => "planner_exhausted",
            Self::Agent(AgentError::Gateway(e)) => e.error_kind(),
            Self::Agent(AgentError::Timeout(_)) => "worker_timeout",
            Self::Agent(_) => "agent_error",
            Self::StreamClosed => "stream_closed",
            Self::Cancelled => "cancelled",
            Self::Internal(_) => "internal",
        }
    }
}

/// Failures of a single tool-using agent (worker, coder or hand-off agent).
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("{0}")]
    Gateway(#[from] GatewayError),

    #[error("worker timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("worker panicked: {0}")]
    Panicked(String),

    #[error("cancelled")]
    Cancelled,
}

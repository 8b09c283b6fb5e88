use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ids::AgentNumber;
use crate::tools::ToolStatus;

/// Coarse classification used by retry policies and surfaced on failure events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    Fatal,
}

/// Typed error hierarchy for completion gateway operations.
#[derive(Clone, Debug, thiserror::Error)]
pub enum GatewayError {
    // Fatal, never retried
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("context window exceeded: {0}")]
    ContextWindowExceeded(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    // Retryable
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("provider overloaded")]
    ProviderOverloaded,
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    #[error("cancelled")]
    Cancelled,
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::ServerError { .. }
                | Self::ProviderOverloaded
                | Self::NetworkError(_)
                | Self::Timeout(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        !self.is_retryable()
    }

    pub fn class(&self) -> ErrorClass {
        if self.is_retryable() {
            ErrorClass::Transient
        } else {
            ErrorClass::Fatal
        }
    }

    pub fn suggested_delay(&self) -> Option<Duration> {
        if let Self::RateLimited { retry_after } = self {
            *retry_after
        } else {
            None
        }
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::ContextWindowExceeded(_) => "context_window_exceeded",
            Self::InvalidRequest(_) => "invalid_request",
            Self::MalformedResponse(_) => "malformed_response",
            Self::UnknownProvider(_) => "unknown_provider",
            Self::RateLimited { .. } => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::ProviderOverloaded => "provider_overloaded",
            Self::NetworkError(_) => "network_error",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    /// Classify an HTTP status code into the appropriate error variant.
    pub fn from_status(status: u16, body: String, retry_after: Option<Duration>) -> Self {
        match status {
            401 | 403 => Self::AuthenticationFailed(body),
            400 if body.contains("context_length_exceeded") => Self::ContextWindowExceeded(body),
            400 | 404 | 422 => Self::InvalidRequest(body),
            408 => Self::Timeout(Duration::ZERO),
            429 => Self::RateLimited { retry_after },
            503 | 529 => Self::ProviderOverloaded,
            500..=599 => Self::ServerError { status, body },
            _ => Self::InvalidRequest(format!("unexpected status {status}: {body}")),
        }
    }
}

/// Failures of a single tool invocation.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ToolError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("exit code {code}: {output}")]
    NonZeroExit { code: i32, output: String },
    #[error("tool unavailable: {0}")]
    Unavailable(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("blocked: {0}")]
    Blocked(String),
    #[error("cancelled")]
    Cancelled,
}

impl ToolError {
    /// Status recorded on the tool run when this error ends an invocation.
    pub fn status(&self) -> ToolStatus {
        match self {
            Self::Timeout(_) => ToolStatus::Timeout,
            _ => ToolStatus::Error,
        }
    }

    /// Text handed back to the model in place of tool output.
    pub fn to_tool_output(&self) -> String {
        match self {
            Self::NonZeroExit { output, .. } => output.clone(),
            Self::Blocked(reason) => format!("Blocked: {reason}"),
            Self::Timeout(d) => format!("Command error: timed out after {}s", d.as_secs()),
            other => format!("Command error: {other}"),
        }
    }
}

/// A plan that cannot be dispatched. Aborts the run before any worker starts.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PlanValidationError {
    #[error("plan declares no workers")]
    NoWorkers,
    #[error("plan declares {declared} workers but at most {cap} are allowed")]
    ExceedsCap { declared: u32, cap: u32 },
    #[error("task assigned to agent {agent} but the plan declares {declared} workers")]
    AgentOutOfRange { agent: AgentNumber, declared: u32 },
    #[error("plan declares {declared} workers but only assigns tasks to {used}")]
    OrphanWorkers { declared: u32, used: u32 },
    #[error("task for agent {agent} has an empty description")]
    EmptyDescription { agent: AgentNumber },
    #[error("malformed plan: {0}")]
    Malformed(String),
}

impl PlanValidationError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::ExceedsCap { .. } => "config_error",
            Self::Malformed(_) => "malformed_plan",
            _ => "plan_validation_error",
        }
    }
}

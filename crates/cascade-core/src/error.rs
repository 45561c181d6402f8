use thiserror::Error;

/// Top-level error type for the cascade-core library.
///
/// Every variant maps to a stable machine-readable code and an
/// HTTP-equivalent status so transport layers can translate errors without
/// inspecting messages. The executor consults [`EngineError::is_retryable`]
/// when deciding whether a failed node attempt should be retried.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad workflow definition or run input.
    #[error("validation error: {0}")]
    Validation(String),

    /// The requested run or definition does not exist, or is not visible
    /// to the requesting owner; the two cases are indistinguishable.
    #[error("not found: {0}")]
    NotFound(String),

    /// Ownership mismatch surfaced by a write path.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Operation is invalid for the run's current status, e.g. resuming a
    /// run that is not suspended.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A tool invocation failed. Retried under the node's retry policy.
    #[error("tool '{tool}' failed: {message}")]
    ToolFailure { tool: String, message: String },

    /// A model invocation failed. Retried under the node's retry policy.
    #[error("model '{model}' failed: {message}")]
    ModelFailure { model: String, message: String },

    /// A human reviewer rejected a pending approval. Terminal.
    #[error("approval rejected for node '{node_id}'")]
    ApprovalRejected { node_id: String, reason: Option<String> },

    /// A pending approval expired without a decision. Terminal.
    #[error("approval timed out for node '{node_id}' after {timeout_minutes} minutes")]
    ApprovalTimeout { node_id: String, timeout_minutes: u64 },

    /// The run was cancelled. Terminal.
    #[error("run cancelled")]
    Cancelled,

    /// Persistence error from the store layer.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A bug: a handler produced a non-serializable value, an invariant
    /// broke, or an internal channel closed unexpectedly.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Stable machine-readable code for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not-found",
            Self::Unauthorized(_) => "unauthorized",
            Self::Conflict(_) => "conflict",
            Self::ToolFailure { .. } => "tool-failure",
            Self::ModelFailure { .. } => "model-failure",
            Self::ApprovalRejected { .. } => "approval-rejected",
            Self::ApprovalTimeout { .. } => "approval-timeout",
            Self::Cancelled => "cancelled",
            Self::Database(_) => "internal",
            Self::Internal(_) => "internal",
        }
    }

    /// HTTP-equivalent status for collaborator transports.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::NotFound(_) => 404,
            Self::Unauthorized(_) => 403,
            Self::Conflict(_) => 409,
            Self::ToolFailure { .. } | Self::ModelFailure { .. } => 502,
            Self::ApprovalRejected { .. } => 422,
            Self::ApprovalTimeout { .. } => 408,
            Self::Cancelled => 499,
            Self::Database(_) | Self::Internal(_) => 500,
        }
    }

    /// Whether the executor may retry a node attempt that failed with this
    /// error. Only upstream tool/model failures are transient; everything
    /// else is either a caller mistake or a terminal outcome.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ToolFailure { .. } | Self::ModelFailure { .. })
    }

    /// JSON form persisted into the run's and step's `error` columns.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "code": self.code(),
            "message": self.to_string(),
        })
    }
}

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(EngineError::Validation("x".into()).code(), "validation");
        assert_eq!(
            EngineError::ToolFailure {
                tool: "lookup".into(),
                message: "boom".into()
            }
            .code(),
            "tool-failure"
        );
        assert_eq!(EngineError::Cancelled.code(), "cancelled");
    }

    #[test]
    fn only_tool_and_model_failures_retry() {
        assert!(EngineError::ToolFailure {
            tool: "t".into(),
            message: "m".into()
        }
        .is_retryable());
        assert!(EngineError::ModelFailure {
            model: "m".into(),
            message: "x".into()
        }
        .is_retryable());
        assert!(!EngineError::Validation("bad".into()).is_retryable());
        assert!(!EngineError::ApprovalRejected {
            node_id: "a1".into(),
            reason: None
        }
        .is_retryable());
        assert!(!EngineError::Cancelled.is_retryable());
    }

    #[test]
    fn json_form_carries_code_and_message() {
        let err = EngineError::Conflict("run is not suspended".into());
        let json = err.to_json();
        assert_eq!(json["code"], "conflict");
        assert_eq!(json["message"], "conflict: run is not suspended");
    }

    #[test]
    fn http_statuses() {
        assert_eq!(EngineError::NotFound("r".into()).http_status(), 404);
        assert_eq!(EngineError::Unauthorized("r".into()).http_status(), 403);
        assert_eq!(EngineError::Internal("bug".into()).http_status(), 500);
    }
}

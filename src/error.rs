//! Error types for a3s-hitl

use crate::types::SessionStatus;
use thiserror::Error;

/// Errors that can occur while coordinating sessions and approvals
#[derive(Debug, Error)]
pub enum HitlError {
    /// Session id is unknown to the store
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Approval id / tool-use id is unknown to the store
    #[error("Approval not found: {0}")]
    ApprovalNotFound(String),

    /// Decision submitted for an approval that is no longer pending
    #[error("Approval already resolved: {0}")]
    AlreadyResolved(String),

    /// The calling transport did not carry a session id
    #[error("Missing session id in request context")]
    MissingSession,

    /// The caller gave up waiting (or the daemon is shutting down)
    #[error("Approval wait cancelled for tool use '{0}'")]
    Cancelled(String),

    /// Persistence layer failure
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Session status change rejected by the lifecycle state machine
    #[error("Invalid session transition: {from} -> {to}")]
    InvalidTransition {
        from: SessionStatus,
        to: SessionStatus,
    },

    /// Tool-use id already recorded for a different session
    #[error("Tool use '{tool_use_id}' already belongs to session '{session_id}'")]
    DuplicateToolUse {
        tool_use_id: String,
        session_id: String,
    },

    /// Another call is already parked on this tool-use id
    #[error("A caller is already waiting on tool use '{0}'")]
    AlreadyWaiting(String),

    /// Opt-in approval timeout elapsed
    #[error("Approval for tool use '{tool_use_id}' timed out after {secs}s")]
    ApprovalTimeout { tool_use_id: String, secs: u64 },

    /// Malformed request payload
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Advisory model failure
    #[error("Advisory query failed: {0}")]
    Advisory(String),

    /// Agent subprocess failure
    #[error("Process error for session '{session_id}': {msg}")]
    Process { session_id: String, msg: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HitlError {
    /// `AlreadyResolved` is reported to clients as a no-op, not a failure
    pub fn is_already_resolved(&self) -> bool {
        matches!(self, HitlError::AlreadyResolved(_))
    }

    /// Stable machine-readable code used by the HTTP and MCP surfaces
    pub fn code(&self) -> &'static str {
        match self {
            HitlError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            HitlError::ApprovalNotFound(_) => "APPROVAL_NOT_FOUND",
            HitlError::AlreadyResolved(_) => "ALREADY_RESOLVED",
            HitlError::MissingSession => "MISSING_SESSION",
            HitlError::Cancelled(_) => "CANCELLED",
            HitlError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            HitlError::InvalidTransition { .. } => "INVALID_TRANSITION",
            HitlError::DuplicateToolUse { .. } => "DUPLICATE_TOOL_USE",
            HitlError::AlreadyWaiting(_) => "ALREADY_WAITING",
            HitlError::ApprovalTimeout { .. } => "APPROVAL_TIMEOUT",
            HitlError::InvalidRequest(_) => "INVALID_REQUEST",
            HitlError::Serialization(_) => "SERIALIZATION",
            HitlError::Config(_) => "CONFIG",
            HitlError::Advisory(_) => "ADVISORY",
            HitlError::Process { .. } => "PROCESS",
            HitlError::Io(_) => "IO",
        }
    }
}

impl axum::response::IntoResponse for HitlError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let status = match &self {
            HitlError::SessionNotFound(_) | HitlError::ApprovalNotFound(_) => StatusCode::NOT_FOUND,
            HitlError::AlreadyResolved(_)
            | HitlError::DuplicateToolUse { .. }
            | HitlError::AlreadyWaiting(_)
            | HitlError::InvalidTransition { .. } => StatusCode::CONFLICT,
            HitlError::MissingSession
            | HitlError::InvalidRequest(_)
            | HitlError::Serialization(_) => StatusCode::BAD_REQUEST,
            HitlError::ApprovalTimeout { .. } => StatusCode::REQUEST_TIMEOUT,
            HitlError::Cancelled(_) | HitlError::StoreUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            HitlError::Advisory(_) => StatusCode::BAD_GATEWAY,
            HitlError::Config(_) | HitlError::Process { .. } | HitlError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "Request failed");
        }

        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        });
        (status, axum::Json(body)).into_response()
    }
}

/// Result type alias for coordination operations
pub type Result<T> = std::result::Result<T, HitlError>;

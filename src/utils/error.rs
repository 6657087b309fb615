//! Error handling for the gateway accounting core
//!
//! This module defines all error types used throughout the crate. Billing and
//! orchestration errors carry stable machine-readable codes (see
//! [`GatewayError::code`]) so the routing layer can map them onto wire errors
//! without string matching.

use thiserror::Error;

/// Result type alias for the gateway core
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Control-flow signal raised when tool-call arguments do not satisfy the
/// schema of a non-primary tool candidate during fallback.
///
/// This is not a caller-visible failure: the orchestrator reacts by advancing
/// the registry's selected candidate and replaying the round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSchemaMismatch {
    /// Lower-cased tool name whose candidate rejected the arguments
    pub tool_name: String,
    /// Index of the candidate that failed validation
    pub candidate_index: usize,
    /// Call ids affected by the mismatch (must be un-marked before replay)
    pub call_ids: Vec<String>,
}

/// Main error type for the gateway accounting core
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing errors
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Serialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// User-level balance cannot cover the estimated quota
    #[error("insufficient user quota: {0}")]
    InsufficientUserQuota(String),

    /// Token-level budget cannot cover the estimated quota
    #[error("insufficient token quota: {0}")]
    InsufficientTokenQuota(String),

    /// Balance store rejected or failed an operation
    #[error("quota operation failed: {0}")]
    QuotaOperation(String),

    /// Lookup failures (user, token, server, request cost row)
    #[error("not found: {0}")]
    NotFound(String),

    /// Validation errors
    #[error("validation error: {0}")]
    Validation(String),

    /// Upstream provider returned an error
    #[error("upstream error ({code}): {message}")]
    Upstream {
        /// Machine-readable upstream error code
        code: String,
        /// Human-readable message
        message: String,
        /// HTTP status reported by the upstream, when known
        status: u16,
    },

    /// Tool invocation failed terminally (transport error or candidates exhausted)
    #[error("tool call failed: {0}")]
    ToolCall(String),

    /// The tool loop exhausted its configured round budget
    #[error("tool rounds exceeded after {rounds} rounds")]
    ToolRoundsExceeded {
        /// Number of counted rounds executed
        rounds: u32,
    },

    /// Tool arguments do not satisfy a fallback candidate's schema
    #[error("tool schema mismatch for {}: candidate {}", .0.tool_name, .0.candidate_index)]
    SchemaMismatch(ToolSchemaMismatch),

    /// Timeout errors
    #[error("timeout: {0}")]
    Timeout(String),

    /// Internal errors
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Configuration error from any displayable value
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Insufficient user quota error
    pub fn insufficient_user_quota(message: impl Into<String>) -> Self {
        Self::InsufficientUserQuota(message.into())
    }

    /// Insufficient token quota error
    pub fn insufficient_token_quota(message: impl Into<String>) -> Self {
        Self::InsufficientTokenQuota(message.into())
    }

    /// Quota store operation failure
    pub fn quota_operation(message: impl Into<String>) -> Self {
        Self::QuotaOperation(message.into())
    }

    /// Not-found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Terminal tool-call error
    pub fn tool_call(message: impl Into<String>) -> Self {
        Self::ToolCall(message.into())
    }

    /// Internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Stable machine-readable error code for the routing layer
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::Io(_) => "io_error",
            Self::Yaml(_) => "yaml_error",
            Self::Serialization(_) => "serialization_error",
            Self::InsufficientUserQuota(_) => "insufficient_user_quota",
            Self::InsufficientTokenQuota(_) => "insufficient_token_quota",
            Self::QuotaOperation(_) => "quota_operation_failed",
            Self::NotFound(_) => "not_found",
            Self::Validation(_) => "validation_error",
            Self::Upstream { .. } => "upstream_error",
            Self::ToolCall(_) => "mcp_tool_call_failed",
            Self::ToolRoundsExceeded { .. } => "mcp_tool_rounds_exceeded",
            Self::SchemaMismatch(_) => "mcp_tool_schema_mismatch",
            Self::Timeout(_) => "timeout",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Whether the error is the non-terminal schema-mismatch signal
    pub fn as_schema_mismatch(&self) -> Option<&ToolSchemaMismatch> {
        match self {
            Self::SchemaMismatch(mismatch) => Some(mismatch),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(
            GatewayError::insufficient_user_quota("x").code(),
            "insufficient_user_quota"
        );
        assert_eq!(
            GatewayError::ToolRoundsExceeded { rounds: 5 }.code(),
            "mcp_tool_rounds_exceeded"
        );
        assert_eq!(
            GatewayError::tool_call("boom").code(),
            "mcp_tool_call_failed"
        );
    }

    #[test]
    fn schema_mismatch_accessor() {
        let err = GatewayError::SchemaMismatch(ToolSchemaMismatch {
            tool_name: "search".into(),
            candidate_index: 1,
            call_ids: vec!["call_1".into()],
        });
        let mismatch = err.as_schema_mismatch().expect("schema mismatch");
        assert_eq!(mismatch.tool_name, "search");
        assert_eq!(mismatch.candidate_index, 1);
        assert!(GatewayError::tool_call("x").as_schema_mismatch().is_none());
    }
}

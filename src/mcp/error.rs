use thiserror::Error;

use super::transport::JSONRPC_INVALID_PARAMS;

/// Failures raised while talking to one MCP tool server.
///
/// Every variant is scoped to a single server; callers isolate them so that
/// one misbehaving server never takes down the others.
#[derive(Debug, Error)]
pub enum McpError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("timed out during {0}")]
    Timeout(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("server rejected request ({code}): {message}")]
    Rejected { code: i64, message: String },

    #[error("tool '{0}' is not allowed")]
    AccessDenied(String),

    #[error("session is not ready")]
    NotReady,
}

impl McpError {
    /// Whether a failed tool call may be retried.
    ///
    /// Invalid-params rejections are local to argument validation; resending
    /// the identical call would only be rejected again.
    pub fn is_transient(&self) -> bool {
        match self {
            McpError::Connection(_) | McpError::Timeout(_) | McpError::Protocol(_) => true,
            McpError::Rejected { code, .. } => *code != JSONRPC_INVALID_PARAMS,
            McpError::AccessDenied(_) | McpError::NotReady => false,
        }
    }
}

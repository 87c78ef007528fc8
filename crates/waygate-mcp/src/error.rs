//! Upstream MCP error types.

use thiserror::Error;

/// Errors from upstream MCP calls.
#[derive(Debug, Error)]
pub enum McpError {
    /// No upstream with this name is configured.
    #[error("unknown MCP upstream: {0}")]
    UnknownUpstream(String),

    /// The child process could not be spawned or written to.
    #[error("upstream {name} unavailable: {reason}")]
    Unavailable {
        /// Upstream name.
        name: String,
        /// What went wrong.
        reason: String,
    },

    /// The upstream did not answer within the per-request deadline.
    #[error("upstream {name} timed out after {timeout_ms}ms calling {method}")]
    Timeout {
        /// Upstream name.
        name: String,
        /// JSON-RPC method that timed out.
        method: String,
        /// The deadline in milliseconds.
        timeout_ms: u64,
    },

    /// The child exited while requests were pending.
    #[error("upstream {0} exited with requests in flight")]
    ConnectionClosed(String),

    /// The upstream reported a JSON-RPC error.
    #[error("upstream error: {message}")]
    Upstream {
        /// Error message reported by the upstream.
        message: String,
    },

    /// The upstream spoke something that is not JSON-RPC.
    #[error("protocol error from {name}: {reason}")]
    Protocol {
        /// Upstream name.
        name: String,
        /// What was malformed.
        reason: String,
    },

    /// HTTP transport failure.
    #[error("http transport error: {0}")]
    Http(String),
}

/// Result alias for upstream operations.
pub type McpResult<T> = Result<T, McpError>;

//! MCP client error types.

use thiserror::Error;

use super::types::TransportKind;

/// One failed connection attempt, kept so the final error can report every
/// transport that was tried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportAttempt {
    pub transport: TransportKind,
    pub error: String,
}

impl std::fmt::Display for TransportAttempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.transport, self.error)
    }
}

/// Errors that can occur during MCP client operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// Every transport failed for a remote service.
    #[error(
        "could not connect to '{service}' at {url} ({})",
        attempts.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
    )]
    ConnectionFailed {
        service: String,
        url: String,
        attempts: Vec<TransportAttempt>,
    },

    /// Operation on a local server that has not been started (or was stopped).
    #[error("local server '{service}' is not running")]
    NotRunning { service: String },

    /// Local server process exited without being asked to.
    #[error("local server '{service}' crashed (exit code {})", exit_code.map(|c| c.to_string()).unwrap_or_else(|| "unknown".into()))]
    ServerCrashed {
        service: String,
        exit_code: Option<i32>,
    },

    /// A local service was registered without a command.
    #[error("local server '{service}' has no command configured")]
    MissingCommand { service: String },

    /// A server process failed to start.
    #[error("failed to spawn server '{service}': {reason}")]
    SpawnFailed { service: String, reason: String },

    /// The initialization handshake failed.
    #[error("server '{service}' initialization failed: {reason}")]
    InitFailed { service: String, reason: String },

    /// JSON-RPC communication error (malformed message, I/O error).
    #[error("transport error for server '{service}': {reason}")]
    TransportError { service: String, reason: String },

    /// The remote endpoint rejected the request for lack of credentials.
    #[error("server '{service}' requires authorization")]
    Unauthorized {
        service: String,
        www_authenticate: Option<String>,
    },

    /// The server dropped the streamable HTTP session; reconnect to get a new one.
    #[error("session '{session_id}' on server '{service}' has expired")]
    SessionExpired { service: String, session_id: String },

    /// Non-2xx HTTP response other than 401.
    #[error("server '{service}' returned HTTP {status}: {body}")]
    HttpStatus {
        service: String,
        status: u16,
        body: String,
    },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// A request did not complete in time.
    #[error("'{operation}' on server '{service}' timed out after {timeout_ms}ms")]
    Timeout {
        service: String,
        operation: String,
        timeout_ms: u64,
    },

    /// Bad service configuration (wrong kind, invalid header, bad URL).
    #[error("config error for '{service}': {reason}")]
    ConfigError { service: String, reason: String },
}

impl McpError {
    /// Whether the underlying channel is unusable and a cached session
    /// should be dropped.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            McpError::TransportError { .. }
                | McpError::SessionExpired { .. }
                | McpError::ServerCrashed { .. }
                | McpError::Unauthorized { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_failed_lists_every_attempt() {
        let err = McpError::ConnectionFailed {
            service: "remote".into(),
            url: "https://mcp.example.com/mcp".into(),
            attempts: vec![
                TransportAttempt {
                    transport: TransportKind::StreamableHttp,
                    error: "HTTP 405".into(),
                },
                TransportAttempt {
                    transport: TransportKind::Sse,
                    error: "connection refused".into(),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("streamable-http: HTTP 405"));
        assert!(msg.contains("sse: connection refused"));
    }

    #[test]
    fn test_crashed_without_exit_code() {
        let err = McpError::ServerCrashed {
            service: "local".into(),
            exit_code: None,
        };
        assert!(err.to_string().contains("unknown"));
        assert!(err.is_transport_failure());
    }
}

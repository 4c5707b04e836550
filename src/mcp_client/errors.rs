//! MCP client error types.
//!
//! `McpError` is what callers of the client see. `ProtocolAnomaly` describes a
//! bad line on the server's stdout; anomalies are logged and published as
//! events but never returned from a caller-facing operation.

use thiserror::Error;

/// Errors that can occur during MCP client operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// The server process failed to start.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed {
        name: String,
        reason: String,
    },

    /// The `tools/list` handshake failed during `start`.
    #[error("server '{name}' initialization failed: {reason}")]
    InitFailed {
        name: String,
        reason: String,
    },

    /// Writing or flushing a line on the server's stdin failed.
    #[error("failed to write to server '{server}': {reason}")]
    WriteFailed {
        server: String,
        reason: String,
    },

    /// The server answered with an `error` field.
    #[error("server error: {message}")]
    ToolError {
        code: Option<i64>,
        message: String,
        payload: serde_json::Value,
    },

    /// The request could not complete because the session shut down.
    #[error("server '{server}' closed: {reason}")]
    Closed {
        server: String,
        reason: String,
    },

    /// A request was not answered within the configured timeout.
    #[error("request '{method}' timed out after {timeout_ms}ms")]
    Timeout {
        method: String,
        timeout_ms: u64,
    },

    /// An operation needed a live session but the client is stopped.
    #[error("server '{name}' is not running")]
    NotRunning {
        name: String,
    },

    /// `start` was called on a client that is already running.
    #[error("server '{name}' is already running")]
    AlreadyRunning {
        name: String,
    },

    /// A message could not be serialized.
    #[error("serialization error: {reason}")]
    Serialization {
        reason: String,
    },

    /// Killing or reaping the server process failed.
    #[error("failed to terminate server '{name}': {reason}")]
    TerminateFailed {
        name: String,
        reason: String,
    },

    /// Configuration error (unreadable file, invalid values).
    #[error("config error: {reason}")]
    ConfigError {
        reason: String,
    },
}

impl McpError {
    /// Build a `ToolError` from the raw `error` value of a response.
    ///
    /// JSON-RPC error objects contribute their `code` and `message`; any other
    /// shape is rendered as JSON text.
    pub fn from_error_payload(payload: serde_json::Value) -> Self {
        let code = payload.get("code").and_then(|c| c.as_i64());
        let message = match payload.get("message").and_then(|m| m.as_str()) {
            Some(msg) => match code {
                Some(code) => format!("[{code}] {msg}"),
                None => msg.to_string(),
            },
            None => match &payload {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            },
        };
        McpError::ToolError {
            code,
            message,
            payload,
        }
    }

    /// Whether this error means the session went away under the caller.
    pub fn is_closed(&self) -> bool {
        matches!(self, McpError::Closed { .. } | McpError::NotRunning { .. })
    }
}

impl From<serde_json::Error> for McpError {
    fn from(e: serde_json::Error) -> Self {
        McpError::Serialization {
            reason: e.to_string(),
        }
    }
}

/// A line on the server's stdout that could not be routed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolAnomaly {
    /// The line is not valid UTF-8 JSON.
    #[error("unparseable line ({reason}): {line}")]
    Parse {
        line: String,
        reason: String,
    },

    /// Valid JSON that is not a request, response or notification.
    #[error("unrecognized message shape: {line}")]
    UnrecognizedShape {
        line: String,
    },

    /// A response whose id has no pending request.
    #[error("response for unknown request id {id}")]
    UnmatchedResponse {
        id: u64,
    },

    /// The server sent a request; this client does not serve any methods.
    #[error("unexpected server request '{method}'")]
    UnexpectedRequest {
        method: String,
    },
}

// ─── Tests ───────────────────────────────────────────────────────────────────

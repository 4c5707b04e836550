//! Line-delimited JSON over the server's stdin.
//!
//! Every producer (in-flight requests, notifications, the heartbeat) hands
//! whole lines to one writer task that owns the pipe. A line is either queued
//! in full or not at all, so a caller that gives up mid-write never leaves a
//! fragment for the next line to run into.

use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};

use super::errors::McpError;
use super::types::JsonRpcResponse;

/// Lines that may wait for the writer task before producers block.
const WRITE_QUEUE_DEPTH: usize = 64;

enum StdinCommand {
    Write {
        line: String,
        reply: oneshot::Sender<std::io::Result<()>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

// ─── Writer ──────────────────────────────────────────────────────────────────

/// Handle to the task that writes the server's stdin.
pub struct StdioWriter {
    server_name: String,
    commands: mpsc::Sender<StdinCommand>,
}

impl StdioWriter {
    /// Spawn the writer task for the server's stdin (or any async writer).
    ///
    /// Must be called from within a Tokio runtime. The task ends on `close`
    /// or once every handle is dropped.
    pub fn new<W>(server_name: &str, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (commands, rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        tokio::spawn(run_writer(server_name.to_string(), writer, rx));
        Self {
            server_name: server_name.to_string(),
            commands,
        }
    }

    /// Serialize `message` as one line and wait until it is written and flushed.
    ///
    /// Dropping the returned future after the line is queued does not stop
    /// the line from being written in full.
    pub async fn write_message<T: Serialize>(&self, message: &T) -> Result<(), McpError> {
        let line = encode_line(message)?;
        let (reply, written) = oneshot::channel();

        self.commands
            .send(StdinCommand::Write { line, reply })
            .await
            .map_err(|_| self.stopped())?;

        match written.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(McpError::WriteFailed {
                server: self.server_name.clone(),
                reason: format!("failed to write to stdin: {e}"),
            }),
            Err(_) => Err(self.stopped()),
        }
    }

    /// Close the write end after every queued line, so the server sees EOF.
    pub async fn close(&self) {
        let (reply, closed) = oneshot::channel();
        if self
            .commands
            .send(StdinCommand::Close { reply })
            .await
            .is_ok()
        {
            let _ = closed.await;
        }
    }

    fn stopped(&self) -> McpError {
        McpError::WriteFailed {
            server: self.server_name.clone(),
            reason: "stdin writer stopped".into(),
        }
    }
}

async fn run_writer<W>(
    server_name: String,
    mut writer: W,
    mut commands: mpsc::Receiver<StdinCommand>,
) where
    W: AsyncWrite + Send + Unpin,
{
    while let Some(command) = commands.recv().await {
        match command {
            StdinCommand::Write { line, reply } => {
                let result = match writer.write_all(line.as_bytes()).await {
                    Ok(()) => writer.flush().await,
                    Err(e) => Err(e),
                };
                // The caller may have stopped waiting.
                let _ = reply.send(result);
            }
            StdinCommand::Close { reply } => {
                if let Err(e) = writer.shutdown().await {
                    tracing::debug!(server = %server_name, error = %e, "stdin already closed");
                }
                let _ = reply.send(());
                break;
            }
        }
    }
    tracing::debug!(server = %server_name, "stdin writer stopped");
}

/// Serialize a message and append the line terminator.
pub fn encode_line<T: Serialize>(message: &T) -> Result<String, McpError> {
    let mut json = serde_json::to_string(message).map_err(|e| McpError::Serialization {
        reason: format!("failed to serialize message: {e}"),
    })?;
    json.push('\n');
    Ok(json)
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
///
/// A response with neither `result` nor `error` yields `null`; the result is
/// opaque to this layer.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::from_error_payload(err));
    }

    Ok(response.result.unwrap_or(serde_json::Value::Null))
}

// ─── Tests ───────────────────────────────────────────────────────────────────

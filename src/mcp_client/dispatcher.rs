//! Single reader of the server's stdout.
//!
//! Decodes one JSON value per line and routes it by shape:
//! - responses resolve the matching pending request
//! - notifications are published as `ServerEvent::Notification`
//! - everything else is a `ProtocolAnomaly`: logged, published, skipped
//!
//! Lines longer than `max_line_bytes` are reported as a parse anomaly and
//! skipped up to the next newline, so a runaway server cannot grow the read
//! buffer without bound.
//!
//! The loop ends on EOF, on a read error, or when shutdown is signalled. It
//! never fails pending requests itself; the client does that on `stop`.

use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::sync::broadcast;

use super::background::ShutdownSignal;
use super::errors::ProtocolAnomaly;
use super::multiplexer::RequestMultiplexer;
use super::types::{excerpt, Message};

/// Default cap on one line of server output, newline excluded.
pub const MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

// ─── Events ──────────────────────────────────────────────────────────────────

/// Something the server did that no pending request is waiting for.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Server push notification.
    Notification {
        method: String,
        params: Option<Value>,
    },
    /// A line that could not be routed.
    Anomaly(ProtocolAnomaly),
    /// The server closed its stdout.
    OutputClosed,
}

/// Why the dispatcher loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Eof,
    Cancelled,
    ReadError,
}

enum ReadLine {
    Eof,
    Line,
    /// The first `max + 1` bytes are in the buffer; `skipped` counts the
    /// bytes dropped after them, up to and excluding the newline.
    Oversized { skipped: usize },
}

/// Read one line into `buf`, keeping at most `max + 1` bytes of it.
async fn read_line<R>(
    reader: &mut BufReader<R>,
    max: usize,
    buf: &mut Vec<u8>,
) -> std::io::Result<ReadLine>
where
    R: AsyncRead + Unpin,
{
    let limit = u64::try_from(max).unwrap_or(u64::MAX).saturating_add(1);
    let read = (&mut *reader).take(limit).read_until(b'\n', buf).await?;
    if read == 0 {
        return Ok(ReadLine::Eof);
    }
    if buf.ends_with(b"\n") || buf.len() <= max {
        return Ok(ReadLine::Line);
    }

    let mut skipped = 0;
    loop {
        let (consumed, done) = {
            let available = reader.fill_buf().await?;
            match available.iter().position(|&b| b == b'\n') {
                Some(pos) => (pos + 1, true),
                None if available.is_empty() => (0, true),
                None => (available.len(), false),
            }
        };
        reader.consume(consumed);
        skipped += if done { consumed.saturating_sub(1) } else { consumed };
        if done {
            return Ok(ReadLine::Oversized { skipped });
        }
    }
}

// ─── Dispatcher ──────────────────────────────────────────────────────────────

pub struct StdoutDispatcher<R> {
    server_name: String,
    reader: BufReader<R>,
    max_line_bytes: usize,
    multiplexer: Arc<RequestMultiplexer>,
    events: broadcast::Sender<ServerEvent>,
}

impl<R> StdoutDispatcher<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(
        server_name: &str,
        stdout: R,
        multiplexer: Arc<RequestMultiplexer>,
        events: broadcast::Sender<ServerEvent>,
    ) -> Self {
        Self {
            server_name: server_name.to_string(),
            reader: BufReader::new(stdout),
            max_line_bytes: MAX_LINE_BYTES,
            multiplexer,
            events,
        }
    }

    /// Override the line length cap.
    pub fn with_max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes;
        self
    }

    /// Read and route lines until EOF, a read error, or shutdown.
    pub async fn run(mut self, mut shutdown: ShutdownSignal) -> DispatchOutcome {
        let mut buf = Vec::new();

        let outcome = loop {
            buf.clear();
            let read = tokio::select! {
                _ = shutdown.cancelled() => break DispatchOutcome::Cancelled,
                read = read_line(&mut self.reader, self.max_line_bytes, &mut buf) => read,
            };

            match read {
                Ok(ReadLine::Eof) => {
                    tracing::info!(server = %self.server_name, "server stdout closed");
                    self.publish(ServerEvent::OutputClosed);
                    break DispatchOutcome::Eof;
                }
                Ok(ReadLine::Line) => self.handle_line(&buf),
                Ok(ReadLine::Oversized { skipped }) => {
                    self.anomaly(ProtocolAnomaly::Parse {
                        line: excerpt(&String::from_utf8_lossy(&buf)),
                        reason: format!(
                            "line exceeds {} bytes ({} bytes dropped)",
                            self.max_line_bytes,
                            buf.len() + skipped
                        ),
                    });
                }
                Err(e) => {
                    tracing::warn!(server = %self.server_name, error = %e, "failed to read server stdout");
                    self.publish(ServerEvent::OutputClosed);
                    break DispatchOutcome::ReadError;
                }
            }
        };

        tracing::debug!(server = %self.server_name, ?outcome, "dispatcher stopped");
        outcome
    }

    fn handle_line(&self, raw: &[u8]) {
        let line = match std::str::from_utf8(raw) {
            Ok(line) => line.trim(),
            Err(e) => {
                self.anomaly(ProtocolAnomaly::Parse {
                    line: String::from_utf8_lossy(raw).trim().to_string(),
                    reason: format!("invalid UTF-8: {e}"),
                });
                return;
            }
        };

        if line.is_empty() {
            return;
        }

        match Message::decode(line) {
            Ok(Message::Response(response)) => {
                let id = response.id;
                match self.multiplexer.resolve(response) {
                    Ok(elapsed) => tracing::debug!(
                        server = %self.server_name,
                        id,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "resolved request"
                    ),
                    Err(anomaly) => self.anomaly(anomaly),
                }
            }
            Ok(Message::Notification(notification)) => {
                tracing::debug!(
                    server = %self.server_name,
                    method = %notification.method,
                    "server notification"
                );
                self.publish(ServerEvent::Notification {
                    method: notification.method,
                    params: notification.params,
                });
            }
            Ok(Message::Request { method, .. }) => {
                self.anomaly(ProtocolAnomaly::UnexpectedRequest { method });
            }
            Err(anomaly) => self.anomaly(anomaly),
        }
    }

    fn anomaly(&self, anomaly: ProtocolAnomaly) {
        tracing::warn!(server = %self.server_name, anomaly = %anomaly, "protocol anomaly");
        self.publish(ServerEvent::Anomaly(anomaly));
    }

    fn publish(&self, event: ServerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncWriteExt, DuplexStream};

    use super::*;
    use crate::mcp_client::background::TaskSet;
    use crate::mcp_client::errors::McpError;

    struct Harness {
        server_side: DuplexStream,
        multiplexer: Arc<RequestMultiplexer>,
        events: broadcast::Receiver<ServerEvent>,
        tasks: TaskSet,
        outcome: tokio::sync::oneshot::Receiver<DispatchOutcome>,
    }

    fn start() -> Harness {
        start_with_cap(MAX_LINE_BYTES)
    }

    fn start_with_cap(max_line_bytes: usize) -> Harness {
        let (client_side, server_side) = tokio::io::duplex(4096);
        let multiplexer = Arc::new(RequestMultiplexer::new("test"));
        let (events_tx, events) = broadcast::channel(32);
        let dispatcher = StdoutDispatcher::new("test", client_side, multiplexer.clone(), events_tx)
            .with_max_line_bytes(max_line_bytes);

        let (outcome_tx, outcome) = tokio::sync::oneshot::channel();
        let mut tasks = TaskSet::new();
        let signal = tasks.signal();
        tasks.spawn("dispatcher", async move {
            let _ = outcome_tx.send(dispatcher.run(signal).await);
        });

        Harness {
            server_side,
            multiplexer,
            events,
            tasks,
            outcome,
        }
    }

    async fn next_event(events: &mut broadcast::Receiver<ServerEvent>) -> ServerEvent {
        tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("event expected")
            .unwrap()
    }

    #[tokio::test]
    async fn test_response_resolves_pending_request() {
        let mut h = start();
        let handle = h.multiplexer.allocate("tools/list").unwrap();

        h.server_side
            .write_all(b"{\"id\":1,\"result\":{\"tools\":[]}}\n")
            .await
            .unwrap();

        let response = handle.wait().await.unwrap();
        assert_eq!(response.result.unwrap()["tools"], serde_json::json!([]));
        h.tasks.shutdown().await;
    }

    #[tokio::test]
    async fn test_malformed_line_does_not_stop_loop() {
        let mut h = start();
        let handle = h.multiplexer.allocate("tools/call").unwrap();

        h.server_side
            .write_all(b"not json\n\n{\"id\":1,\"result\":\"ok\"}\n")
            .await
            .unwrap();

        assert_eq!(handle.wait().await.unwrap().result.unwrap(), "ok");
        match next_event(&mut h.events).await {
            ServerEvent::Anomaly(ProtocolAnomaly::Parse { line, .. }) => {
                assert_eq!(line, "not json")
            }
            other => panic!("expected parse anomaly, got {other:?}"),
        }
        h.tasks.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_anomaly() {
        let mut h = start();
        let handle = h.multiplexer.allocate("tools/call").unwrap();

        h.server_side.write_all(b"\xff\xfe\n").await.unwrap();
        h.server_side
            .write_all(b"{\"id\":1,\"result\":1}\n")
            .await
            .unwrap();

        assert!(matches!(
            next_event(&mut h.events).await,
            ServerEvent::Anomaly(ProtocolAnomaly::Parse { .. })
        ));
        assert!(handle.wait().await.is_ok());
        h.tasks.shutdown().await;
    }

    #[tokio::test]
    async fn test_overlong_line_is_skipped_up_to_newline() {
        let mut h = start_with_cap(64);
        let handle = h.multiplexer.allocate("tools/call").unwrap();

        let mut junk = vec![b'x'; 5000];
        junk.push(b'\n');
        h.server_side.write_all(&junk).await.unwrap();
        h.server_side
            .write_all(b"{\"id\":1,\"result\":\"after\"}\n")
            .await
            .unwrap();

        match next_event(&mut h.events).await {
            ServerEvent::Anomaly(ProtocolAnomaly::Parse { line, reason }) => {
                assert_eq!(line, "x".repeat(65));
                assert_eq!(reason, "line exceeds 64 bytes (5000 bytes dropped)");
            }
            other => panic!("expected parse anomaly, got {other:?}"),
        }
        assert_eq!(handle.wait().await.unwrap().result.unwrap(), "after");
        h.tasks.shutdown().await;
    }

    #[tokio::test]
    async fn test_line_at_cap_is_accepted() {
        let mut h = start_with_cap(22);
        let handle = h.multiplexer.allocate("tools/call").unwrap();

        // Exactly 22 bytes before the newline.
        h.server_side
            .write_all(b"{\"id\":1,\"result\":\"ok\"}\n")
            .await
            .unwrap();

        assert_eq!(handle.wait().await.unwrap().result.unwrap(), "ok");
        assert!(h.events.try_recv().is_err());
        h.tasks.shutdown().await;
    }

    #[tokio::test]
    async fn test_unmatched_response_is_discarded() {
        let mut h = start();
        let handle = h.multiplexer.allocate("tools/call").unwrap();

        h.server_side
            .write_all(b"{\"id\":42,\"result\":\"stray\"}\n{\"id\":1,\"result\":\"mine\"}\n")
            .await
            .unwrap();

        assert_eq!(handle.wait().await.unwrap().result.unwrap(), "mine");
        assert_eq!(
            next_event(&mut h.events).await,
            ServerEvent::Anomaly(ProtocolAnomaly::UnmatchedResponse { id: 42 })
        );
        h.tasks.shutdown().await;
    }

    #[tokio::test]
    async fn test_notification_is_published() {
        let mut h = start();
        h.server_side
            .write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"notifications/message\",\"params\":{\"level\":\"info\"}}\n")
            .await
            .unwrap();

        assert_eq!(
            next_event(&mut h.events).await,
            ServerEvent::Notification {
                method: "notifications/message".into(),
                params: Some(serde_json::json!({"level": "info"})),
            }
        );
        h.tasks.shutdown().await;
    }

    #[tokio::test]
    async fn test_server_request_is_anomaly() {
        let mut h = start();
        h.server_side
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":7,\"method\":\"roots/list\"}\n")
            .await
            .unwrap();

        assert_eq!(
            next_event(&mut h.events).await,
            ServerEvent::Anomaly(ProtocolAnomaly::UnexpectedRequest {
                method: "roots/list".into()
            })
        );
        // The id must not have resolved anything
        assert_eq!(h.multiplexer.pending_count(), 0);
        h.tasks.shutdown().await;
    }

    #[tokio::test]
    async fn test_eof_ends_loop_without_cancelling_requests() {
        let mut h = start();
        let handle = h.multiplexer.allocate("tools/call").unwrap();

        drop(h.server_side);
        let outcome = tokio::time::timeout(Duration::from_secs(2), h.outcome)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Eof);
        assert_eq!(next_event(&mut h.events).await, ServerEvent::OutputClosed);

        // Still pending until the owner cancels
        assert_eq!(h.multiplexer.pending_count(), 1);
        h.multiplexer.cancel_all("closed");
        assert!(matches!(handle.wait().await, Err(McpError::Closed { .. })));
        h.tasks.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_blocked_read() {
        let h = start();
        // Nothing is ever written; the dispatcher is parked in read_until.
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(2), h.tasks.shutdown())
            .await
            .unwrap();
        assert_eq!(h.outcome.await.unwrap(), DispatchOutcome::Cancelled);
        drop(h.server_side);
    }
}

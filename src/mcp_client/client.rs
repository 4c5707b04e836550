//! MCP Client — high-level interface for one stdio server.
//!
//! Composes the process supervisor, the request multiplexer, the stdout
//! dispatcher and the background tasks. All methods take `&self`, so a client
//! behind an `Arc` can serve many concurrent `call_tool`s while another task
//! calls `stop`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::background::{
    run_heartbeat, run_status_report, HeartbeatStats, StatusReport, StatusSink, TaskSet,
    TracingStatusSink,
};
use super::config::ClientConfig;
use super::dispatcher::{ServerEvent, StdoutDispatcher};
use super::errors::McpError;
use super::lifecycle::{self, ChildProcess};
use super::multiplexer::RequestMultiplexer;
use super::registry::ToolCatalog;
use super::transport::{extract_result, StdioWriter};
use super::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ToolDescriptor, ToolListResult};

/// Failure delivered to requests still pending when the client stops.
const CLOSED_REASON: &str = "closed";

/// How long `stop` waits for stdin to close before killing anyway.
const STDIN_CLOSE_GRACE: Duration = Duration::from_millis(100);

// ─── Session State ───────────────────────────────────────────────────────────

/// What a request needs to reach the server. Cloned out by each caller so no
/// lock is held while it waits.
struct SessionChannels {
    id: Uuid,
    writer: Arc<StdioWriter>,
    multiplexer: Arc<RequestMultiplexer>,
}

/// Everything `stop` has to tear down.
struct RunningSession {
    channels: Arc<SessionChannels>,
    process: ChildProcess,
    tasks: TaskSet,
}

// ─── McpClient ───────────────────────────────────────────────────────────────

/// Client for a single MCP server spoken to over its stdin/stdout.
pub struct McpClient {
    config: ClientConfig,
    catalog: ToolCatalog,
    events: broadcast::Sender<ServerEvent>,
    status_sink: Arc<dyn StatusSink>,
    /// Channels of the live session, if any.
    channels: Mutex<Option<Arc<SessionChannels>>>,
    /// Serializes `start`/`stop` and owns the process. Never held across a
    /// server round trip.
    lifecycle: tokio::sync::Mutex<Option<RunningSession>>,
}

impl McpClient {
    /// Create a stopped client. Nothing is spawned until `start`.
    pub fn new(config: ClientConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            catalog: ToolCatalog::new(),
            events,
            status_sink: Arc::new(TracingStatusSink),
            channels: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(None),
        }
    }

    /// Send status reports to `sink` instead of the log.
    pub fn with_status_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.status_sink = sink;
        self
    }

    /// Server name from the config.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Receive server notifications and protocol anomalies.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    fn channels_slot(&self) -> MutexGuard<'_, Option<Arc<SessionChannels>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn live_channels(&self) -> Result<Arc<SessionChannels>, McpError> {
        self.channels_slot().clone().ok_or(McpError::NotRunning {
            name: self.config.name.clone(),
        })
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Spawn the server, start the reader and background tasks, and load
    /// the tool catalog with `tools/list`.
    ///
    /// On any failure everything already started is torn down again. The
    /// `tools/list` handshake runs without holding the lifecycle lock, so a
    /// concurrent `stop` interrupts it and `start` returns `Closed`. If the
    /// `start` future itself is dropped mid-handshake, the session stays
    /// claimed until `stop`.
    pub async fn start(&self) -> Result<(), McpError> {
        let name = self.config.name.as_str();
        let started = Instant::now();

        let channels = {
            let mut lifecycle = self.lifecycle.lock().await;
            if lifecycle.is_some() {
                return Err(McpError::AlreadyRunning {
                    name: self.config.name.clone(),
                });
            }
            self.config.validate()?;

            let session = self.launch(started).await?;
            let channels = session.channels.clone();
            // Claimed but unpublished: `start` sees AlreadyRunning, callers
            // see NotRunning, `stop` can tear it down.
            *lifecycle = Some(session);
            channels
        };

        let listed = self.list_tools_on(&channels).await;

        let mut lifecycle = self.lifecycle.lock().await;
        if !Self::is_current(&lifecycle, &channels) {
            return Err(self.closed("stopped during start"));
        }

        let tools = match listed {
            Ok(tools) => tools,
            Err(e) => {
                tracing::warn!(server = name, error = %e, "server initialization failed");
                if let Some(session) = lifecycle.take() {
                    let _ = Self::teardown(name, session).await;
                }
                return Err(match e {
                    McpError::InitFailed { .. } => e,
                    other => McpError::InitFailed {
                        name: name.to_string(),
                        reason: other.to_string(),
                    },
                });
            }
        };

        tracing::info!(
            server = name,
            session = %channels.id,
            pid = ?lifecycle.as_ref().and_then(|s| s.process.pid()),
            tools = ?tools.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "server started"
        );

        self.catalog.replace(tools);
        *self.channels_slot() = Some(channels);
        Ok(())
    }

    /// Spawn the child and everything that runs beside it.
    async fn launch(&self, started: Instant) -> Result<RunningSession, McpError> {
        let name = self.config.name.as_str();

        let mut process = lifecycle::spawn_server(name, &self.config.server)?;
        let (stdin, stdout, stderr) = match process.take_stdio() {
            Ok(stdio) => stdio,
            Err(e) => {
                if let Err(kill_err) = process.terminate().await {
                    tracing::warn!(server = name, error = %kill_err, "failed to reap server");
                }
                return Err(e);
            }
        };

        let channels = Arc::new(SessionChannels {
            id: Uuid::new_v4(),
            writer: Arc::new(StdioWriter::new(name, stdin)),
            multiplexer: Arc::new(RequestMultiplexer::new(name)),
        });
        let tasks = self.spawn_tasks(&channels, stdout, stderr, started);

        Ok(RunningSession {
            channels,
            process,
            tasks,
        })
    }

    /// Whether `channels` still belong to the session held in `lifecycle`.
    fn is_current(lifecycle: &Option<RunningSession>, channels: &SessionChannels) -> bool {
        lifecycle
            .as_ref()
            .is_some_and(|session| session.channels.id == channels.id)
    }

    fn closed(&self, reason: &str) -> McpError {
        McpError::Closed {
            server: self.config.name.clone(),
            reason: reason.to_string(),
        }
    }

    fn spawn_tasks(
        &self,
        channels: &Arc<SessionChannels>,
        stdout: tokio::process::ChildStdout,
        stderr: Option<tokio::process::ChildStderr>,
        started: Instant,
    ) -> TaskSet {
        let name = self.config.name.clone();
        let mut tasks = TaskSet::new();

        let dispatcher = StdoutDispatcher::new(
            &name,
            stdout,
            channels.multiplexer.clone(),
            self.events.clone(),
        );
        let signal = tasks.signal();
        tasks.spawn("dispatcher", async move {
            dispatcher.run(signal).await;
        });

        if let Some(stderr) = stderr {
            tasks.spawn(
                "stderr",
                lifecycle::drain_stderr(name.clone(), stderr, tasks.signal()),
            );
        }

        let heartbeats = Arc::new(HeartbeatStats::default());
        tasks.spawn(
            "heartbeat",
            run_heartbeat(
                name.clone(),
                channels.writer.clone(),
                self.config.heartbeat_interval(),
                heartbeats.clone(),
                tasks.signal(),
            ),
        );

        let catalog = self.catalog.clone();
        let multiplexer = channels.multiplexer.clone();
        let session_id = channels.id;
        let observe = move || StatusReport {
            server: name.clone(),
            session_id,
            observed_at: chrono::Utc::now(),
            uptime_ms: started.elapsed().as_millis() as u64,
            tool_count: catalog.len(),
            pending_requests: multiplexer.pending_count(),
            heartbeats_sent: heartbeats.sent(),
            heartbeat_failures: heartbeats.failed(),
        };
        tasks.spawn(
            "status",
            run_status_report(
                observe,
                self.status_sink.clone(),
                self.config.status_interval(),
                tasks.signal(),
            ),
        );

        tasks
    }

    /// Stop background tasks, fail outstanding requests with `Closed`, and
    /// kill the server. A no-op on a stopped client.
    pub async fn stop(&self) -> Result<(), McpError> {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(session) = lifecycle.take() else {
            return Ok(());
        };

        // New callers see NotRunning from here on.
        self.channels_slot().take();
        let result = Self::teardown(&self.config.name, session).await;
        self.catalog.clear();
        result.map(|_| ())
    }

    /// Cancel tasks first so nothing writes to a dying pipe, then drain the
    /// request table, then kill.
    async fn teardown(
        name: &str,
        session: RunningSession,
    ) -> Result<std::process::ExitStatus, McpError> {
        let RunningSession {
            channels,
            mut process,
            tasks,
        } = session;

        tasks.shutdown().await;
        let cancelled = channels.multiplexer.cancel_all(CLOSED_REASON);
        // Lines queued behind a full pipe may keep EOF from going out.
        if tokio::time::timeout(STDIN_CLOSE_GRACE, channels.writer.close())
            .await
            .is_err()
        {
            tracing::debug!(server = name, "stdin busy, killing without EOF");
        }
        let status = process.terminate().await;

        match &status {
            Ok(status) => tracing::info!(
                server = name,
                session = %channels.id,
                cancelled,
                %status,
                "server stopped"
            ),
            Err(e) => tracing::warn!(server = name, error = %e, "server did not stop cleanly"),
        }
        status
    }

    // ─── Requests ────────────────────────────────────────────────────────

    /// Call a tool and return its result payload.
    ///
    /// Fails with `ToolError` if the server answers with an error, `Closed`
    /// if the client stops first, and `Timeout` only when `call_timeout_ms`
    /// is configured.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, McpError> {
        let params = serde_json::json!({
            "name": name,
            "arguments": arguments,
        });

        let response = self
            .request_with_timeout("tools/call", Some(params), self.config.call_timeout())
            .await?;
        extract_result(response)
    }

    /// Send an arbitrary request and wait for its raw response.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        self.request_with_timeout(method, params, self.config.call_timeout())
            .await
    }

    /// Send a notification (no id, no response).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let channels = self.live_channels()?;
        channels
            .writer
            .write_message(&JsonRpcNotification::new(method, params))
            .await
    }

    async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<JsonRpcResponse, McpError> {
        let channels = self.live_channels()?;
        Self::send_request(&self.config.name, &channels, method, params, timeout).await
    }

    async fn send_request(
        name: &str,
        channels: &SessionChannels,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<JsonRpcResponse, McpError> {
        let handle = channels.multiplexer.allocate(method)?;
        let id = handle.id();
        let request = JsonRpcRequest::new(id, method, params);

        tracing::debug!(server = name, id, method, "sending request");

        if let Err(e) = channels.writer.write_message(&request).await {
            if channels.multiplexer.is_closed() {
                return Err(McpError::Closed {
                    server: name.to_string(),
                    reason: CLOSED_REASON.into(),
                });
            }
            return Err(e);
        }

        let Some(limit) = timeout else {
            return handle.wait().await;
        };

        match tokio::time::timeout(limit, handle.wait()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                // The dropped handle took its entry along; a late answer for
                // this id becomes an unmatched-response anomaly.
                Err(McpError::Timeout {
                    method: method.to_string(),
                    timeout_ms: limit.as_millis() as u64,
                })
            }
        }
    }

    /// Issue `tools/list` on a session that is not yet published.
    async fn list_tools_on(
        &self,
        channels: &SessionChannels,
    ) -> Result<Vec<ToolDescriptor>, McpError> {
        let response = Self::send_request(
            &self.config.name,
            channels,
            "tools/list",
            None,
            self.config.init_timeout(),
        )
        .await?;

        let result = extract_result(response)?;
        let listed: ToolListResult =
            serde_json::from_value(result).map_err(|e| McpError::InitFailed {
                name: self.config.name.clone(),
                reason: format!("failed to parse tools/list response: {e}"),
            })?;
        Ok(listed.tools)
    }

    /// Re-issue `tools/list` and replace the catalog with the answer.
    ///
    /// A concurrent `stop` fails the pending request with `Closed`.
    pub async fn refresh_tools(&self) -> Result<usize, McpError> {
        let channels = self.live_channels()?;
        let tools = self.list_tools_on(&channels).await?;

        // Do not repopulate the catalog of a session stopped meanwhile.
        let lifecycle = self.lifecycle.lock().await;
        if !Self::is_current(&lifecycle, &channels) {
            return Err(self.closed("stopped during refresh"));
        }

        let count = tools.len();
        self.catalog.replace(tools);
        tracing::info!(server = %self.config.name, tools = count, "tool catalog refreshed");
        Ok(count)
    }

    // ─── Status ──────────────────────────────────────────────────────────

    /// The tools advertised by the server (empty when stopped).
    pub fn list_tools(&self) -> Arc<[ToolDescriptor]> {
        self.catalog.snapshot()
    }

    /// Shared handle to the tool catalog.
    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    /// Whether a session is live.
    pub fn is_running(&self) -> bool {
        self.channels_slot().is_some()
    }

    /// Requests awaiting a response in the live session.
    pub fn pending_requests(&self) -> usize {
        self.channels_slot()
            .as_ref()
            .map(|c| c.multiplexer.pending_count())
            .unwrap_or(0)
    }

    /// OS process id of the live server, if any.
    pub async fn server_pid(&self) -> Option<u32> {
        self.lifecycle
            .lock()
            .await
            .as_ref()
            .and_then(|s| s.process.pid())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

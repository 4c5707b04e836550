//! Background tasks that run alongside a server session.
//!
//! `TaskSet` owns the dispatcher, the stderr drain, the heartbeat and the
//! status reporter. All of them watch one `ShutdownSignal`, so a single
//! `shutdown()` interrupts every task at its current await point (pipe read,
//! pipe write or timer) and waits for all of them to return.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::transport::StdioWriter;
use super::types::Ping;

// ─── Shutdown Signal ─────────────────────────────────────────────────────────

/// Cancellation flag shared by every task of a session.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Resolve once shutdown is requested (or the `TaskSet` is dropped).
    pub async fn cancelled(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }
}

// ─── TaskSet ─────────────────────────────────────────────────────────────────

/// Tasks started together and cancelled together.
pub struct TaskSet {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl TaskSet {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            tasks: Vec::new(),
        }
    }

    /// A signal for a task about to be spawned into this set.
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.shutdown_tx.subscribe(),
        }
    }

    /// Spawn a task. It must return once its `ShutdownSignal` fires.
    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.push((name, tokio::spawn(task)));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Signal every task and wait until all of them have returned.
    pub async fn shutdown(self) {
        self.shutdown_tx.send_replace(true);

        let (names, handles): (Vec<_>, Vec<_>) = self.tasks.into_iter().unzip();
        let results = futures::future::join_all(handles).await;

        for (name, result) in names.into_iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(task = name, error = %e, "background task ended abnormally");
            }
        }
    }
}

impl Default for TaskSet {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Heartbeat ───────────────────────────────────────────────────────────────

/// Counters kept by the heartbeat task.
#[derive(Debug, Default)]
pub struct HeartbeatStats {
    sent: AtomicU64,
    failed: AtomicU64,
}

impl HeartbeatStats {
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Write `{"type":"ping"}` to the server every `period`.
///
/// The first ping goes out immediately. A failed write is logged and counted;
/// the next tick tries again. No reply is expected.
pub async fn run_heartbeat(
    server_name: String,
    writer: Arc<StdioWriter>,
    period: Duration,
    stats: Arc<HeartbeatStats>,
    mut shutdown: ShutdownSignal,
) {
    let ping = Ping::default();
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        // A stalled pipe must not delay shutdown.
        tokio::select! {
            _ = shutdown.cancelled() => break,
            result = writer.write_message(&ping) => match result {
                Ok(()) => {
                    stats.sent.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(server = %server_name, "heartbeat sent");
                }
                Err(e) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(server = %server_name, error = %e, "heartbeat failed");
                }
            },
        }
    }

    tracing::debug!(server = %server_name, "heartbeat stopped");
}

// ─── Status Report ───────────────────────────────────────────────────────────

/// One liveness observation of a running session.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub server: String,
    pub session_id: uuid::Uuid,
    pub observed_at: DateTime<Utc>,
    pub uptime_ms: u64,
    pub tool_count: usize,
    pub pending_requests: usize,
    pub heartbeats_sent: u64,
    pub heartbeat_failures: u64,
}

/// Receives periodic status reports.
pub trait StatusSink: Send + Sync {
    fn report(&self, report: &StatusReport);
}

/// Default sink: one structured `info` line per report.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingStatusSink;

impl StatusSink for TracingStatusSink {
    fn report(&self, report: &StatusReport) {
        tracing::info!(
            server = %report.server,
            session = %report.session_id,
            uptime_ms = report.uptime_ms,
            tools = report.tool_count,
            pending = report.pending_requests,
            heartbeats_sent = report.heartbeats_sent,
            heartbeat_failures = report.heartbeat_failures,
            "server alive"
        );
    }
}

/// Every `period`, build a report with `observe` and hand it to `sink`.
///
/// Never touches the server's pipes.
pub async fn run_status_report<F>(
    observe: F,
    sink: Arc<dyn StatusSink>,
    period: Duration,
    mut shutdown: ShutdownSignal,
) where
    F: Fn() -> StatusReport + Send + 'static,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => sink.report(&observe()),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

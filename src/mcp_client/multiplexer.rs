//! Pending-request table keyed by correlation id.
//!
//! Ids start at 1 and increase strictly for the lifetime of one multiplexer
//! (one server session). Every entry leaves the table exactly once: through
//! `resolve`, `cancel_all` or the drop of its `CompletionHandle`, all of
//! which remove under the same lock, so whichever runs first wins and the
//! others find nothing. A caller that stops waiting leaves nothing behind.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use super::errors::{McpError, ProtocolAnomaly};
use super::types::JsonRpcResponse;

type Completion = oneshot::Sender<Result<JsonRpcResponse, McpError>>;

// ─── PendingRequest ──────────────────────────────────────────────────────────

/// An outstanding request awaiting its response.
#[derive(Debug)]
pub struct PendingRequest {
    pub id: u64,
    pub method: String,
    pub issued_at: Instant,
    completion: Completion,
}

impl PendingRequest {
    fn deliver(self, outcome: Result<JsonRpcResponse, McpError>) -> bool {
        self.completion.send(outcome).is_ok()
    }
}

/// Caller-side token for a request's eventual response.
#[derive(Debug)]
pub struct CompletionHandle {
    id: u64,
    server_name: String,
    receiver: oneshot::Receiver<Result<JsonRpcResponse, McpError>>,
    table: Weak<Mutex<Table>>,
}

impl CompletionHandle {
    /// The correlation id this handle waits on.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the response, or for the session to close.
    pub async fn wait(mut self) -> Result<JsonRpcResponse, McpError> {
        match (&mut self.receiver).await {
            Ok(outcome) => outcome,
            // Sender dropped without delivery: the multiplexer went away.
            Err(_) => Err(McpError::Closed {
                server: self.server_name.clone(),
                reason: "request table dropped".into(),
            }),
        }
    }
}

impl Drop for CompletionHandle {
    fn drop(&mut self) {
        // Already gone after a delivery; ids are never reused.
        if let Some(table) = self.table.upgrade() {
            lock_table(&table).pending.remove(&self.id);
        }
    }
}

// ─── RequestMultiplexer ──────────────────────────────────────────────────────

#[derive(Debug)]
struct Table {
    next_id: u64,
    pending: HashMap<u64, PendingRequest>,
    closed: bool,
}

/// Owns the table of outstanding requests for one server session.
#[derive(Debug)]
pub struct RequestMultiplexer {
    server_name: String,
    table: Arc<Mutex<Table>>,
}

fn lock_table(table: &Mutex<Table>) -> MutexGuard<'_, Table> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RequestMultiplexer {
    pub fn new(server_name: &str) -> Self {
        Self {
            server_name: server_name.to_string(),
            table: Arc::new(Mutex::new(Table {
                next_id: 1,
                pending: HashMap::new(),
                closed: false,
            })),
        }
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        lock_table(&self.table)
    }

    /// Allocate a fresh id and register a completion slot for it.
    ///
    /// Fails with `Closed` once `cancel_all` has run.
    pub fn allocate(&self, method: &str) -> Result<CompletionHandle, McpError> {
        let mut table = self.table();
        if table.closed {
            return Err(McpError::Closed {
                server: self.server_name.clone(),
                reason: "session is shutting down".into(),
            });
        }

        let id = table.next_id;
        table.next_id += 1;

        let (tx, rx) = oneshot::channel();
        table.pending.insert(
            id,
            PendingRequest {
                id,
                method: method.to_string(),
                issued_at: Instant::now(),
                completion: tx,
            },
        );

        Ok(CompletionHandle {
            id,
            server_name: self.server_name.clone(),
            receiver: rx,
            table: Arc::downgrade(&self.table),
        })
    }

    /// Deliver a response to the request with the same id.
    ///
    /// Returns the request's round-trip time, or `UnmatchedResponse` when no
    /// request with that id is outstanding.
    pub fn resolve(&self, response: JsonRpcResponse) -> Result<Duration, ProtocolAnomaly> {
        let id = response.id;
        let entry = self.table().pending.remove(&id);

        let Some(entry) = entry else {
            return Err(ProtocolAnomaly::UnmatchedResponse { id });
        };

        let elapsed = entry.issued_at.elapsed();
        let method = entry.method.clone();
        if !entry.deliver(Ok(response)) {
            tracing::debug!(
                server = %self.server_name,
                id,
                method = %method,
                "caller stopped waiting before the response arrived"
            );
        }
        Ok(elapsed)
    }

    /// Fail every outstanding request with `Closed` and refuse new ones.
    ///
    /// Returns how many requests were cancelled.
    pub fn cancel_all(&self, reason: &str) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut table = self.table();
            table.closed = true;
            table.pending.drain().map(|(_, entry)| entry).collect()
        };

        let count = drained.len();
        for entry in drained {
            entry.deliver(Err(McpError::Closed {
                server: self.server_name.clone(),
                reason: reason.to_string(),
            }));
        }

        if count > 0 {
            tracing::info!(
                server = %self.server_name,
                cancelled = count,
                reason,
                "cancelled outstanding requests"
            );
        }
        count
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.table().pending.len()
    }

    /// Whether `cancel_all` has run.
    pub fn is_closed(&self) -> bool {
        self.table().closed
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

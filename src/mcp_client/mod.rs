//! MCP Client — JSON-RPC over stdio for a single MCP server.
//!
//! This module handles:
//! - Spawning and terminating the server child process
//! - Multiplexing concurrent requests over one stdin/stdout pair
//! - Routing server output to waiting callers, notifications and anomalies
//! - Heartbeat and status reporting while a session is live
//!
//! `McpClient` is the entry point; the other modules are its parts.

pub mod background;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod lifecycle;
pub mod multiplexer;
pub mod registry;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use background::{StatusReport, StatusSink, TracingStatusSink};
pub use client::McpClient;
pub use config::ClientConfig;
pub use dispatcher::ServerEvent;
pub use errors::{McpError, ProtocolAnomaly};
pub use registry::ToolCatalog;
pub use types::{JsonRpcResponse, ServerConfig, ToolDescriptor};

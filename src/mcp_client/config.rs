//! Client configuration loading and validation.
//!
//! A config file names one server and the timing of the session around it.
//! JSON by default, YAML when the file ends in `.yaml`/`.yml`. String values
//! may reference environment variables as `${VAR}` or `${VAR:-default}`.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use super::errors::McpError;
use super::types::ServerConfig;

// ─── Defaults ────────────────────────────────────────────────────────────────

fn default_name() -> String {
    "server".to_string()
}
fn default_heartbeat_interval_ms() -> u64 {
    5_000
}
fn default_status_interval_ms() -> u64 {
    10_000
}
fn default_init_timeout_ms() -> Option<u64> {
    Some(30_000)
}
fn default_event_capacity() -> usize {
    64
}

// ─── ClientConfig ────────────────────────────────────────────────────────────

/// Everything needed to run one server session.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Server name used in logs, errors and status reports.
    #[serde(default = "default_name")]
    pub name: String,
    pub server: ServerConfig,
    /// Period of the `{"type":"ping"}` heartbeat.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Period of the status report.
    #[serde(default = "default_status_interval_ms")]
    pub status_interval_ms: u64,
    /// Bound on the `tools/list` handshake in `start`. `null` waits forever.
    #[serde(default = "default_init_timeout_ms")]
    pub init_timeout_ms: Option<u64>,
    /// Bound on each `tools/call`. Unset (the default) waits until answered
    /// or until the client stops.
    #[serde(default)]
    pub call_timeout_ms: Option<u64>,
    /// Buffered server events per subscriber before the oldest are dropped.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl ClientConfig {
    /// Config with default timings for the given server.
    pub fn new(name: &str, server: ServerConfig) -> Self {
        Self {
            name: name.to_string(),
            server,
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            status_interval_ms: default_status_interval_ms(),
            init_timeout_ms: default_init_timeout_ms(),
            call_timeout_ms: None,
            event_capacity: default_event_capacity(),
        }
    }

    /// Load, interpolate and validate a config file.
    pub fn load(path: &Path) -> Result<Self, McpError> {
        let raw = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;

        let interpolated = interpolate_env_vars(&raw);

        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        let config: ClientConfig = if is_yaml {
            serde_yaml::from_str(&interpolated).map_err(|e| McpError::ConfigError {
                reason: format!("failed to parse {}: {e}", path.display()),
            })?
        } else {
            serde_json::from_str(&interpolated).map_err(|e| McpError::ConfigError {
                reason: format!("failed to parse {}: {e}", path.display()),
            })?
        };

        config.validate()?;

        tracing::info!(
            path = %path.display(),
            server = %config.name,
            command = %config.server.display_command(),
            "loaded client config"
        );
        Ok(config)
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), McpError> {
        let invalid = |reason: &str| {
            Err(McpError::ConfigError {
                reason: format!("server '{}': {reason}", self.name),
            })
        };

        if self.server.command.trim().is_empty() {
            return invalid("command is empty");
        }
        if self.heartbeat_interval_ms == 0 {
            return invalid("heartbeat_interval_ms must be positive");
        }
        if self.status_interval_ms == 0 {
            return invalid("status_interval_ms must be positive");
        }
        if self.init_timeout_ms == Some(0) || self.call_timeout_ms == Some(0) {
            return invalid("timeouts must be positive when set");
        }
        if self.event_capacity == 0 {
            return invalid("event_capacity must be positive");
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }

    pub fn init_timeout(&self) -> Option<Duration> {
        self.init_timeout_ms.map(Duration::from_millis)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    if let Some(idx) = expr.find(":-") {
        let var_name = &expr[..idx];
        let default = &expr[idx + 2..];
        std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
    } else {
        std::env::var(expr).unwrap_or_default()
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

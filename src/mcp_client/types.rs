//! Shared types for the MCP client.
//!
//! JSON-RPC 2.0 message types, the line classifier used by the dispatcher, and
//! MCP protocol structures.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::ProtocolAnomaly;

/// Longest excerpt of a bad line kept in a `ProtocolAnomaly`.
const ANOMALY_EXCERPT_CHARS: usize = 200;

fn jsonrpc_version() -> String {
    "2.0".to_string()
}

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
///
/// `jsonrpc` is optional on the wire; some servers omit it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

/// JSON-RPC 2.0 notification (no id, no response expected).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 error object, when the server sends one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Non-standard liveness line: `{"type":"ping"}`.
#[derive(Debug, Clone, Serialize)]
pub struct Ping {
    #[serde(rename = "type")]
    kind: &'static str,
}

impl Default for Ping {
    fn default() -> Self {
        Self { kind: "ping" }
    }
}

// ─── Message Classification ─────────────────────────────────────────────────

/// One decoded line from the server's stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Server-initiated request (has both `method` and `id`).
    Request {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    /// Answer to one of our requests.
    Response(JsonRpcResponse),
    /// Server push event.
    Notification(JsonRpcNotification),
}

impl Message {
    /// Classify one line of server output by shape.
    ///
    /// - `method` + non-null `id` → `Request`
    /// - `method`, no `id` → `Notification`
    /// - integer `id` + `result` or `error` → `Response`
    /// - anything else → `ProtocolAnomaly`
    pub fn decode(line: &str) -> Result<Self, ProtocolAnomaly> {
        let value: Value = serde_json::from_str(line).map_err(|e| ProtocolAnomaly::Parse {
            line: excerpt(line),
            reason: e.to_string(),
        })?;

        let unrecognized = || ProtocolAnomaly::UnrecognizedShape {
            line: excerpt(line),
        };

        let Some(obj) = value.as_object() else {
            return Err(unrecognized());
        };

        let id = obj.get("id").filter(|v| !v.is_null());
        let method = obj.get("method").and_then(|m| m.as_str());
        let params = obj.get("params").cloned();

        match (method, id) {
            (Some(method), Some(id)) => Ok(Message::Request {
                id: id.clone(),
                method: method.to_string(),
                params,
            }),
            (Some(method), None) => Ok(Message::Notification(JsonRpcNotification {
                jsonrpc: jsonrpc_version(),
                method: method.to_string(),
                params,
            })),
            (None, Some(id)) if obj.contains_key("result") || obj.contains_key("error") => {
                let id = id.as_u64().ok_or_else(unrecognized)?;
                Ok(Message::Response(JsonRpcResponse {
                    jsonrpc: jsonrpc_version(),
                    id,
                    result: obj.get("result").cloned(),
                    error: obj.get("error").filter(|e| !e.is_null()).cloned(),
                }))
            }
            _ => Err(unrecognized()),
        }
    }
}

/// Clip a line for inclusion in logs and anomaly events.
pub(crate) fn excerpt(line: &str) -> String {
    if line.chars().count() <= ANOMALY_EXCERPT_CHARS {
        return line.to_string();
    }
    let mut clipped: String = line.chars().take(ANOMALY_EXCERPT_CHARS).collect();
    clipped.push_str("...");
    clipped
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// A tool advertised by the server in its `tools/list` result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "inputSchema", alias = "input_schema")]
    pub input_schema: Value,
}

/// Payload of a `tools/list` result.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolListResult {
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
}

/// How to launch the server process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for the child.
    #[serde(default)]
    pub cwd: Option<String>,
    /// Optional Python virtual environment path. When set, `command` is resolved
    /// to `{venv}/bin/{command}` and `VIRTUAL_ENV` + `PATH` are injected.
    #[serde(default)]
    pub venv: Option<String>,
}

impl ServerConfig {
    /// Launch an arbitrary executable with arguments.
    pub fn new(command: &str, args: &[&str]) -> Self {
        Self {
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: HashMap::new(),
            cwd: None,
            venv: None,
        }
    }

    /// Launch a Python module as `python3 -m <module>`.
    pub fn python_module(module: &str) -> Self {
        Self::new(default_python_command(), &["-m", module])
    }

    /// Command line for log output.
    pub fn display_command(&self) -> String {
        let mut parts = vec![self.command.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// Platform-correct Python command.
///
/// macOS 12.3+ removed the `python` symlink; only `python3` exists.
/// Windows installs Python as `python.exe` via the official installer.
pub fn default_python_command() -> &'static str {
    if cfg!(target_os = "windows") {
        "python"
    } else {
        "python3"
    }
}

// ─── Standard MCP Error Codes ────────────────────────────────────────────────

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_rpc_request_serialization() {
        let req = JsonRpcRequest::new(1, "tools/list", None);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"id\":1"));
        assert!(json.contains("\"method\":\"tools/list\""));
        // params should be omitted when None
        assert!(!json.contains("params"));
    }

    #[test]
    fn test_json_rpc_request_with_params() {
        let params = serde_json::json!({"name": "get_weather", "arguments": {"city": "Beijing"}});
        let req = JsonRpcRequest::new(42, "tools/call", Some(params));
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"id\":42"));
        assert!(json.contains("tools/call"));
        assert!(json.contains("Beijing"));
    }

    #[test]
    fn test_ping_serialization() {
        let json = serde_json::to_string(&Ping::default()).unwrap();
        assert_eq!(json, r#"{"type":"ping"}"#);
    }

    #[test]
    fn test_decode_response_without_jsonrpc_field() {
        let line = r#"{"id":1,"result":{"tools":[{"name":"get_weather","description":"d"}]}}"#;
        match Message::decode(line).unwrap() {
            Message::Response(resp) => {
                assert_eq!(resp.id, 1);
                assert!(resp.error.is_none());
                let tools: ToolListResult =
                    serde_json::from_value(resp.result.unwrap()).unwrap();
                assert_eq!(tools.tools.len(), 1);
                assert_eq!(tools.tools[0].name, "get_weather");
                assert_eq!(tools.tools[0].input_schema, Value::Null);
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_error_response() {
        let line = r#"{"jsonrpc":"2.0","id":2,"result":null,"error":{"code":-32601,"message":"Method not found"}}"#;
        match Message::decode(line).unwrap() {
            Message::Response(resp) => {
                let err: JsonRpcError = serde_json::from_value(resp.error.unwrap()).unwrap();
                assert_eq!(err.code, error_codes::METHOD_NOT_FOUND);
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_null_error_is_success() {
        let line = r#"{"id":3,"result":{"ok":true},"error":null}"#;
        match Message::decode(line).unwrap() {
            Message::Response(resp) => assert!(resp.error.is_none()),
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_notification() {
        let line = r#"{"jsonrpc":"2.0","method":"notifications/progress","params":{"pct":50}}"#;
        match Message::decode(line).unwrap() {
            Message::Notification(n) => {
                assert_eq!(n.method, "notifications/progress");
                assert_eq!(n.params.unwrap()["pct"], 50);
            }
            other => panic!("expected notification, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_server_request() {
        let line = r#"{"jsonrpc":"2.0","id":"srv-1","method":"sampling/createMessage"}"#;
        assert!(matches!(
            Message::decode(line).unwrap(),
            Message::Request { ref method, .. } if method == "sampling/createMessage"
        ));
    }

    #[test]
    fn test_decode_not_json() {
        let err = Message::decode("not json").unwrap_err();
        assert!(matches!(err, ProtocolAnomaly::Parse { ref line, .. } if line == "not json"));
    }

    #[test]
    fn test_decode_unrecognized_shapes() {
        for line in [r#"{"type":"pong"}"#, "[1,2,3]", r#"{"id":"abc","result":1}"#, "42"] {
            assert!(
                matches!(
                    Message::decode(line),
                    Err(ProtocolAnomaly::UnrecognizedShape { .. })
                ),
                "line {line} should be unrecognized"
            );
        }
    }

    #[test]
    fn test_anomaly_excerpt_is_clipped() {
        let long = "x".repeat(1000);
        match Message::decode(&long).unwrap_err() {
            ProtocolAnomaly::Parse { line, .. } => {
                assert_eq!(line.chars().count(), ANOMALY_EXCERPT_CHARS + 3);
            }
            other => panic!("expected parse anomaly, got {other:?}"),
        }
    }

    #[test]
    fn test_tool_descriptor_accepts_both_schema_spellings() {
        let camel: ToolDescriptor =
            serde_json::from_str(r#"{"name":"a","inputSchema":{"type":"object"}}"#).unwrap();
        let snake: ToolDescriptor =
            serde_json::from_str(r#"{"name":"a","input_schema":{"type":"object"}}"#).unwrap();
        assert_eq!(camel, snake);
        assert_eq!(camel.description, "");
    }

    #[test]
    fn test_python_module_config() {
        let cfg = ServerConfig::python_module("mcp_server_weather");
        assert_eq!(cfg.command, default_python_command());
        assert_eq!(cfg.args, vec!["-m", "mcp_server_weather"]);
        assert_eq!(
            cfg.display_command(),
            format!("{} -m mcp_server_weather", default_python_command())
        );
    }
}

//! Scripted MCP server used by the integration tests.
//!
//! Speaks line-delimited JSON-RPC on stdin/stdout. Behavior per tool:
//! - `get_weather`: answers with the city (in reversed pairs when
//!   `FAKE_MCP_REORDER=1`)
//! - `silent`: never answered
//! - `fail`: error object
//! - `echo`: arguments back
//! - `noisy`: garbage, a stray response and a notification before the answer
//! - `ping_count`: heartbeat pings seen so far
//! - `delayed`: arguments back after `arguments.ms` milliseconds
//!
//! `FAKE_MCP_LIST_ERROR=1` makes `tools/list` fail. `FAKE_MCP_LIST_ANSWERS=n`
//! answers only the first `n` `tools/list` requests.

use std::io::{BufRead, Write};
use std::time::Duration;

use serde_json::{json, Value};

fn send(message: &Value) {
    send_raw(&message.to_string());
}

/// Each line goes out under its own stdout lock.
fn send_raw(line: &str) {
    let mut out = std::io::stdout().lock();
    let _ = writeln!(out, "{line}");
    let _ = out.flush();
}

fn result(id: &Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

fn error(id: &Value, code: i64, message: &str) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
}

fn weather(id: &Value, arguments: &Value) -> Value {
    let city = arguments["city"].as_str().unwrap_or("unknown");
    result(
        id,
        json!({
            "city": city,
            "content": [{"type": "text", "text": format!("Sunny in {city}")}],
        }),
    )
}

fn flag(name: &str) -> bool {
    std::env::var(name).is_ok_and(|v| v == "1")
}

fn main() {
    let reorder = flag("FAKE_MCP_REORDER");
    let list_error = flag("FAKE_MCP_LIST_ERROR");
    let mut list_answers: u64 = std::env::var("FAKE_MCP_LIST_ANSWERS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(u64::MAX);

    eprintln!("fake-mcp-server starting (pid {})", std::process::id());

    let stdin = std::io::stdin();
    let mut pings: u64 = 0;
    let mut held_weather: Option<Value> = None;

    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            eprintln!("unparseable input: {line}");
            continue;
        };

        if message["type"] == "ping" {
            pings += 1;
            continue;
        }

        // Notifications need no answer.
        let Some(id) = message.get("id").cloned() else {
            continue;
        };

        match message["method"].as_str().unwrap_or_default() {
            "tools/list" if list_answers == 0 => {}
            "tools/list" if list_error => {
                send(&error(&id, -32603, "tool discovery failed"));
            }
            "tools/list" => {
                list_answers -= 1;
                send(&result(
                    &id,
                    json!({"tools": [{
                        "name": "get_weather",
                        "description": "Current weather for a city",
                        "inputSchema": {
                            "type": "object",
                            "properties": {"city": {"type": "string"}},
                            "required": ["city"],
                        },
                    }]}),
                ));
            }
            "tools/call" => {
                let params = &message["params"];
                let arguments = &params["arguments"];
                match params["name"].as_str().unwrap_or_default() {
                    "get_weather" if reorder => match held_weather.take() {
                        None => held_weather = Some(message.clone()),
                        Some(first) => {
                            send(&weather(&id, arguments));
                            send(&weather(&first["id"], &first["params"]["arguments"]));
                        }
                    },
                    "get_weather" => send(&weather(&id, arguments)),
                    "silent" => {}
                    "fail" => send(&error(&id, -32000, "tool exploded")),
                    "echo" => send(&result(&id, arguments.clone())),
                    "noisy" => {
                        send_raw("not json");
                        send(&result(&json!(9999), json!("stray")));
                        send(&json!({
                            "jsonrpc": "2.0",
                            "method": "notifications/message",
                            "params": {"level": "info", "data": "noisy"},
                        }));
                        send(&result(&id, json!({"ok": true})));
                    }
                    "ping_count" => send(&result(&id, json!({"pings": pings}))),
                    "delayed" => {
                        let delay = Duration::from_millis(arguments["ms"].as_u64().unwrap_or(0));
                        let answer = result(&id, arguments.clone());
                        std::thread::spawn(move || {
                            std::thread::sleep(delay);
                            send(&answer);
                        });
                    }
                    other => send(&error(&id, -32602, &format!("unknown tool: {other}"))),
                }
            }
            other => send(&error(&id, -32601, &format!("method not found: {other}"))),
        }
    }
}

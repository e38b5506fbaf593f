//! Scriptable stdio capability server for the integration suites.
//!
//! Speaks line-delimited JSON-RPC on stdin/stdout. Calls are answered from
//! worker threads through a single writer channel, so slow calls finish
//! after fast ones and responses interleave out of request order.

use serde_json::{Value, json};
use std::io::{BufRead, Write};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// Request id for the server-initiated ping in `--interject` mode.
const PING_ID: u64 = 77;

fn main() {
    let flags: Vec<String> = std::env::args().skip(1).collect();
    let mute = flags.iter().any(|f| f == "--mute-handshake");
    let garbage_on_call = flags.iter().any(|f| f == "--garbage-on-call");
    let catalogue_v2 = flags.iter().any(|f| f == "--catalogue-v2");
    let interject = flags.iter().any(|f| f == "--interject");

    let (tx, rx) = mpsc::channel::<String>();
    let writer = thread::spawn(move || {
        let mut out = std::io::stdout().lock();
        for line in rx {
            if writeln!(out, "{line}").is_err() {
                break;
            }
            let _ = out.flush();
        }
    });

    let stdin = std::io::stdin();
    let mut stashed_call: Option<(Value, Value)> = None;
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        if mute {
            continue;
        }
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        let method = message
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        // A frame without a method is the client answering a request this
        // server initiated.
        if method.is_empty() {
            if let Some((call_id, params)) = stashed_call.take() {
                release_stashed(&tx, &message, call_id, &params);
            }
            continue;
        }
        let Some(id) = message.get("id").cloned() else {
            continue;
        };
        match method.as_str() {
            "initialize" => {
                send(
                    &tx,
                    reply(
                        id,
                        json!({
                            "protocolVersion": "2025-06-18",
                            "serverInfo": {
                                "name": "gangway-stub",
                                "version": env!("CARGO_PKG_VERSION"),
                            },
                            "capabilities": {"tools": {}}
                        }),
                    ),
                );
            }
            "tools/list" => {
                send(&tx, reply(id, json!({"tools": catalogue(catalogue_v2)})));
            }
            "tools/call" => {
                if garbage_on_call {
                    send(&tx, "### stub crash dump: not a frame ###".to_string());
                    continue;
                }
                let params = message.get("params").cloned().unwrap_or_else(|| json!({}));
                if interject {
                    // Talk back mid-call: a notification plus a request of
                    // our own. The call is answered only once the client
                    // replies to the ping.
                    send(
                        &tx,
                        json!({
                            "jsonrpc": "2.0",
                            "method": "notifications/progress",
                            "params": {"progress": 1}
                        })
                        .to_string(),
                    );
                    send(
                        &tx,
                        json!({
                            "jsonrpc": "2.0",
                            "id": PING_ID,
                            "method": "server/ping",
                            "params": {}
                        })
                        .to_string(),
                    );
                    stashed_call = Some((id, params));
                    continue;
                }
                let tx = tx.clone();
                thread::spawn(move || handle_call(&tx, id, &params));
            }
            _ => {
                send(&tx, error_reply(id, -32601, "method not found"));
            }
        }
    }

    drop(tx);
    let _ = writer.join();
}

/// Answer a stashed call once the client's reply to the ping arrives.
/// Anything other than a method-not-found error for the ping id becomes a
/// visible tool failure.
fn release_stashed(tx: &mpsc::Sender<String>, frame: &Value, call_id: Value, params: &Value) {
    let ping_refused = frame.get("id").and_then(Value::as_u64) == Some(PING_ID)
        && frame
            .get("error")
            .and_then(|err| err.get("code"))
            .and_then(Value::as_i64)
            == Some(-32601);
    if ping_refused {
        handle_call(tx, call_id, params);
    } else {
        send(
            tx,
            reply(
                call_id,
                json!({
                    "content": [{"type": "text", "text": "expected a method-not-found reply to the ping"}],
                    "isError": true
                }),
            ),
        );
    }
}

fn handle_call(tx: &mpsc::Sender<String>, id: Value, params: &Value) {
    let tool = params.get("name").and_then(Value::as_str).unwrap_or_default();
    let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
    match tool {
        "echo" => {
            let text = args.get("text").and_then(Value::as_str).unwrap_or_default();
            send(tx, reply(id, text_result(text)));
        }
        "slow_echo" => {
            let delay = args.get("delay_ms").and_then(Value::as_u64).unwrap_or(250);
            thread::sleep(Duration::from_millis(delay));
            let text = args.get("text").and_then(Value::as_str).unwrap_or_default();
            send(tx, reply(id, text_result(text)));
        }
        "fail" => {
            let reason = args
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("tool failed");
            if args.get("rpc").and_then(Value::as_bool).unwrap_or(false) {
                send(
                    tx,
                    json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": {
                            "code": -32000,
                            "message": reason,
                            "data": {"retry_after_secs": 30}
                        }
                    })
                    .to_string(),
                );
                return;
            }
            send(
                tx,
                reply(
                    id,
                    json!({
                        "content": [{"type": "text", "text": reason}],
                        "isError": true
                    }),
                ),
            );
        }
        "big_output" => {
            let bytes = args
                .get("bytes")
                .and_then(Value::as_u64)
                .unwrap_or(2_000_000) as usize;
            send(tx, reply(id, text_result(&"x".repeat(bytes))));
        }
        "exit_now" => {
            let code = args.get("code").and_then(Value::as_i64).unwrap_or(1) as i32;
            std::process::exit(code);
        }
        _ => send(tx, error_reply(id, -32602, "unknown tool")),
    }
}

fn catalogue(extended: bool) -> Vec<Value> {
    let mut tools = vec![
        tool(
            "echo",
            "Echo the given text back verbatim.",
            json!({
                "type": "object",
                "properties": {"text": {"type": "string", "description": "Text to echo"}},
                "required": ["text"]
            }),
        ),
        tool(
            "slow_echo",
            "Echo text after a configurable delay.",
            json!({
                "type": "object",
                "properties": {
                    "text": {"type": "string", "description": "Text to echo"},
                    "delay_ms": {"type": "integer", "description": "Delay before responding"}
                },
                "required": ["text"]
            }),
        ),
        tool(
            "fail",
            "Fail the call, at the tool level or the protocol level.",
            json!({
                "type": "object",
                "properties": {
                    "reason": {"type": "string", "description": "Failure message"},
                    "rpc": {"type": "boolean", "description": "Refuse with a JSON-RPC error instead"}
                }
            }),
        ),
        tool(
            "big_output",
            "Produce a large text payload.",
            json!({
                "type": "object",
                "properties": {"bytes": {"type": "integer", "description": "Payload size in characters"}}
            }),
        ),
        tool(
            "exit_now",
            "Terminate the server process without responding.",
            json!({
                "type": "object",
                "properties": {"code": {"type": "integer", "description": "Exit code"}}
            }),
        ),
    ];
    if extended {
        tools.push(tool(
            "reverse",
            "Echo the given text reversed.",
            json!({
                "type": "object",
                "properties": {"text": {"type": "string", "description": "Text to reverse"}},
                "required": ["text"]
            }),
        ));
    }
    tools
}

fn tool(name: &str, description: &str, schema: Value) -> Value {
    json!({"name": name, "description": description, "inputSchema": schema})
}

fn text_result(text: &str) -> Value {
    json!({"content": [{"type": "text", "text": text}]})
}

fn reply(id: Value, result: Value) -> String {
    json!({"jsonrpc": "2.0", "id": id, "result": result}).to_string()
}

fn error_reply(id: Value, code: i64, message: &str) -> String {
    json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}}).to_string()
}

fn send(tx: &mpsc::Sender<String>, line: String) {
    let _ = tx.send(line);
}

// Invocation executor tests - synopsis bounding, durable records and pointers
//
// Full tool output always lands on disk; the caller only gets a bounded
// synopsis plus a pointer. Resolution failures reject the call before any
// process spawns and leave no record behind.

use gangway::{
    AppConfig, BridgeSettings, InvocationStatus, InvokeError, ServerConfig, ToolBridge,
};
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tempfile::tempdir;
use uuid::Uuid;

fn stub_server(name: &str) -> ServerConfig {
    ServerConfig {
        name: name.to_string(),
        command: PathBuf::from(env!("CARGO_BIN_EXE_gangway-stub")),
        args: Vec::new(),
        env: HashMap::new(),
    }
}

fn bridge_config(state_dir: &Path, servers: Vec<ServerConfig>) -> AppConfig {
    AppConfig {
        servers,
        bridge: BridgeSettings {
            state_dir: state_dir.to_path_buf(),
            synopsis_chars: 500,
            call_timeout_secs: 2,
            startup_timeout_secs: 2,
        },
    }
}

#[tokio::test]
async fn large_output_is_bounded_but_fully_retrievable() {
    let dir = tempdir().expect("tempdir");
    let bridge = ToolBridge::new(&bridge_config(dir.path(), vec![stub_server("files")]));
    bridge.refresh("files").await.expect("discovery");

    let outcome = bridge
        .invoke("files/big_output", json!({"bytes": 2_000_000}), None)
        .await
        .expect("invoke");
    assert_eq!(outcome.status, InvocationStatus::Ok);
    assert_eq!(outcome.synopsis.chars().count(), 500);
    assert!(outcome.synopsis.ends_with("… [truncated]"));

    let record = bridge
        .fetch_full(&outcome.pointer.to_string())
        .expect("stored record");
    assert_eq!(record.id, outcome.pointer);
    assert_eq!(record.status, InvocationStatus::Ok);
    let payload = record.result.expect("full payload");
    let text = payload["content"][0]["text"].as_str().expect("text part");
    assert_eq!(text.chars().count(), 2_000_000);

    bridge.shutdown().await;
}

#[tokio::test]
async fn tiny_synopsis_caps_are_still_honoured() {
    let dir = tempdir().expect("tempdir");
    let mut config = bridge_config(dir.path(), vec![stub_server("files")]);
    config.bridge.synopsis_chars = 9;
    let bridge = ToolBridge::new(&config);
    bridge.refresh("files").await.expect("discovery");

    // A cap below the truncation marker length gets a plain hard cut; the
    // full payload is still on disk.
    let outcome = bridge
        .invoke(
            "files/echo",
            json!({"text": "well beyond nine characters"}),
            None,
        )
        .await
        .expect("invoke");
    assert_eq!(outcome.status, InvocationStatus::Ok);
    assert_eq!(outcome.synopsis, "well beyo");

    let record = bridge
        .fetch_full(&outcome.pointer.to_string())
        .expect("stored record");
    let payload = record.result.expect("full payload");
    assert_eq!(
        payload["content"][0]["text"].as_str().expect("text part"),
        "well beyond nine characters"
    );

    bridge.shutdown().await;
}

#[tokio::test]
async fn tool_failure_is_recorded_as_tool_error() {
    let dir = tempdir().expect("tempdir");
    let bridge = ToolBridge::new(&bridge_config(dir.path(), vec![stub_server("files")]));
    bridge.refresh("files").await.expect("discovery");

    let outcome = bridge
        .invoke("files/fail", json!({"reason": "disk on fire"}), None)
        .await
        .expect("invoke");
    assert_eq!(outcome.status, InvocationStatus::ToolError);
    assert_eq!(outcome.synopsis, "disk on fire");

    let record = bridge
        .fetch_full(&outcome.pointer.to_string())
        .expect("stored record");
    assert_eq!(record.status, InvocationStatus::ToolError);
    assert_eq!(record.synopsis, "disk on fire");
    assert_eq!(record.result.expect("full payload")["isError"], true);

    bridge.shutdown().await;
}

#[tokio::test]
async fn rpc_refusal_is_recorded_with_the_servers_detail() {
    let dir = tempdir().expect("tempdir");
    let bridge = ToolBridge::new(&bridge_config(dir.path(), vec![stub_server("files")]));
    bridge.refresh("files").await.expect("discovery");

    // The server answers with a JSON-RPC error instead of a result; the
    // transport keeps working and the error's data member survives into
    // the record.
    let outcome = bridge
        .invoke(
            "files/fail",
            json!({"rpc": true, "reason": "quota exhausted"}),
            None,
        )
        .await
        .expect("invoke");
    assert_eq!(outcome.status, InvocationStatus::ToolError);
    assert!(outcome.synopsis.starts_with("[tool-error]"));
    assert!(outcome.synopsis.contains("quota exhausted"));

    let record = bridge
        .fetch_full(&outcome.pointer.to_string())
        .expect("stored record");
    assert_eq!(record.status, InvocationStatus::ToolError);
    assert!(record.result.is_none());
    let diagnostic = record.error.expect("diagnostic");
    assert!(diagnostic.contains("quota exhausted"));
    assert!(diagnostic.contains("retry_after_secs"));

    // The conduit is still healthy after the refusal.
    let after = bridge
        .invoke("files/echo", json!({"text": "fine"}), None)
        .await
        .expect("invoke");
    assert_eq!(after.status, InvocationStatus::Ok);

    bridge.shutdown().await;
}

#[tokio::test]
async fn timeout_is_recorded_with_a_diagnostic() {
    let dir = tempdir().expect("tempdir");
    let bridge = ToolBridge::new(&bridge_config(dir.path(), vec![stub_server("files")]));
    bridge.refresh("files").await.expect("discovery");

    let outcome = bridge
        .invoke(
            "files/slow_echo",
            json!({"text": "late", "delay_ms": 1200}),
            Some(std::time::Duration::from_millis(200)),
        )
        .await
        .expect("timeout is recorded, not raised");
    assert_eq!(outcome.status, InvocationStatus::Timeout);
    assert!(outcome.duration_ms >= 200);
    assert!(outcome.synopsis.starts_with("[timeout]"));

    let record = bridge
        .fetch_full(&outcome.pointer.to_string())
        .expect("stored record");
    assert_eq!(record.status, InvocationStatus::Timeout);
    assert!(record.result.is_none());
    assert!(record.error.expect("diagnostic").contains("timed out"));

    bridge.shutdown().await;
}

#[tokio::test]
async fn resolution_failures_never_spawn_or_record() {
    let dir = tempdir().expect("tempdir");
    let ghost = ServerConfig {
        name: "ghost".to_string(),
        command: PathBuf::from("/nonexistent/capability-server"),
        args: Vec::new(),
        env: HashMap::new(),
    };
    let bridge = ToolBridge::new(&bridge_config(dir.path(), vec![stub_server("files"), ghost]));
    bridge.refresh("files").await.expect("discovery");

    let err = bridge
        .invoke("nowhere/echo", json!({}), None)
        .await
        .expect_err("unconfigured server");
    assert!(matches!(err, InvokeError::UnknownServer { .. }));

    // Configured but never discovered; rejected before its broken command
    // could ever be spawned.
    let at = Instant::now();
    let err = bridge
        .invoke("ghost/echo", json!({}), None)
        .await
        .expect_err("undiscovered server");
    assert!(matches!(err, InvokeError::Undiscovered { .. }));
    assert!(at.elapsed() < std::time::Duration::from_millis(200));

    let err = bridge
        .invoke("files/missing_tool", json!({}), None)
        .await
        .expect_err("unknown tool");
    assert!(matches!(err, InvokeError::UnknownTool { .. }));

    let err = bridge
        .invoke("justoneword", json!({}), None)
        .await
        .expect_err("bad address");
    assert!(matches!(err, InvokeError::BadAddress { .. }));

    assert!(
        !dir.path().join("results").exists(),
        "resolution failures must not write records"
    );

    bridge.shutdown().await;
}

#[tokio::test]
async fn records_accumulate_under_unique_pointers() {
    let dir = tempdir().expect("tempdir");
    let bridge = ToolBridge::new(&bridge_config(dir.path(), vec![stub_server("files")]));
    bridge.refresh("files").await.expect("discovery");

    let first = bridge
        .invoke("files/echo", json!({"text": "one"}), None)
        .await
        .expect("invoke");
    let second = bridge
        .invoke("files/echo", json!({"text": "two"}), None)
        .await
        .expect("invoke");
    assert_ne!(first.pointer, second.pointer);

    let first = bridge
        .fetch_full(&first.pointer.to_string())
        .expect("first record");
    let second = bridge
        .fetch_full(&second.pointer.to_string())
        .expect("second record");
    assert_eq!(first.sequence, 1);
    assert_eq!(second.sequence, 2);
    assert_eq!(first.server, "files");
    assert_eq!(first.tool, "echo");
    assert_eq!(first.arguments, json!({"text": "one"}));
    assert_eq!(second.synopsis, "two");

    let stored = std::fs::read_dir(dir.path().join("results"))
        .expect("results dir")
        .count();
    assert_eq!(stored, 2);

    bridge.shutdown().await;
}

#[tokio::test]
async fn pointers_are_validated_before_hitting_the_store() {
    let dir = tempdir().expect("tempdir");
    let bridge = ToolBridge::new(&bridge_config(dir.path(), vec![stub_server("files")]));

    let err = bridge
        .fetch_full("not-a-uuid")
        .expect_err("malformed pointer");
    assert!(matches!(err, InvokeError::BadPointer { .. }));

    let err = bridge
        .fetch_full("../../etc/passwd")
        .expect_err("path-shaped pointer");
    assert!(matches!(err, InvokeError::BadPointer { .. }));

    let err = bridge
        .fetch_full(&Uuid::new_v4().to_string())
        .expect_err("unknown pointer");
    assert!(matches!(err, InvokeError::RecordNotFound { .. }));

    bridge.shutdown().await;
}

use super::error::ConduitError;
use crate::config::ServerConfig;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use tracing::{debug, info, warn};

const PROTOCOL_VERSION: &str = "2025-06-18";

/// How long to wait for the child after its stdout closes before deciding
/// whether the process died or merely shut its pipe.
const EXIT_GRACE: Duration = Duration::from_millis(200);

/// Lifecycle of a conduit. There is no automatic path out of `Degraded` or
/// `Terminated`; recovery means replacing the conduit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Unstarted,
    Starting,
    Ready,
    Degraded,
    Terminated,
}

#[derive(Debug, Clone, Copy)]
pub struct ConduitSettings {
    pub startup_timeout: Duration,
    pub call_timeout: Duration,
}

/// One line-delimited JSON-RPC session with a spawned capability server.
///
/// The process is spawned lazily on first use. A single reader task owns
/// stdout and resolves in-flight requests through the pending table; all
/// writers share the buffered stdin behind a lock. Cheap to clone.
#[derive(Clone)]
pub struct Conduit {
    inner: Arc<ConduitInner>,
}

struct ConduitInner {
    server: ServerConfig,
    settings: ConduitSettings,
    phase: StdMutex<Phase>,
    start_gate: AsyncMutex<()>,
    state: AsyncMutex<Option<RunningState>>,
    writer: AsyncMutex<Option<BufWriter<ChildStdin>>>,
    pending: AsyncMutex<HashMap<u64, oneshot::Sender<Result<Value, ConduitError>>>>,
    id_counter: AtomicU64,
}

struct RunningState {
    child: Child,
}

enum ReadEnd {
    Eof,
    Violation,
}

impl Conduit {
    pub fn new(server: ServerConfig, settings: ConduitSettings) -> Self {
        Self {
            inner: Arc::new(ConduitInner {
                server,
                settings,
                phase: StdMutex::new(Phase::Unstarted),
                start_gate: AsyncMutex::new(()),
                state: AsyncMutex::new(None),
                writer: AsyncMutex::new(None),
                pending: AsyncMutex::new(HashMap::new()),
                id_counter: AtomicU64::new(1),
            }),
        }
    }

    pub fn server_name(&self) -> &str {
        &self.inner.server.name
    }

    pub fn phase(&self) -> Phase {
        self.inner.phase()
    }

    /// Spawn the server and run the initialize handshake if this conduit has
    /// never started; fail fast once it is degraded or terminated.
    pub async fn ensure_ready(&self) -> Result<(), ConduitError> {
        match self.inner.phase() {
            Phase::Ready => return Ok(()),
            Phase::Degraded => return Err(self.inner.degraded_error()),
            Phase::Terminated => return Err(self.inner.terminated_error()),
            Phase::Unstarted | Phase::Starting => {}
        }

        let _gate = self.inner.start_gate.lock().await;
        match self.inner.phase() {
            Phase::Ready => Ok(()),
            Phase::Degraded => Err(self.inner.degraded_error()),
            Phase::Terminated => Err(self.inner.terminated_error()),
            Phase::Unstarted | Phase::Starting => self.inner.start().await,
        }
    }

    /// Raw `tools/list` round trip; the caller owns catalogue validation.
    pub async fn list_tools(&self) -> Result<Value, ConduitError> {
        self.ensure_ready().await?;
        self.inner
            .request("tools/list", json!({}), self.inner.settings.call_timeout)
            .await
    }

    /// `tools/call` round trip under the per-request deadline.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, ConduitError> {
        self.ensure_ready().await?;
        let params = json!({
            "name": tool,
            "arguments": match arguments {
                Value::Null => Value::Object(Default::default()),
                other => other,
            }
        });
        let deadline = timeout.unwrap_or(self.inner.settings.call_timeout);
        self.inner.request("tools/call", params, deadline).await
    }

    /// Kill the child and fail every pending request. Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.phase() == Phase::Terminated {
            return;
        }
        info!(server = %self.inner.server.name, "shutting down conduit");
        self.inner.terminate().await;
    }
}

impl ConduitInner {
    fn phase(&self) -> Phase {
        *self.phase.lock().expect("phase lock")
    }

    fn set_phase(&self, next: Phase) {
        *self.phase.lock().expect("phase lock") = next;
    }

    /// Announce readiness after the handshake. The reader task can degrade
    /// or terminate the conduit while the handshake future is still
    /// resolving; that verdict stands and readiness is refused.
    fn promote_to_ready(&self) -> Result<(), ConduitError> {
        let mut phase = self.phase.lock().expect("phase lock");
        match *phase {
            Phase::Degraded => Err(self.degraded_error()),
            Phase::Terminated => Err(self.terminated_error()),
            Phase::Unstarted | Phase::Starting | Phase::Ready => {
                *phase = Phase::Ready;
                Ok(())
            }
        }
    }

    fn degraded_error(&self) -> ConduitError {
        ConduitError::Degraded {
            server: self.server.name.clone(),
        }
    }

    fn terminated_error(&self) -> ConduitError {
        ConduitError::Terminated {
            server: self.server.name.clone(),
        }
    }

    fn transport_error(&self, message: impl Into<String>) -> ConduitError {
        ConduitError::Transport {
            server: self.server.name.clone(),
            message: message.into(),
        }
    }

    async fn start(self: &Arc<Self>) -> Result<(), ConduitError> {
        self.set_phase(Phase::Starting);

        let handshake = tokio::time::timeout(self.settings.startup_timeout, async {
            self.spawn_child().await?;
            self.initialize_sequence().await
        })
        .await;

        match handshake {
            Ok(Ok(())) => {
                if let Err(err) = self.promote_to_ready() {
                    warn!(server = %self.server.name, %err, "conduit lost during handshake");
                    return Err(err);
                }
                info!(server = %self.server.name, "capability server ready");
                Ok(())
            }
            Ok(Err(err)) => {
                warn!(server = %self.server.name, %err, "handshake failed");
                self.terminate().await;
                Err(err)
            }
            Err(_elapsed) => {
                warn!(
                    server = %self.server.name,
                    timeout = ?self.settings.startup_timeout,
                    "handshake timed out"
                );
                self.terminate().await;
                Err(ConduitError::Timeout {
                    server: self.server.name.clone(),
                    timeout: self.settings.startup_timeout,
                })
            }
        }
    }

    async fn spawn_child(self: &Arc<Self>) -> Result<(), ConduitError> {
        let mut command = Command::new(&self.server.command);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !self.server.args.is_empty() {
            command.args(&self.server.args);
        }
        for (key, value) in &self.server.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|source| ConduitError::Spawn {
            server: self.server.name.clone(),
            source,
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| self.transport_error("failed to capture server stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.transport_error("failed to capture server stdout"))?;
        let stderr = child.stderr.take();

        {
            let mut writer = self.writer.lock().await;
            *writer = Some(BufWriter::new(stdin));
        }
        {
            let mut state = self.state.lock().await;
            *state = Some(RunningState { child });
        }

        let reader_self = Arc::clone(self);
        tokio::spawn(async move {
            reader_self.reader_loop(stdout).await;
        });
        if let Some(stderr) = stderr {
            tokio::spawn(drain_stderr(self.server.name.clone(), stderr));
        }
        Ok(())
    }

    async fn initialize_sequence(self: &Arc<Self>) -> Result<(), ConduitError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION")
            },
            "capabilities": {}
        });
        self.request("initialize", params, self.settings.startup_timeout)
            .await?;
        self.send_notification("notifications/initialized", json!({}))
            .await?;
        Ok(())
    }

    async fn request(
        self: &Arc<Self>,
        method: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<Value, ConduitError> {
        match self.phase() {
            Phase::Degraded => return Err(self.degraded_error()),
            Phase::Terminated => return Err(self.terminated_error()),
            Phase::Unstarted | Phase::Starting | Phase::Ready => {}
        }

        let id = self.id_counter.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(id, tx);
        }

        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params
        });
        if let Err(err) = self.write_message(&payload).await {
            self.pending.lock().await.remove(&id);
            self.degrade("stdin write failed").await;
            return Err(err);
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(Ok(value))) => {
                let result = value.get("result").cloned().unwrap_or(Value::Null);
                Ok(result)
            }
            Ok(Ok(Err(err))) => Err(err),
            Ok(Err(_closed)) => Err(ConduitError::Cancelled {
                server: self.server.name.clone(),
            }),
            Err(_elapsed) => {
                // Drop the entry so a late response is discarded as unmatched
                // instead of resolving a caller that already gave up.
                self.pending.lock().await.remove(&id);
                debug!(
                    server = %self.server.name,
                    request_id = id,
                    method,
                    "request deadline elapsed"
                );
                Err(ConduitError::Timeout {
                    server: self.server.name.clone(),
                    timeout: deadline,
                })
            }
        }
    }

    async fn reader_loop(self: Arc<Self>, stdout: ChildStdout) {
        let mut lines = BufReader::new(stdout).lines();
        let end = loop {
            match lines.next_line().await {
                Ok(Some(raw)) => {
                    let trimmed = raw.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Value>(trimmed) {
                        Ok(value) => {
                            if let Err(err) = self.route_inbound(value).await {
                                warn!(
                                    server = %self.server.name,
                                    %err,
                                    "failed to process message from capability server"
                                );
                            }
                        }
                        Err(source) => {
                            warn!(
                                server = %self.server.name,
                                line = raw,
                                %source,
                                "non-JSON frame on stdout"
                            );
                            break ReadEnd::Violation;
                        }
                    }
                }
                Ok(None) => break ReadEnd::Eof,
                Err(err) => {
                    warn!(server = %self.server.name, %err, "stdout read failed");
                    break ReadEnd::Eof;
                }
            }
        };

        match end {
            ReadEnd::Violation => self.degrade("malformed frame").await,
            ReadEnd::Eof => self.handle_stream_end().await,
        }
    }

    /// Stdout closed: decide between process death (terminate, fail pending
    /// fast) and a live process that shut its pipe (degrade, pending run out
    /// via their own deadlines).
    async fn handle_stream_end(&self) {
        if self.phase() == Phase::Terminated {
            return;
        }

        let exit_status = {
            let mut state = self.state.lock().await;
            match state.as_mut() {
                Some(running) => {
                    match tokio::time::timeout(EXIT_GRACE, running.child.wait()).await {
                        Ok(Ok(status)) => Some(status),
                        Ok(Err(err)) => {
                            debug!(server = %self.server.name, %err, "wait on child failed");
                            None
                        }
                        Err(_still_running) => None,
                    }
                }
                None => return,
            }
        };

        match exit_status {
            Some(status) => {
                warn!(
                    server = %self.server.name,
                    code = ?status.code(),
                    "capability server exited"
                );
                self.terminate().await;
            }
            None => self.degrade("stdout closed while process alive").await,
        }
    }

    async fn route_inbound(&self, value: Value) -> Result<(), ConduitError> {
        if let Some(id) = value.get("id").cloned() {
            if value.get("method").is_some() {
                self.refuse_server_request(id, value).await
            } else {
                self.handle_response(id, value).await;
                Ok(())
            }
        } else if let Some(method) = value.get("method").and_then(Value::as_str) {
            debug!(
                server = %self.server.name,
                method,
                "ignoring notification from capability server"
            );
            Ok(())
        } else {
            Ok(())
        }
    }

    async fn handle_response(&self, id: Value, value: Value) {
        let key = match response_key(&id) {
            Some(key) => key,
            None => {
                debug!(server = %self.server.name, ?id, "response with unusable id");
                return;
            }
        };

        let responder = {
            let mut pending = self.pending.lock().await;
            pending.remove(&key)
        };

        match responder {
            Some(sender) => {
                let outcome = if value.get("error").is_some() {
                    Err(self.rpc_error(&value))
                } else {
                    Ok(value)
                };
                let _ = sender.send(outcome);
            }
            None => {
                debug!(
                    server = %self.server.name,
                    response_id = key,
                    "dropping response for unknown request"
                );
            }
        }
    }

    fn rpc_error(&self, value: &Value) -> ConduitError {
        let Some(error) = value.get("error").and_then(Value::as_object) else {
            return ConduitError::Rpc {
                server: self.server.name.clone(),
                code: -32000,
                message: "missing error payload".to_string(),
            };
        };
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(-32000);
        let mut message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        // The data member holds the server's machine-readable detail; it
        // travels with the diagnostic into the stored record.
        if let Some(data) = error.get("data").filter(|data| !data.is_null()) {
            message.push_str(&format!("; data: {data}"));
        }
        ConduitError::Rpc {
            server: self.server.name.clone(),
            code,
            message,
        }
    }

    /// The bridge exposes no client-side methods, so every server-initiated
    /// request gets a method-not-found reply instead of a stalled server.
    async fn refuse_server_request(&self, id: Value, value: Value) -> Result<(), ConduitError> {
        let method = value
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default();
        debug!(
            server = %self.server.name,
            method,
            "refusing server-initiated request"
        );
        let mut payload = json!({
            "jsonrpc": "2.0",
            "error": {
                "code": -32601,
                "message": format!("bridge does not implement method '{method}'"),
            }
        });
        if let Value::Object(ref mut map) = payload {
            map.insert("id".to_string(), id);
        }
        self.write_message(&payload).await
    }

    async fn send_notification(&self, method: &str, params: Value) -> Result<(), ConduitError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params
        });
        self.write_message(&payload).await
    }

    async fn write_message(&self, message: &Value) -> Result<(), ConduitError> {
        let encoded =
            serde_json::to_string(message).map_err(|source| ConduitError::InvalidJson {
                server: self.server.name.clone(),
                source,
            })?;

        let mut writer = self.writer.lock().await;
        let stream = writer
            .as_mut()
            .ok_or_else(|| self.transport_error("writer not initialised"))?;
        stream
            .write_all(encoded.as_bytes())
            .await
            .map_err(|source| self.transport_error(source.to_string()))?;
        stream
            .write_all(b"\n")
            .await
            .map_err(|source| self.transport_error(source.to_string()))?;
        stream
            .flush()
            .await
            .map_err(|source| self.transport_error(source.to_string()))?;
        Ok(())
    }

    async fn degrade(&self, reason: &str) {
        {
            let mut phase = self.phase.lock().expect("phase lock");
            if matches!(*phase, Phase::Degraded | Phase::Terminated) {
                return;
            }
            *phase = Phase::Degraded;
        }
        warn!(
            server = %self.server.name,
            reason,
            "conduit degraded; rejecting new requests"
        );
    }

    async fn terminate(&self) {
        self.set_phase(Phase::Terminated);
        {
            let mut writer = self.writer.lock().await;
            *writer = None;
        }

        let mut state = self.state.lock().await;
        if let Some(mut running) = state.take() {
            if let Err(err) = running.child.kill().await {
                debug!(
                    server = %self.server.name,
                    %err,
                    "failed to kill capability server (may have already exited)"
                );
            }
            let _ = running.child.wait().await;
        }
        drop(state);

        self.fail_all_pending().await;
    }

    async fn fail_all_pending(&self) {
        let mut pending = self.pending.lock().await;
        for (_, sender) in pending.drain() {
            let _ = sender.send(Err(ConduitError::Terminated {
                server: self.server.name.clone(),
            }));
        }
    }
}

fn response_key(id: &Value) -> Option<u64> {
    match id {
        Value::Number(num) => num.as_u64(),
        Value::String(text) => text.parse().ok(),
        _ => None,
    }
}

async fn drain_stderr(server: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(server = %server, line, "capability server stderr");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use serde_json::json;

    fn test_conduit() -> Conduit {
        let server = ServerConfig {
            name: "stub".to_string(),
            command: "true".into(),
            args: Vec::new(),
            env: HashMap::new(),
        };
        Conduit::new(
            server,
            ConduitSettings {
                startup_timeout: Duration::from_secs(1),
                call_timeout: Duration::from_secs(1),
            },
        )
    }

    #[test]
    fn response_key_accepts_numbers_and_numeric_strings() {
        assert_eq!(response_key(&json!(42)), Some(42));
        assert_eq!(response_key(&json!("42")), Some(42));
        assert_eq!(response_key(&json!("req-42")), None);
        assert_eq!(response_key(&json!(null)), None);
        assert_eq!(response_key(&json!(-1)), None);
    }

    #[tokio::test]
    async fn matching_response_resolves_pending_request() {
        let conduit = test_conduit();
        let (tx, rx) = oneshot::channel();
        conduit.inner.pending.lock().await.insert(7, tx);

        conduit
            .inner
            .route_inbound(json!({"jsonrpc": "2.0", "id": 7, "result": {"ok": true}}))
            .await
            .expect("route");

        let value = rx.await.expect("delivered").expect("ok response");
        assert_eq!(value["result"]["ok"], json!(true));
        assert!(conduit.inner.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn error_response_resolves_as_rpc_error() {
        let conduit = test_conduit();
        let (tx, rx) = oneshot::channel();
        conduit.inner.pending.lock().await.insert(3, tx);

        conduit
            .inner
            .route_inbound(json!({
                "jsonrpc": "2.0",
                "id": 3,
                "error": {"code": -32602, "message": "bad params"}
            }))
            .await
            .expect("route");

        let err = rx.await.expect("delivered").expect_err("error response");
        assert!(matches!(err, ConduitError::Rpc { code: -32602, .. }));
    }

    #[tokio::test]
    async fn rpc_error_keeps_the_data_member() {
        let conduit = test_conduit();
        let (tx, rx) = oneshot::channel();
        conduit.inner.pending.lock().await.insert(5, tx);

        conduit
            .inner
            .route_inbound(json!({
                "jsonrpc": "2.0",
                "id": 5,
                "error": {
                    "code": -32000,
                    "message": "quota exhausted",
                    "data": {"retry_after_secs": 30}
                }
            }))
            .await
            .expect("route");

        let err = rx.await.expect("delivered").expect_err("error response");
        let diagnostic = err.to_string();
        assert!(diagnostic.contains("quota exhausted"));
        assert!(diagnostic.contains("retry_after_secs"));
        assert!(diagnostic.contains("30"));
    }

    #[tokio::test]
    async fn unmatched_response_is_dropped() {
        let conduit = test_conduit();
        let (tx, mut rx) = oneshot::channel();
        conduit.inner.pending.lock().await.insert(1, tx);

        conduit
            .inner
            .route_inbound(json!({"jsonrpc": "2.0", "id": 99, "result": {}}))
            .await
            .expect("route");

        assert!(rx.try_recv().is_err());
        assert_eq!(conduit.inner.pending.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn degraded_conduit_rejects_new_requests() {
        let conduit = test_conduit();
        conduit.inner.degrade("test-induced").await;
        assert_eq!(conduit.phase(), Phase::Degraded);

        let err = conduit
            .inner
            .request("tools/list", json!({}), Duration::from_secs(1))
            .await
            .expect_err("degraded conduit must refuse work");
        assert!(matches!(err, ConduitError::Degraded { .. }));
        assert!(conduit.inner.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn terminate_wins_over_degrade() {
        let conduit = test_conduit();
        conduit.inner.terminate().await;
        conduit.inner.degrade("late degrade").await;
        assert_eq!(conduit.phase(), Phase::Terminated);
    }

    #[tokio::test]
    async fn readiness_never_overwrites_a_reader_verdict() {
        let conduit = test_conduit();
        conduit.inner.set_phase(Phase::Starting);
        conduit.inner.promote_to_ready().expect("clean handshake");
        assert_eq!(conduit.phase(), Phase::Ready);

        conduit.inner.degrade("garbage frame mid-handshake").await;
        let err = conduit
            .inner
            .promote_to_ready()
            .expect_err("degraded verdict stands");
        assert!(matches!(err, ConduitError::Degraded { .. }));
        assert_eq!(conduit.phase(), Phase::Degraded);

        conduit.inner.terminate().await;
        let err = conduit
            .inner
            .promote_to_ready()
            .expect_err("terminated verdict stands");
        assert!(matches!(err, ConduitError::Terminated { .. }));
        assert_eq!(conduit.phase(), Phase::Terminated);
    }

    #[tokio::test]
    async fn terminate_fails_all_pending() {
        let conduit = test_conduit();
        let (tx_a, rx_a) = oneshot::channel();
        let (tx_b, rx_b) = oneshot::channel();
        {
            let mut pending = conduit.inner.pending.lock().await;
            pending.insert(1, tx_a);
            pending.insert(2, tx_b);
        }

        conduit.inner.terminate().await;

        for rx in [rx_a, rx_b] {
            let err = rx.await.expect("delivered").expect_err("failed fast");
            assert!(matches!(err, ConduitError::Terminated { .. }));
        }
    }

    #[tokio::test]
    async fn request_without_writer_degrades_conduit() {
        let conduit = test_conduit();
        let err = conduit
            .inner
            .request("tools/list", json!({}), Duration::from_secs(1))
            .await
            .expect_err("no writer");
        assert!(matches!(err, ConduitError::Transport { .. }));
        assert_eq!(conduit.phase(), Phase::Degraded);
        assert!(conduit.inner.pending.lock().await.is_empty());
    }
}

//! Subprocess tool bridge
//!
//! Requests from any number of tasks are multiplexed onto the child's stdin
//! by id. One background reader owns stdout and resolves waiters through the
//! pending table; a second task drains stderr into the log.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rmcp::model::{CallToolResult, Tool};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::protocol::{self, Incoming, Notification, Request};
use crate::config::ToolBridgeConfig;
use crate::tools::{ToolBackend, ToolError, ToolsResult};
use crate::types::{ToolDescriptor, ToolResult};

const PROTOCOL_VERSION: &str = "2025-03-26";
const STOP_GRACE: Duration = Duration::from_secs(2);

type Waiter = oneshot::Sender<ToolsResult<Value>>;
type PendingTable = Arc<parking_lot::Mutex<HashMap<u64, Waiter>>>;
type SharedStdin = Arc<Mutex<Option<ChildStdin>>>;

/// One running child process
struct Connection {
    child: Mutex<Child>,
    stdin: SharedStdin,
    pending: PendingTable,
    alive: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Connection {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn send_line(&self, line: &[u8]) -> ToolsResult<()> {
        write_line(&self.stdin, line).await
    }

    async fn request(&self, id: u64, method: &str, params: Value, timeout: Duration, label: &str) -> ToolsResult<Value> {
        if !self.is_alive() {
            return Err(ToolError::BridgeUnavailable("tool bridge has exited".into()));
        }
        let line = protocol::encode(&Request::new(id, method, params))?;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        // The write counts against the timeout too: a child that stops
        // reading stdin must not wedge the caller
        let exchange = async {
            if let Err(e) = self.send_line(&line).await {
                return Err(e);
            }
            debug!(id, method, "tool bridge request sent");
            match rx.await {
                Ok(outcome) => outcome,
                Err(_) => Err(ToolError::BridgeUnavailable("tool bridge closed".into())),
            }
        };
        let outcome = match tokio::time::timeout(timeout, exchange).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ToolError::Timeout {
                name: label.to_string(),
                secs: timeout.as_secs(),
            }),
        };
        if outcome.is_err() {
            // A late answer is dropped by the reader as unknown
            self.pending.lock().remove(&id);
        }
        outcome
    }

    async fn shutdown(&self) {
        self.stdin.lock().await.take();
        let mut child = self.child.lock().await;
        match tokio::time::timeout(STOP_GRACE, child.wait()).await {
            Ok(Ok(status)) => info!("tool bridge exited with {}", status),
            Ok(Err(e)) => warn!("waiting for tool bridge failed: {}", e),
            Err(_) => {
                warn!("tool bridge did not exit in {:?}, killing it", STOP_GRACE);
                if let Err(e) = child.kill().await {
                    warn!("failed to kill tool bridge: {}", e);
                }
            }
        }
        self.alive.store(false, Ordering::SeqCst);
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn write_line(stdin: &SharedStdin, line: &[u8]) -> ToolsResult<()> {
    // Holding the lock across both calls keeps each line whole
    let mut guard = stdin.lock().await;
    let stdin = guard
        .as_mut()
        .ok_or_else(|| ToolError::BridgeUnavailable("tool bridge stdin is closed".into()))?;
    stdin.write_all(line).await?;
    stdin.flush().await?;
    Ok(())
}

async fn read_loop(stdout: ChildStdout, pending: PendingTable, stdin: SharedStdin, alive: Arc<AtomicBool>) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim();
                if !line.is_empty() {
                    dispatch_line(line, &pending, &stdin).await;
                }
            }
            Err(e) => {
                warn!("tool bridge stdout read failed: {}", e);
                break;
            }
        }
    }

    alive.store(false, Ordering::SeqCst);
    let waiters: Vec<Waiter> = pending.lock().drain().map(|(_, tx)| tx).collect();
    if !waiters.is_empty() {
        warn!("tool bridge exited with {} request(s) in flight", waiters.len());
    }
    for tx in waiters {
        let _ = tx.send(Err(ToolError::BridgeUnavailable("tool bridge exited".into())));
    }
}

async fn dispatch_line(line: &str, pending: &PendingTable, stdin: &SharedStdin) {
    let message = match protocol::decode(line) {
        Ok(Some(message)) => message,
        Ok(None) => {
            debug!("ignoring non-rpc line from tool bridge");
            return;
        }
        Err(e) => {
            warn!("unparseable line from tool bridge: {}", e);
            return;
        }
    };

    match message {
        Incoming::Response { id, outcome } => {
            let waiter = pending.lock().remove(&id);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(outcome);
                }
                None => debug!(id, "discarding response with no pending request"),
            }
        }
        Incoming::Request { id, method } => {
            let reply = if method == "ping" {
                json!({"jsonrpc": "2.0", "id": id, "result": {}})
            } else {
                json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": -32601, "message": format!("method not found: {}", method)}
                })
            };
            match protocol::encode(&reply) {
                Ok(line) => {
                    if let Err(e) = write_line(stdin, &line).await {
                        warn!("failed to answer tool bridge request {}: {}", method, e);
                    }
                }
                Err(e) => warn!("failed to encode reply: {}", e),
            }
        }
        Incoming::Notification { method } => debug!(%method, "tool bridge notification"),
    }
}

async fn drain_stderr(stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "pilotgate::bridge::stderr", "{}", line);
    }
}

/// Client for a tool server running as a child process.
///
/// Shared for the life of the gateway. `start` must succeed before tools
/// can be listed or called; `restart` replaces the child and drops the
/// cached tool list.
pub struct ToolBridge {
    config: ToolBridgeConfig,
    next_id: AtomicU64,
    conn: RwLock<Option<Arc<Connection>>>,
    tools: parking_lot::RwLock<Option<Vec<ToolDescriptor>>>,
}

impl ToolBridge {
    pub fn new(config: ToolBridgeConfig) -> Self {
        Self {
            config,
            next_id: AtomicU64::new(1),
            conn: RwLock::new(None),
            tools: parking_lot::RwLock::new(None),
        }
    }

    fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub async fn is_running(&self) -> bool {
        self.conn.read().await.as_ref().is_some_and(|c| c.is_alive())
    }

    /// Spawn the child and run the initialize handshake.
    /// A no-op when a live child already exists.
    pub async fn start(&self) -> ToolsResult<()> {
        let mut slot = self.conn.write().await;
        if slot.as_ref().is_some_and(|c| c.is_alive()) {
            return Ok(());
        }
        if let Some(stale) = slot.take() {
            stale.shutdown().await;
        }

        // Descriptors are re-listed from every new child
        self.tools.write().take();

        let conn = Arc::new(self.spawn()?);
        let handshake = self.initialize(&conn).await;
        if let Err(e) = handshake {
            warn!("tool bridge handshake failed: {}", e);
            conn.shutdown().await;
            return Err(e);
        }
        *slot = Some(conn);
        Ok(())
    }

    fn spawn(&self) -> ToolsResult<Connection> {
        info!("starting tool bridge: {} {:?}", self.config.command, self.config.args);
        let mut command = Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.config.cwd {
            command.current_dir(cwd);
        }

        let mut child = command
            .spawn()
            .map_err(|e| ToolError::BridgeUnavailable(format!("failed to spawn {}: {}", self.config.command, e)))?;
        let missing = || ToolError::BridgeUnavailable("child stdio was not captured".into());
        let stdin = child.stdin.take().ok_or_else(missing)?;
        let stdout = child.stdout.take().ok_or_else(missing)?;
        let stderr = child.stderr.take().ok_or_else(missing)?;

        let stdin: SharedStdin = Arc::new(Mutex::new(Some(stdin)));
        let pending: PendingTable = Arc::default();
        let alive = Arc::new(AtomicBool::new(true));

        let reader = tokio::spawn(read_loop(stdout, pending.clone(), stdin.clone(), alive.clone()));
        let stderr_task = tokio::spawn(drain_stderr(stderr));

        Ok(Connection {
            child: Mutex::new(child),
            stdin,
            pending,
            alive,
            tasks: vec![reader, stderr_task],
        })
    }

    async fn initialize(&self, conn: &Connection) -> ToolsResult<()> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {"name": "pilotgate", "version": env!("CARGO_PKG_VERSION")},
        });
        let timeout = Duration::from_secs(self.config.startup_timeout_secs);
        let result = conn.request(self.next_id(), "initialize", params, timeout, "initialize").await?;
        if let Some(server) = result.get("serverInfo").and_then(|s| s.get("name")).and_then(Value::as_str) {
            info!("tool bridge initialized: {}", server);
        }
        let line = protocol::encode(&Notification::new("notifications/initialized", None))?;
        conn.send_line(&line).await
    }

    /// Close stdin, give the child a moment to exit, then kill it
    pub async fn stop(&self) {
        let conn = self.conn.write().await.take();
        if let Some(conn) = conn {
            conn.shutdown().await;
        }
        self.tools.write().take();
    }

    pub async fn restart(&self) -> ToolsResult<()> {
        self.stop().await;
        self.start().await
    }

    /// The live connection. A child that has exited since `start` is
    /// started again once; a bridge that was never started or was stopped
    /// stays down.
    async fn connection(&self) -> ToolsResult<Arc<Connection>> {
        if !self.is_running().await {
            if self.conn.read().await.is_none() {
                return Err(ToolError::BridgeUnavailable("tool bridge is not started".into()));
            }
            warn!("tool bridge has exited, starting it again");
            self.start().await?;
        }
        self.conn
            .read()
            .await
            .as_ref()
            .filter(|conn| conn.is_alive())
            .cloned()
            .ok_or_else(|| ToolError::BridgeUnavailable("tool bridge has exited".into()))
    }

    /// Discover tools, following `nextCursor`. Cached until the child is
    /// replaced.
    pub async fn list_tools(&self) -> ToolsResult<Vec<ToolDescriptor>> {
        let conn = self.connection().await?;
        if let Some(tools) = self.tools.read().as_ref() {
            return Ok(tools.clone());
        }

        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = match &cursor {
                Some(cursor) => json!({"cursor": cursor}),
                None => json!({}),
            };
            let page = conn
                .request(self.next_id(), "tools/list", params, self.call_timeout(), "tools/list")
                .await?;
            let listed: Vec<Tool> = serde_json::from_value(page.get("tools").cloned().unwrap_or_else(|| json!([])))?;
            tools.extend(listed.iter().map(descriptor_from));

            cursor = page
                .get("nextCursor")
                .and_then(Value::as_str)
                .filter(|c| !c.is_empty())
                .map(str::to_string);
            if cursor.is_none() {
                break;
            }
        }
        info!("tool bridge offers {} tool(s)", tools.len());
        *self.tools.write() = Some(tools.clone());
        Ok(tools)
    }

    /// Invoke `name`. Fails with `NotFound` for names the bridge never listed.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> ToolsResult<ToolResult> {
        let known = self.list_tools().await?;
        if !known.iter().any(|t| t.name == name) {
            return Err(ToolError::NotFound(name.to_string()));
        }
        let conn = self.connection().await?;
        let params = json!({"name": name, "arguments": arguments});
        let value = conn
            .request(self.next_id(), "tools/call", params, self.call_timeout(), name)
            .await?;
        let result: CallToolResult = serde_json::from_value(value)?;
        Ok(tool_result_from(result))
    }
}

fn descriptor_from(tool: &Tool) -> ToolDescriptor {
    ToolDescriptor::new(
        tool.name.to_string(),
        tool.description.as_deref().unwrap_or_default(),
        Value::Object((*tool.input_schema).clone()),
    )
}

fn tool_result_from(result: CallToolResult) -> ToolResult {
    let text = result
        .content
        .iter()
        .filter_map(|c| c.as_text().map(|t| t.text.to_string()))
        .collect::<Vec<_>>()
        .join("\n");
    ToolResult {
        content: text,
        is_error: result.is_error.unwrap_or(false),
    }
}

#[async_trait]
impl ToolBackend for ToolBridge {
    async fn list_tools(&self) -> ToolsResult<Vec<ToolDescriptor>> {
        ToolBridge::list_tools(self).await
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> ToolsResult<ToolResult> {
        ToolBridge::call_tool(self, name, arguments).await
    }
}

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::client::McpClient;
use super::pending::{PendingGuard, PendingRequests};
use super::types::{JsonRpcRequest, JsonRpcResponse, McpCallToolParam, McpListToolParam, McpToolSchema};
use crate::error::{Result, TaskFlowError};
use crate::tools::ToolResult;

struct ProcessHandle {
    child: Mutex<Child>,
    stdin: tokio::sync::Mutex<ChildStdin>,
    reader: JoinHandle<()>,
    stderr: Option<JoinHandle<()>>,
}

impl ProcessHandle {
    fn shutdown(&self) {
        if let Err(e) = self.child.lock().start_kill() {
            debug!(error = %e, "MCP process already exited");
        }
        self.reader.abort();
        if let Some(stderr) = &self.stderr {
            stderr.abort();
        }
    }
}

/// 通过子进程标准输入输出通信的 MCP 客户端
///
/// 每行一个 JSON-RPC 消息，响应按请求 id 匹配。
pub struct StdioMcpClient {
    command: String,
    args: Vec<String>,
    envs: HashMap<String, String>,
    process: Mutex<Option<Arc<ProcessHandle>>>,
    pending: Arc<PendingRequests>,
}

impl StdioMcpClient {
    pub fn new<S: Into<String>>(command: S, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            envs: HashMap::new(),
            process: Mutex::new(None),
            pending: Arc::new(PendingRequests::new()),
        }
    }

    pub fn with_env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.envs.insert(key.into(), value.into());
        self
    }

    fn spawn(&self) -> Result<ProcessHandle> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .envs(&self.envs)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TaskFlowError::Context("MCP process stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TaskFlowError::Context("MCP process stdout unavailable".into()))?;

        let pending = self.pending.clone();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        pending.handle_line(&line);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "Failed to read MCP process output");
                        break;
                    }
                }
            }
            debug!("MCP process stdout closed");
            pending.clear();
        });

        let stderr = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "taskflow::mcp::stderr", "{}", line);
                }
            })
        });

        Ok(ProcessHandle {
            child: Mutex::new(child),
            stdin: tokio::sync::Mutex::new(stdin),
            reader,
            stderr,
        })
    }

    fn current(&self) -> Option<Arc<ProcessHandle>> {
        self.process.lock().clone()
    }

    async fn send_message(&self, method: &str, params: Value, cancel: &CancellationToken) -> Result<Value> {
        if !self.is_connected() {
            self.connect(cancel).await?;
        }
        let handle = self.current().ok_or(TaskFlowError::McpNotConnected)?;

        let id = Uuid::new_v4().to_string();
        let rx = self.pending.register(&id);
        let _guard = PendingGuard::new(&self.pending, id.clone());

        let request = JsonRpcRequest::new(id.clone(), method, params);
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');
        debug!(method, id = %id, "MCP request");
        {
            let mut stdin = handle.stdin.lock().await;
            stdin.write_all(line.as_bytes()).await.map_err(|e| protocol(method, e))?;
            stdin.flush().await.map_err(|e| protocol(method, e))?;
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TaskFlowError::Aborted),
            response = rx => response.map_err(|_| protocol(method, "no response"))?,
        };
        handle_response(method, response)
    }
}

fn protocol(method: &str, message: impl std::fmt::Display) -> TaskFlowError {
    TaskFlowError::Protocol {
        method: method.to_string(),
        message: message.to_string(),
    }
}

/// 把 JSON-RPC 响应转换为结果，错误字段和 `isError` 都视为失败
fn handle_response(method: &str, response: JsonRpcResponse) -> Result<Value> {
    if let Some(error) = response.error {
        let message = match &error {
            Value::String(message) => message.clone(),
            other => other["message"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| other.to_string()),
        };
        return Err(protocol(method, message));
    }
    let result = response.result.ok_or_else(|| protocol(method, "no response"))?;
    if result["isError"].as_bool().unwrap_or(false) {
        let message = match &result["content"] {
            Value::String(text) => text.clone(),
            Value::Array(items) => items
                .first()
                .and_then(|item| item["text"].as_str())
                .map(str::to_string)
                .unwrap_or_else(|| result.to_string()),
            _ => result.to_string(),
        };
        return Err(protocol(method, message));
    }
    Ok(result)
}

#[async_trait]
impl McpClient for StdioMcpClient {
    async fn connect(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(TaskFlowError::Aborted);
        }
        if let Some(previous) = self.process.lock().take() {
            previous.shutdown();
            // 旧进程的读取任务已终止，不会再清理它的等待者
            self.pending.clear();
        }
        let handle = self.spawn()?;
        info!(command = %self.command, "MCP process started");
        *self.process.lock() = Some(Arc::new(handle));
        Ok(())
    }

    async fn list_tools(
        &self,
        param: McpListToolParam,
        cancel: &CancellationToken,
    ) -> Result<Vec<McpToolSchema>> {
        let params = serde_json::to_value(&param)?;
        let result = self.send_message("tools/list", params, cancel).await?;
        match result.get("tools") {
            Some(tools) if !tools.is_null() => Ok(serde_json::from_value(tools.clone())?),
            _ => Ok(Vec::new()),
        }
    }

    async fn call_tool(&self, param: McpCallToolParam, cancel: &CancellationToken) -> Result<ToolResult> {
        let params = serde_json::to_value(&param)?;
        let result = self.send_message("tools/call", params, cancel).await?;
        Ok(serde_json::from_value(result)?)
    }

    fn is_connected(&self) -> bool {
        match self.process.lock().as_ref() {
            Some(handle) => matches!(handle.child.lock().try_wait(), Ok(None)),
            None => false,
        }
    }

    async fn close(&self) -> Result<()> {
        if let Some(handle) = self.process.lock().take() {
            handle.shutdown();
            info!(command = %self.command, "MCP process closed");
        }
        self.pending.clear();
        Ok(())
    }
}

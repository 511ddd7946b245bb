use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use crate::llm::{FinishReason, Usage};
use crate::tools::ToolResult;
use crate::workflow::Workflow;

/// 进度事件
///
/// 同一个 `stream_id` 可能收到多次 `stream_done = false`，之后恰好一次 `stream_done = true`。
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Text {
        stream_id: String,
        stream_done: bool,
        text: String,
    },
    Thinking {
        stream_id: String,
        stream_done: bool,
        text: String,
    },
    ToolStreaming {
        tool_id: String,
        tool_name: String,
        params_text: String,
    },
    ToolUse {
        tool_id: String,
        tool_name: String,
        params: Value,
    },
    ToolResult {
        tool_id: String,
        tool_name: String,
        params: Value,
        result: ToolResult,
    },
    Workflow {
        stream_done: bool,
        workflow: Workflow,
    },
    File {
        mime_type: String,
        data: String,
    },
    Error {
        error: String,
    },
    Finish {
        finish_reason: FinishReason,
        usage: Usage,
    },
}

#[derive(Clone, Debug, Serialize)]
pub struct StreamMessage {
    pub task_id: String,
    pub agent_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(flatten)]
    pub event: StreamEvent,
}

#[async_trait]
pub trait StreamCallback: Send + Sync {
    async fn on_message(&self, message: StreamMessage);
}

pub type DynStreamCallback = Arc<dyn StreamCallback>;

/// 丢弃所有事件
#[derive(Default, Clone)]
pub struct NoopCallback;

#[async_trait]
impl StreamCallback for NoopCallback {
    async fn on_message(&self, _message: StreamMessage) {}
}

/// 将事件按顺序收集到内存，便于嵌入方回放
#[derive(Default, Clone)]
pub struct RecordingCallback {
    messages: Arc<Mutex<Vec<StreamMessage>>>,
}

impl RecordingCallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<StreamMessage> {
        self.messages.lock().clone()
    }

    pub fn clear(&self) {
        self.messages.lock().clear();
    }
}

#[async_trait]
impl StreamCallback for RecordingCallback {
    async fn on_message(&self, message: StreamMessage) {
        self.messages.lock().push(message);
    }
}

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use taskflow::llm::{FinishReason, LlmRegistry, Usage};
use taskflow::message::ToolCallPart;
use taskflow::workflow::node_id;
use taskflow::{
    Agent, AgentStatus, ContentPart, LlmClient, LlmRequest, LlmResponse, TaskConfig, TaskContext, TaskFlowError,
    WorkflowAgent,
};

/// 按顺序返回预设响应并记录每次请求
#[derive(Default)]
pub struct ScriptedLlm {
    responses: Mutex<VecDeque<taskflow::Result<LlmResponse>>>,
    requests: Mutex<Vec<LlmRequest>>,
}

impl ScriptedLlm {
    pub fn new(responses: Vec<LlmResponse>) -> Arc<Self> {
        Self::with_results(responses.into_iter().map(Ok).collect())
    }

    /// 脚本中可以混入失败的调用
    pub fn with_results(results: Vec<taskflow::Result<LlmResponse>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(results.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().clone()
    }

    pub fn remaining(&self) -> usize {
        self.responses.lock().len()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn call(&self, request: &LlmRequest, _cancel: &CancellationToken) -> taskflow::Result<LlmResponse> {
        self.requests.lock().push(request.clone());
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(TaskFlowError::Llm("script exhausted".into())))
    }
}

pub fn registry(llm: Arc<ScriptedLlm>) -> LlmRegistry {
    let mut llms = LlmRegistry::new();
    llms.insert("default".to_string(), llm);
    llms
}

pub fn text(text: &str) -> LlmResponse {
    LlmResponse::text(text)
}

pub fn tool_call(id: &str, name: &str, input: Value) -> LlmResponse {
    LlmResponse {
        content: vec![ContentPart::ToolCall(ToolCallPart {
            tool_call_id: id.to_string(),
            tool_name: name.to_string(),
            input,
        })],
        finish_reason: FinishReason::ToolCalls,
        usage: Usage::new(10, 5),
    }
}

/// 同一轮里的多个工具调用
pub fn tool_calls(calls: &[(&str, &str, Value)]) -> LlmResponse {
    LlmResponse {
        content: calls
            .iter()
            .map(|(id, name, input)| {
                ContentPart::ToolCall(ToolCallPart {
                    tool_call_id: id.to_string(),
                    tool_name: name.to_string(),
                    input: input.clone(),
                })
            })
            .collect(),
        finish_reason: FinishReason::ToolCalls,
        usage: Usage::new(10, 5),
    }
}

/// 因输出长度上限被截断的文本回合
pub fn truncated(text: &str) -> LlmResponse {
    LlmResponse {
        content: vec![ContentPart::text(text)],
        finish_reason: FinishReason::Length,
        usage: Usage::new(10, 5),
    }
}

pub fn fast_config() -> TaskConfig {
    TaskConfig {
        retry_base_delay_ms: 1,
        plan_retry_delay_ms: 1,
        ..TaskConfig::default()
    }
}

pub fn task(id: &str, config: TaskConfig, llm: Arc<ScriptedLlm>, agents: Vec<Arc<Agent>>) -> Arc<TaskContext> {
    Arc::new(TaskContext::new(id, Arc::new(config), registry(llm)).with_agents(agents))
}

pub fn node(task_id: &str, index: usize, name: &str, task: &str) -> WorkflowAgent {
    WorkflowAgent {
        id: node_id(task_id, index),
        name: name.to_string(),
        task: task.to_string(),
        depends_on: Vec::new(),
        xml: String::new(),
        status: AgentStatus::Init,
    }
}

pub const TWO_NODE_PLAN: &str = r#"<root>
  <name>Weekly report</name>
  <thought>Collect first, then write.</thought>
  <agents>
    <agent name="Writer" id="0" dependsOn="">
      <task>Collect the sales figures</task>
    </agent>
    <agent name="Writer" id="1" dependsOn="0">
      <task>Write the report</task>
    </agent>
  </agents>
</root>"#;

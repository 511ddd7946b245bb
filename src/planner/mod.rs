//! 规划与重规划

mod prompt;
pub mod replan;

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{Result, TaskFlowError};
use crate::events::{DynStreamCallback, StreamEvent, StreamMessage};
use crate::llm::{FinishReason, LlmRequest, RetryLanguageModel, StreamChunk};
use crate::message::Message;
use crate::state::TaskContext;
use crate::workflow::Workflow;

pub use prompt::{plan_system_prompt, plan_user_prompt};
pub use replan::{execution_summary, Replanner};

/// 规划事件使用的 agent 名称
pub const PLANNER_NAME: &str = "Planner";

const PLAN_MAX_TOKENS: u32 = 8192;
const PLAN_TEMPERATURE: f32 = 0.7;

/// 任务规划器
pub struct Planner {
    task: Arc<TaskContext>,
    callback: Option<DynStreamCallback>,
}

fn variable_text(value: Option<Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(text) => Some(text),
        other => Some(other.to_string()),
    }
}

impl Planner {
    pub fn new(task: Arc<TaskContext>) -> Self {
        let callback = task.callback.clone();
        Self { task, callback }
    }

    /// 替换工作流事件的接收者
    pub fn with_callback(mut self, callback: Option<DynStreamCallback>) -> Self {
        self.callback = callback;
        self
    }

    pub async fn plan(&self, task_prompt: &str, save_history: bool) -> Result<Workflow> {
        let website = variable_text(self.task.variables.get("task_website").await?);
        let ext_prompt = variable_text(self.task.variables.get("plan_ext_prompt").await?);
        let messages = vec![
            Message::system(plan_system_prompt(&self.task)),
            Message::user(plan_user_prompt(task_prompt, website.as_deref(), ext_prompt.as_deref())),
        ];
        self.do_plan(task_prompt, messages, save_history).await
    }

    /// 在上一次规划对话的基础上追加新指令
    pub async fn replan(&self, task_prompt: &str, save_history: bool) -> Result<Workflow> {
        match self.previous_conversation() {
            Some(mut messages) => {
                messages.push(Message::user(task_prompt));
                self.do_plan(task_prompt, messages, save_history).await
            }
            None => self.plan(task_prompt, save_history).await,
        }
    }

    /// 上一次规划的请求消息加上模型输出
    pub(crate) fn previous_conversation(&self) -> Option<Vec<Message>> {
        let chain = self.task.chain.read();
        let request = chain.plan_request.as_ref()?;
        let result = chain.plan_result.as_ref()?;
        let mut messages = request.messages.clone();
        messages.push(Message::assistant_text(result.clone()));
        Some(messages)
    }

    pub async fn do_plan(&self, task_prompt: &str, messages: Vec<Message>, save_history: bool) -> Result<Workflow> {
        let config = self.task.config.clone();
        let rlm = self.task.plan_model();
        let request = LlmRequest::new(messages)
            .with_max_tokens(PLAN_MAX_TOKENS)
            .with_temperature(PLAN_TEMPERATURE);

        let mut attempt = 0u32;
        let (text, mut workflow) = loop {
            match self.attempt_plan(&rlm, &request).await {
                Ok(planned) => break planned,
                Err(e) if e.is_aborted() => return Err(e),
                Err(e) if attempt < config.plan_max_retries => {
                    attempt += 1;
                    warn!(task_id = %self.task.task_id, attempt, error = %e, "Planning failed, retrying");
                    tokio::select! {
                        biased;
                        _ = self.task.cancel_token().cancelled() => return Err(TaskFlowError::Aborted),
                        _ = tokio::time::sleep(Duration::from_millis(config.plan_retry_delay_ms)) => {}
                    }
                }
                Err(e) => return Err(TaskFlowError::Planning(e.to_string())),
            }
        };
        info!(task_id = %self.task.task_id, agents = workflow.agents.len(), "Planner result:\n{}", text);

        {
            let mut chain = self.task.chain.write();
            if save_history {
                chain.plan_request = Some(request);
                chain.plan_result = Some(text);
            }
            chain.append_task_prompt(task_prompt);
        }
        workflow.task_prompt = format!("{}\n{}", workflow.task_prompt, task_prompt).trim().to_string();
        self.emit_workflow(workflow.clone(), true).await;
        Ok(workflow)
    }

    /// 单次流式规划，成功时返回原始文本与严格解析后的工作流
    async fn attempt_plan(&self, rlm: &RetryLanguageModel, request: &LlmRequest) -> Result<(String, Workflow)> {
        let cancel = self.task.cancel_token();
        let task_id = self.task.task_id.as_str();
        let mut stream = rlm.call_stream(request, cancel).await?;
        let mut text = String::new();
        let mut thinking = String::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TaskFlowError::Aborted),
                next = stream.next() => next,
            };
            let chunk = match next {
                Some(chunk) => chunk?,
                None => break,
            };
            match chunk {
                StreamChunk::Error { error } => return Err(TaskFlowError::Llm(error)),
                StreamChunk::ReasoningDelta { delta, .. } => thinking.push_str(&delta),
                StreamChunk::TextDelta { delta, .. } => {
                    text.push_str(&delta);
                    if self.callback.is_some() {
                        match self.task.codec.parse(task_id, &text, false, non_empty(&thinking)) {
                            Ok(Some(partial)) => self.emit_workflow(partial, false).await,
                            Ok(None) => {}
                            Err(e) => debug!(error = %e, "Partial plan is not parseable yet"),
                        }
                    }
                }
                StreamChunk::Finish {
                    finish_reason: FinishReason::ContentFilter,
                    ..
                } => return Err(TaskFlowError::Llm("trigger content filtering violation".into())),
                StreamChunk::Finish {
                    finish_reason: FinishReason::Other,
                    ..
                } => return Err(TaskFlowError::Llm("terminated due to other reasons".into())),
                _ => {}
            }
        }

        let workflow = self
            .task
            .codec
            .parse(task_id, &text, true, non_empty(&thinking))?
            .ok_or_else(|| TaskFlowError::WorkflowParse("planner returned an empty plan".into()))?;
        workflow.validate()?;
        Ok((text, workflow))
    }

    async fn emit_workflow(&self, workflow: Workflow, stream_done: bool) {
        if let Some(callback) = &self.callback {
            callback
                .on_message(StreamMessage {
                    task_id: self.task.task_id.clone(),
                    agent_name: PLANNER_NAME.to_string(),
                    node_id: None,
                    event: StreamEvent::Workflow { stream_done, workflow },
                })
                .await;
        }
    }
}

fn non_empty(text: &str) -> Option<&str> {
    (!text.is_empty()).then_some(text)
}

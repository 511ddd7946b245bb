//! 流式响应装配：把分片折叠成一轮完整的助手输出并推送进度事件

use std::collections::HashMap;
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::prompt::intervention_prompt;
use crate::error::{Result, TaskFlowError};
use crate::events::StreamEvent;
use crate::llm::{
    estimate_prompt_tokens, FinishReason, LlmRequest, RetryLanguageModel, StreamChunk, ToolChoice, ToolSchema, Usage,
};
use crate::message::{ContentPart, Message, ToolCallPart};
use crate::state::AgentContext;

/// 长度截断后自动压缩重试所需的最少消息数
const LENGTH_RETRY_MIN_MESSAGES: usize = 5;

#[derive(Clone, Debug, Default)]
pub struct CallOptions {
    /// 强制调用某个工具；设置后不会注入用户干预，也不会记录到执行链
    pub tool_choice: Option<ToolChoice>,
    pub no_compress: bool,
}

impl CallOptions {
    pub fn forced<T: Into<String>>(tool_name: T) -> Self {
        Self {
            tool_choice: Some(ToolChoice::tool(tool_name)),
            no_compress: true,
        }
    }

    fn is_forced(&self) -> bool {
        self.tool_choice.as_ref().is_some_and(ToolChoice::is_forced)
    }
}

/// 一轮完整的助手输出
#[derive(Clone, Debug, Default)]
pub struct AssembledTurn {
    /// 文本在前，工具调用按出现顺序在后
    pub parts: Vec<ContentPart>,
    pub text: String,
    pub finish_reason: FinishReason,
    pub usage: Usage,
}

#[derive(Default)]
struct Segment {
    id: Option<String>,
    text: String,
    done: bool,
}

impl Segment {
    fn is_open(&self) -> bool {
        self.id.is_some() && !self.done
    }
}

/// 分片折叠器
///
/// 每个打开过的文本流在结束时恰好推送一次 `stream_done = true`。
pub struct StreamAssembler<'a> {
    ctx: &'a AgentContext,
    text: Segment,
    reasoning: Segment,
    full_text: String,
    tool_calls: Vec<ToolCallPart>,
    tool_args: HashMap<String, String>,
    pending_tool: Option<usize>,
    finish: Option<(FinishReason, Usage)>,
}

impl<'a> StreamAssembler<'a> {
    pub fn new(ctx: &'a AgentContext) -> Self {
        Self {
            ctx,
            text: Segment::default(),
            reasoning: Segment::default(),
            full_text: String::new(),
            tool_calls: Vec::new(),
            tool_args: HashMap::new(),
            pending_tool: None,
            finish: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finish.is_some()
    }

    async fn close_text(&mut self) {
        if !self.text.is_open() {
            return;
        }
        self.text.done = true;
        if let Some(id) = self.text.id.clone() {
            self.ctx
                .emit(StreamEvent::Text {
                    stream_id: id,
                    stream_done: true,
                    text: self.text.text.clone(),
                })
                .await;
        }
    }

    async fn close_reasoning(&mut self) {
        if !self.reasoning.is_open() {
            return;
        }
        self.reasoning.done = true;
        if let Some(id) = self.reasoning.id.clone() {
            self.ctx
                .emit(StreamEvent::Thinking {
                    stream_id: id,
                    stream_done: true,
                    text: self.reasoning.text.clone(),
                })
                .await;
        }
    }

    async fn open_text(&mut self) {
        self.close_text().await;
        self.text = Segment {
            id: Some(Uuid::new_v4().to_string()),
            ..Default::default()
        };
    }

    async fn open_reasoning(&mut self) {
        self.close_reasoning().await;
        self.reasoning = Segment {
            id: Some(Uuid::new_v4().to_string()),
            ..Default::default()
        };
    }

    fn resolve_input(&self, call: &ToolCallPart) -> Value {
        if !call.input.is_null() {
            return call.input.clone();
        }
        let raw = self.tool_args.get(&call.tool_call_id).map(String::as_str).unwrap_or("");
        parse_input(raw)
    }

    async fn flush_pending_tool(&mut self) {
        if let Some(index) = self.pending_tool.take() {
            if let Some(call) = self.tool_calls.get(index) {
                let params = self.resolve_input(call);
                self.ctx
                    .emit(StreamEvent::ToolUse {
                        tool_id: call.tool_call_id.clone(),
                        tool_name: call.tool_name.clone(),
                        params,
                    })
                    .await;
            }
        }
    }

    pub async fn push(&mut self, chunk: StreamChunk) -> Result<()> {
        match chunk {
            StreamChunk::TextStart { .. } => self.open_text().await,
            StreamChunk::TextDelta { delta, .. } => {
                if delta.is_empty() {
                    return Ok(());
                }
                if !self.text.is_open() {
                    self.open_text().await;
                }
                self.text.text.push_str(&delta);
                self.full_text.push_str(&delta);
                if let Some(id) = self.text.id.clone() {
                    self.ctx
                        .emit(StreamEvent::Text {
                            stream_id: id,
                            stream_done: false,
                            text: self.text.text.clone(),
                        })
                        .await;
                }
                self.flush_pending_tool().await;
            }
            StreamChunk::TextEnd { .. } => self.close_text().await,
            StreamChunk::ReasoningStart { .. } => self.open_reasoning().await,
            StreamChunk::ReasoningDelta { delta, .. } => {
                if delta.is_empty() {
                    return Ok(());
                }
                if !self.reasoning.is_open() {
                    self.open_reasoning().await;
                }
                self.reasoning.text.push_str(&delta);
                if let Some(id) = self.reasoning.id.clone() {
                    self.ctx
                        .emit(StreamEvent::Thinking {
                            stream_id: id,
                            stream_done: false,
                            text: self.reasoning.text.clone(),
                        })
                        .await;
                }
            }
            StreamChunk::ReasoningEnd { .. } => self.close_reasoning().await,
            StreamChunk::ToolInputStart { id, tool_name } => {
                self.flush_pending_tool().await;
                self.tool_args.insert(id.clone(), String::new());
                self.tool_calls.push(ToolCallPart {
                    tool_call_id: id,
                    tool_name,
                    input: Value::Null,
                });
                self.pending_tool = Some(self.tool_calls.len() - 1);
            }
            StreamChunk::ToolInputDelta { id, delta } => {
                self.close_text().await;
                let args = self.tool_args.entry(id.clone()).or_default();
                args.push_str(&delta);
                let params_text = args.clone();
                let tool_name = self
                    .tool_calls
                    .iter()
                    .find(|call| call.tool_call_id == id)
                    .map(|call| call.tool_name.clone())
                    .unwrap_or_default();
                self.ctx
                    .emit(StreamEvent::ToolStreaming {
                        tool_id: id,
                        tool_name,
                        params_text,
                    })
                    .await;
            }
            StreamChunk::ToolCall {
                tool_call_id,
                tool_name,
                input,
            } => {
                let params = parse_input(&input);
                let index = match self.tool_calls.iter().position(|call| call.tool_call_id == tool_call_id) {
                    Some(index) => {
                        let call = &mut self.tool_calls[index];
                        call.tool_name = tool_name.clone();
                        call.input = params.clone();
                        index
                    }
                    None => {
                        self.tool_calls.push(ToolCallPart {
                            tool_call_id: tool_call_id.clone(),
                            tool_name: tool_name.clone(),
                            input: params.clone(),
                        });
                        self.tool_calls.len() - 1
                    }
                };
                if self.pending_tool == Some(index) {
                    self.pending_tool = None;
                }
                self.ctx
                    .emit(StreamEvent::ToolUse {
                        tool_id: tool_call_id,
                        tool_name,
                        params,
                    })
                    .await;
            }
            StreamChunk::File { media_type, data } => {
                self.ctx
                    .emit(StreamEvent::File {
                        mime_type: media_type,
                        data,
                    })
                    .await;
            }
            StreamChunk::Error { error } => {
                self.ctx.emit(StreamEvent::Error { error: error.clone() }).await;
                return Err(TaskFlowError::Llm(error));
            }
            StreamChunk::Finish { finish_reason, usage } => {
                self.close_text().await;
                self.close_reasoning().await;
                self.flush_pending_tool().await;
                self.ctx.emit(StreamEvent::Finish { finish_reason, usage }).await;
                self.finish = Some((finish_reason, usage));
            }
        }
        Ok(())
    }

    /// 流结束后收尾；没有收到结束分片时同样关闭所有打开的流
    pub async fn finish(mut self) -> AssembledTurn {
        if self.finish.is_none() {
            self.close_text().await;
            self.close_reasoning().await;
            self.flush_pending_tool().await;
        }
        let (finish_reason, usage) = self.finish.unwrap_or_default();
        let mut parts = Vec::with_capacity(self.tool_calls.len() + 1);
        if !self.full_text.is_empty() {
            parts.push(ContentPart::text(self.full_text.clone()));
        }
        let calls: Vec<ToolCallPart> = self
            .tool_calls
            .iter()
            .map(|call| ToolCallPart {
                input: self.resolve_input(call),
                ..call.clone()
            })
            .collect();
        parts.extend(calls.into_iter().map(ContentPart::ToolCall));
        AssembledTurn {
            parts,
            text: self.full_text,
            finish_reason,
            usage,
        }
    }
}

/// 非法 JSON 保留原始文本，交给工具执行时报错
fn parse_input(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(Default::default());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn should_compress(ctx: &AgentContext, messages: &[Message], tools: &[ToolSchema]) -> bool {
    let config = &ctx.task.config;
    if messages.len() >= config.compress_threshold {
        return true;
    }
    messages.len() >= config.compress_min_messages
        && estimate_prompt_tokens(messages, tools) >= config.compress_tokens_threshold
}

async fn compress(ctx: &AgentContext, rlm: &RetryLanguageModel, messages: &mut Vec<Message>, tools: &[ToolSchema]) {
    let Some(compressor) = ctx.task.compressor.clone() else {
        debug!(agent = %ctx.agent_name, "No compressor configured, sending messages as is");
        return;
    };
    let before = messages.len();
    match compressor.compress(ctx, rlm, messages, tools).await {
        Ok(()) => info!(agent = %ctx.agent_name, before, after = messages.len(), "Compressed agent messages"),
        Err(e) => warn!(agent = %ctx.agent_name, error = %e, "Message compression failed"),
    }
}

async fn stream_turn(ctx: &AgentContext, rlm: &RetryLanguageModel, request: &LlmRequest) -> Result<AssembledTurn> {
    let cancel = ctx.task.cancel_token();
    let mut stream = rlm.call_stream(request, cancel).await?;
    let mut assembler = StreamAssembler::new(ctx);
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TaskFlowError::Aborted),
            next = stream.next() => next,
        };
        match next {
            Some(Ok(chunk)) => assembler.push(chunk).await?,
            Some(Err(e)) => return Err(e),
            None => break,
        }
    }
    Ok(assembler.finish().await)
}

/// 一次 agent 模型调用，含压缩、重试与用户干预注入
pub async fn call_agent_llm(
    ctx: &AgentContext,
    rlm: &RetryLanguageModel,
    messages: &mut Vec<Message>,
    tools: &[ToolSchema],
    options: CallOptions,
) -> Result<Vec<ContentPart>> {
    let config = ctx.task.config.clone();
    let forced = options.is_forced();
    let mut retry_num = 0u32;
    let mut overflow_retried = false;
    let mut length_retried = false;

    loop {
        ctx.task.check_aborted()?;
        if !options.no_compress && should_compress(ctx, messages, tools) {
            compress(ctx, rlm, messages, tools).await;
        }
        if !forced {
            let instructions = ctx.task.take_conversation();
            if !instructions.is_empty() {
                info!(agent = %ctx.agent_name, count = instructions.len(), "Injecting user intervention");
                messages.push(Message::user(intervention_prompt(&instructions)));
            }
        }

        let request = LlmRequest::new(messages.clone())
            .with_tools(tools.to_vec())
            .with_tool_choice(options.tool_choice.clone())
            .with_max_tokens(config.max_tokens);
        if !forced {
            if let Some(record) = ctx.task.chain.write().agent_mut(ctx.chain_id) {
                record.request = Some(request.clone());
            }
        }

        match stream_turn(ctx, rlm, &request).await {
            Ok(turn) => {
                if !forced {
                    if let Some(record) = ctx.task.chain.write().agent_mut(ctx.chain_id) {
                        record.result = Some(turn.text.clone());
                    }
                }
                if turn.finish_reason == FinishReason::Length
                    && !options.no_compress
                    && !length_retried
                    && messages.len() >= LENGTH_RETRY_MIN_MESSAGES
                {
                    length_retried = true;
                    warn!(agent = %ctx.agent_name, "Output truncated by length limit, compressing and retrying");
                    compress(ctx, rlm, messages, tools).await;
                    continue;
                }
                return Ok(turn.parts);
            }
            Err(err) if err.is_aborted() => return Err(err),
            Err(err) => {
                if err.is_context_overflow() && !options.no_compress && !overflow_retried {
                    overflow_retried = true;
                    warn!(agent = %ctx.agent_name, error = %err, "Context too long, compressing and retrying");
                    compress(ctx, rlm, messages, tools).await;
                    continue;
                }
                if retry_num >= config.max_retry_num {
                    return Err(err);
                }
                retry_num += 1;
                let delay = Duration::from_millis(config.retry_base_delay_ms * u64::from(retry_num).pow(2));
                warn!(
                    agent = %ctx.agent_name,
                    error = %err,
                    attempt = retry_num,
                    delay_ms = delay.as_millis() as u64,
                    "Agent LLM call failed, retrying"
                );
                tokio::select! {
                    biased;
                    _ = ctx.task.cancel_token().cancelled() => return Err(TaskFlowError::Aborted),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

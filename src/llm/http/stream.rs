use std::collections::BTreeMap;

use anyhow::anyhow;
use serde_json::Value;

use crate::error::{Result, TaskFlowError};
use crate::llm::types::{FinishReason, StreamChunk, Usage};

const TEXT_STREAM_ID: &str = "text";
const REASONING_STREAM_ID: &str = "reasoning";

#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// SSE (Server-Sent Events) 解析器
///
/// 把 OpenAI 兼容接口的增量 JSON 转换为统一的分片序列。
#[derive(Default)]
pub struct SseParser {
    buffer: String,
    text_open: bool,
    reasoning_open: bool,
    tool_calls: BTreeMap<u64, PendingToolCall>,
    finish_reason: Option<FinishReason>,
    usage: Usage,
    finished: bool,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// 解析数据块，返回流式 chunk 列表
    ///
    /// SSE 格式：
    /// ```text
    /// data: {"id":"...","choices":[{"delta":{"content":"Hello"}}]}
    ///
    /// data: [DONE]
    /// ```
    pub fn parse_chunk(&mut self, data: &[u8]) -> Result<Vec<StreamChunk>> {
        let text = String::from_utf8_lossy(data).replace("\r\n", "\n");
        self.buffer.push_str(&text);

        let mut chunks = Vec::new();
        while let Some(end_pos) = self.buffer.find("\n\n") {
            let event_text: String = self.buffer.drain(..end_pos + 2).collect();
            self.parse_event(event_text.trim_end(), &mut chunks)?;
        }
        Ok(chunks)
    }

    /// 结束解析，补齐未关闭的流和挂起的工具调用
    pub fn finish(&mut self) -> Vec<StreamChunk> {
        let mut chunks = Vec::new();
        if self.finished {
            return chunks;
        }
        self.finished = true;
        if self.reasoning_open {
            self.reasoning_open = false;
            chunks.push(StreamChunk::ReasoningEnd {
                id: REASONING_STREAM_ID.to_string(),
            });
        }
        if self.text_open {
            self.text_open = false;
            chunks.push(StreamChunk::TextEnd {
                id: TEXT_STREAM_ID.to_string(),
            });
        }
        for (_, call) in std::mem::take(&mut self.tool_calls) {
            chunks.push(StreamChunk::ToolCall {
                tool_call_id: call.id,
                tool_name: call.name,
                input: call.arguments,
            });
        }
        chunks.push(StreamChunk::Finish {
            finish_reason: self.finish_reason.unwrap_or(FinishReason::Stop),
            usage: self.usage,
        });
        chunks
    }

    fn parse_event(&mut self, event_text: &str, chunks: &mut Vec<StreamChunk>) -> Result<()> {
        for line in event_text.lines() {
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data.is_empty() {
                continue;
            }
            if data == "[DONE]" {
                chunks.extend(self.finish());
                continue;
            }
            let json: Value = serde_json::from_str(data).map_err(|e| {
                TaskFlowError::Other(anyhow!("Failed to parse SSE JSON: {}: {}", e, data))
            })?;
            self.apply_delta(&json, chunks);
        }
        Ok(())
    }

    fn apply_delta(&mut self, json: &Value, chunks: &mut Vec<StreamChunk>) {
        if let Some(error) = json.get("error") {
            let message = error["message"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            chunks.push(StreamChunk::Error { error: message });
            return;
        }

        if let Some(usage) = json.get("usage").filter(|usage| usage.is_object()) {
            let input = usage["prompt_tokens"].as_u64().unwrap_or(0);
            let output = usage["completion_tokens"].as_u64().unwrap_or(0);
            self.usage = Usage::new(input, output);
        }

        let Some(choice) = json["choices"].as_array().and_then(|choices| choices.first()) else {
            return;
        };
        let delta = &choice["delta"];

        if let Some(reasoning) = delta["reasoning_content"].as_str().filter(|s| !s.is_empty()) {
            if !self.reasoning_open {
                self.reasoning_open = true;
                chunks.push(StreamChunk::ReasoningStart {
                    id: REASONING_STREAM_ID.to_string(),
                });
            }
            chunks.push(StreamChunk::ReasoningDelta {
                id: REASONING_STREAM_ID.to_string(),
                delta: reasoning.to_string(),
            });
        }

        if let Some(content) = delta["content"].as_str().filter(|s| !s.is_empty()) {
            if self.reasoning_open {
                self.reasoning_open = false;
                chunks.push(StreamChunk::ReasoningEnd {
                    id: REASONING_STREAM_ID.to_string(),
                });
            }
            if !self.text_open {
                self.text_open = true;
                chunks.push(StreamChunk::TextStart {
                    id: TEXT_STREAM_ID.to_string(),
                });
            }
            chunks.push(StreamChunk::TextDelta {
                id: TEXT_STREAM_ID.to_string(),
                delta: content.to_string(),
            });
        }

        if let Some(calls) = delta["tool_calls"].as_array() {
            for call in calls {
                let index = call["index"].as_u64().unwrap_or(0);
                let entry = self.tool_calls.entry(index).or_default();
                if let Some(id) = call["id"].as_str() {
                    entry.id = id.to_string();
                }
                if let Some(name) = call["function"]["name"].as_str() {
                    if entry.name.is_empty() {
                        entry.name = name.to_string();
                        chunks.push(StreamChunk::ToolInputStart {
                            id: entry.id.clone(),
                            tool_name: entry.name.clone(),
                        });
                    }
                }
                if let Some(arguments) = call["function"]["arguments"].as_str().filter(|s| !s.is_empty()) {
                    entry.arguments.push_str(arguments);
                    chunks.push(StreamChunk::ToolInputDelta {
                        id: entry.id.clone(),
                        delta: arguments.to_string(),
                    });
                }
            }
        }

        if let Some(reason) = choice["finish_reason"].as_str() {
            self.finish_reason = Some(FinishReason::from_provider(reason));
        }
    }
}

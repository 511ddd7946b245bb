use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::message::{ContentPart, Message};

/// 暴露给模型的工具描述
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ToolSchema {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolChoice {
    Auto,
    None,
    Required,
    Tool { tool_name: String },
}

impl ToolChoice {
    pub fn tool<T: Into<String>>(name: T) -> Self {
        ToolChoice::Tool {
            tool_name: name.into(),
        }
    }

    pub fn is_forced(&self) -> bool {
        matches!(self, ToolChoice::Tool { .. } | ToolChoice::Required)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LlmRequest {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub tools: Vec<ToolSchema>,
    #[serde(default)]
    pub tool_choice: Option<ToolChoice>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

impl LlmRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolSchema>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_tool_choice(mut self, choice: Option<ToolChoice>) -> Self {
        self.tool_choice = choice;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Error,
    Other,
    #[default]
    Unknown,
}

impl FinishReason {
    /// 解析提供方返回的结束原因字符串
    pub fn from_provider(raw: &str) -> Self {
        match raw {
            "stop" | "end_turn" => FinishReason::Stop,
            "length" | "max_tokens" => FinishReason::Length,
            "tool_calls" | "tool-calls" | "tool_use" | "function_call" => FinishReason::ToolCalls,
            "content_filter" | "content-filter" => FinishReason::ContentFilter,
            "error" => FinishReason::Error,
            "other" => FinishReason::Other,
            _ => FinishReason::Unknown,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }
}

/// 流式响应中的一个分片
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamChunk {
    TextStart { id: String },
    TextDelta { id: String, delta: String },
    TextEnd { id: String },
    ReasoningStart { id: String },
    ReasoningDelta { id: String, delta: String },
    ReasoningEnd { id: String },
    ToolInputStart { id: String, tool_name: String },
    ToolInputDelta { id: String, delta: String },
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        /// 原始 JSON 参数文本
        input: String,
    },
    File { media_type: String, data: String },
    Error { error: String },
    Finish {
        finish_reason: FinishReason,
        #[serde(default)]
        usage: Usage,
    },
}

pub type LlmStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// 非流式调用的完整结果
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LlmResponse {
    pub content: Vec<ContentPart>,
    #[serde(default)]
    pub finish_reason: FinishReason,
    #[serde(default)]
    pub usage: Usage,
}

impl LlmResponse {
    pub fn text<T: Into<String>>(text: T) -> Self {
        Self {
            content: vec![ContentPart::text(text)],
            finish_reason: FinishReason::Stop,
            usage: Usage::default(),
        }
    }

    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentPart::as_text)
            .collect::<Vec<_>>()
            .join("")
    }

    /// 把完整结果展开成等价的分片序列
    pub fn into_chunks(self) -> Vec<StreamChunk> {
        let mut chunks = Vec::new();
        for (index, part) in self.content.into_iter().enumerate() {
            let id = format!("part-{index}");
            match part {
                ContentPart::Text { text } => {
                    chunks.push(StreamChunk::TextStart { id: id.clone() });
                    chunks.push(StreamChunk::TextDelta {
                        id: id.clone(),
                        delta: text,
                    });
                    chunks.push(StreamChunk::TextEnd { id });
                }
                ContentPart::Reasoning { text } => {
                    chunks.push(StreamChunk::ReasoningStart { id: id.clone() });
                    chunks.push(StreamChunk::ReasoningDelta {
                        id: id.clone(),
                        delta: text,
                    });
                    chunks.push(StreamChunk::ReasoningEnd { id });
                }
                ContentPart::ToolCall(call) => {
                    let input = match call.input {
                        Value::String(raw) => raw,
                        other => other.to_string(),
                    };
                    chunks.push(StreamChunk::ToolCall {
                        tool_call_id: call.tool_call_id,
                        tool_name: call.tool_name,
                        input,
                    });
                }
                ContentPart::File { data, media_type } => {
                    chunks.push(StreamChunk::File { media_type, data });
                }
                ContentPart::ToolResult(_) => {}
            }
        }
        chunks.push(StreamChunk::Finish {
            finish_reason: self.finish_reason,
            usage: self.usage,
        });
        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ToolCallPart;
    use serde_json::json;

    #[test]
    fn response_expands_to_ordered_chunks() {
        let response = LlmResponse {
            content: vec![
                ContentPart::text("hi"),
                ContentPart::ToolCall(ToolCallPart {
                    tool_call_id: "c1".into(),
                    tool_name: "search".into(),
                    input: json!({"q": "x"}),
                }),
            ],
            finish_reason: FinishReason::ToolCalls,
            usage: Usage::new(3, 4),
        };
        let chunks = response.into_chunks();
        assert_eq!(chunks.len(), 5);
        assert!(matches!(&chunks[1], StreamChunk::TextDelta { delta, .. } if delta == "hi"));
        assert!(matches!(&chunks[3], StreamChunk::ToolCall { input, .. } if input == r#"{"q":"x"}"#));
        assert!(matches!(
            chunks[4],
            StreamChunk::Finish { finish_reason: FinishReason::ToolCalls, usage } if usage.total_tokens == 7
        ));
    }

    #[test]
    fn provider_finish_reasons_are_normalized() {
        assert_eq!(FinishReason::from_provider("max_tokens"), FinishReason::Length);
        assert_eq!(FinishReason::from_provider("content_filter"), FinishReason::ContentFilter);
        assert_eq!(FinishReason::from_provider("weird"), FinishReason::Unknown);
    }
}

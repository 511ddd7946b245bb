use std::collections::VecDeque;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use super::stream::SseParser;
use crate::error::{Result, TaskFlowError};
use crate::llm::client::LlmClient;
use crate::llm::types::{FinishReason, LlmRequest, LlmResponse, LlmStream, ToolChoice, Usage};
use crate::message::{ContentPart, Message, Role, ToolCallPart};

/// OpenAI 兼容的 chat/completions 客户端
#[derive(Clone)]
pub struct GenericHttpClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    auth_header: Option<String>,
}

impl GenericHttpClient {
    /// 连接池复用连接，并限制连接和整体超时
    fn create_optimized_client() -> reqwest::Client {
        reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(300))
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Failed to build tuned HTTP client, using defaults");
                reqwest::Client::new()
            })
    }

    pub fn new<S1, S2, S3>(endpoint: S1, api_key: S2, model: S3) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
        S3: Into<String>,
    {
        Self {
            client: Self::create_optimized_client(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            model: model.into(),
            auth_header: None,
        }
    }

    pub fn with_auth_header<S: Into<String>>(mut self, auth_header: S) -> Self {
        self.auth_header = Some(auth_header.into());
        self
    }

    fn full_endpoint(&self) -> String {
        if self.endpoint.contains("/chat/completions") {
            self.endpoint.clone()
        } else {
            format!("{}/chat/completions", self.endpoint.trim_end_matches('/'))
        }
    }

    fn auth_value(&self) -> String {
        match &self.auth_header {
            Some(scheme) => format!("{} {}", scheme, self.api_key),
            None => format!("Bearer {}", self.api_key),
        }
    }

    fn build_body(&self, request: &LlmRequest, stream: bool) -> Value {
        let messages: Vec<Value> = request.messages.iter().flat_map(convert_message).collect();
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": stream,
        });
        if stream {
            body["stream_options"] = json!({ "include_usage": true });
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if !request.tools.is_empty() {
            body["tools"] = request
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.input_schema,
                        }
                    })
                })
                .collect();
            if let Some(choice) = &request.tool_choice {
                body["tool_choice"] = match choice {
                    ToolChoice::Auto => json!("auto"),
                    ToolChoice::None => json!("none"),
                    ToolChoice::Required => json!("required"),
                    ToolChoice::Tool { tool_name } => {
                        json!({ "type": "function", "function": { "name": tool_name } })
                    }
                };
            }
        }
        body
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(self.full_endpoint())
            .header("Authorization", self.auth_value())
            .json(body)
            .send()
            .await
            .map_err(|e| TaskFlowError::Llm(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(TaskFlowError::Llm(format!(
                "request failed with status {}: {}",
                status, detail
            )));
        }
        Ok(response)
    }
}

fn convert_message(message: &Message) -> Vec<Value> {
    match message.role {
        Role::System => vec![json!({ "role": "system", "content": message.text() })],
        Role::User => {
            let has_media = message.content.iter().any(ContentPart::is_media);
            if !has_media {
                return vec![json!({ "role": "user", "content": message.text() })];
            }
            let parts: Vec<Value> = message
                .content
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(json!({ "type": "text", "text": text })),
                    ContentPart::File { data, media_type } => Some(json!({
                        "type": "image_url",
                        "image_url": { "url": format!("data:{};base64,{}", media_type, data) }
                    })),
                    _ => None,
                })
                .collect();
            vec![json!({ "role": "user", "content": parts })]
        }
        Role::Assistant => {
            let tool_calls: Vec<Value> = message
                .tool_calls()
                .map(|call| {
                    let arguments = match &call.input {
                        Value::String(raw) => raw.clone(),
                        other => other.to_string(),
                    };
                    json!({
                        "id": call.tool_call_id,
                        "type": "function",
                        "function": { "name": call.tool_name, "arguments": arguments }
                    })
                })
                .collect();
            let mut value = json!({ "role": "assistant", "content": message.text() });
            if !tool_calls.is_empty() {
                value["tool_calls"] = json!(tool_calls);
            }
            vec![value]
        }
        Role::Tool => message
            .content
            .iter()
            .filter_map(|part| match part {
                ContentPart::ToolResult(result) => Some(json!({
                    "role": "tool",
                    "tool_call_id": result.tool_call_id,
                    "content": result.output.to_plain_text(),
                })),
                _ => None,
            })
            .collect(),
    }
}

fn parse_completion(payload: &Value) -> Result<LlmResponse> {
    let choice = payload["choices"]
        .get(0)
        .ok_or_else(|| TaskFlowError::Other(anyhow!("missing choices in completion")))?;
    let message = &choice["message"];
    let mut content = Vec::new();
    if let Some(reasoning) = message["reasoning_content"].as_str().filter(|s| !s.is_empty()) {
        content.push(ContentPart::Reasoning {
            text: reasoning.to_string(),
        });
    }
    if let Some(text) = message["content"].as_str().filter(|s| !s.is_empty()) {
        content.push(ContentPart::text(text));
    }
    if let Some(calls) = message["tool_calls"].as_array() {
        for call in calls {
            content.push(ContentPart::ToolCall(ToolCallPart {
                tool_call_id: call["id"].as_str().unwrap_or_default().to_string(),
                tool_name: call["function"]["name"].as_str().unwrap_or_default().to_string(),
                input: Value::String(call["function"]["arguments"].as_str().unwrap_or("{}").to_string()),
            }));
        }
    }
    let finish_reason = choice["finish_reason"]
        .as_str()
        .map(FinishReason::from_provider)
        .unwrap_or(FinishReason::Stop);
    let usage = Usage::new(
        payload["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
        payload["usage"]["completion_tokens"].as_u64().unwrap_or(0),
    );
    Ok(LlmResponse {
        content,
        finish_reason,
        usage,
    })
}

#[async_trait]
impl LlmClient for GenericHttpClient {
    #[instrument(skip_all, fields(model = %self.model))]
    async fn call(&self, request: &LlmRequest, cancel: &CancellationToken) -> Result<LlmResponse> {
        let body = self.build_body(request, false);
        let payload: Value = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TaskFlowError::Aborted),
            response = self.send(&body) => response?
                .json()
                .await
                .map_err(|e| TaskFlowError::Llm(e.to_string()))?,
        };
        parse_completion(&payload)
    }

    #[instrument(skip_all, fields(model = %self.model))]
    async fn call_stream(&self, request: &LlmRequest, cancel: &CancellationToken) -> Result<LlmStream> {
        let body = self.build_body(request, true);
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TaskFlowError::Aborted),
            response = self.send(&body) => response?,
        };

        let bytes = response.bytes_stream();
        let state = (bytes, SseParser::new(), VecDeque::new());
        let stream = futures::stream::unfold(state, |(mut bytes, mut parser, mut queue)| async move {
            loop {
                if let Some(chunk) = queue.pop_front() {
                    return Some((Ok(chunk), (bytes, parser, queue)));
                }
                if parser.is_finished() {
                    return None;
                }
                match bytes.next().await {
                    Some(Ok(data)) => match parser.parse_chunk(&data) {
                        Ok(chunks) => queue.extend(chunks),
                        Err(e) => return Some((Err(e), (bytes, parser, queue))),
                    },
                    Some(Err(e)) => {
                        let err = TaskFlowError::Llm(e.to_string());
                        return Some((Err(err), (bytes, parser, queue)));
                    }
                    None => queue.extend(parser.finish()),
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::ToolSchema;
    use crate::message::{ToolResultOutput, ToolResultPart};

    #[test]
    fn body_maps_tools_and_forced_choice() {
        let client = GenericHttpClient::new("https://api.example.com/v1", "key", "model-x");
        let request = LlmRequest::new(vec![Message::user("hi")])
            .with_tools(vec![ToolSchema {
                name: "search".into(),
                description: "web search".into(),
                input_schema: json!({"type": "object"}),
            }])
            .with_tool_choice(Some(ToolChoice::tool("search")))
            .with_max_tokens(512);
        let body = client.build_body(&request, true);
        assert_eq!(body["tools"][0]["function"]["name"], "search");
        assert_eq!(body["tool_choice"]["function"]["name"], "search");
        assert_eq!(body["max_tokens"], 512);
        assert_eq!(client.full_endpoint(), "https://api.example.com/v1/chat/completions");
    }

    #[test]
    fn tool_message_expands_per_result() {
        let message = Message::tool(vec![
            ToolResultPart {
                tool_call_id: "a".into(),
                tool_name: "x".into(),
                output: ToolResultOutput::Text("one".into()),
            },
            ToolResultPart {
                tool_call_id: "b".into(),
                tool_name: "y".into(),
                output: ToolResultOutput::ErrorText("Error: two".into()),
            },
        ]);
        let converted = convert_message(&message);
        assert_eq!(converted.len(), 2);
        assert_eq!(converted[1]["tool_call_id"], "b");
        assert_eq!(converted[1]["content"], "Error: two");
    }

    #[test]
    fn completion_payload_is_parsed() {
        let payload = json!({
            "choices": [{
                "message": {
                    "content": "done",
                    "tool_calls": [{"id": "c1", "function": {"name": "search", "arguments": "{}"}}]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 2}
        });
        let response = parse_completion(&payload).unwrap();
        assert_eq!(response.content.len(), 2);
        assert_eq!(response.finish_reason, FinishReason::ToolCalls);
        assert_eq!(response.usage.total_tokens, 12);
    }
}

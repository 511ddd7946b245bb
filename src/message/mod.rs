use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// 对话中的一条消息
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentPart>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Reasoning { text: String },
    File { data: String, media_type: String },
    ToolCall(ToolCallPart),
    ToolResult(ToolResultPart),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ToolCallPart {
    pub tool_call_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub input: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ToolResultPart {
    pub tool_call_id: String,
    pub tool_name: String,
    pub output: ToolResultOutput,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ToolResultOutput {
    Text(String),
    Json(Value),
    ErrorText(String),
    Content(Vec<ToolResultContent>),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolResultContent {
    Text { text: String },
    Media { data: String, media_type: String },
}

impl Message {
    pub fn system<T: Into<String>>(text: T) -> Self {
        Self {
            role: Role::System,
            content: vec![ContentPart::text(text)],
        }
    }

    pub fn user<T: Into<String>>(text: T) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentPart::text(text)],
        }
    }

    pub fn assistant(content: Vec<ContentPart>) -> Self {
        Self {
            role: Role::Assistant,
            content,
        }
    }

    pub fn assistant_text<T: Into<String>>(text: T) -> Self {
        Self::assistant(vec![ContentPart::text(text)])
    }

    pub fn tool(results: Vec<ToolResultPart>) -> Self {
        Self {
            role: Role::Tool,
            content: results.into_iter().map(ContentPart::ToolResult).collect(),
        }
    }

    /// 拼接消息中的全部文本片段
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCallPart> {
        self.content.iter().filter_map(|part| match part {
            ContentPart::ToolCall(call) => Some(call),
            _ => None,
        })
    }
}

impl ContentPart {
    pub fn text<T: Into<String>>(text: T) -> Self {
        ContentPart::Text { text: text.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentPart::Text { text } => Some(text),
            _ => None,
        }
    }

    pub fn is_media(&self) -> bool {
        matches!(self, ContentPart::File { .. })
    }
}

impl ToolResultOutput {
    /// 用于日志和重规划摘要的扁平文本
    pub fn to_plain_text(&self) -> String {
        match self {
            ToolResultOutput::Text(text) | ToolResultOutput::ErrorText(text) => text.clone(),
            ToolResultOutput::Json(value) => value.to_string(),
            ToolResultOutput::Content(items) => items
                .iter()
                .map(|item| match item {
                    ToolResultContent::Text { text } => text.clone(),
                    ToolResultContent::Media { media_type, .. } => format!("[{media_type}]"),
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn assistant_turn_serializes_with_tagged_parts() {
        let message = Message::assistant(vec![
            ContentPart::text("checking"),
            ContentPart::ToolCall(ToolCallPart {
                tool_call_id: "call_1".into(),
                tool_name: "search".into(),
                input: json!({"q": "rust"}),
            }),
        ]);
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["role"], "assistant");
        assert_eq!(value["content"][1]["type"], "tool_call");
        assert_eq!(value["content"][1]["tool_name"], "search");
        assert_eq!(message.tool_calls().count(), 1);
        assert_eq!(message.text(), "checking");
    }
}

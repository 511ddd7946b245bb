use serde_json::Value;

use crate::message::{ContentPart, Message, Role, ToolCallPart, ToolResultContent, ToolResultOutput, ToolResultPart};

use super::tool::{ToolContent, ToolResult};

/// 去掉 `data:<mime>;base64,` 前缀
pub fn strip_data_url(data: &str) -> &str {
    if data.starts_with("data:") {
        if let Some((_, payload)) = data.split_once(";base64,") {
            return payload;
        }
    }
    data
}

fn looks_like_json(text: &str) -> bool {
    let text = text.trim();
    (text.starts_with('{') && text.ends_with('}')) || (text.starts_with('[') && text.ends_with(']'))
}

fn text_output(text: &str, is_error: bool) -> ToolResultOutput {
    if is_error {
        return ToolResultOutput::ErrorText(format!("Error: {}", text));
    }
    if text.is_empty() {
        return ToolResultOutput::Text("Successful".to_string());
    }
    if looks_like_json(text) {
        if let Ok(value) = serde_json::from_str::<Value>(text) {
            return ToolResultOutput::Json(value);
        }
    }
    ToolResultOutput::Text(text.to_string())
}

/// 把工具结果转换为模型可见的结果片段
///
/// 关闭多模态时，图片会移到额外的用户消息中，由调用方追加在工具消息之后。
pub fn convert_tool_result(
    call: &ToolCallPart,
    result: &ToolResult,
    multimodal: bool,
    user_messages: &mut Vec<Message>,
) -> ToolResultPart {
    let output = match result.content.as_slice() {
        [ToolContent::Text { text }] => text_output(text, result.is_error),
        items => {
            let mut content = Vec::new();
            let mut media = Vec::new();
            for item in items {
                match item {
                    ToolContent::Text { text } => content.push(ToolResultContent::Text { text: text.clone() }),
                    ToolContent::Image { data, mime_type } => {
                        let data = strip_data_url(data).to_string();
                        if multimodal {
                            content.push(ToolResultContent::Media {
                                data,
                                media_type: mime_type.clone(),
                            });
                        } else {
                            media.push(ContentPart::File {
                                data,
                                media_type: mime_type.clone(),
                            });
                        }
                    }
                    ToolContent::Unsupported => {}
                }
            }
            if !media.is_empty() {
                media.push(ContentPart::text(format!("call `{}` tool result", call.tool_name)));
                user_messages.push(Message {
                    role: Role::User,
                    content: media,
                });
            }
            match content.as_slice() {
                [] => text_output("", result.is_error),
                [ToolResultContent::Text { text }] => text_output(text, result.is_error),
                _ => ToolResultOutput::Content(content),
            }
        }
    };
    ToolResultPart {
        tool_call_id: call.tool_call_id.clone(),
        tool_name: call.tool_name.clone(),
        output,
    }
}

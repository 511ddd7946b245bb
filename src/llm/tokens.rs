//! 粗略的 token 估算，只用于决定何时压缩上下文。

use crate::message::{ContentPart, Message, ToolResultOutput};

use super::types::ToolSchema;

fn is_cjk(c: char) -> bool {
    matches!(
        c as u32,
        0x4e00..=0x9fff | 0x3400..=0x4dbf | 0x3040..=0x309f | 0x30a0..=0x30ff | 0xac00..=0xd7af
    )
}

/// 估算一段文本的 token 数
///
/// CJK 字符每个计 2，空白不计，连续 ASCII 字母按 4 个一组，
/// 连续数字按 3 个一组，其他字符各计 1。非空文本至少为 1。
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    let chars: Vec<char> = text.chars().collect();
    let mut count = 0usize;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if is_cjk(c) {
            count += 2;
            i += 1;
        } else if c.is_whitespace() {
            i += 1;
        } else if c.is_ascii_alphabetic() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_alphabetic() {
                i += 1;
            }
            let len = i - start;
            count += if len <= 4 { 1 } else { len.div_ceil(4) };
        } else if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            count += (i - start).div_ceil(3).max(1);
        } else {
            count += 1;
            i += 1;
        }
    }
    count.max(1)
}

/// 估算整段对话加上工具描述的 token 数
pub fn estimate_prompt_tokens(messages: &[Message], tools: &[ToolSchema]) -> usize {
    let mut total = 0;
    for message in messages {
        for part in &message.content {
            total += match part {
                ContentPart::Text { text } | ContentPart::Reasoning { text } => estimate_tokens(text),
                ContentPart::File { .. } => 0,
                ContentPart::ToolCall(call) => {
                    estimate_tokens(&call.tool_name) + estimate_tokens(&call.input.to_string())
                }
                ContentPart::ToolResult(result) => {
                    estimate_tokens(&result.tool_name) + estimate_output(&result.output)
                }
            };
        }
    }
    if !tools.is_empty() {
        let raw = serde_json::to_string(tools).unwrap_or_default();
        total += estimate_tokens(&raw);
    }
    total
}

fn estimate_output(output: &ToolResultOutput) -> usize {
    match output {
        ToolResultOutput::Text(text) | ToolResultOutput::ErrorText(text) => estimate_tokens(text),
        ToolResultOutput::Json(value) => estimate_tokens(&value.to_string()),
        ToolResultOutput::Content(_) => estimate_tokens(&output.to_plain_text()),
    }
}

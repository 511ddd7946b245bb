//! 对话记忆整理：压缩与大上下文裁剪

use std::collections::HashSet;

use async_trait::async_trait;
use tracing::debug;

use crate::config::TaskConfig;
use crate::error::Result;
use crate::llm::{RetryLanguageModel, ToolSchema};
use crate::message::{ContentPart, Message, Role, ToolResultContent, ToolResultOutput};
use crate::state::AgentContext;
use crate::utils::sub;

/// 对话压缩器
///
/// 调用方保证第一条是系统消息、第二条是初始用户消息，实现需要原样保留这两条。
#[async_trait]
pub trait MessageCompressor: Send + Sync {
    async fn compress(
        &self,
        ctx: &AgentContext,
        rlm: &RetryLanguageModel,
        messages: &mut Vec<Message>,
        tools: &[ToolSchema],
    ) -> Result<()>;
}

/// 只保留系统消息、初始用户消息和最近若干条消息
#[derive(Clone, Debug)]
pub struct TailWindowCompressor {
    keep_last: usize,
}

impl TailWindowCompressor {
    pub fn new(keep_last: usize) -> Self {
        Self {
            keep_last: keep_last.max(1),
        }
    }

    pub fn compress_messages(&self, messages: &mut Vec<Message>) -> usize {
        const HEAD: usize = 2;
        if messages.len() <= HEAD + self.keep_last + 1 {
            return 0;
        }
        let mut start = messages.len() - self.keep_last;
        // 工具结果不能脱离发起调用的助手消息
        while start > HEAD && messages[start].role == Role::Tool {
            start -= 1;
        }
        if start <= HEAD {
            return 0;
        }
        let omitted = start - HEAD;
        let tail = messages.split_off(start);
        messages.truncate(HEAD);
        messages.push(Message::user(format!(
            "[{omitted} earlier messages were omitted to keep the conversation within the context window]"
        )));
        messages.extend(tail);
        omitted
    }
}

impl Default for TailWindowCompressor {
    fn default() -> Self {
        Self::new(20)
    }
}

#[async_trait]
impl MessageCompressor for TailWindowCompressor {
    async fn compress(
        &self,
        ctx: &AgentContext,
        _rlm: &RetryLanguageModel,
        messages: &mut Vec<Message>,
        _tools: &[ToolSchema],
    ) -> Result<()> {
        let omitted = self.compress_messages(messages);
        debug!(agent = %ctx.agent_name, omitted, remaining = messages.len(), "Compressed agent messages");
        Ok(())
    }
}

fn media_placeholder(media_type: &str) -> &'static str {
    if media_type.starts_with("image/") {
        "[image]"
    } else {
        "[file]"
    }
}

/// 裁剪历史中的大块内容
///
/// 只保留最近 `max_dialogue_img_file_num` 个媒体附件，较早的替换为占位文本；
/// 除最后一条消息外，超长的工具文本结果会被截断。
pub fn handle_large_context_messages(messages: &mut [Message], config: &TaskConfig) {
    let mut media_seen = 0usize;
    let last = messages.len().saturating_sub(1);
    for (index, message) in messages.iter_mut().enumerate().rev() {
        for part in message.content.iter_mut().rev() {
            match part {
                ContentPart::File { media_type, .. } => {
                    media_seen += 1;
                    if media_seen > config.max_dialogue_img_file_num {
                        let placeholder = media_placeholder(media_type);
                        *part = ContentPart::text(placeholder);
                    }
                }
                ContentPart::ToolResult(result) => match &mut result.output {
                    ToolResultOutput::Content(items) => {
                        for item in items.iter_mut().rev() {
                            if let ToolResultContent::Media { media_type, .. } = item {
                                media_seen += 1;
                                if media_seen > config.max_dialogue_img_file_num {
                                    let placeholder = media_placeholder(media_type);
                                    *item = ToolResultContent::Text {
                                        text: placeholder.to_string(),
                                    };
                                }
                            }
                        }
                    }
                    ToolResultOutput::Text(text) | ToolResultOutput::ErrorText(text)
                        if index != last && text.chars().count() > config.large_text_length =>
                    {
                        *text = sub(text, config.large_text_length, true);
                    }
                    _ => {}
                },
                _ => {}
            }
        }
    }
}

/// 历史中调用过的工具，按首次出现顺序
pub fn extract_used_tool_names(messages: &[Message]) -> Vec<String> {
    let mut seen = HashSet::new();
    messages
        .iter()
        .filter(|message| message.role == Role::Assistant)
        .flat_map(|message| message.tool_calls())
        .filter(|call| seen.insert(call.tool_name.clone()))
        .map(|call| call.tool_name.clone())
        .collect()
}

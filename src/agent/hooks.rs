use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use serde_json::{Map, Value};
use tracing::warn;

use super::memory::handle_large_context_messages;
use super::prompt;
use super::Agent;
use crate::error::Result;
use crate::message::{ContentPart, Message, Role, ToolCallPart};
use crate::state::AgentContext;
use crate::tools::ToolRegistry;

/// 本轮是否拉取远端工具，以及附带的参数
#[derive(Clone, Debug, Default)]
pub struct McpToolControl {
    pub list: bool,
    pub params: Map<String, Value>,
}

/// agent 的可替换行为
#[async_trait]
pub trait AgentHooks: Send + Sync {
    async fn build_system_prompt(&self, agent: &Agent, ctx: &AgentContext, tools: &ToolRegistry) -> Result<String> {
        Ok(prompt::agent_system_prompt(agent, ctx, tools))
    }

    async fn build_user_prompt(
        &self,
        agent: &Agent,
        ctx: &AgentContext,
        _tools: &ToolRegistry,
    ) -> Result<Vec<ContentPart>> {
        Ok(vec![ContentPart::text(prompt::agent_user_prompt(agent, ctx))])
    }

    /// 每轮调用模型前整理消息
    async fn handle_messages(
        &self,
        ctx: &AgentContext,
        messages: &mut Vec<Message>,
        _tools: &ToolRegistry,
    ) -> Result<()> {
        handle_large_context_messages(messages, &ctx.task.config);
        Ok(())
    }

    fn can_parallel_tool_calls(&self, ctx: &AgentContext, _calls: &[ToolCallPart]) -> bool {
        ctx.task.config.parallel_tool_calls
    }

    fn control_mcp_tools(&self, _ctx: &AgentContext, _messages: &[Message], loop_num: u32) -> McpToolControl {
        McpToolControl {
            list: loop_num == 0,
            params: Map::new(),
        }
    }
}

#[derive(Default, Clone)]
pub struct DefaultHooks;

#[async_trait]
impl AgentHooks for DefaultHooks {}

pub struct Screenshot {
    pub data: Vec<u8>,
    pub media_type: String,
}

/// 截图来源，由宿主环境实现
#[async_trait]
pub trait ScreenshotProvider: Send + Sync {
    async fn screenshot(&self, ctx: &AgentContext) -> Result<Screenshot>;
}

/// 每次工具回合后附加最新截图
pub struct VisualFeedbackHooks {
    provider: Arc<dyn ScreenshotProvider>,
}

impl VisualFeedbackHooks {
    pub fn new(provider: Arc<dyn ScreenshotProvider>) -> Self {
        Self { provider }
    }
}

const SCREENSHOT_TEXT: &str = "This is the latest screenshot";

fn is_screenshot(message: &Message) -> bool {
    message.role == Role::User && message.content.iter().any(|part| part.as_text() == Some(SCREENSHOT_TEXT))
}

/// 最近一个工具回合之后还没有附加过截图
fn follows_tool_turn(messages: &[Message]) -> bool {
    for message in messages.iter().rev() {
        if message.role == Role::Assistant || is_screenshot(message) {
            return false;
        }
        if message.role == Role::Tool {
            return true;
        }
    }
    false
}

#[async_trait]
impl AgentHooks for VisualFeedbackHooks {
    async fn handle_messages(
        &self,
        ctx: &AgentContext,
        messages: &mut Vec<Message>,
        _tools: &ToolRegistry,
    ) -> Result<()> {
        if follows_tool_turn(messages) {
            match self.provider.screenshot(ctx).await {
                Ok(shot) => messages.push(Message {
                    role: Role::User,
                    content: vec![
                        ContentPart::File {
                            data: base64::engine::general_purpose::STANDARD.encode(&shot.data),
                            media_type: shot.media_type,
                        },
                        ContentPart::text(SCREENSHOT_TEXT),
                    ],
                }),
                Err(e) => warn!(agent = %ctx.agent_name, error = %e, "Failed to capture screenshot"),
            }
        }
        handle_large_context_messages(messages, &ctx.task.config);
        Ok(())
    }
}

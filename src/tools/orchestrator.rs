use futures::future;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::chain::ToolChain;
use crate::error::{Result, TaskFlowError};
use crate::events::StreamEvent;
use crate::message::{Message, ToolCallPart, ToolResultPart};
use crate::state::AgentContext;

use super::convert::convert_tool_result;
use super::registry::ToolRegistry;
use super::tool::ToolResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToolStrategy {
    Sequential,
    Parallel,
}

/// 一轮工具调用的产出
#[derive(Debug, Default)]
pub struct ToolBatchOutcome {
    /// 与调用顺序一致
    pub results: Vec<ToolResultPart>,
    /// 需要追加在工具消息之后的用户消息
    pub user_messages: Vec<Message>,
}

/// 执行一轮模型请求的工具调用
pub struct ToolOrchestrator<'a> {
    ctx: &'a AgentContext,
    registry: &'a ToolRegistry,
}

/// 工具参数可能是 JSON 文本或已解析的值
pub fn parse_tool_args(input: &Value) -> Result<Value> {
    match input {
        Value::Null => Ok(Value::Object(Default::default())),
        Value::String(raw) if raw.trim().is_empty() => Ok(Value::Object(Default::default())),
        Value::String(raw) => serde_json::from_str(raw)
            .map_err(|e| TaskFlowError::Serialization(format!("invalid tool arguments: {e}"))),
        other => Ok(other.clone()),
    }
}

impl<'a> ToolOrchestrator<'a> {
    pub fn new(ctx: &'a AgentContext, registry: &'a ToolRegistry) -> Self {
        Self { ctx, registry }
    }

    pub async fn execute(&self, calls: &[ToolCallPart], strategy: ToolStrategy) -> Result<ToolBatchOutcome> {
        // 先按调用顺序预留执行链槽位
        let slots: Vec<Option<usize>> = {
            let mut chain = self.ctx.task.chain.write();
            calls
                .iter()
                .map(|call| {
                    let params = parse_tool_args(&call.input).unwrap_or_else(|_| call.input.clone());
                    chain.push_tool(
                        self.ctx.chain_id,
                        ToolChain::new(call.tool_call_id.clone(), call.tool_name.clone(), params),
                    )
                })
                .collect()
        };

        let mut outcome = ToolBatchOutcome::default();
        match strategy {
            ToolStrategy::Sequential => {
                for (call, slot) in calls.iter().zip(slots) {
                    let (part, extra) = self.execute_call(call, slot).await?;
                    outcome.results.push(part);
                    outcome.user_messages.extend(extra);
                }
            }
            ToolStrategy::Parallel => {
                let futures = calls
                    .iter()
                    .zip(slots)
                    .map(|(call, slot)| self.execute_call(call, slot));
                for (part, extra) in future::try_join_all(futures).await? {
                    outcome.results.push(part);
                    outcome.user_messages.extend(extra);
                }
            }
        }
        Ok(outcome)
    }

    async fn run_tool(&self, call: &ToolCallPart) -> Result<ToolResult> {
        self.ctx.task.check_aborted()?;
        let tool = self
            .registry
            .get(&call.tool_name)
            .ok_or_else(|| TaskFlowError::ToolNotRegistered(call.tool_name.clone()))?;
        let args = parse_tool_args(&call.input)?;
        tool.execute(args, self.ctx, call).await
    }

    async fn execute_call(&self, call: &ToolCallPart, slot: Option<usize>) -> Result<(ToolResultPart, Vec<Message>)> {
        debug!(tool = %call.tool_name, id = %call.tool_call_id, "Executing tool call");
        let result = match self.run_tool(call).await {
            Ok(result) => {
                self.ctx.record_tool_success();
                result
            }
            Err(err) if err.is_aborted() => return Err(err),
            Err(err) => {
                let count = self.ctx.record_tool_failure();
                error!(tool = %call.tool_name, error = %err, consecutive = count, "Tool call failed");
                if count >= self.ctx.task.config.max_consecutive_tool_errors {
                    warn!(consecutive = count, "Too many consecutive tool failures, aborting node");
                    return Err(TaskFlowError::ConsecutiveToolFailures {
                        count,
                        last_error: err.to_string(),
                    });
                }
                ToolResult::error(err.to_string())
            }
        };

        if let Some(slot) = slot {
            self.ctx
                .task
                .chain
                .write()
                .set_tool_result(self.ctx.chain_id, slot, result.clone());
        }

        let params = parse_tool_args(&call.input).unwrap_or_else(|_| call.input.clone());
        self.ctx
            .emit(StreamEvent::ToolResult {
                tool_id: call.tool_call_id.clone(),
                tool_name: call.tool_name.clone(),
                params,
                result: result.clone(),
            })
            .await;

        let mut user_messages = Vec::new();
        let part = convert_tool_result(
            call,
            &result,
            self.ctx.task.config.tool_result_multimodal,
            &mut user_messages,
        );
        Ok((part, user_messages))
    }
}

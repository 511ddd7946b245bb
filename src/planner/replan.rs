use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{error, info};

use super::Planner;
use crate::chain::AgentChain;
use crate::error::{Result, TaskFlowError};
use crate::events::{DynStreamCallback, StreamCallback, StreamEvent, StreamMessage};
use crate::llm::{LlmRequest, ToolChoice, ToolSchema};
use crate::message::{ContentPart, Message, Role, ToolResultOutput};
use crate::state::TaskContext;
use crate::tools::parse_tool_args;
use crate::utils::sub;
use crate::workflow::{merge_workflow, Workflow};

pub const CHECK_TASK_STATUS_TOOL: &str = "check_task_status";

const CHECK_MAX_TOKENS: u32 = 512;

const REPLAN_CHECK_INSTRUCTIONS: &str = "# Task Replan Check\n\
Please review the plan for unexecuted tasks based on the results of partially executed tasks, and check whether it still meets the requirements of the current user task.\n\
If after executing some subtasks it is found that the previous plan has issues or is no longer the optimal solution, then the unexecuted task nodes need to be replanned; otherwise, replanning is not necessary.";

const REPLAN_INSTRUCTIONS: &str = "# Replan\n\
The previous plan is no longer suitable for the current task.\n\
Please reformulate the plan for unexecuted tasks based on the results of partially executed tasks to meet the requirements of the current task.\n\
Please do not output nodes that have already been executed. The new plan is an incremental update to the unexecuted plan nodes, and can use the results and variables from previously executed tasks.";

fn check_task_status_schema() -> ToolSchema {
    ToolSchema {
        name: CHECK_TASK_STATUS_TOOL.to_string(),
        description: "Check the task status, and based on the results of partially executed tasks, examine whether the unexecuted task nodes need to be replanned.".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "thinking": {
                    "type": "string",
                    "description": "Output the thinking process, analyzing whether the unexecuted task nodes need to be replanned.(100 words or less)"
                },
                "replan": {
                    "type": "boolean",
                    "description": "Whether the unexecuted task nodes need to be replanned. Replanning is only needed when the existing unexecuted nodes cannot meet the task requirements."
                }
            },
            "required": ["thinking", "replan"]
        }),
    }
}

fn tool_output_json(output: &ToolResultOutput) -> String {
    match output {
        ToolResultOutput::Text(text) | ToolResultOutput::ErrorText(text) => Value::String(text.clone()).to_string(),
        ToolResultOutput::Json(value) => value.to_string(),
        ToolResultOutput::Content(items) => serde_json::to_string(items).unwrap_or_default(),
    }
}

/// 把节点的请求消息压缩成执行进度
fn execution_progress(messages: &[Message]) -> Vec<String> {
    let mut lines = Vec::new();
    for (index, message) in messages.iter().enumerate() {
        match message.role {
            Role::User => {
                let limit = if index < 3 { 2000 } else { 500 };
                for text in message.content.iter().filter_map(ContentPart::as_text) {
                    if !text.is_empty() {
                        lines.push(format!("User: {}", sub(text, limit, true)));
                    }
                }
            }
            Role::Assistant => {
                for part in &message.content {
                    match part {
                        ContentPart::Text { text } if !text.is_empty() => {
                            lines.push(format!("Assistant: {}", sub(text, 500, true)));
                        }
                        ContentPart::ToolCall(call) => {
                            let params = if call.input.is_null() { json!({}) } else { call.input.clone() };
                            lines.push(format!("Call `{}` Tool Params: {}", call.tool_name, params));
                        }
                        _ => {}
                    }
                }
            }
            Role::Tool => {
                for part in &message.content {
                    if let ContentPart::ToolResult(result) = part {
                        lines.push(format!(
                            "Call `{}` Tool Result: {}",
                            result.tool_name,
                            sub(&tool_output_json(&result.output), 500, true)
                        ));
                    }
                }
            }
            Role::System => {}
        }
    }
    lines
}

/// 各节点的执行状态摘要
///
/// `current_node_id` 及其之前已有结果的节点显示结果，已发出请求的节点显示执行进度，其余显示未开始。
pub fn execution_summary(task: &TaskContext, current_node_id: &str) -> String {
    let Some(workflow) = task.workflow_snapshot() else {
        return String::new();
    };
    let chain = task.chain.read();
    let latest: HashMap<&str, &AgentChain> = chain
        .agents()
        .iter()
        .map(|record| (record.node_id.as_str(), record))
        .collect();

    let mut summary = String::new();
    let mut before = true;
    for agent in &workflow.agents {
        let record = latest.get(agent.id.as_str());
        summary.push_str(&format!("## {} Agent: {}\n", agent.name, agent.task));
        match record {
            Some(record) if before && record.result.is_some() => {
                summary.push_str("Executed, execution result:\n");
                summary.push_str(record.result.as_deref().unwrap_or_default());
            }
            Some(AgentChain {
                request: Some(request), ..
            }) => {
                summary.push_str("Currently executing, execution progress:\n");
                summary.push_str(&execution_progress(&request.messages).join("\n\n"));
            }
            _ => summary.push_str("Not started execution."),
        }
        summary.push_str("\n\n");
        if agent.id == current_node_id {
            before = false;
        }
    }
    summary.trim().to_string()
}

/// 预览合并结果后转发给下游的回调
struct MergingCallback {
    base: Workflow,
    current_index: usize,
    downstream: Option<DynStreamCallback>,
}

#[async_trait]
impl StreamCallback for MergingCallback {
    async fn on_message(&self, message: StreamMessage) {
        let Some(downstream) = &self.downstream else {
            return;
        };
        let message = match message.event {
            StreamEvent::Workflow { stream_done, workflow } => {
                let mut preview = self.base.clone();
                merge_workflow(&mut preview, &workflow, self.current_index);
                StreamMessage {
                    event: StreamEvent::Workflow {
                        stream_done,
                        workflow: preview,
                    },
                    ..message
                }
            }
            _ => message,
        };
        downstream.on_message(message).await;
    }
}

/// 执行中途判断并重写未执行的节点
pub struct Replanner {
    task: Arc<TaskContext>,
}

impl Replanner {
    pub fn new(task: Arc<TaskContext>) -> Self {
        Self { task }
    }

    /// 是否需要重规划；任何失败都按不需要处理
    pub async fn check_task_replan(&self, current_node_id: &str) -> bool {
        match self.try_check_task_replan(current_node_id).await {
            Ok(replan) => {
                info!(task_id = %self.task.task_id, node = %current_node_id, replan, "Replan check finished");
                replan
            }
            Err(e) => {
                error!(task_id = %self.task.task_id, error = %e, "Replan check failed");
                false
            }
        }
    }

    async fn try_check_task_replan(&self, current_node_id: &str) -> Result<bool> {
        let Some(mut messages) = Planner::new(self.task.clone()).previous_conversation() else {
            return Ok(false);
        };
        messages.push(Message::user(format!(
            "# Task Execution Status\n{}\n\n{}",
            execution_summary(&self.task, current_node_id),
            REPLAN_CHECK_INSTRUCTIONS
        )));
        let request = LlmRequest::new(messages)
            .with_tools(vec![check_task_status_schema()])
            .with_tool_choice(Some(ToolChoice::tool(CHECK_TASK_STATUS_TOOL)))
            .with_max_tokens(CHECK_MAX_TOKENS)
            .with_temperature(0.7);
        let response = self
            .task
            .plan_model()
            .call(&request, self.task.cancel_token())
            .await?;
        let call = response
            .content
            .iter()
            .find_map(|part| match part {
                ContentPart::ToolCall(call) => Some(call),
                _ => None,
            })
            .ok_or_else(|| TaskFlowError::Llm(format!("model did not call `{CHECK_TASK_STATUS_TOOL}`")))?;
        let args = parse_tool_args(&call.input)?;
        Ok(args.get("replan").and_then(Value::as_bool).unwrap_or(false))
    }

    /// 重新规划 `current_node_id` 之后的节点并合并进当前工作流
    pub async fn replan_workflow(&self, current_node_id: &str) -> Result<()> {
        let base = self
            .task
            .workflow_snapshot()
            .ok_or_else(|| TaskFlowError::Context("task has no workflow to replan".into()))?;
        let current_index = base.agent_position(current_node_id).ok_or_else(|| {
            TaskFlowError::InvalidWorkflow(format!("node `{current_node_id}` is not part of the workflow"))
        })?;

        let prompt = format!(
            "# Task Execution Status\n{}\n\n{}",
            execution_summary(&self.task, current_node_id),
            REPLAN_INSTRUCTIONS
        );
        let callback: DynStreamCallback = Arc::new(MergingCallback {
            base,
            current_index,
            downstream: self.task.callback.clone(),
        });
        let planner = Planner::new(self.task.clone()).with_callback(Some(callback));
        let replanned = match planner.previous_conversation() {
            Some(mut messages) => {
                messages.push(Message::user(prompt));
                planner.do_plan("", messages, true).await?
            }
            None => planner.plan(&prompt, true).await?,
        };

        let mut guard = self.task.workflow.write();
        let workflow = guard
            .as_mut()
            .ok_or_else(|| TaskFlowError::Context("task has no workflow to replan".into()))?;
        merge_workflow(workflow, &replanned, current_index);
        workflow.xml = self.task.codec.serialize(workflow);
        workflow.validate()?;
        info!(
            task_id = %self.task.task_id,
            node = %current_node_id,
            agents = workflow.agents.len(),
            "Workflow replanned"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ToolCallPart, ToolResultPart};

    #[test]
    fn progress_condenses_transcript() {
        let long = "x".repeat(600);
        let messages = vec![
            Message::system("sys"),
            Message::user("task"),
            Message::assistant(vec![
                ContentPart::text(long.clone()),
                ContentPart::ToolCall(ToolCallPart {
                    tool_call_id: "1".into(),
                    tool_name: "search".into(),
                    input: json!({"q": "rust"}),
                }),
            ]),
            Message::tool(vec![ToolResultPart {
                tool_call_id: "1".into(),
                tool_name: "search".into(),
                output: ToolResultOutput::Text("found".into()),
            }]),
            Message::user(long),
        ];
        let lines = execution_progress(&messages);
        assert_eq!(lines[0], "User: task");
        assert_eq!(lines[1], format!("Assistant: {}...", "x".repeat(500)));
        assert_eq!(lines[2], r#"Call `search` Tool Params: {"q":"rust"}"#);
        assert_eq!(lines[3], r#"Call `search` Tool Result: "found""#);
        assert_eq!(lines[4], format!("User: {}...", "x".repeat(500)));
    }
}

//! 专家模式下的两道检查：完成度校验与待办整理

use std::fmt::Write;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

use super::assembler::{call_agent_llm, CallOptions};
use super::memory::extract_used_tool_names;
use crate::error::{Result, TaskFlowError};
use crate::events::StreamEvent;
use crate::llm::{RetryLanguageModel, ToolSchema};
use crate::message::{ContentPart, Message, ToolCallPart};
use crate::state::AgentContext;
use crate::tools::{parse_tool_args, Tool, ToolResult};

pub const TASK_RESULT_CHECK_TOOL: &str = "task_result_check";
pub const TODO_LIST_MANAGER_TOOL: &str = "todo_list_manager";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionStatus {
    #[default]
    Completed,
    Incomplete,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskResultCheckArgs {
    #[serde(default)]
    completion_status: CompletionStatus,
    #[serde(default)]
    todo_list: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TodoListArgs {
    #[serde(default)]
    completed_list: Vec<String>,
    #[serde(default)]
    todo_list: Vec<String>,
    #[serde(default)]
    loop_detection: Option<String>,
}

pub struct TaskResultCheckTool;

#[async_trait]
impl Tool for TaskResultCheckTool {
    fn name(&self) -> &str {
        TASK_RESULT_CHECK_TOOL
    }

    fn description(&self) -> &str {
        "Check the current task execution process and results, evaluate the overall completion status of the current task, and whether the output variables in the nodes are stored."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "thought": {
                    "type": "string",
                    "description": "Analyze the overall execution process and results of the current task, and whether the task has been completed."
                },
                "completionStatus": {
                    "type": "string",
                    "description": "The task is only complete when the entire current task is finished; partial completion or failure is incomplete.",
                    "enum": ["completed", "incomplete"]
                },
                "todoList": {
                    "type": "string",
                    "description": "When the task is incomplete, describe which steps remain to be completed."
                }
            },
            "required": ["thought", "completionStatus"]
        })
    }

    async fn execute(&self, _args: Value, _ctx: &AgentContext, _call: &ToolCallPart) -> Result<ToolResult> {
        Ok(ToolResult::text("success"))
    }
}

pub struct TodoListManagerTool;

#[async_trait]
impl Tool for TodoListManagerTool {
    fn name(&self) -> &str {
        TODO_LIST_MANAGER_TOOL
    }

    fn description(&self) -> &str {
        "Manage the to-do list of the current task. Update the completed and pending items according to the execution status, and detect whether steps are being repeated in a loop."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "completedList": {
                    "type": "array",
                    "description": "Completed task list items, updated from the current execution status.",
                    "items": { "type": "string" }
                },
                "todoList": {
                    "type": "array",
                    "description": "Pending task list items, updated from the current execution status.",
                    "items": { "type": "string" }
                },
                "loopDetection": {
                    "type": "string",
                    "description": "Compare with previous steps and check whether the current step is being repeated.",
                    "enum": ["loop", "no_loop"]
                }
            },
            "required": ["completedList", "todoList", "loopDetection"]
        })
    }

    async fn execute(&self, _args: Value, _ctx: &AgentContext, _call: &ToolCallPart) -> Result<ToolResult> {
        Ok(ToolResult::text("success"))
    }
}

/// 已使用过的工具加上检查工具本身
fn gate_tools(messages: &[Message], tools: &[ToolSchema], gate: &dyn Tool) -> Vec<ToolSchema> {
    let used = extract_used_tool_names(messages);
    let mut schemas: Vec<ToolSchema> = tools
        .iter()
        .filter(|tool| tool.name != gate.name() && used.iter().any(|name| name == &tool.name))
        .cloned()
        .collect();
    schemas.push(gate.schema());
    schemas
}

fn check_prompt(ctx: &AgentContext) -> String {
    let task = if ctx.node.xml.trim().is_empty() {
        ctx.node.task.as_str()
    } else {
        ctx.node.xml.as_str()
    };
    format!("Task:\n{task}\n\nPlease check the completion status of the current task.")
}

/// 在消息副本上强制调用检查工具，返回解析后的参数
async fn run_gate(
    ctx: &AgentContext,
    rlm: &RetryLanguageModel,
    messages: &[Message],
    tools: &[ToolSchema],
    gate: &dyn Tool,
) -> Result<Value> {
    let mut check_messages = messages.to_vec();
    check_messages.push(Message::user(check_prompt(ctx)));
    let schemas = gate_tools(messages, tools, gate);
    let parts = call_agent_llm(ctx, rlm, &mut check_messages, &schemas, CallOptions::forced(gate.name())).await?;
    let call = parts
        .into_iter()
        .find_map(|part| match part {
            ContentPart::ToolCall(call) if call.tool_name == gate.name() => Some(call),
            _ => None,
        })
        .ok_or_else(|| TaskFlowError::Llm(format!("model did not call `{}`", gate.name())))?;
    let args = parse_tool_args(&call.input)?;
    let result = gate.execute(args.clone(), ctx, &call).await?;
    ctx.emit(StreamEvent::ToolResult {
        tool_id: call.tool_call_id.clone(),
        tool_name: call.tool_name.clone(),
        params: args.clone(),
        result,
    })
    .await;
    Ok(args)
}

/// 判定当前节点是否真正完成
///
/// 未完成时向对话追加剩余步骤；检查本身失败时按已完成处理。
pub async fn do_task_result_check(
    ctx: &AgentContext,
    rlm: &RetryLanguageModel,
    messages: &mut Vec<Message>,
    tools: &[ToolSchema],
) -> CompletionStatus {
    let outcome = async {
        let args = run_gate(ctx, rlm, messages, tools, &TaskResultCheckTool).await?;
        Ok::<_, TaskFlowError>(serde_json::from_value::<TaskResultCheckArgs>(args)?)
    }
    .await;
    match outcome {
        Ok(args) => {
            if args.completion_status == CompletionStatus::Incomplete {
                info!(agent = %ctx.agent_name, node = %ctx.node.id, "Task result check reported incomplete");
                messages.push(Message::user(format!(
                    "It seems that your task has not been fully completed. Please continue with the remaining steps:\n{}",
                    args.todo_list.unwrap_or_default()
                )));
            }
            args.completion_status
        }
        Err(e) => {
            error!(agent = %ctx.agent_name, error = %e, "Task result check failed");
            CompletionStatus::Completed
        }
    }
}

fn todo_status_prompt(args: &TodoListArgs) -> String {
    let mut prompt = String::from("# Task Execution Status\n");
    if !args.completed_list.is_empty() {
        prompt.push_str("## Completed task list\n");
        for item in &args.completed_list {
            let _ = writeln!(prompt, "- {item}");
        }
        prompt.push('\n');
    }
    if !args.todo_list.is_empty() {
        prompt.push_str("## Pending task list\n");
        for item in &args.todo_list {
            let _ = writeln!(prompt, "- {item}");
        }
        prompt.push('\n');
    }
    if args.loop_detection.as_deref() == Some("loop") {
        prompt.push_str(
            "## Loop detection\nIt seems that your task is being executed in a loop, Please change the execution strategy and try other methods to complete the current task.\n\n",
        );
    }
    prompt.push_str("Please continue executing the remaining tasks.");
    prompt.trim().to_string()
}

/// 整理待办并检测循环，结果作为用户消息追加；失败时不改动对话
pub async fn do_todo_list_manager(
    ctx: &AgentContext,
    rlm: &RetryLanguageModel,
    messages: &mut Vec<Message>,
    tools: &[ToolSchema],
) {
    let outcome = async {
        let args = run_gate(ctx, rlm, messages, tools, &TodoListManagerTool).await?;
        Ok::<_, TaskFlowError>(serde_json::from_value::<TodoListArgs>(args)?)
    }
    .await;
    match outcome {
        Ok(args) => messages.push(Message::user(todo_status_prompt(&args))),
        Err(e) => error!(agent = %ctx.agent_name, error = %e, "Todo list manager failed"),
    }
}

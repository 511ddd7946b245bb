use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use super::assembler::{call_agent_llm, CallOptions};
use super::gates::{do_task_result_check, do_todo_list_manager, CompletionStatus};
use super::memory::extract_used_tool_names;
use super::{Agent, FORCE_STOP_VARIABLE, UNFINISHED_RESULT};
use crate::error::Result;
use crate::mcp::{DynMcpClient, McpListToolParam};
use crate::message::{ContentPart, Message, Role, ToolCallPart};
use crate::state::{AgentContext, TaskContext};
use crate::tools::{DynTool, McpTool, ToolOrchestrator, ToolRegistry, ToolStrategy, VariableStorageTool};
use crate::workflow::WorkflowAgent;

impl Agent {
    /// 执行一个工作流节点，返回节点结果文本
    pub async fn run(self: &Arc<Self>, task: &Arc<TaskContext>, node: &WorkflowAgent) -> Result<String> {
        let chain_id = task.chain.write().push_agent(node);
        let ctx = AgentContext::new(task.clone(), self.name.clone(), node.clone(), chain_id);
        let mcp_client = self.mcp_client.clone().or_else(|| task.default_mcp_client.clone());
        info!(agent = %self.name, node = %node.id, "Agent started");

        let outcome = async {
            if let Some(client) = &mcp_client {
                if !client.is_connected() {
                    client.connect(task.cancel_token()).await?;
                }
            }
            self.run_with_context(&ctx, mcp_client.as_ref(), Vec::new()).await
        }
        .await;

        if let Some(client) = &mcp_client {
            if let Err(e) = client.close().await {
                warn!(agent = %self.name, error = %e, "Failed to close MCP client");
            }
        }

        let result = outcome.map_err(|e| {
            error!(agent = %self.name, node = %node.id, error = %e, "Agent failed");
            e
        })?;
        if let Some(record) = task.chain.write().agent_mut(chain_id) {
            record.result = Some(result.clone());
        }
        info!(agent = %self.name, node = %node.id, "Agent finished");
        Ok(result)
    }

    /// 节点固有的工具，按节点声明补充内置工具
    fn node_tools(&self, node: &WorkflowAgent) -> ToolRegistry {
        let mut tools = ToolRegistry::from(self.tools.clone());
        if VariableStorageTool::needed_for(&node.xml) && !tools.contains(crate::tools::VARIABLE_STORAGE_TOOL) {
            tools.register(Arc::new(VariableStorageTool));
        }
        tools
    }

    /// 推理-行动循环
    pub async fn run_with_context(
        &self,
        ctx: &AgentContext,
        mcp_client: Option<&DynMcpClient>,
        history: Vec<Message>,
    ) -> Result<String> {
        let config = ctx.task.config.clone();
        let node_tools = self.node_tools(&ctx.node);
        let system_prompt = self.hooks.build_system_prompt(self, ctx, &node_tools).await?;
        let user_prompt = self.hooks.build_user_prompt(self, ctx, &node_tools).await?;

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(Message::system(system_prompt));
        messages.extend(history);
        messages.push(Message {
            role: Role::User,
            content: user_prompt,
        });

        let rlm = ctx.task.retry_model(self.llms.as_deref());
        let mut agent_tools = node_tools.clone();
        let mut loop_num = 0u32;
        let mut check_num = 0u32;

        while loop_num < config.max_react_num {
            ctx.task.check_aborted()?;
            if let Some(client) = mcp_client {
                let control = self.hooks.control_mcp_tools(ctx, &messages, loop_num);
                if control.list {
                    let remote = self.list_mcp_tools(ctx, client, control.params).await;
                    let used = extract_used_tool_names(&messages);
                    let kept: Vec<DynTool> = agent_tools
                        .iter()
                        .filter(|tool| used.iter().any(|name| name == tool.name()))
                        .cloned()
                        .collect();
                    agent_tools = node_tools.merge(kept).merge(remote);
                }
            }

            self.hooks.handle_messages(ctx, &mut messages, &agent_tools).await?;
            let schemas = agent_tools.schemas();
            let results = call_agent_llm(ctx, &rlm, &mut messages, &schemas, CallOptions::default()).await?;

            if let Some(stop) = ctx.variables.get(FORCE_STOP_VARIABLE).await? {
                info!(agent = %self.name, "Force stop requested");
                return Ok(match stop {
                    Value::String(text) => text,
                    other => other.to_string(),
                });
            }

            let final_result = self.handle_call_result(ctx, &mut messages, &agent_tools, results).await?;
            loop_num += 1;
            let Some(final_result) = final_result else {
                if config.is_expert()
                    && config.expert_mode_todo_loop_num > 0
                    && loop_num % config.expert_mode_todo_loop_num == 0
                {
                    do_todo_list_manager(ctx, &rlm, &mut messages, &schemas).await;
                }
                continue;
            };
            if config.is_expert() && check_num == 0 {
                check_num += 1;
                let status = do_task_result_check(ctx, &rlm, &mut messages, &schemas).await;
                if status == CompletionStatus::Incomplete {
                    continue;
                }
            }
            return Ok(final_result);
        }
        warn!(agent = %self.name, loops = loop_num, "Iteration budget exhausted");
        Ok(UNFINISHED_RESULT.to_string())
    }

    /// 执行本轮工具调用；只有文本时返回最终结果
    async fn handle_call_result(
        &self,
        ctx: &AgentContext,
        messages: &mut Vec<Message>,
        tools: &ToolRegistry,
        results: Vec<ContentPart>,
    ) -> Result<Option<String>> {
        if results.is_empty() {
            debug!(agent = %self.name, "Empty model turn");
            return Ok(None);
        }
        let calls: Vec<ToolCallPart> = results
            .iter()
            .filter_map(|part| match part {
                ContentPart::ToolCall(call) => Some(call.clone()),
                _ => None,
            })
            .collect();
        if calls.is_empty() {
            let text = results
                .iter()
                .filter_map(ContentPart::as_text)
                .collect::<Vec<_>>()
                .join("\n\n");
            messages.push(Message::assistant(results));
            return Ok(Some(text));
        }

        let strategy = if calls.len() > 1 && self.hooks.can_parallel_tool_calls(ctx, &calls) {
            ToolStrategy::Parallel
        } else {
            ToolStrategy::Sequential
        };
        let outcome = ToolOrchestrator::new(ctx, tools).execute(&calls, strategy).await?;
        messages.push(Message::assistant(results));
        messages.push(Message::tool(outcome.results));
        messages.extend(outcome.user_messages);
        Ok(None)
    }

    /// 拉取远端工具；失败时返回空列表
    async fn list_mcp_tools(
        &self,
        ctx: &AgentContext,
        client: &DynMcpClient,
        params: Map<String, Value>,
    ) -> Vec<DynTool> {
        let cancel = ctx.task.cancel_token();
        let listed = async {
            if !client.is_connected() {
                client.connect(cancel).await?;
            }
            let prompt = if ctx.node.task.is_empty() {
                ctx.task.chain.read().task_prompt.clone()
            } else {
                ctx.node.task.clone()
            };
            client
                .list_tools(
                    McpListToolParam {
                        environment: ctx.task.config.platform.to_string(),
                        task_id: ctx.task.task_id.clone(),
                        node_id: Some(ctx.node.id.clone()),
                        agent_name: ctx.agent_name.clone(),
                        prompt,
                        params,
                    },
                    cancel,
                )
                .await
        }
        .await;
        match listed {
            Ok(schemas) => {
                debug!(agent = %self.name, count = schemas.len(), "Listed MCP tools");
                schemas
                    .into_iter()
                    .map(|schema| Arc::new(McpTool::new(schema, client.clone())) as DynTool)
                    .collect()
            }
            Err(e) => {
                error!(agent = %self.name, error = %e, "Failed to list MCP tools");
                Vec::new()
            }
        }
    }
}

pub mod assembler;
pub mod gates;
pub mod hooks;
pub mod memory;
pub mod prompt;
mod runner;

use std::sync::Arc;

use crate::mcp::DynMcpClient;
use crate::tools::DynTool;

pub use assembler::{call_agent_llm, AssembledTurn, CallOptions, StreamAssembler};
pub use gates::{do_task_result_check, do_todo_list_manager, CompletionStatus};
pub use hooks::{AgentHooks, DefaultHooks, McpToolControl, Screenshot, ScreenshotProvider, VisualFeedbackHooks};
pub use memory::{extract_used_tool_names, handle_large_context_messages, MessageCompressor, TailWindowCompressor};

/// 迭代预算耗尽时返回的结果
pub const UNFINISHED_RESULT: &str = "Unfinished";

/// 模型可通过该 agent 变量要求立即结束
pub const FORCE_STOP_VARIABLE: &str = "forceStop";

/// 可被规划器调度的 agent
pub struct Agent {
    pub name: String,
    pub description: String,
    pub plan_description: Option<String>,
    pub ext_sys_prompt: Option<String>,
    pub tools: Vec<DynTool>,
    pub llms: Option<Vec<String>>,
    pub mcp_client: Option<DynMcpClient>,
    pub hooks: Arc<dyn AgentHooks>,
}

impl Agent {
    pub fn new<N: Into<String>, D: Into<String>>(name: N, description: D) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            plan_description: None,
            ext_sys_prompt: None,
            tools: Vec::new(),
            llms: None,
            mcp_client: None,
            hooks: Arc::new(DefaultHooks),
        }
    }

    pub fn with_tool(mut self, tool: DynTool) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn with_tools(mut self, tools: Vec<DynTool>) -> Self {
        self.tools.extend(tools);
        self
    }

    pub fn with_llms(mut self, llms: Vec<String>) -> Self {
        self.llms = Some(llms);
        self
    }

    pub fn with_mcp_client(mut self, client: DynMcpClient) -> Self {
        self.mcp_client = Some(client);
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn AgentHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// 规划时展示给规划模型的描述，默认使用 `description`
    pub fn with_plan_description<T: Into<String>>(mut self, description: T) -> Self {
        self.plan_description = Some(description.into());
        self
    }

    pub fn with_ext_sys_prompt<T: Into<String>>(mut self, prompt: T) -> Self {
        self.ext_sys_prompt = Some(prompt.into());
        self
    }
}

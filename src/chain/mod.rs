//! 执行链：记录规划请求、每个 agent 的请求与结果以及每次工具调用

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::LlmRequest;
use crate::tools::ToolResult;
use crate::workflow::WorkflowAgent;

/// 链上 agent 记录的下标
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentChainId(usize);

impl AgentChainId {
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolChain {
    pub tool_call_id: String,
    pub tool_name: String,
    pub params: Value,
    #[serde(default)]
    pub result: Option<ToolResult>,
}

impl ToolChain {
    pub fn new<I: Into<String>, N: Into<String>>(tool_call_id: I, tool_name: N, params: Value) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            params,
            result: None,
        }
    }
}

/// 一次节点执行的记录，同一节点重复执行时会追加新记录
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentChain {
    pub node_id: String,
    pub agent_name: String,
    pub task: String,
    #[serde(default)]
    pub request: Option<LlmRequest>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub tools: Vec<ToolChain>,
}

impl AgentChain {
    pub fn new(node: &WorkflowAgent) -> Self {
        Self {
            node_id: node.id.clone(),
            agent_name: node.name.clone(),
            task: node.task.clone(),
            request: None,
            result: None,
            tools: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TaskChain {
    pub task_prompt: String,
    #[serde(default)]
    pub plan_request: Option<LlmRequest>,
    #[serde(default)]
    pub plan_result: Option<String>,
    agents: Vec<AgentChain>,
}

impl TaskChain {
    pub fn new<T: Into<String>>(task_prompt: T) -> Self {
        Self {
            task_prompt: task_prompt.into(),
            ..Default::default()
        }
    }

    pub fn push_agent(&mut self, node: &WorkflowAgent) -> AgentChainId {
        self.agents.push(AgentChain::new(node));
        AgentChainId(self.agents.len() - 1)
    }

    pub fn agent(&self, id: AgentChainId) -> Option<&AgentChain> {
        self.agents.get(id.0)
    }

    pub fn agent_mut(&mut self, id: AgentChainId) -> Option<&mut AgentChain> {
        self.agents.get_mut(id.0)
    }

    pub fn agents(&self) -> &[AgentChain] {
        &self.agents
    }

    /// 节点最近一次执行的记录
    pub fn latest_for_node(&self, node_id: &str) -> Option<&AgentChain> {
        self.agents.iter().rev().find(|agent| agent.node_id == node_id)
    }

    /// 预留一个工具记录槽位，返回槽位下标
    pub fn push_tool(&mut self, id: AgentChainId, tool: ToolChain) -> Option<usize> {
        let agent = self.agents.get_mut(id.0)?;
        agent.tools.push(tool);
        Some(agent.tools.len() - 1)
    }

    pub fn set_tool_result(&mut self, id: AgentChainId, slot: usize, result: ToolResult) {
        if let Some(tool) = self.agents.get_mut(id.0).and_then(|agent| agent.tools.get_mut(slot)) {
            tool.result = Some(result);
        }
    }

    /// 追加任务描述，保持去除首尾空白
    pub fn append_task_prompt(&mut self, prompt: &str) {
        self.task_prompt = format!("{}\n{}", self.task_prompt, prompt).trim().to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::AgentStatus;
    use serde_json::json;

    fn node(id: &str) -> WorkflowAgent {
        WorkflowAgent {
            id: id.into(),
            name: "Browser".into(),
            task: "look".into(),
            depends_on: vec![],
            xml: String::new(),
            status: AgentStatus::Init,
        }
    }

    #[test]
    fn tool_slots_keep_emission_order() {
        let mut chain = TaskChain::new("task");
        let id = chain.push_agent(&node("t-00"));
        let first = chain.push_tool(id, ToolChain::new("a", "x", json!({}))).unwrap();
        let second = chain.push_tool(id, ToolChain::new("b", "y", json!({}))).unwrap();
        chain.set_tool_result(id, second, ToolResult::text("second"));
        chain.set_tool_result(id, first, ToolResult::text("first"));
        let tools = &chain.agent(id).unwrap().tools;
        assert_eq!(tools[0].tool_call_id, "a");
        assert_eq!(tools[0].result.as_ref().unwrap().text_content(), "first");
    }

    #[test]
    fn latest_record_wins_for_repeated_node() {
        let mut chain = TaskChain::new("");
        chain.push_agent(&node("t-00"));
        let second = chain.push_agent(&node("t-00"));
        chain.agent_mut(second).unwrap().result = Some("again".into());
        assert_eq!(chain.latest_for_node("t-00").unwrap().result.as_deref(), Some("again"));
    }

    #[test]
    fn task_prompt_is_appended_and_trimmed() {
        let mut chain = TaskChain::new("");
        chain.append_task_prompt("first ");
        chain.append_task_prompt("second");
        assert_eq!(chain.task_prompt, "first \nsecond");
    }
}

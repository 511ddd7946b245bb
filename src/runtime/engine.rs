use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::types::TaskResult;
use crate::agent::{Agent, MessageCompressor};
use crate::config::TaskConfig;
use crate::error::{Result, TaskFlowError};
use crate::events::DynStreamCallback;
use crate::llm::LlmRegistry;
use crate::mcp::DynMcpClient;
use crate::planner::{Planner, Replanner};
use crate::state::{MemoryStore, TaskContext, VariableStore};
use crate::workflow::{AgentStatus, Workflow, WorkflowAgent, WorkflowCodec, XmlWorkflowCodec};

/// 按任务 id 创建变量存储
pub type VariableStoreFactory = Arc<dyn Fn(&str) -> Arc<dyn VariableStore> + Send + Sync>;

/// 任务引擎：规划、调度节点并汇总结果
pub struct TaskEngine {
    config: Arc<TaskConfig>,
    llms: LlmRegistry,
    plan_llms: Option<Vec<String>>,
    agents: Vec<Arc<Agent>>,
    callback: Option<DynStreamCallback>,
    compressor: Option<Arc<dyn MessageCompressor>>,
    default_mcp_client: Option<DynMcpClient>,
    codec: Arc<dyn WorkflowCodec>,
    variables: Option<VariableStoreFactory>,
    tasks: RwLock<HashMap<String, Arc<TaskContext>>>,
}

/// 状态为 Init 且依赖全部完成的节点
fn ready_nodes(workflow: &Workflow) -> Vec<WorkflowAgent> {
    workflow
        .agents
        .iter()
        .filter(|agent| agent.status == AgentStatus::Init)
        .filter(|agent| {
            agent.depends_on.iter().all(|dep| {
                workflow
                    .agent(dep)
                    .is_some_and(|node| node.status == AgentStatus::Done)
            })
        })
        .cloned()
        .collect()
}

impl TaskEngine {
    pub fn new(config: TaskConfig, llms: LlmRegistry) -> Self {
        Self {
            config: Arc::new(config),
            llms,
            plan_llms: None,
            agents: Vec::new(),
            callback: None,
            compressor: None,
            default_mcp_client: None,
            codec: Arc::new(XmlWorkflowCodec),
            variables: None,
            tasks: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_agent(mut self, agent: Agent) -> Self {
        self.agents.push(Arc::new(agent));
        self
    }

    pub fn with_callback(mut self, callback: DynStreamCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn with_compressor(mut self, compressor: Arc<dyn MessageCompressor>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    pub fn with_default_mcp_client(mut self, client: DynMcpClient) -> Self {
        self.default_mcp_client = Some(client);
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn WorkflowCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_plan_llms(mut self, names: Vec<String>) -> Self {
        self.plan_llms = Some(names);
        self
    }

    pub fn with_variables(mut self, factory: VariableStoreFactory) -> Self {
        self.variables = Some(factory);
        self
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    fn create_task(&self, task_id: String) -> Arc<TaskContext> {
        let variables = match &self.variables {
            Some(factory) => factory(&task_id),
            None => Arc::new(MemoryStore::new()) as Arc<dyn VariableStore>,
        };
        let task = TaskContext::new(task_id.clone(), self.config.clone(), self.llms.clone())
            .with_agents(self.agents.clone())
            .with_plan_llms(self.plan_llms.clone())
            .with_callback(self.callback.clone())
            .with_compressor(self.compressor.clone())
            .with_default_mcp_client(self.default_mcp_client.clone())
            .with_codec(self.codec.clone())
            .with_variables(variables);
        let task = Arc::new(task);
        self.tasks.write().insert(task_id, task.clone());
        task
    }

    /// 为任务生成工作流
    pub async fn generate(&self, task_prompt: &str, task_id: Option<String>) -> Result<Workflow> {
        let task_id = task_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let task = self.create_task(task_id);
        let workflow = Planner::new(task.clone()).plan(task_prompt, true).await?;
        *task.workflow.write() = Some(workflow.clone());
        Ok(workflow)
    }

    /// 基于已有规划对话修改工作流
    pub async fn modify(&self, task_id: &str, modify_prompt: &str) -> Result<Workflow> {
        let task = self.require_task(task_id)?;
        let workflow = Planner::new(task.clone()).replan(modify_prompt, true).await?;
        *task.workflow.write() = Some(workflow.clone());
        Ok(workflow)
    }

    /// 执行已生成的工作流
    pub async fn execute(&self, task_id: &str) -> Result<TaskResult> {
        let task = self.require_task(task_id)?;
        match self.execute_workflow(&task).await {
            Ok(result) => {
                info!(task_id = %task_id, "Task finished");
                Ok(TaskResult::done(task_id, result))
            }
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Task failed");
                Ok(TaskResult::failed(task_id, &e))
            }
        }
    }

    /// 规划并执行
    pub async fn run(&self, task_prompt: &str) -> Result<TaskResult> {
        let task_id = Uuid::new_v4().to_string();
        if let Err(e) = self.generate(task_prompt, Some(task_id.clone())).await {
            error!(task_id = %task_id, error = %e, "Planning failed");
            return Ok(TaskResult::failed(task_id, &e));
        }
        self.execute(&task_id).await
    }

    pub async fn abort_task(&self, task_id: &str) -> bool {
        let task = self.tasks.read().get(task_id).cloned();
        match task {
            Some(task) => {
                task.abort().await;
                true
            }
            None => false,
        }
    }

    /// 向运行中的任务追加用户指令，下一次模型调用前生效
    pub fn intervene<T: Into<String>>(&self, task_id: &str, instruction: T) -> bool {
        match self.tasks.read().get(task_id) {
            Some(task) => {
                task.push_conversation(instruction);
                true
            }
            None => false,
        }
    }

    pub fn task(&self, task_id: &str) -> Option<Arc<TaskContext>> {
        self.tasks.read().get(task_id).cloned()
    }

    pub fn delete_task(&self, task_id: &str) -> bool {
        self.tasks.write().remove(task_id).is_some()
    }

    fn require_task(&self, task_id: &str) -> Result<Arc<TaskContext>> {
        self.task(task_id)
            .ok_or_else(|| TaskFlowError::Context(format!("task `{task_id}` does not exist")))
    }

    async fn execute_workflow(&self, task: &Arc<TaskContext>) -> Result<String> {
        let workflow = task
            .workflow_snapshot()
            .ok_or_else(|| TaskFlowError::Context(format!("task `{}` has no workflow", task.task_id)))?;
        workflow.validate()?;

        loop {
            task.check_aborted()?;
            let Some(workflow) = task.workflow_snapshot() else {
                break;
            };
            let ready = ready_nodes(&workflow);
            if ready.is_empty() {
                if workflow.agents.iter().any(|agent| agent.status == AgentStatus::Init) {
                    warn!(task_id = %task.task_id, "Workflow has nodes that can never become ready");
                }
                break;
            }

            if task.config.agent_parallel && ready.len() > 1 {
                run_parallel(task, ready).await?;
                continue;
            }

            let node = &ready[0];
            run_node(task, node).await?;
            let is_last = workflow.agents.last().is_some_and(|last| last.id == node.id);
            if task.config.is_expert() && !workflow.modified && !is_last {
                let replanner = Replanner::new(task.clone());
                if replanner.check_task_replan(&node.id).await {
                    replanner.replan_workflow(&node.id).await?;
                }
            }
        }

        let workflow = task.workflow_snapshot().unwrap_or_default();
        let chain = task.chain.read();
        let result = workflow
            .agents
            .last()
            .and_then(|last| chain.latest_for_node(&last.id))
            .and_then(|record| record.result.clone())
            .unwrap_or_default();
        Ok(result)
    }
}

fn set_status(task: &TaskContext, node_id: &str, status: AgentStatus) {
    if let Some(workflow) = task.workflow.write().as_mut() {
        workflow.set_status(node_id, status);
    }
}

async fn run_node(task: &Arc<TaskContext>, node: &WorkflowAgent) -> Result<String> {
    let agent = task
        .find_agent(&node.name)
        .ok_or_else(|| TaskFlowError::Config(format!("agent `{}` is not registered", node.name)))?;
    set_status(task, &node.id, AgentStatus::Running);
    match agent.run(task, node).await {
        Ok(result) => {
            set_status(task, &node.id, AgentStatus::Done);
            Ok(result)
        }
        Err(e) => {
            set_status(task, &node.id, AgentStatus::Error);
            Err(e)
        }
    }
}

/// 同时执行一组互不依赖的就绪节点
async fn run_parallel(task: &Arc<TaskContext>, nodes: Vec<WorkflowAgent>) -> Result<()> {
    info!(task_id = %task.task_id, count = nodes.len(), "Running agents in parallel");
    let mut join_set = JoinSet::new();
    for node in nodes {
        let task = task.clone();
        join_set.spawn(async move { run_node(&task, &node).await });
    }
    let mut first_error = None;
    while let Some(joined) = join_set.join_next().await {
        let outcome = joined.map_err(|e| TaskFlowError::Other(e.into()));
        if let Err(e) = outcome.and_then(|result| result.map(|_| ())) {
            if first_error.is_none() {
                first_error = Some(e);
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::node_id;

    fn node(index: usize, deps: &[usize], status: AgentStatus) -> WorkflowAgent {
        WorkflowAgent {
            id: node_id("t", index),
            name: "Writer".into(),
            task: format!("step {index}"),
            depends_on: deps.iter().map(|dep| node_id("t", *dep)).collect(),
            xml: String::new(),
            status,
        }
    }

    #[test]
    fn ready_nodes_wait_for_dependencies() {
        let workflow = Workflow {
            task_id: "t".into(),
            agents: vec![
                node(0, &[], AgentStatus::Done),
                node(1, &[0], AgentStatus::Init),
                node(2, &[0], AgentStatus::Init),
                node(3, &[1, 2], AgentStatus::Init),
            ],
            ..Default::default()
        };
        let ids: Vec<_> = ready_nodes(&workflow).into_iter().map(|n| n.id).collect();
        assert_eq!(ids, vec!["t-01", "t-02"]);
    }
}

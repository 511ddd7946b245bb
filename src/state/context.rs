use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::store::{MemoryStore, VariableStore};
use crate::agent::{Agent, MessageCompressor};
use crate::chain::{AgentChainId, TaskChain};
use crate::config::TaskConfig;
use crate::error::{Result, TaskFlowError};
use crate::events::{DynStreamCallback, StreamEvent, StreamMessage};
use crate::llm::{LlmRegistry, RetryLanguageModel};
use crate::mcp::DynMcpClient;
use crate::workflow::{Workflow, WorkflowAgent, WorkflowCodec, XmlWorkflowCodec};

/// 任务上下文
///
/// 一个任务从规划到执行结束共享同一个实例。
pub struct TaskContext {
    pub task_id: String,
    pub config: Arc<TaskConfig>,
    pub llms: LlmRegistry,
    pub plan_llms: Option<Vec<String>>,
    pub agents: Vec<Arc<Agent>>,
    pub chain: RwLock<TaskChain>,
    pub workflow: RwLock<Option<Workflow>>,
    pub variables: Arc<dyn VariableStore>,
    pub callback: Option<DynStreamCallback>,
    pub compressor: Option<Arc<dyn MessageCompressor>>,
    pub default_mcp_client: Option<DynMcpClient>,
    pub codec: Arc<dyn WorkflowCodec>,
    conversation: Mutex<Vec<String>>,
    cancel: CancellationToken,
}

impl TaskContext {
    pub fn new<T: Into<String>>(task_id: T, config: Arc<TaskConfig>, llms: LlmRegistry) -> Self {
        Self {
            task_id: task_id.into(),
            config,
            llms,
            plan_llms: None,
            agents: Vec::new(),
            chain: RwLock::new(TaskChain::default()),
            workflow: RwLock::new(None),
            variables: Arc::new(MemoryStore::new()),
            callback: None,
            compressor: None,
            default_mcp_client: None,
            codec: Arc::new(XmlWorkflowCodec),
            conversation: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_agents(mut self, agents: Vec<Arc<Agent>>) -> Self {
        self.agents = agents;
        self
    }

    pub fn with_plan_llms(mut self, names: Option<Vec<String>>) -> Self {
        self.plan_llms = names;
        self
    }

    pub fn with_callback(mut self, callback: Option<DynStreamCallback>) -> Self {
        self.callback = callback;
        self
    }

    pub fn with_compressor(mut self, compressor: Option<Arc<dyn MessageCompressor>>) -> Self {
        self.compressor = compressor;
        self
    }

    pub fn with_variables(mut self, variables: Arc<dyn VariableStore>) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_default_mcp_client(mut self, client: Option<DynMcpClient>) -> Self {
        self.default_mcp_client = client;
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn WorkflowCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_workflow(self, workflow: Workflow) -> Self {
        *self.workflow.write() = Some(workflow);
        self
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn check_aborted(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(TaskFlowError::Aborted);
        }
        Ok(())
    }

    /// 取消任务并清空任务变量
    pub async fn abort(&self) {
        info!(task_id = %self.task_id, "Aborting task");
        self.cancel.cancel();
        if let Err(e) = self.variables.clear().await {
            warn!(task_id = %self.task_id, error = %e, "Failed to clear task variables");
        }
    }

    /// 用户在执行过程中追加的指令
    pub fn push_conversation<T: Into<String>>(&self, text: T) {
        self.conversation.lock().push(text.into());
    }

    pub fn take_conversation(&self) -> Vec<String> {
        std::mem::take(&mut *self.conversation.lock())
    }

    pub fn workflow_snapshot(&self) -> Option<Workflow> {
        self.workflow.read().clone()
    }

    pub fn find_agent(&self, name: &str) -> Option<Arc<Agent>> {
        self.agents
            .iter()
            .find(|agent| agent.name.eq_ignore_ascii_case(name))
            .cloned()
    }

    /// 按名称列表构造带回退的模型调用器
    pub fn retry_model(&self, names: Option<&[String]>) -> RetryLanguageModel {
        RetryLanguageModel::new(&self.llms, names)
            .with_first_chunk_timeout(Duration::from_millis(self.config.stream_first_chunk_timeout_ms))
    }

    pub fn plan_model(&self) -> RetryLanguageModel {
        self.retry_model(self.plan_llms.as_deref())
    }

    pub async fn emit(&self, agent_name: &str, node_id: Option<&str>, event: StreamEvent) {
        if let Some(callback) = &self.callback {
            callback
                .on_message(StreamMessage {
                    task_id: self.task_id.clone(),
                    agent_name: agent_name.to_string(),
                    node_id: node_id.map(str::to_string),
                    event,
                })
                .await;
        }
    }
}

/// 单个节点执行期间的上下文
pub struct AgentContext {
    pub task: Arc<TaskContext>,
    pub agent_name: String,
    pub node: WorkflowAgent,
    pub chain_id: AgentChainId,
    /// 只在本节点可见的变量
    pub variables: Arc<dyn VariableStore>,
    consecutive_errors: AtomicU32,
}

impl AgentContext {
    pub fn new<N: Into<String>>(
        task: Arc<TaskContext>,
        agent_name: N,
        node: WorkflowAgent,
        chain_id: AgentChainId,
    ) -> Self {
        Self {
            task,
            agent_name: agent_name.into(),
            node,
            chain_id,
            variables: Arc::new(MemoryStore::new()),
            consecutive_errors: AtomicU32::new(0),
        }
    }

    pub fn record_tool_success(&self) {
        self.consecutive_errors.store(0, Ordering::SeqCst);
    }

    /// 返回累加后的连续失败次数
    pub fn record_tool_failure(&self) -> u32 {
        self.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors.load(Ordering::SeqCst)
    }

    pub async fn emit(&self, event: StreamEvent) {
        self.task
            .emit(&self.agent_name, Some(&self.node.id), event)
            .await;
    }
}

pub mod agent;
pub mod chain;
pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod llm;
pub mod mcp;
pub mod message;
pub mod planner;
pub mod runtime;
pub mod state;
pub mod tools;
pub mod utils;
pub mod workflow;

pub use agent::{Agent, AgentHooks, DefaultHooks, MessageCompressor, TailWindowCompressor};
pub use chain::{AgentChain, TaskChain, ToolChain};
pub use config::{EnvConfig, TaskConfig};
pub use error::{Result, TaskFlowError};
pub use events::{DynStreamCallback, NoopCallback, RecordingCallback, StreamCallback, StreamEvent, StreamMessage};
#[cfg(feature = "openai-client")]
pub use llm::GenericHttpClient;
pub use llm::{DynLlmClient, LlmClient, LlmRegistry, LlmRequest, LlmResponse, LocalEchoClient, RetryLanguageModel};
pub use mcp::{DynMcpClient, McpClient, StdioMcpClient};
pub use message::{ContentPart, Message, Role};
pub use planner::{Planner, Replanner};
pub use runtime::{StopReason, TaskEngine, TaskResult};
pub use state::{AgentContext, MemoryStore, TaskContext, VariableStore};
pub use tools::{DynTool, Tool, ToolOrchestrator, ToolRegistry, ToolResult};
pub use utils::logging;
pub use workflow::{AgentStatus, Workflow, WorkflowAgent, WorkflowCodec, XmlWorkflowCodec};

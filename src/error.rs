use thiserror::Error;

pub type Result<T> = std::result::Result<T, TaskFlowError>;

#[derive(Debug, Error)]
pub enum TaskFlowError {
    #[error("operation was interrupted")]
    Aborted,
    #[error("LLM error: {0}")]
    Llm(String),
    #[error("all language models failed: {0}")]
    AllModelsFailed(String),
    #[error("tool `{0}` does not exist")]
    ToolNotRegistered(String),
    #[error("tool `{tool}` failed: {message}")]
    ToolExecution { tool: String, message: String },
    #[error("{count} consecutive tool call failures, last error: {last_error}")]
    ConsecutiveToolFailures { count: u32, last_error: String },
    #[error("MCP {method} error: {message}")]
    Protocol { method: String, message: String },
    #[error("MCP client is not connected")]
    McpNotConnected,
    #[error("planning failed: {0}")]
    Planning(String),
    #[error("workflow parse error: {0}")]
    WorkflowParse(String),
    #[error("invalid workflow: {0}")]
    InvalidWorkflow(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("context error: {0}")]
    Context(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TaskFlowError {
    pub fn is_aborted(&self) -> bool {
        matches!(self, TaskFlowError::Aborted)
    }

    /// 判断错误是否由上下文超长引起
    pub fn is_context_overflow(&self) -> bool {
        let text = self.to_string().to_lowercase();
        text.contains("is too long")
            || text.contains("context length")
            || text.contains("maximum context")
    }
}

impl From<serde_json::Error> for TaskFlowError {
    fn from(err: serde_json::Error) -> Self {
        TaskFlowError::Serialization(err.to_string())
    }
}

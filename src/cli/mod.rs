use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing::warn;

use crate::agent::Agent;
use crate::config::TaskConfig;
use crate::error::Result;
use crate::events::{StreamCallback, StreamEvent, StreamMessage};
use crate::llm::{DynLlmClient, LlmRegistry, LocalEchoClient};

#[derive(Parser)]
#[command(name = "taskflow", version, about = "TaskFlow multi-agent task engine", author)]
pub struct Cli {
    /// JSON task config file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    /// OpenAI-compatible endpoint
    #[arg(long, global = true, env = "TASKFLOW_BASE_URL")]
    pub base_url: Option<String>,
    #[arg(long, global = true, env = "TASKFLOW_MODEL", default_value = "gpt-4o-mini")]
    pub model: String,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Plan a task and print the workflow
    Plan { prompt: String },
    /// Plan and execute a task
    Run { prompt: String },
    /// Estimate the token cost of a text
    Tokens { text: String },
    /// List the tools exposed by a stdio MCP server
    McpTools {
        #[arg(long)]
        command: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

/// 读取配置文件并应用环境变量覆盖
pub fn load_config(path: Option<&Path>) -> Result<TaskConfig> {
    let config = match path {
        Some(path) => TaskConfig::from_file(path)?,
        None => TaskConfig::default(),
    };
    config.apply_env_overrides()
}

/// 按命令行参数构造模型表
///
/// 未配置 `TASKFLOW_API_KEY` 时退回本地回显模型。
pub fn build_llms(base_url: Option<&str>, model: &str) -> LlmRegistry {
    let mut llms = LlmRegistry::new();
    let client = remote_client(base_url, model).unwrap_or_else(|| {
        warn!("No remote model configured, falling back to the local echo client");
        Arc::new(LocalEchoClient) as DynLlmClient
    });
    llms.insert("default".to_string(), client);
    llms
}

#[cfg(feature = "openai-client")]
fn remote_client(base_url: Option<&str>, model: &str) -> Option<DynLlmClient> {
    use crate::config::EnvConfig;
    use crate::llm::GenericHttpClient;

    let api_key = EnvConfig::get_env_optional("TASKFLOW_API_KEY")?;
    let base_url = base_url.unwrap_or("https://api.openai.com/v1");
    Some(Arc::new(GenericHttpClient::new(base_url, api_key, model)))
}

#[cfg(not(feature = "openai-client"))]
fn remote_client(_base_url: Option<&str>, _model: &str) -> Option<DynLlmClient> {
    None
}

/// 命令行默认注册的通用 agent
pub fn default_agent() -> Agent {
    Agent::new(
        "Assistant",
        "A general-purpose assistant that completes text tasks such as research summaries, writing and analysis.",
    )
}

/// 把进度事件打印到终端
#[derive(Default, Clone)]
pub struct ConsoleCallback;

#[async_trait]
impl StreamCallback for ConsoleCallback {
    async fn on_message(&self, message: StreamMessage) {
        match &message.event {
            StreamEvent::Text {
                stream_done: true,
                text,
                ..
            } => println!("[{}] {}", message.agent_name, text),
            StreamEvent::ToolUse { tool_name, params, .. } => {
                println!("[{}] -> {} {}", message.agent_name, tool_name, params)
            }
            StreamEvent::ToolResult { tool_name, result, .. } => {
                let status = if result.is_error { "failed" } else { "ok" };
                println!("[{}] <- {} {}", message.agent_name, tool_name, status)
            }
            StreamEvent::Workflow {
                stream_done: true,
                workflow,
            } => println!("[{}] workflow `{}` with {} agents", message.agent_name, workflow.name, workflow.agents.len()),
            StreamEvent::Error { error } => eprintln!("[{}] error: {}", message.agent_name, error),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_default_model() {
        let llms = build_llms(None, "gpt-4o-mini");
        assert!(llms.contains_key("default"));
    }

    #[test]
    fn parses_mcp_tools_arguments() {
        let cli = Cli::parse_from(["taskflow", "mcp-tools", "--command", "node", "server.js", "--stdio"]);
        match cli.command {
            Command::McpTools { command, args } => {
                assert_eq!(command, "node");
                assert_eq!(args, vec!["server.js", "--stdio"]);
            }
            _ => panic!("expected mcp-tools"),
        }
    }
}

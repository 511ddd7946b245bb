use std::sync::Arc;

use clap::Parser;
use taskflow::cli::{build_llms, default_agent, load_config, Cli, Command, ConsoleCallback};
use taskflow::llm::estimate_tokens;
use taskflow::mcp::{McpClient, McpListToolParam, StdioMcpClient};
use taskflow::utils::LoggingConfig;
use taskflow::TaskEngine;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    LoggingConfig::init();

    let cli = Cli::parse();
    match cli.command {
        Command::Tokens { text } => {
            println!("{}", estimate_tokens(&text));
        }
        Command::McpTools { command, args } => handle_mcp_tools(command, args).await?,
        Command::Plan { prompt } => {
            let config = load_config(cli.config.as_deref())?;
            let engine = TaskEngine::new(config, build_llms(cli.base_url.as_deref(), &cli.model))
                .with_agent(default_agent())
                .with_callback(Arc::new(ConsoleCallback));
            let workflow = engine.generate(&prompt, None).await?;
            println!("{}", workflow.xml);
        }
        Command::Run { prompt } => {
            let config = load_config(cli.config.as_deref())?;
            let engine = TaskEngine::new(config, build_llms(cli.base_url.as_deref(), &cli.model))
                .with_agent(default_agent())
                .with_callback(Arc::new(ConsoleCallback));
            let result = engine.run(&prompt).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.success {
                std::process::exit(1);
            }
        }
    }
    Ok(())
}

async fn handle_mcp_tools(command: String, args: Vec<String>) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let client = StdioMcpClient::new(command, args);
    client.connect(&cancel).await?;
    let listed = client
        .list_tools(
            McpListToolParam {
                environment: "cli".to_string(),
                ..Default::default()
            },
            &cancel,
        )
        .await;
    client.close().await?;
    for tool in listed? {
        println!("{}\t{}", tool.name, tool.description.unwrap_or_default());
    }
    Ok(())
}

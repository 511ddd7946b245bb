use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::types::{McpCallToolParam, McpListToolParam, McpToolSchema};
use crate::error::Result;
use crate::tools::ToolResult;

/// 远程工具服务客户端
#[async_trait]
pub trait McpClient: Send + Sync {
    async fn connect(&self, cancel: &CancellationToken) -> Result<()>;

    async fn list_tools(
        &self,
        param: McpListToolParam,
        cancel: &CancellationToken,
    ) -> Result<Vec<McpToolSchema>>;

    async fn call_tool(&self, param: McpCallToolParam, cancel: &CancellationToken) -> Result<ToolResult>;

    fn is_connected(&self) -> bool;

    async fn close(&self) -> Result<()>;
}

pub type DynMcpClient = Arc<dyn McpClient>;

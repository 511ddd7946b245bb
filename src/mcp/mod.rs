//! 远程工具服务（MCP）客户端

pub mod client;
pub mod pending;
pub mod stdio;
pub mod types;

pub use client::{DynMcpClient, McpClient};
pub use pending::PendingRequests;
pub use stdio::StdioMcpClient;
pub use types::{McpCallToolParam, McpExtInfo, McpListToolParam, McpToolSchema};

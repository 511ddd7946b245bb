use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::Result;
use crate::mcp::{DynMcpClient, McpCallToolParam, McpExtInfo, McpToolSchema};
use crate::message::ToolCallPart;
use crate::state::AgentContext;

use super::tool::{Tool, ToolResult};

/// 把远端工具包装成本地工具
pub struct McpTool {
    schema: McpToolSchema,
    description: String,
    client: DynMcpClient,
}

impl McpTool {
    pub fn new(schema: McpToolSchema, client: DynMcpClient) -> Self {
        let description = schema.description.clone().unwrap_or_default();
        Self {
            schema,
            description,
            client,
        }
    }
}

#[async_trait]
impl Tool for McpTool {
    fn name(&self) -> &str {
        &self.schema.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> Value {
        if self.schema.input_schema.is_null() {
            json!({ "type": "object", "properties": {} })
        } else {
            self.schema.input_schema.clone()
        }
    }

    async fn execute(&self, args: Value, ctx: &AgentContext, _call: &ToolCallPart) -> Result<ToolResult> {
        let param = McpCallToolParam {
            name: self.schema.name.clone(),
            arguments: args,
            ext_info: Some(McpExtInfo {
                task_id: ctx.task.task_id.clone(),
                node_id: Some(ctx.node.id.clone()),
                environment: ctx.task.config.platform.to_string(),
                agent_name: ctx.agent_name.clone(),
            }),
        };
        self.client.call_tool(param, ctx.task.cancel_token()).await
    }
}

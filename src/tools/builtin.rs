use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{Result, TaskFlowError};
use crate::message::ToolCallPart;
use crate::state::AgentContext;

use super::tool::{Tool, ToolResult};

pub const VARIABLE_STORAGE_TOOL: &str = "variable_storage";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum VariableOperation {
    ReadVariable,
    WriteVariable,
    ListAllVariable,
}

#[derive(Debug, Deserialize)]
struct VariableArgs {
    operation: VariableOperation,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    value: Option<Value>,
}

/// 在节点之间读写任务级变量
#[derive(Default, Clone)]
pub struct VariableStorageTool;

impl VariableStorageTool {
    /// 节点声明了输入或输出变量时才需要该工具
    pub fn needed_for(node_xml: &str) -> bool {
        node_xml.contains("input=") || node_xml.contains("output=")
    }
}

#[async_trait]
impl Tool for VariableStorageTool {
    fn name(&self) -> &str {
        VARIABLE_STORAGE_TOOL
    }

    fn description(&self) -> &str {
        "Read, write or list task variables shared between agents. Use it to pass data declared with input/output attributes."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "operation": {
                    "type": "string",
                    "enum": ["read_variable", "write_variable", "list_all_variable"]
                },
                "name": {
                    "type": "string",
                    "description": "Variable name, separate multiple names with commas when reading"
                },
                "value": {
                    "type": "string",
                    "description": "Value to write"
                }
            },
            "required": ["operation"]
        })
    }

    async fn execute(&self, args: Value, ctx: &AgentContext, _call: &ToolCallPart) -> Result<ToolResult> {
        let args: VariableArgs = serde_json::from_value(args)?;
        let store = &ctx.task.variables;
        match args.operation {
            VariableOperation::ReadVariable => {
                let names = args
                    .name
                    .ok_or_else(|| TaskFlowError::ToolExecution {
                        tool: VARIABLE_STORAGE_TOOL.into(),
                        message: "name is required".into(),
                    })?;
                let mut values = serde_json::Map::new();
                for name in names.split(',').map(str::trim).filter(|n| !n.is_empty()) {
                    values.insert(name.to_string(), store.get(name).await?.unwrap_or(Value::Null));
                }
                Ok(ToolResult::text(Value::Object(values).to_string()))
            }
            VariableOperation::WriteVariable => {
                let name = args.name.filter(|n| !n.trim().is_empty()).ok_or_else(|| {
                    TaskFlowError::ToolExecution {
                        tool: VARIABLE_STORAGE_TOOL.into(),
                        message: "name is required".into(),
                    }
                })?;
                store.set(name.trim(), args.value.unwrap_or(Value::Null)).await?;
                Ok(ToolResult::text("success"))
            }
            VariableOperation::ListAllVariable => {
                let keys = store.keys().await?;
                Ok(ToolResult::text(Value::from(keys).to_string()))
            }
        }
    }
}

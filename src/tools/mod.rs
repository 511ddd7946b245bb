pub mod builtin;
pub mod convert;
pub mod mcp_tool;
pub mod orchestrator;
pub mod registry;
pub mod tool;

pub use builtin::{VariableStorageTool, VARIABLE_STORAGE_TOOL};
pub use convert::convert_tool_result;
pub use mcp_tool::McpTool;
pub use orchestrator::{parse_tool_args, ToolBatchOutcome, ToolOrchestrator, ToolStrategy};
pub use registry::ToolRegistry;
pub use tool::{DynTool, Tool, ToolContent, ToolResult};

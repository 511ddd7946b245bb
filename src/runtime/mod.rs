//! 任务运行时：规划后按依赖调度工作流节点

mod engine;
mod types;

pub use engine::{TaskEngine, VariableStoreFactory};
pub use types::{StopReason, TaskResult};

// 状态管理模块

mod context;
mod store;

pub use context::{AgentContext, TaskContext};
#[cfg(feature = "redis-store")]
pub use store::redis::RedisStore;
pub use store::{MemoryStore, VariableStore};

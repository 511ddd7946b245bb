pub mod env;
pub mod task_config;

pub use env::EnvConfig;
pub use task_config::{ExecutionMode, Platform, TaskConfig};

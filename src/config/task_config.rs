use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::env::EnvConfig;
use crate::error::{Result, TaskFlowError};

/// 执行模式
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Fast,
    #[default]
    Normal,
    Expert,
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fast" => Ok(ExecutionMode::Fast),
            "normal" => Ok(ExecutionMode::Normal),
            "expert" => Ok(ExecutionMode::Expert),
            other => Err(format!("unknown execution mode `{other}`")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Windows,
    #[default]
    Mac,
    Linux,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Platform::Windows => "windows",
            Platform::Mac => "mac",
            Platform::Linux => "linux",
        };
        f.write_str(name)
    }
}

/// 任务配置
///
/// 在任务创建时传入，贯穿整个任务生命周期，不存在进程级全局配置。
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    pub name: String,
    pub mode: ExecutionMode,
    pub platform: Platform,
    pub max_react_num: u32,
    pub max_tokens: u32,
    pub max_retry_num: u32,
    pub agent_parallel: bool,
    /// 按消息条数触发压缩的阈值
    pub compress_threshold: usize,
    /// 按估算 token 数触发压缩的阈值
    pub compress_tokens_threshold: usize,
    pub compress_min_messages: usize,
    pub large_text_length: usize,
    pub max_dialogue_img_file_num: usize,
    pub tool_result_multimodal: bool,
    pub parallel_tool_calls: bool,
    pub expert_mode_todo_loop_num: u32,
    pub max_consecutive_tool_errors: u32,
    pub plan_max_retries: u32,
    pub plan_retry_delay_ms: u64,
    pub retry_base_delay_ms: u64,
    pub stream_first_chunk_timeout_ms: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            name: "TaskFlow".to_string(),
            mode: ExecutionMode::Normal,
            platform: Platform::Mac,
            max_react_num: 500,
            max_tokens: 16000,
            max_retry_num: 3,
            agent_parallel: false,
            compress_threshold: 80,
            compress_tokens_threshold: 80000,
            compress_min_messages: 10,
            large_text_length: 8000,
            max_dialogue_img_file_num: 1,
            tool_result_multimodal: true,
            parallel_tool_calls: true,
            expert_mode_todo_loop_num: 10,
            max_consecutive_tool_errors: 10,
            plan_max_retries: 3,
            plan_retry_delay_ms: 1000,
            retry_base_delay_ms: 300,
            stream_first_chunk_timeout_ms: 30000,
        }
    }
}

impl TaskConfig {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: TaskConfig = serde_json::from_str(raw)
            .map_err(|e| TaskFlowError::Config(format!("failed to parse task config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }

    /// 使用环境变量覆盖配置项
    pub fn apply_env_overrides(mut self) -> Result<Self> {
        if let Some(mode) = EnvConfig::parse_env::<ExecutionMode>("TASKFLOW_MODE")? {
            self.mode = mode;
        }
        if let Some(value) = EnvConfig::parse_env::<u32>("TASKFLOW_MAX_REACT_NUM")? {
            self.max_react_num = value;
        }
        if let Some(value) = EnvConfig::parse_env::<u32>("TASKFLOW_MAX_RETRY_NUM")? {
            self.max_retry_num = value;
        }
        if let Some(value) = EnvConfig::parse_env::<bool>("TASKFLOW_AGENT_PARALLEL")? {
            self.agent_parallel = value;
        }
        if let Some(value) = EnvConfig::parse_env::<bool>("TASKFLOW_PARALLEL_TOOL_CALLS")? {
            self.parallel_tool_calls = value;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_react_num == 0 {
            return Err(TaskFlowError::Config("max_react_num must be positive".into()));
        }
        if self.expert_mode_todo_loop_num == 0 {
            return Err(TaskFlowError::Config(
                "expert_mode_todo_loop_num must be positive".into(),
            ));
        }
        if self.max_consecutive_tool_errors == 0 {
            return Err(TaskFlowError::Config(
                "max_consecutive_tool_errors must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn is_expert(&self) -> bool {
        self.mode == ExecutionMode::Expert
    }
}

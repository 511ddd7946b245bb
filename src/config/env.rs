use crate::error::{Result, TaskFlowError};
use std::env;
use std::str::FromStr;

/// 环境变量配置管理
pub struct EnvConfig;

impl EnvConfig {
    /// 获取 API Key，支持从环境变量或配置中获取
    ///
    /// 优先级：
    /// 1. 直接传入的 api_key 参数（如果不以 ${} 包裹）
    /// 2. 环境变量（如果 api_key 以 ${VAR_NAME} 格式）
    /// 3. 默认环境变量
    pub fn get_api_key(api_key: &str, default_env_var: &str) -> Result<String> {
        if api_key.starts_with("${") && api_key.ends_with('}') {
            let env_var_name = &api_key[2..api_key.len() - 1];
            Self::get_env(env_var_name)
        } else if api_key.is_empty() || api_key.starts_with("your_") {
            Self::get_env(default_env_var)
        } else {
            Ok(api_key.to_string())
        }
    }

    /// 从环境变量获取值
    pub fn get_env(key: &str) -> Result<String> {
        env::var(key).map_err(|_| {
            TaskFlowError::Config(format!(
                "environment variable '{}' is not set",
                key
            ))
        })
    }

    /// 获取可选的环境变量
    pub fn get_env_optional(key: &str) -> Option<String> {
        env::var(key).ok().filter(|value| !value.trim().is_empty())
    }

    /// 解析可选的环境变量，解析失败时返回错误
    pub fn parse_env<T>(key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match Self::get_env_optional(key) {
            Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
                TaskFlowError::Config(format!("invalid value for {}: {} ({})", key, raw, e))
            }),
            None => Ok(None),
        }
    }

    /// 检查是否启用调试模式
    pub fn is_debug_mode() -> bool {
        env::var("TASKFLOW_DEBUG").is_ok()
    }
}

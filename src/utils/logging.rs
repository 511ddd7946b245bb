use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::EnvConfig;

/// 日志配置
pub struct LoggingConfig;

impl LoggingConfig {
    /// 初始化日志系统
    ///
    /// 支持通过环境变量配置：
    /// - RUST_LOG: 设置日志级别（error, warn, info, debug, trace）
    /// - TASKFLOW_DEBUG: 启用详细调试输出
    ///
    /// 重复调用时保留第一次安装的订阅者，返回 `false`。
    pub fn init() -> bool {
        let is_debug = Self::is_debug();

        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            if is_debug {
                EnvFilter::new("taskflow=debug,info")
            } else {
                EnvFilter::new("taskflow=info,warn")
            }
        });

        let fmt_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(is_debug)
            .with_file(is_debug)
            .with_line_number(is_debug)
            .with_thread_ids(is_debug);

        let installed = tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .is_ok();

        if installed && is_debug {
            tracing::debug!("Debug logging enabled");
        }
        installed
    }

    /// 初始化日志系统（带自定义过滤器）
    pub fn init_with_filter(filter: &str) -> bool {
        tracing_subscriber::registry()
            .with(EnvFilter::new(filter))
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()
            .is_ok()
    }

    /// 检查是否启用调试模式
    pub fn is_debug() -> bool {
        EnvConfig::is_debug_mode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_is_debug() {
        env::remove_var("TASKFLOW_DEBUG");
        assert!(!LoggingConfig::is_debug());

        env::set_var("TASKFLOW_DEBUG", "1");
        assert!(LoggingConfig::is_debug());

        env::remove_var("TASKFLOW_DEBUG");
    }

    #[test]
    fn second_init_is_harmless() {
        LoggingConfig::init_with_filter("taskflow=warn");
        assert!(!LoggingConfig::init_with_filter("taskflow=warn"));
    }
}

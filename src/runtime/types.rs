use serde::{Deserialize, Serialize};

use crate::error::TaskFlowError;

/// 任务结束原因
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopReason {
    Done,
    Abort,
    Error,
}

/// 任务执行结果
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub success: bool,
    pub stop_reason: StopReason,
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskResult {
    pub fn done<I: Into<String>, R: Into<String>>(task_id: I, result: R) -> Self {
        Self {
            task_id: task_id.into(),
            success: true,
            stop_reason: StopReason::Done,
            result: result.into(),
            error: None,
        }
    }

    pub fn failed<I: Into<String>>(task_id: I, error: &TaskFlowError) -> Self {
        let stop_reason = if error.is_aborted() {
            StopReason::Abort
        } else {
            StopReason::Error
        };
        Self {
            task_id: task_id.into(),
            success: false,
            stop_reason,
            result: String::new(),
            error: Some(error.to_string()),
        }
    }
}

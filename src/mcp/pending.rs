use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use super::types::JsonRpcResponse;

/// 按请求 id 等待响应的挂起表
#[derive(Default)]
pub struct PendingRequests {
    waiters: Mutex<HashMap<String, oneshot::Sender<JsonRpcResponse>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: &str) -> oneshot::Receiver<JsonRpcResponse> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(id.to_string(), tx);
        rx
    }

    /// 把响应交给对应的等待者，未知 id 和重复响应直接忽略
    pub fn resolve(&self, response: JsonRpcResponse) -> bool {
        let Some(id) = response.id_key() else {
            trace!("Ignoring JSON-RPC message without id");
            return false;
        };
        match self.waiters.lock().remove(&id) {
            Some(tx) => tx.send(response).is_ok(),
            None => {
                debug!(id = %id, "Ignoring response for unknown request id");
                false
            }
        }
    }

    pub fn remove(&self, id: &str) {
        self.waiters.lock().remove(id);
    }

    /// 丢弃全部等待者，接收端会立刻得到通道关闭
    pub fn clear(&self) {
        self.waiters.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 处理子进程输出的一行，只接受以 `{` 开头的 JSON
    pub fn handle_line(&self, line: &str) -> bool {
        let line = line.trim();
        if !line.starts_with('{') {
            return false;
        }
        match serde_json::from_str::<JsonRpcResponse>(line) {
            Ok(response) => self.resolve(response),
            Err(e) => {
                debug!(error = %e, "Ignoring malformed JSON-RPC line");
                false
            }
        }
    }
}

/// 离开作用域时移除挂起项
pub(crate) struct PendingGuard<'a> {
    pending: &'a PendingRequests,
    id: String,
}

impl<'a> PendingGuard<'a> {
    pub(crate) fn new(pending: &'a PendingRequests, id: String) -> Self {
        Self { pending, id }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

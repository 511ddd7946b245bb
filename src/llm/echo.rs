use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::client::LlmClient;
use super::types::{LlmRequest, LlmResponse};
use crate::error::Result;
use crate::message::Role;

/// 回显最后一条用户消息，用于离线演练
#[derive(Default, Clone)]
pub struct LocalEchoClient;

#[async_trait]
impl LlmClient for LocalEchoClient {
    async fn call(&self, request: &LlmRequest, _cancel: &CancellationToken) -> Result<LlmResponse> {
        let user = request
            .messages
            .iter()
            .rev()
            .find(|message| message.role == Role::User)
            .map(|message| message.text())
            .unwrap_or_default();
        Ok(LlmResponse::text(format!("[Echo] {}", user)))
    }
}

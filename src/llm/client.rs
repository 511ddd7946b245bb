use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::types::{LlmRequest, LlmResponse, LlmStream};
use crate::error::Result;

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn call(&self, request: &LlmRequest, cancel: &CancellationToken) -> Result<LlmResponse>;

    /// 默认实现：一次性调用后展开为分片流
    async fn call_stream(&self, request: &LlmRequest, cancel: &CancellationToken) -> Result<LlmStream> {
        let response = self.call(request, cancel).await?;
        let chunks = response.into_chunks().into_iter().map(Ok);
        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}

pub type DynLlmClient = Arc<dyn LlmClient>;

/// 按名称注册的模型端点
pub type LlmRegistry = HashMap<String, DynLlmClient>;

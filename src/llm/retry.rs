use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::client::{DynLlmClient, LlmRegistry};
use super::types::{LlmRequest, LlmResponse, LlmStream, StreamChunk};
use crate::error::{Result, TaskFlowError};

const DEFAULT_MODEL: &str = "default";

/// 按顺序在多个模型端点之间回退的调用器
///
/// 流式调用会先等待首个分片，首个分片超时、报错或流为空都视为该端点失败。
#[derive(Clone)]
pub struct RetryLanguageModel {
    endpoints: Vec<(String, DynLlmClient)>,
    first_chunk_timeout: Duration,
}

impl RetryLanguageModel {
    /// `names` 为空时优先使用 `default`，其余端点按名称排序
    pub fn new(registry: &LlmRegistry, names: Option<&[String]>) -> Self {
        let endpoints = match names {
            Some(names) if !names.is_empty() => names
                .iter()
                .filter_map(|name| match registry.get(name) {
                    Some(client) => Some((name.clone(), client.clone())),
                    None => {
                        warn!(model = %name, "Language model is not registered, skipping");
                        None
                    }
                })
                .collect(),
            _ => {
                let mut names: Vec<&String> = registry.keys().collect();
                names.sort_by(|a, b| {
                    (a.as_str() != DEFAULT_MODEL, a.as_str()).cmp(&(b.as_str() != DEFAULT_MODEL, b.as_str()))
                });
                names
                    .into_iter()
                    .filter_map(|name| registry.get(name).map(|client| (name.clone(), client.clone())))
                    .collect()
            }
        };
        Self {
            endpoints,
            first_chunk_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_first_chunk_timeout(mut self, timeout: Duration) -> Self {
        self.first_chunk_timeout = timeout;
        self
    }

    pub fn names(&self) -> Vec<&str> {
        self.endpoints.iter().map(|(name, _)| name.as_str()).collect()
    }

    fn ensure_endpoints(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(TaskFlowError::Config("no language model configured".into()));
        }
        Ok(())
    }

    pub async fn call(&self, request: &LlmRequest, cancel: &CancellationToken) -> Result<LlmResponse> {
        self.ensure_endpoints()?;
        let mut last_error = String::new();
        for (name, client) in &self.endpoints {
            if cancel.is_cancelled() {
                return Err(TaskFlowError::Aborted);
            }
            match client.call(request, cancel).await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_aborted() => return Err(err),
                Err(err) => {
                    warn!(model = %name, error = %err, "LLM call failed, trying next model");
                    last_error = err.to_string();
                }
            }
        }
        Err(TaskFlowError::AllModelsFailed(last_error))
    }

    pub async fn call_stream(&self, request: &LlmRequest, cancel: &CancellationToken) -> Result<LlmStream> {
        self.ensure_endpoints()?;
        let mut last_error = String::new();
        for (name, client) in &self.endpoints {
            if cancel.is_cancelled() {
                return Err(TaskFlowError::Aborted);
            }
            let mut stream = match client.call_stream(request, cancel).await {
                Ok(stream) => stream,
                Err(err) if err.is_aborted() => return Err(err),
                Err(err) => {
                    warn!(model = %name, error = %err, "LLM stream request failed, trying next model");
                    last_error = err.to_string();
                    continue;
                }
            };

            let first = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TaskFlowError::Aborted),
                first = tokio::time::timeout(self.first_chunk_timeout, stream.next()) => first,
            };
            match first {
                Ok(Some(Ok(StreamChunk::Error { error }))) => {
                    warn!(model = %name, error = %error, "LLM stream started with an error");
                    last_error = error;
                }
                Ok(Some(Ok(chunk))) => {
                    debug!(model = %name, "LLM stream established");
                    let head = futures::stream::iter(std::iter::once(Ok(chunk)));
                    return Ok(Box::pin(head.chain(stream)));
                }
                Ok(Some(Err(err))) => {
                    if err.is_aborted() {
                        return Err(err);
                    }
                    warn!(model = %name, error = %err, "LLM stream failed before first chunk");
                    last_error = err.to_string();
                }
                Ok(None) => {
                    warn!(model = %name, "LLM stream ended without any chunk");
                    last_error = format!("model `{name}` returned an empty stream");
                }
                Err(_) => {
                    warn!(model = %name, timeout_ms = self.first_chunk_timeout.as_millis() as u64, "LLM stream first chunk timed out");
                    last_error = format!("model `{name}` timed out waiting for first chunk");
                }
            }
        }
        Err(TaskFlowError::AllModelsFailed(last_error))
    }
}

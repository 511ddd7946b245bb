pub mod client;
pub mod echo;
#[cfg(feature = "openai-client")]
pub mod http;
pub mod retry;
pub mod tokens;
pub mod types;

pub use client::{DynLlmClient, LlmClient, LlmRegistry};
pub use echo::LocalEchoClient;
#[cfg(feature = "openai-client")]
pub use http::{GenericHttpClient, SseParser};
pub use retry::RetryLanguageModel;
pub use tokens::{estimate_prompt_tokens, estimate_tokens};
pub use types::{
    FinishReason, LlmRequest, LlmResponse, LlmStream, StreamChunk, ToolChoice, ToolSchema, Usage,
};

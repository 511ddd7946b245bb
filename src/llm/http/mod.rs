//! HTTP 客户端实现模块
//!
//! - `GenericHttpClient`: OpenAI 兼容的 chat/completions 客户端，支持流式和工具调用
//! - `SseParser`: SSE 流式响应解析器

pub mod generic;
pub mod stream;

pub use generic::GenericHttpClient;
pub use stream::SseParser;

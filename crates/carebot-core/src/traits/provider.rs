//! Chat model provider trait.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::Result;
use crate::types::{Message, StreamEvent, ToolDefinition};

/// Boxed stream of provider events.
pub type ProviderStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

/// Generation parameters for a single model call.
#[derive(Debug, Clone)]
pub struct GenerateParams {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for GenerateParams {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".into(),
            temperature: 0.2,
            max_tokens: 1024,
        }
    }
}

/// A language model reachable over some API.
///
/// Given a prompt and the available tools, `chat_stream` yields answer text
/// and assembled tool calls as they arrive.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    async fn chat_stream(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        params: &GenerateParams,
    ) -> Result<ProviderStream>;

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

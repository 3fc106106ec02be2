//! # Carebot Providers
//!
//! Chat and embedding providers for Carebot.
//!
//! Every supported backend (OpenAI, OpenRouter, DeepSeek, Groq, Together,
//! Mistral, Ollama, llama.cpp, vLLM, or a `custom:<url>` endpoint) speaks the
//! OpenAI dialect and is handled by a single `OpenAiCompatibleProvider`.

pub mod openai_compatible;
pub mod provider_registry;
pub mod stream;

use std::sync::Arc;

use carebot_core::config::{CarebotConfig, LlmConfig};
use carebot_core::error::{CarebotError, Result};
use carebot_core::traits::{Embedder, Provider};

use openai_compatible::{OpenAiCompatibleProvider, OpenAiEmbedder};

fn build(llm: &LlmConfig) -> Result<OpenAiCompatibleProvider> {
    let name = llm.provider.as_str();
    if name.starts_with("custom:") {
        return OpenAiCompatibleProvider::custom(name, llm);
    }
    let registry = provider_registry::get_provider_config(name)
        .ok_or_else(|| CarebotError::ProviderNotFound(name.into()))?;
    OpenAiCompatibleProvider::from_registry(registry, llm)
}

/// Create the chat provider from configuration.
pub fn create_provider(config: &CarebotConfig) -> Result<Arc<dyn Provider>> {
    let provider = build(&config.llm)?;
    tracing::info!("Chat provider: {} ({})", provider_name(&config.llm), config.llm.model);
    Ok(Arc::new(provider))
}

/// Create the embedder; it shares the chat provider's endpoint and key.
pub fn create_embedder(config: &CarebotConfig) -> Result<Arc<dyn Embedder>> {
    let provider = build(&config.llm)?;
    Ok(Arc::new(OpenAiEmbedder::new(
        provider,
        config.embedding.model.clone(),
        config.embedding.dimensions,
    )))
}

fn provider_name(llm: &LlmConfig) -> &str {
    if llm.provider.starts_with("custom:") {
        "custom"
    } else {
        &llm.provider
    }
}

/// List all available provider names.
pub fn available_providers() -> Vec<&'static str> {
    let mut names = provider_registry::all_provider_names();
    names.push("custom");
    names
}

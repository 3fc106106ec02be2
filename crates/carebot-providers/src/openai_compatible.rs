//! Unified OpenAI-compatible provider.
//!
//! One struct handles streamed chat completions and embeddings
//! for every backend in the registry. Backends are distinguished only by
//! endpoint URL, auth style and API key.

use std::time::Duration;

use async_trait::async_trait;
use carebot_core::config::LlmConfig;
use carebot_core::error::{CarebotError, Result};
use carebot_core::traits::Embedder;
use carebot_core::traits::provider::{GenerateParams, Provider, ProviderStream};
use carebot_core::types::{Message, StreamEvent, ToolDefinition};
use futures::StreamExt;
use serde_json::{Value, json};

use crate::provider_registry::{AuthStyle, ProviderConfig};
use crate::stream::{DeltaAccumulator, SseDecoder};

/// A provider that works with any OpenAI-compatible API.
#[derive(Clone)]
pub struct OpenAiCompatibleProvider {
    /// Provider name (e.g. "openai", "groq", "ollama").
    name: String,
    api_key: String,
    /// Base URL (e.g. "https://api.openai.com/v1").
    base_url: String,
    chat_path: String,
    embeddings_path: String,
    auth_style: AuthStyle,
    request_timeout: Duration,
    client: reqwest::Client,
}

fn build_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| CarebotError::Http(format!("Failed to build HTTP client: {e}")))
}

impl OpenAiCompatibleProvider {
    /// Create from a registry entry.
    ///
    /// Resolution order:
    /// - API key: `llm.api_key` > env vars > empty
    /// - Base URL: `llm.endpoint` > env override > registry default
    pub fn from_registry(registry: &ProviderConfig, llm: &LlmConfig) -> Result<Self> {
        let api_key = if !llm.api_key.is_empty() {
            llm.api_key.clone()
        } else {
            registry
                .env_keys
                .iter()
                .find_map(|key| std::env::var(key).ok())
                .unwrap_or_default()
        };

        let base_url = if !llm.endpoint.is_empty() {
            llm.endpoint.trim_end_matches('/').to_string()
        } else {
            registry
                .base_url_env
                .and_then(|env_key| {
                    let val = std::env::var(env_key).ok()?;
                    // OLLAMA_HOST / LLAMACPP_HOST are usually given without /v1
                    if val.ends_with("/v1") {
                        Some(val)
                    } else {
                        Some(format!("{}/v1", val.trim_end_matches('/')))
                    }
                })
                .unwrap_or_else(|| registry.base_url.to_string())
        };

        Ok(Self {
            name: registry.name.to_string(),
            api_key,
            base_url,
            chat_path: registry.chat_path.to_string(),
            embeddings_path: registry.embeddings_path.to_string(),
            auth_style: registry.auth_style,
            request_timeout: Duration::from_secs(llm.request_timeout_secs),
            client: build_client()?,
        })
    }

    /// Create for a custom endpoint (e.g. "custom:https://my-server.com/v1").
    pub fn custom(endpoint: &str, llm: &LlmConfig) -> Result<Self> {
        let base_url = endpoint
            .strip_prefix("custom:")
            .unwrap_or(endpoint)
            .trim_end_matches('/')
            .to_string();
        if base_url.is_empty() {
            return Err(CarebotError::Config("custom provider needs a URL".into()));
        }

        let api_key = if !llm.api_key.is_empty() {
            llm.api_key.clone()
        } else {
            std::env::var("CUSTOM_API_KEY").unwrap_or_default()
        };
        let auth_style = if api_key.is_empty() {
            AuthStyle::None
        } else {
            AuthStyle::Bearer
        };

        Ok(Self {
            name: "custom".to_string(),
            api_key,
            base_url,
            chat_path: "/chat/completions".to_string(),
            embeddings_path: "/embeddings".to_string(),
            auth_style,
            request_timeout: Duration::from_secs(llm.request_timeout_secs),
            client: build_client()?,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn apply_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.auth_style {
            AuthStyle::Bearer if !self.api_key.is_empty() => {
                req.header("Authorization", format!("Bearer {}", self.api_key))
            }
            _ => req,
        }
    }

    fn ensure_key(&self) -> Result<()> {
        if self.auth_style != AuthStyle::None && self.api_key.is_empty() {
            return Err(CarebotError::ApiKeyMissing(self.name.clone()));
        }
        Ok(())
    }

    /// POST a JSON body and return the response if its status is a success.
    async fn post(&self, path: &str, body: &Value) -> Result<reqwest::Response> {
        self.ensure_key()?;
        let url = format!("{}{}", self.base_url, path);
        let req = self
            .client
            .post(&url)
            .timeout(self.request_timeout)
            .header("Content-Type", "application/json")
            .json(body);
        let resp = self
            .apply_auth(req)
            .send()
            .await
            .map_err(|e| request_error(&self.name, &url, e))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(CarebotError::from_status(&self.name, status.as_u16(), &text));
        }
        Ok(resp)
    }
}

/// Timeouts, refused connections and connections dropped mid-request are
/// retryable; everything else (bad URL, builder errors) is not.
fn request_error(provider: &str, url: &str, e: reqwest::Error) -> CarebotError {
    if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
        CarebotError::Transient(format!("{provider} request to {url} failed: {e}"))
    } else {
        CarebotError::Http(format!("{provider} connection failed ({url}): {e}"))
    }
}

/// Build a streamed chat-completions request body.
pub fn chat_body(messages: &[Message], tools: &[ToolDefinition], params: &GenerateParams) -> Result<Value> {
    let mut body = json!({
        "model": params.model,
        "temperature": params.temperature,
        "max_tokens": params.max_tokens,
        "stream": true,
        "messages": serde_json::to_value(messages)?,
    });
    if !tools.is_empty() {
        let tool_defs: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();
        body["tools"] = Value::Array(tool_defs);
    }
    Ok(body)
}

/// Parse `data[i].embedding` from an embeddings response, ordered by `index`.
pub fn parse_embeddings(json: &Value) -> Result<Vec<Vec<f32>>> {
    let data = json["data"]
        .as_array()
        .ok_or_else(|| CarebotError::Provider("No data in embeddings response".into()))?;

    let mut rows: Vec<(u64, Vec<f32>)> = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let values = item["embedding"]
            .as_array()
            .ok_or_else(|| CarebotError::Provider("embedding entry without vector".into()))?;
        let vector = values
            .iter()
            .map(|v| v.as_f64().map(|f| f as f32))
            .collect::<Option<Vec<f32>>>()
            .ok_or_else(|| CarebotError::Provider("non-numeric embedding value".into()))?;
        rows.push((item["index"].as_u64().unwrap_or(pos as u64), vector));
    }
    rows.sort_by_key(|(index, _)| *index);
    Ok(rows.into_iter().map(|(_, v)| v).collect())
}

#[async_trait]
impl Provider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat_stream(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        params: &GenerateParams,
    ) -> Result<ProviderStream> {
        let body = chat_body(messages, tools, params)?;
        let resp = self.post(&self.chat_path, &body).await?;
        let name = self.name.clone();
        let mut bytes = resp.bytes_stream();

        let stream = async_stream::stream! {
            let mut decoder = SseDecoder::default();
            let mut acc = DeltaAccumulator::default();

            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let err = if e.is_timeout() {
                            CarebotError::Transient(format!("{name} stream timed out: {e}"))
                        } else {
                            CarebotError::Http(format!("{name} stream interrupted: {e}"))
                        };
                        yield Err(err);
                        return;
                    }
                };
                for data in decoder.push(&chunk) {
                    match acc.apply(&data) {
                        Ok(events) => {
                            for event in events {
                                yield Ok(event);
                            }
                        }
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }
                if acc.is_finished() {
                    return;
                }
            }

            if let Some(data) = decoder.finish() {
                match acc.apply(&data) {
                    Ok(events) => {
                        for event in events {
                            yield Ok(event);
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
            // Servers that close without [DONE] still get a terminal event
            for event in acc.finish() {
                yield Ok::<StreamEvent, CarebotError>(event);
            }
        };

        Ok(Box::pin(stream))
    }

    async fn health_check(&self) -> Result<bool> {
        if self.auth_style != AuthStyle::None {
            return Ok(!self.api_key.is_empty());
        }
        // Local servers: try to connect
        let url = format!("{}/models", self.base_url);
        let resp = self.client.get(&url).send().await;
        Ok(resp.is_ok())
    }
}

/// Embeddings through the same OpenAI-compatible endpoint.
pub struct OpenAiEmbedder {
    provider: OpenAiCompatibleProvider,
    model: String,
    dimensions: usize,
}

impl OpenAiEmbedder {
    pub fn new(provider: OpenAiCompatibleProvider, model: impl Into<String>, dimensions: usize) -> Self {
        Self {
            provider,
            model: model.into(),
            dimensions,
        }
    }

    pub fn request_body(&self, texts: &[String]) -> Value {
        json!({
            "model": self.model,
            "input": texts,
            "dimensions": self.dimensions,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn name(&self) -> &str {
        &self.provider.name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = self.request_body(texts);
        let resp = self
            .provider
            .post(&self.provider.embeddings_path, &body)
            .await?;
        let json: Value = resp
            .json()
            .await
            .map_err(|e| CarebotError::Transient(format!("embeddings response unreadable: {e}")))?;
        parse_embeddings(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider_registry::get_provider_config;

    #[test]
    fn test_chat_body_with_tools() {
        let tools = vec![ToolDefinition {
            name: "QueryKnowledgeBaseTool".into(),
            description: "Search the medical knowledge base".into(),
            parameters: json!({"type": "object"}),
        }];
        let body = chat_body(
            &[Message::system("protocol"), Message::user("I feel dizzy")],
            &tools,
            &GenerateParams::default(),
        )
        .unwrap();
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["tools"][0]["function"]["name"], "QueryKnowledgeBaseTool");

        let plain = chat_body(&[Message::user("hi")], &[], &GenerateParams::default()).unwrap();
        assert!(plain.get("tools").is_none());
    }

    #[test]
    fn test_parse_embeddings_orders_by_index() {
        let json = json!({"data": [
            {"index": 1, "embedding": [0.0, 1.0]},
            {"index": 0, "embedding": [1.0, 0.0]}
        ]});
        assert_eq!(parse_embeddings(&json).unwrap(), vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
        assert!(parse_embeddings(&json!({"error": "x"})).is_err());
    }

    #[test]
    fn test_endpoint_override_and_embedding_body() {
        let llm = LlmConfig {
            endpoint: "http://localhost:9999/v1/".into(),
            api_key: "sk-test".into(),
            ..Default::default()
        };
        let provider = OpenAiCompatibleProvider::from_registry(get_provider_config("openai").unwrap(), &llm).unwrap();
        assert_eq!(provider.base_url(), "http://localhost:9999/v1");

        let embedder = OpenAiEmbedder::new(provider, "text-embedding-3-small", 256);
        let body = embedder.request_body(&["cough".to_string()]);
        assert_eq!(body["dimensions"], 256);
        assert_eq!(body["input"][0], "cough");
        assert_eq!(embedder.dimensions(), 256);
    }

    #[tokio::test]
    async fn test_missing_key_is_reported_before_any_request() {
        let llm = LlmConfig {
            api_key: String::new(),
            ..Default::default()
        };
        let mut provider = OpenAiCompatibleProvider::from_registry(get_provider_config("groq").unwrap(), &llm).unwrap();
        // Env may carry a real key; clear it on the instance
        provider.api_key.clear();
        let Err(err) = provider
            .chat_stream(&[Message::user("hi")], &[], &GenerateParams::default())
            .await
        else {
            panic!("expected a missing-key error");
        };
        assert!(matches!(err, CarebotError::ApiKeyMissing(_)));
    }

    #[tokio::test]
    async fn test_dropped_connection_is_transient() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((socket, _)) = listener.accept().await {
                drop(socket);
            }
        });

        let url = format!("http://{addr}/v1/embeddings");
        let err = reqwest::Client::new()
            .post(&url)
            .body("{}")
            .send()
            .await
            .unwrap_err();
        assert!(request_error("test", &url, err).is_transient());
    }

    #[test]
    fn test_custom_endpoint() {
        let provider = OpenAiCompatibleProvider::custom("custom:http://127.0.0.1:5000/v1/", &LlmConfig::default()).unwrap();
        assert_eq!(provider.base_url(), "http://127.0.0.1:5000/v1");
        assert!(OpenAiCompatibleProvider::custom("custom:", &LlmConfig::default()).is_err());
    }
}

//! Error type shared across all Carebot crates.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CarebotError>;

#[derive(Debug, Error)]
pub enum CarebotError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Provider not found: {0}")]
    ProviderNotFound(String),

    #[error("API key missing for provider: {0}")]
    ApiKeyMissing(String),

    /// Timeout, connection reset or 5xx.
    #[error("Transient provider failure: {0}")]
    Transient(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Embedding failed for batch {batch} after {attempts} attempt(s): {reason}")]
    EmbeddingFailed {
        batch: usize,
        attempts: u32,
        reason: String,
        /// The last failure was retryable, so `attempts` hit the limit.
        transient: bool,
    },

    #[error("Vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Chat {0} does not exist")]
    ChatNotFound(String),

    #[error("Chat {0} already exists")]
    ChatExists(String),

    #[error("Chat {id} is corrupted: {reason}")]
    CorruptChat { id: String, reason: String },

    #[error("Tool error: {0}")]
    Tool(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl CarebotError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CarebotError::Transient(_) | CarebotError::RateLimited(_)
        )
    }

    /// Whether a retryable failure used up its bounded retry loop.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, CarebotError::EmbeddingFailed { transient: true, .. })
    }

    /// Classify an HTTP status returned by a provider.
    pub fn from_status(provider: &str, status: u16, body: &str) -> Self {
        match status {
            429 => CarebotError::RateLimited(format!("{provider}: {body}")),
            500..=599 => CarebotError::Transient(format!("{provider} API error {status}: {body}")),
            _ => CarebotError::Provider(format!("{provider} API error {status}: {body}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(CarebotError::from_status("openai", 429, "slow down").is_transient());
        assert!(CarebotError::from_status("openai", 503, "busy").is_transient());
        assert!(!CarebotError::from_status("openai", 400, "bad").is_transient());
        assert!(!CarebotError::from_status("openai", 401, "key").is_transient());
    }

    #[test]
    fn test_exhausted_is_not_transient() {
        let err = CarebotError::EmbeddingFailed {
            batch: 0,
            attempts: 4,
            reason: "timeout".into(),
            transient: true,
        };
        assert!(err.is_exhausted());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_permanent_embedding_failure_is_not_exhausted() {
        let err = CarebotError::EmbeddingFailed {
            batch: 0,
            attempts: 1,
            reason: "401 invalid key".into(),
            transient: false,
        };
        assert!(!err.is_exhausted());
    }
}

//! Batched embedding with bounded retries.

use std::sync::Arc;
use std::time::Duration;

use carebot_core::config::EmbeddingConfig;
use carebot_core::error::{CarebotError, Result};
use carebot_core::traits::Embedder;
use rand::Rng;

/// Exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &EmbeddingConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Base delay before retry number `attempt` (1-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }

    fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter_ms = base.as_millis() as u64 / 4;
        let jitter = rand::thread_rng().gen_range(0..=jitter_ms);
        base + Duration::from_millis(jitter)
    }
}

/// Embeds texts in sequential batches, one outstanding request at a time.
pub struct EmbeddingClient {
    embedder: Arc<dyn Embedder>,
    batch_size: usize,
    policy: RetryPolicy,
}

impl EmbeddingClient {
    pub fn new(embedder: Arc<dyn Embedder>, batch_size: usize, policy: RetryPolicy) -> Self {
        Self {
            embedder,
            batch_size: batch_size.max(1),
            policy,
        }
    }

    pub fn from_config(embedder: Arc<dyn Embedder>, config: &EmbeddingConfig) -> Self {
        Self::new(embedder, config.batch_size, RetryPolicy::from_config(config))
    }

    pub fn dimensions(&self) -> usize {
        self.embedder.dimensions()
    }

    /// Embed every text. The output is aligned with `texts`; any failure
    /// fails the whole call.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        let batches = texts.len().div_ceil(self.batch_size);

        for (batch, inputs) in texts.chunks(self.batch_size).enumerate() {
            tracing::debug!("Embedding batch {}/{batches} ({} texts)", batch + 1, inputs.len());
            let embedded = self.embed_with_retry(batch, inputs).await?;
            self.check_batch(inputs.len(), &embedded)?;
            vectors.extend(embedded);
        }
        Ok(vectors)
    }

    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(&[text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| CarebotError::Provider("embedding response was empty".into()))
    }

    async fn embed_with_retry(&self, batch: usize, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut attempt = 1;
        loop {
            match self.embedder.embed_batch(inputs).await {
                Ok(vectors) => return Ok(vectors),
                Err(e) if e.is_transient() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay(attempt);
                    tracing::warn!(
                        "Embedding batch {batch} attempt {attempt}/{} failed: {e}; retrying in {delay:?}",
                        self.policy.max_attempts
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(CarebotError::EmbeddingFailed {
                        batch,
                        attempts: attempt,
                        reason: e.to_string(),
                        transient: e.is_transient(),
                    });
                }
            }
        }
    }

    fn check_batch(&self, expected: usize, vectors: &[Vec<f32>]) -> Result<()> {
        if vectors.len() != expected {
            return Err(CarebotError::Provider(format!(
                "embedding response has {} vectors for {expected} inputs",
                vectors.len()
            )));
        }
        let dims = self.dimensions();
        if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
            return Err(CarebotError::DimensionMismatch {
                expected: dims,
                actual: bad.len(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Deterministic bag-of-words embedder.
    pub(crate) struct HashEmbedder {
        pub dims: usize,
    }

    impl HashEmbedder {
        pub fn vector(&self, text: &str) -> Vec<f32> {
            let mut v = vec![0f32; self.dims];
            for word in text.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
                let word = word.to_lowercase();
                let h = word.bytes().fold(5381u64, |h, b| h.wrapping_mul(33) ^ b as u64);
                v[(h % self.dims as u64) as usize] += 1.0;
            }
            v
        }
    }

    #[async_trait]
    impl Embedder for HashEmbedder {
        fn name(&self) -> &str {
            "hash"
        }

        fn dimensions(&self) -> usize {
            self.dims
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|t| self.vector(t)).collect())
        }
    }

    /// Fails with a transient error `failures` times, then succeeds.
    struct FlakyEmbedder {
        failures: u32,
        calls: AtomicU32,
        batches: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl Embedder for FlakyEmbedder {
        fn name(&self) -> &str {
            "flaky"
        }

        fn dimensions(&self) -> usize {
            2
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(CarebotError::Transient("503 busy".into()));
            }
            self.batches.lock().unwrap().push(texts.len());
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    struct RejectingEmbedder;

    #[async_trait]
    impl Embedder for RejectingEmbedder {
        fn name(&self) -> &str {
            "rejecting"
        }

        fn dimensions(&self) -> usize {
            2
        }

        async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Err(CarebotError::Provider("401 invalid api key".into()))
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    fn flaky(failures: u32) -> Arc<FlakyEmbedder> {
        Arc::new(FlakyEmbedder {
            failures,
            calls: AtomicU32::new(0),
            batches: Mutex::new(vec![]),
        })
    }

    fn texts(n: usize) -> Vec<String> {
        (0..n).map(|i| "x".repeat(i + 1)).collect()
    }

    #[tokio::test]
    async fn test_batches_are_sequential_and_aligned() {
        let embedder = flaky(0);
        let client = EmbeddingClient::new(embedder.clone(), 64, fast_policy(4));
        let vectors = client.embed(&texts(150)).await.unwrap();

        assert_eq!(vectors.len(), 150);
        assert_eq!(vectors[0][0], 1.0);
        assert_eq!(vectors[149][0], 150.0);
        assert_eq!(*embedder.batches.lock().unwrap(), vec![64, 64, 22]);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let embedder = flaky(2);
        let client = EmbeddingClient::new(embedder.clone(), 8, fast_policy(4));
        let vectors = client.embed(&texts(3)).await.unwrap();
        assert_eq!(vectors.len(), 3);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_whole_call() {
        let embedder = flaky(10);
        let client = EmbeddingClient::new(embedder.clone(), 8, fast_policy(4));
        let err = client.embed(&texts(3)).await.unwrap_err();
        assert!(err.is_exhausted());
        match err {
            CarebotError::EmbeddingFailed { batch, attempts, .. } => {
                assert_eq!(batch, 0);
                assert_eq!(attempts, 4);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let client = EmbeddingClient::new(Arc::new(RejectingEmbedder), 8, fast_policy(4));
        let err = client.embed_one("chest pain").await.unwrap_err();
        assert!(matches!(
            err,
            CarebotError::EmbeddingFailed { attempts: 1, transient: false, .. }
        ));
        assert!(!err.is_exhausted());
    }

    /// Claims 3 dimensions, returns 2.
    struct ShortEmbedder;

    #[async_trait]
    impl Embedder for ShortEmbedder {
        fn name(&self) -> &str {
            "short"
        }

        fn dimensions(&self) -> usize {
            3
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![0.5, 0.5]).collect())
        }
    }

    #[tokio::test]
    async fn test_wrong_dimension_is_rejected() {
        let client = EmbeddingClient::new(Arc::new(HashEmbedder { dims: 4 }), 8, fast_policy(1));
        assert_eq!(client.embed_one("fever").await.unwrap().len(), 4);

        let bad = EmbeddingClient::new(Arc::new(ShortEmbedder), 8, fast_policy(1));
        let err = bad.embed_one("fever").await.unwrap_err();
        assert!(matches!(err, CarebotError::DimensionMismatch { expected: 3, actual: 2 }));
    }

    #[tokio::test]
    async fn test_empty_input() {
        let client = EmbeddingClient::new(flaky(0), 8, fast_policy(1));
        assert!(client.embed(&[]).await.unwrap().is_empty());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay(1), Duration::from_millis(500));
        assert_eq!(policy.base_delay(2), Duration::from_millis(1000));
        assert_eq!(policy.base_delay(3), Duration::from_millis(2000));
        assert_eq!(policy.base_delay(10), Duration::from_secs(8));
    }
}

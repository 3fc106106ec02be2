//! Embedding provider trait.

use async_trait::async_trait;

use crate::error::Result;

/// Maps texts to fixed-dimension vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn name(&self) -> &str;

    /// Vector dimension `D` produced by this embedder.
    fn dimensions(&self) -> usize;

    /// Embed one batch; the output is aligned with `texts`.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

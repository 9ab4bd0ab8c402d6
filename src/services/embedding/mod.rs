//! Embedding providers.
//!
//! Every backend maps text to fixed-length vectors through [`Embedder`]; the
//! backend is chosen by `embedding.provider` at construction.

mod hash;
mod http;
mod onnx;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::EmbeddingError;
use crate::models::{EmbeddingConfig, EmbeddingProvider};

pub use hash::HashEmbedder;
pub use http::HttpEmbedder;
pub use onnx::OnnxEmbedder;

#[async_trait]
pub trait Embedder: Send + Sync + fmt::Debug {
    /// Embed a batch of passages, one vector per input in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    /// Embed a single search query.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.embed(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::InvalidResponse("empty embedding response".to_string()))
    }

    fn dimension(&self) -> usize;

    fn model_name(&self) -> &str;
}

/// Build the embedder selected by configuration.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>, EmbeddingError> {
    tracing::debug!(provider = %config.provider, model = %config.model, "creating embedder");
    match config.provider {
        EmbeddingProvider::Http => Ok(Arc::new(HttpEmbedder::new(config)?)),
        EmbeddingProvider::Onnx => Ok(Arc::new(OnnxEmbedder::load(config)?)),
        EmbeddingProvider::Hash => Ok(Arc::new(HashEmbedder::new(config.dimension as usize))),
    }
}

pub(crate) fn normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
}

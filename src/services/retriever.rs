//! Similarity search over a chunk store with a relevance threshold.

use std::sync::Arc;

use crate::error::StoreError;
use crate::models::{MetadataFilter, RetrievalResult};
use crate::services::chunk_store::ChunkStore;

/// Search results that passed the similarity threshold.
#[derive(Debug, Clone, Default)]
pub struct Retrieved {
    /// Hits returned by the store before thresholding.
    pub candidates: usize,
    pub results: Vec<RetrievalResult>,
}

impl Retrieved {
    pub fn top_score(&self) -> Option<f32> {
        self.results.first().map(|r| r.score)
    }
}

#[derive(Debug, Clone)]
pub struct Retriever {
    store: Arc<dyn ChunkStore>,
    similarity_threshold: f32,
}

impl Retriever {
    pub fn new(store: Arc<dyn ChunkStore>, similarity_threshold: f32) -> Self {
        Self {
            store,
            similarity_threshold,
        }
    }

    pub fn store(&self) -> &Arc<dyn ChunkStore> {
        &self.store
    }

    pub fn similarity_threshold(&self) -> f32 {
        self.similarity_threshold
    }

    /// Up to `top_k` hits, best first. An empty corpus yields an empty vec.
    pub async fn search(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        filters: &MetadataFilter,
    ) -> Result<Vec<RetrievalResult>, StoreError> {
        let mut results = self.store.search(query_embedding, top_k, filters).await?;
        results.truncate(top_k);
        Ok(results)
    }

    /// Like [`search`](Self::search) but drops hits below the threshold.
    pub async fn search_relevant(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        filters: &MetadataFilter,
    ) -> Result<Retrieved, StoreError> {
        let results = self.search(query_embedding, top_k, filters).await?;
        let candidates = results.len();
        let results: Vec<_> = results
            .into_iter()
            .filter(|r| r.score >= self.similarity_threshold)
            .collect();

        tracing::debug!(
            candidates,
            kept = results.len(),
            threshold = self.similarity_threshold,
            "retrieved chunks"
        );

        Ok(Retrieved {
            candidates,
            results,
        })
    }
}

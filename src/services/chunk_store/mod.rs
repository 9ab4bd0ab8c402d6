//! Chunk store abstraction layer.
//!
//! Backends keep chunks keyed by id and answer nearest-neighbour queries over
//! their embeddings. The backend is chosen by `store.driver`.

mod memory;
mod pgvector;

pub use memory::MemoryStore;
pub use pgvector::PgVectorStore;

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::StoreError;
use crate::models::{Chunk, Config, MetadataFilter, RetrievalResult, StoreDriver};

/// Counts reported by `status`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub chunks: u64,
    pub documents: u64,
    pub pending_embeddings: u64,
}

#[async_trait]
pub trait ChunkStore: Send + Sync + fmt::Debug {
    /// Width every stored vector must have.
    fn dimension(&self) -> usize;

    fn backend_name(&self) -> &'static str;

    async fn health_check(&self) -> Result<bool, StoreError>;

    /// Create tables and indexes if needed.
    async fn initialize(&self) -> Result<(), StoreError>;

    /// Delete every chunk of `document_id` and insert `chunks`, atomically.
    async fn replace_document(&self, document_id: &str, chunks: Vec<Chunk>)
    -> Result<(), StoreError>;

    /// Replace one chunk's vector in place and clear its `needs_embedding` flag.
    async fn update_embedding(&self, chunk_id: &str, embedding: Vec<f32>)
    -> Result<(), StoreError>;

    /// At most `top_k` searchable chunks matching `filters`, best first.
    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filters: &MetadataFilter,
    ) -> Result<Vec<RetrievalResult>, StoreError>;

    /// Chunks to re-embed, ordered by document and ordinal. With `missing_only`
    /// only chunks flagged `needs_embedding` are returned.
    async fn chunks_for_reprocessing(
        &self,
        document_id: Option<&str>,
        missing_only: bool,
    ) -> Result<Vec<Chunk>, StoreError>;

    async fn document_chunks(&self, document_id: &str) -> Result<Vec<Chunk>, StoreError>;

    /// Returns the number of chunks removed.
    async fn delete_document(&self, document_id: &str) -> Result<u64, StoreError>;

    async fn stats(&self) -> Result<StoreStats, StoreError>;

    async fn clear(&self) -> Result<(), StoreError>;

    /// Persist buffered state. No-op for backends that write through.
    async fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Create a chunk store based on configuration.
pub async fn create_store(
    config: &Config,
    dimension: usize,
) -> Result<Arc<dyn ChunkStore>, StoreError> {
    let store: Arc<dyn ChunkStore> = match config.store.driver {
        StoreDriver::Memory => {
            let snapshot = if config.store.memory.persist {
                config.snapshot_path()
            } else {
                None
            };
            match snapshot {
                Some(path) => Arc::new(MemoryStore::open(path, dimension)?),
                None => Arc::new(MemoryStore::new(dimension)),
            }
        }
        StoreDriver::Postgres => {
            Arc::new(PgVectorStore::connect(&config.store.postgres, dimension).await?)
        }
    };
    store.initialize().await?;
    tracing::debug!(backend = store.backend_name(), dimension, "chunk store ready");
    Ok(store)
}

pub fn validate_dimension(expected: usize, actual: usize) -> Result<(), StoreError> {
    if expected != actual {
        return Err(StoreError::DimensionMismatch { expected, actual });
    }
    Ok(())
}

/// Check a chunk before it is written.
pub fn validate_chunk(chunk: &Chunk, document_id: &str, dimension: usize) -> Result<(), StoreError> {
    if chunk.document_id != document_id {
        return Err(StoreError::InvalidChunk(format!(
            "chunk {} belongs to document {}, not {}",
            chunk.id, chunk.document_id, document_id
        )));
    }
    match &chunk.embedding {
        Some(embedding) => validate_dimension(dimension, embedding.len()),
        None if chunk.needs_embedding => Ok(()),
        None => Err(StoreError::InvalidChunk(format!(
            "chunk {} has no embedding and is not flagged for embedding",
            chunk.id
        ))),
    }
}

/// Cosine similarity of two vectors; 0 when either is all zeros.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Similarity descending, then ordinal, document id and chunk id ascending.
pub fn sort_results(results: &mut [RetrievalResult]) {
    results.sort_by(compare_results);
}

fn compare_results(a: &RetrievalResult, b: &RetrievalResult) -> Ordering {
    b.similarity
        .total_cmp(&a.similarity)
        .then_with(|| a.chunk.ordinal.cmp(&b.chunk.ordinal))
        .then_with(|| a.chunk.document_id.cmp(&b.chunk.document_id))
        .then_with(|| a.chunk_id.cmp(&b.chunk_id))
}

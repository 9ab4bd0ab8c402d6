//! Brute-force in-memory chunk store with optional JSON snapshot.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::{
    ChunkStore, StoreStats, cosine_similarity, sort_results, validate_chunk, validate_dimension,
};
use crate::error::StoreError;
use crate::models::{Chunk, MetadataFilter, RetrievalResult};

#[derive(Serialize, Deserialize)]
struct Snapshot {
    dimension: usize,
    chunks: Vec<Chunk>,
}

/// Chunks are held as `Arc<Chunk>` and replaced whole, so a reader never sees
/// a partially written chunk.
#[derive(Debug)]
pub struct MemoryStore {
    dimension: usize,
    chunks: RwLock<HashMap<String, Arc<Chunk>>>,
    snapshot_path: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            chunks: RwLock::new(HashMap::new()),
            snapshot_path: None,
        }
    }

    /// Load the snapshot at `path` if it exists; `flush` writes back to it.
    pub fn open(path: impl Into<PathBuf>, dimension: usize) -> Result<Self, StoreError> {
        let path = path.into();
        let mut chunks = HashMap::new();

        if path.exists() {
            let content = std::fs::read_to_string(&path)
                .map_err(|e| StoreError::SnapshotError(format!("{}: {}", path.display(), e)))?;
            let snapshot: Snapshot = serde_json::from_str(&content)
                .map_err(|e| StoreError::SnapshotError(format!("{}: {}", path.display(), e)))?;
            validate_dimension(dimension, snapshot.dimension)?;
            for chunk in snapshot.chunks {
                chunks.insert(chunk.id.clone(), Arc::new(chunk));
            }
            tracing::debug!(path = %path.display(), chunks = chunks.len(), "loaded chunk snapshot");
        }

        Ok(Self {
            dimension,
            chunks: RwLock::new(chunks),
            snapshot_path: Some(path),
        })
    }

    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }
}

#[async_trait]
impl ChunkStore for MemoryStore {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn health_check(&self) -> Result<bool, StoreError> {
        Ok(true)
    }

    async fn initialize(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn replace_document(
        &self,
        document_id: &str,
        chunks: Vec<Chunk>,
    ) -> Result<(), StoreError> {
        for chunk in &chunks {
            validate_chunk(chunk, document_id, self.dimension)?;
        }

        let mut map = self.chunks.write().await;
        map.retain(|_, c| c.document_id != document_id);
        for chunk in chunks {
            map.insert(chunk.id.clone(), Arc::new(chunk));
        }
        Ok(())
    }

    async fn update_embedding(
        &self,
        chunk_id: &str,
        embedding: Vec<f32>,
    ) -> Result<(), StoreError> {
        validate_dimension(self.dimension, embedding.len())?;

        let mut map = self.chunks.write().await;
        let existing = map
            .get(chunk_id)
            .ok_or_else(|| StoreError::NotFound(chunk_id.to_string()))?;
        let updated = Chunk::clone(existing).with_embedding(embedding);
        map.insert(chunk_id.to_string(), Arc::new(updated));
        Ok(())
    }

    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filters: &MetadataFilter,
    ) -> Result<Vec<RetrievalResult>, StoreError> {
        validate_dimension(self.dimension, query.len())?;
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let map = self.chunks.read().await;
        let mut results: Vec<RetrievalResult> = map
            .values()
            .filter(|c| c.is_searchable() && filters.matches(c))
            .filter_map(|c| {
                let embedding = c.embedding.as_deref()?;
                Some(RetrievalResult::new(
                    Arc::clone(c),
                    cosine_similarity(query, embedding),
                ))
            })
            .collect();
        drop(map);

        sort_results(&mut results);
        results.truncate(top_k);
        Ok(results)
    }

    async fn chunks_for_reprocessing(
        &self,
        document_id: Option<&str>,
        missing_only: bool,
    ) -> Result<Vec<Chunk>, StoreError> {
        let map = self.chunks.read().await;
        let mut chunks: Vec<Chunk> = map
            .values()
            .filter(|c| document_id.is_none_or(|id| c.document_id == id))
            .filter(|c| !missing_only || c.needs_embedding)
            .map(|c| Chunk::clone(c))
            .collect();
        chunks.sort_by(|a, b| {
            a.document_id
                .cmp(&b.document_id)
                .then(a.ordinal.cmp(&b.ordinal))
        });
        Ok(chunks)
    }

    async fn document_chunks(&self, document_id: &str) -> Result<Vec<Chunk>, StoreError> {
        self.chunks_for_reprocessing(Some(document_id), false).await
    }

    async fn delete_document(&self, document_id: &str) -> Result<u64, StoreError> {
        let mut map = self.chunks.write().await;
        let before = map.len();
        map.retain(|_, c| c.document_id != document_id);
        Ok((before - map.len()) as u64)
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let map = self.chunks.read().await;
        let mut documents: Vec<&str> = map.values().map(|c| c.document_id.as_str()).collect();
        documents.sort_unstable();
        documents.dedup();
        Ok(StoreStats {
            chunks: map.len() as u64,
            documents: documents.len() as u64,
            pending_embeddings: map.values().filter(|c| c.needs_embedding).count() as u64,
        })
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.chunks.write().await.clear();
        Ok(())
    }

    async fn flush(&self) -> Result<(), StoreError> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };

        let snapshot = {
            let map = self.chunks.read().await;
            let mut chunks: Vec<Chunk> = map.values().map(|c| Chunk::clone(c)).collect();
            chunks.sort_by(|a, b| a.id.cmp(&b.id));
            Snapshot {
                dimension: self.dimension,
                chunks,
            }
        };

        let json = serde_json::to_string(&snapshot)
            .map_err(|e| StoreError::SnapshotError(e.to_string()))?;
        let snapshot_err = |e: std::io::Error| StoreError::SnapshotError(e.to_string());
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(snapshot_err)?;
        }
        // Write-then-rename keeps the previous snapshot intact on failure
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await.map_err(snapshot_err)?;
        tokio::fs::rename(&tmp, path).await.map_err(snapshot_err)?;
        tracing::debug!(path = %path.display(), chunks = snapshot.chunks.len(), "wrote chunk snapshot");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkMetadata;

    fn chunk(doc: &str, ordinal: u32, embedding: Option<Vec<f32>>) -> Chunk {
        let metadata = ChunkMetadata {
            document_title: format!("Title {doc}"),
            language: "en".into(),
            ..Default::default()
        };
        let base = Chunk::new(doc, ordinal, format!("{doc} chunk {ordinal}"), metadata);
        match embedding {
            Some(e) => base.with_embedding(e),
            None => base,
        }
    }

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new(2);
        store
            .replace_document(
                "a",
                vec![
                    chunk("a", 0, Some(vec![1.0, 0.0])),
                    chunk("a", 1, Some(vec![0.7, 0.7])),
                ],
            )
            .await
            .unwrap();
        store
            .replace_document(
                "b",
                vec![
                    chunk("b", 0, Some(vec![0.0, 1.0])),
                    chunk("b", 1, None),
                ],
            )
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_search_orders_by_score() {
        let store = seeded().await;
        let results = store
            .search(&[1.0, 0.0], 10, &MetadataFilter::new())
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].chunk.document_id, "a");
        assert_eq!(results[0].chunk.ordinal, 0);
        for pair in results.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        assert!(results.iter().all(|r| (0.0..=1.0).contains(&r.score)));
    }

    #[tokio::test]
    async fn test_search_respects_top_k_and_filters() {
        let store = seeded().await;
        let top = store
            .search(&[1.0, 0.0], 1, &MetadataFilter::new())
            .await
            .unwrap();
        assert_eq!(top.len(), 1);

        let filtered = store
            .search(&[1.0, 0.0], 10, &MetadataFilter::new().with("document_id", "b"))
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].chunk.document_id, "b");

        assert!(
            store
                .search(&[1.0, 0.0], 0, &MetadataFilter::new())
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_top_k_ranks_by_raw_similarity_below_zero() {
        let store = MemoryStore::new(2);
        store
            .replace_document(
                "a",
                vec![
                    chunk("a", 0, Some(vec![-1.0, 0.0])),
                    chunk("a", 1, Some(vec![-0.1, 1.0])),
                ],
            )
            .await
            .unwrap();

        let top = store
            .search(&[1.0, 0.0], 1, &MetadataFilter::new())
            .await
            .unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].chunk.ordinal, 1);
        assert!(top[0].similarity > -0.1);
        assert_eq!(top[0].score, 0.0);
    }

    #[tokio::test]
    async fn test_empty_store_returns_no_results() {
        let store = MemoryStore::new(2);
        let results = store
            .search(&[1.0, 0.0], 5, &MetadataFilter::new())
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_query_dimension_is_checked() {
        let store = seeded().await;
        let err = store
            .search(&[1.0, 0.0, 0.0], 5, &MetadataFilter::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DimensionMismatch { expected: 2, actual: 3 }));
    }

    #[tokio::test]
    async fn test_replace_document_is_idempotent() {
        let store = seeded().await;
        store
            .replace_document("a", vec![chunk("a", 0, Some(vec![1.0, 0.0]))])
            .await
            .unwrap();
        store
            .replace_document("a", vec![chunk("a", 0, Some(vec![1.0, 0.0]))])
            .await
            .unwrap();

        assert_eq!(store.document_chunks("a").await.unwrap().len(), 1);
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.documents, 2);
        assert_eq!(stats.chunks, 3);
        assert_eq!(stats.pending_embeddings, 1);
    }

    #[tokio::test]
    async fn test_wrong_dimension_is_rejected_without_partial_write() {
        let store = seeded().await;
        let err = store
            .replace_document(
                "a",
                vec![
                    chunk("a", 0, Some(vec![1.0, 0.0])),
                    chunk("a", 1, Some(vec![1.0, 0.0, 0.0])),
                ],
            )
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::DimensionMismatch { .. }));
        assert_eq!(store.document_chunks("a").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_update_embedding_makes_chunk_searchable() {
        let store = seeded().await;
        let pending = store.chunks_for_reprocessing(None, true).await.unwrap();
        assert_eq!(pending.len(), 1);

        store
            .update_embedding(&pending[0].id, vec![0.0, 1.0])
            .await
            .unwrap();
        assert!(store.chunks_for_reprocessing(None, true).await.unwrap().is_empty());
        assert_eq!(store.stats().await.unwrap().pending_embeddings, 0);

        assert!(matches!(
            store.update_embedding("missing", vec![0.0, 1.0]).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_document() {
        let store = seeded().await;
        assert_eq!(store.delete_document("a").await.unwrap(), 2);
        assert_eq!(store.delete_document("a").await.unwrap(), 0);
        store.clear().await.unwrap();
        assert_eq!(store.stats().await.unwrap(), StoreStats::default());
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chunks.json");

        let store = MemoryStore::open(&path, 2).unwrap();
        store
            .replace_document("a", vec![chunk("a", 0, Some(vec![1.0, 0.0]))])
            .await
            .unwrap();
        store.flush().await.unwrap();

        let reopened = MemoryStore::open(&path, 2).unwrap();
        assert_eq!(reopened.stats().await.unwrap().chunks, 1);

        assert!(matches!(
            MemoryStore::open(&path, 3),
            Err(StoreError::DimensionMismatch { .. })
        ));
    }
}

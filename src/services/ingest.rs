//! Document ingestion: chunk, embed in batches, store.
//!
//! A batch whose embedding fails after retries is stored with null vectors and
//! flagged for `reprocess`; the document still counts as ingested.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{EmbeddingError, IngestError};
use crate::models::{Chunk, ChunkMetadata, IngestionConfig};
use crate::services::chunk_store::ChunkStore;
use crate::services::chunker::TextChunker;
use crate::services::embedding::Embedder;
use crate::utils::retry::{RetryConfig, RetryResult, with_retry};

/// Per-document ingestion settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestOptions {
    /// Falls back to the document id when empty.
    #[serde(default)]
    pub document_title: String,
    /// Falls back to `en` when empty.
    #[serde(default)]
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlap: Option<usize>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl IngestOptions {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            document_title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// One document of a batch ingest.
#[derive(Debug, Clone)]
pub struct DocumentInput {
    pub document_id: String,
    pub text: String,
    pub options: IngestOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionReport {
    pub document_id: String,
    /// Chunks stored with an embedding.
    pub chunks_written: usize,
    /// Chunks stored without one, awaiting `reprocess`.
    pub chunks_failed: usize,
}

impl IngestionReport {
    pub fn total(&self) -> usize {
        self.chunks_written + self.chunks_failed
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReprocessTarget {
    Document(String),
    All,
}

impl ReprocessTarget {
    fn document_id(&self) -> Option<&str> {
        match self {
            ReprocessTarget::Document(id) => Some(id),
            ReprocessTarget::All => None,
        }
    }
}

impl std::fmt::Display for ReprocessTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReprocessTarget::Document(id) => f.write_str(id),
            ReprocessTarget::All => f.write_str("*"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReprocessMode {
    /// Only chunks flagged `needs_embedding`.
    #[default]
    MissingOnly,
    /// Every chunk, e.g. after switching embedding models.
    AllChunks,
}

#[derive(Debug, Clone)]
pub struct Ingestor {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn ChunkStore>,
    config: IngestionConfig,
    retry: RetryConfig,
}

impl Ingestor {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn ChunkStore>,
        config: IngestionConfig,
    ) -> Self {
        let retry = RetryConfig::new(config.max_retries);
        Self {
            embedder,
            store,
            config,
            retry,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Chunk, embed and store one document, replacing any previous version.
    pub async fn ingest(
        &self,
        document_id: &str,
        raw_text: &str,
        options: &IngestOptions,
    ) -> Result<IngestionReport, IngestError> {
        let document_id = document_id.trim();
        if document_id.is_empty() {
            return Err(IngestError::Validation("document id is empty".into()));
        }
        if raw_text.trim().is_empty() {
            return Err(IngestError::Validation(format!(
                "document {} has no text",
                document_id
            )));
        }

        let chunker = self.chunker_for(options)?;
        let metadata = ChunkMetadata {
            document_title: if options.document_title.trim().is_empty() {
                document_id.to_string()
            } else {
                options.document_title.trim().to_string()
            },
            page_number: None,
            section_title: None,
            language: if options.language.trim().is_empty() {
                "en".to_string()
            } else {
                options.language.trim().to_lowercase()
            },
            extra: options.extra.clone(),
        };

        let mut chunks: Vec<Chunk> = chunker
            .split(raw_text)
            .into_iter()
            .enumerate()
            .map(|(ordinal, window)| {
                let mut metadata = metadata.clone();
                metadata.page_number = window.page_number;
                metadata.section_title = window.section_title;
                Chunk::new(document_id, ordinal as u32, window.text, metadata)
            })
            .collect();

        let mut report = IngestionReport {
            document_id: document_id.to_string(),
            ..Default::default()
        };

        for batch in chunks.chunks_mut(self.config.batch_size.max(1)) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            match self.embed_batch(&texts).await? {
                Some(embeddings) => {
                    for (chunk, embedding) in batch.iter_mut().zip(embeddings) {
                        chunk.embedding = Some(embedding);
                        chunk.needs_embedding = false;
                    }
                    report.chunks_written += batch.len();
                }
                None => report.chunks_failed += batch.len(),
            }
        }

        self.store.replace_document(document_id, chunks).await?;
        self.store.flush().await?;

        tracing::info!(
            document_id,
            written = report.chunks_written,
            failed = report.chunks_failed,
            "ingested document"
        );
        Ok(report)
    }

    /// Ingest several documents. A failure affects only its own document.
    pub async fn ingest_batch(
        &self,
        documents: Vec<DocumentInput>,
    ) -> Vec<(String, Result<IngestionReport, IngestError>)> {
        let mut outcomes = Vec::with_capacity(documents.len());
        for doc in documents {
            let result = self.ingest(&doc.document_id, &doc.text, &doc.options).await;
            if let Err(e) = &result {
                tracing::warn!(document_id = %doc.document_id, error = %e, "document ingestion failed");
            }
            outcomes.push((doc.document_id, result));
        }
        outcomes
    }

    /// Re-embed stored chunks and replace their vectors in place.
    pub async fn reprocess(
        &self,
        target: &ReprocessTarget,
        mode: ReprocessMode,
    ) -> Result<IngestionReport, IngestError> {
        let chunks = self
            .store
            .chunks_for_reprocessing(target.document_id(), mode == ReprocessMode::MissingOnly)
            .await?;

        let mut report = IngestionReport {
            document_id: target.to_string(),
            ..Default::default()
        };

        for batch in chunks.chunks(self.config.batch_size.max(1)) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            match self.embed_batch(&texts).await? {
                Some(embeddings) => {
                    for (chunk, embedding) in batch.iter().zip(embeddings) {
                        self.store.update_embedding(&chunk.id, embedding).await?;
                    }
                    report.chunks_written += batch.len();
                }
                None => report.chunks_failed += batch.len(),
            }
        }

        self.store.flush().await?;

        tracing::info!(
            target = %target,
            written = report.chunks_written,
            failed = report.chunks_failed,
            "reprocessed chunks"
        );
        Ok(report)
    }

    fn chunker_for(&self, options: &IngestOptions) -> Result<TextChunker, IngestError> {
        let size = options.chunk_size.unwrap_or(self.config.chunk_size);
        let overlap = options.overlap.unwrap_or(self.config.chunk_overlap);
        if size == 0 || overlap >= size {
            return Err(IngestError::Validation(format!(
                "overlap ({}) must be smaller than chunk size ({})",
                overlap, size
            )));
        }
        Ok(TextChunker::new(size, overlap))
    }

    /// Embed one batch with retries. `None` means the batch failed and its
    /// chunks should be stored for later reprocessing.
    async fn embed_batch(&self, texts: &[String]) -> Result<Option<Vec<Vec<f32>>>, IngestError> {
        let result = with_retry(&self.retry, || self.embedder.embed(texts)).await;

        let embeddings = match result {
            RetryResult::Success { value, .. } => value,
            RetryResult::Failed {
                last_error,
                attempts,
            } => {
                tracing::warn!(
                    chunks = texts.len(),
                    attempts,
                    error = %last_error,
                    "embedding batch failed, chunks flagged for reprocessing"
                );
                return Ok(None);
            }
        };

        if embeddings.len() != texts.len() {
            let error = EmbeddingError::InvalidResponse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                embeddings.len()
            ));
            tracing::warn!(error = %error, "embedding batch failed, chunks flagged for reprocessing");
            return Ok(None);
        }

        let expected = self.store.dimension();
        if let Some(bad) = embeddings.iter().find(|e| e.len() != expected) {
            return Err(IngestError::DimensionMismatch {
                expected,
                actual: bad.len(),
            });
        }

        Ok(Some(embeddings))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MetadataFilter;
    use crate::services::chunk_store::MemoryStore;
    use crate::services::embedding::HashEmbedder;
    use crate::services::testing::FlakyEmbedder;
    use std::time::Duration;

    fn config() -> IngestionConfig {
        IngestionConfig {
            chunk_size: 120,
            chunk_overlap: 20,
            batch_size: 2,
            ..Default::default()
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig::new(3).with_initial_delay(Duration::from_millis(1))
    }

    fn manual() -> String {
        (0..12)
            .map(|i| format!("Step {i}: connect cable number {i} to the matching port."))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[tokio::test]
    async fn test_ingest_stores_embedded_chunks() {
        let store = Arc::new(MemoryStore::new(64));
        let ingestor = Ingestor::new(Arc::new(HashEmbedder::new(64)), store.clone(), config());

        let report = ingestor
            .ingest("manual", &manual(), &IngestOptions::titled("Router Manual"))
            .await
            .unwrap();

        assert!(report.chunks_written > 1);
        assert_eq!(report.chunks_failed, 0);

        let chunks = store.document_chunks("manual").await.unwrap();
        assert_eq!(chunks.len(), report.total());
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.ordinal, i as u32);
            assert_eq!(chunk.metadata.document_title, "Router Manual");
            assert_eq!(chunk.metadata.language, "en");
            assert_eq!(chunk.embedding.as_ref().map(Vec::len), Some(64));
        }
    }

    #[tokio::test]
    async fn test_reingest_replaces_previous_chunks() {
        let store = Arc::new(MemoryStore::new(64));
        let ingestor = Ingestor::new(Arc::new(HashEmbedder::new(64)), store.clone(), config());

        ingestor
            .ingest("manual", &manual(), &IngestOptions::default())
            .await
            .unwrap();
        let first = store.stats().await.unwrap();
        ingestor
            .ingest("manual", &manual(), &IngestOptions::default())
            .await
            .unwrap();
        assert_eq!(store.stats().await.unwrap(), first);

        ingestor
            .ingest("manual", "Only one short paragraph now.", &IngestOptions::default())
            .await
            .unwrap();
        assert_eq!(store.document_chunks("manual").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_batch_is_flagged_then_reprocessed() {
        let store = Arc::new(MemoryStore::new(64));
        // First call fails permanently for every attempt of the first batch
        let embedder = Arc::new(FlakyEmbedder::new(64, 3));
        let ingestor =
            Ingestor::new(embedder.clone(), store.clone(), config()).with_retry(fast_retry());

        let report = ingestor
            .ingest("manual", &manual(), &IngestOptions::default())
            .await
            .unwrap();
        assert_eq!(report.chunks_failed, 2);
        assert_eq!(store.stats().await.unwrap().pending_embeddings, 2);

        // Flagged chunks never show up in search
        let query = HashEmbedder::new(64).embed_text("connect cable");
        let hits = store
            .search(&query, 100, &MetadataFilter::new())
            .await
            .unwrap();
        assert_eq!(hits.len(), report.chunks_written);

        let reprocessed = ingestor
            .reprocess(&ReprocessTarget::All, ReprocessMode::MissingOnly)
            .await
            .unwrap();
        assert_eq!(reprocessed.chunks_written, 2);
        assert_eq!(reprocessed.chunks_failed, 0);
        assert_eq!(store.stats().await.unwrap().pending_embeddings, 0);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let store = Arc::new(MemoryStore::new(64));
        let embedder = Arc::new(FlakyEmbedder::new(64, 1));
        let ingestor = Ingestor::new(embedder, store, config()).with_retry(fast_retry());

        let report = ingestor
            .ingest("manual", &manual(), &IngestOptions::default())
            .await
            .unwrap();
        assert_eq!(report.chunks_failed, 0);
    }

    #[tokio::test]
    async fn test_reprocess_all_chunks() {
        let store = Arc::new(MemoryStore::new(64));
        let ingestor = Ingestor::new(Arc::new(HashEmbedder::new(64)), store.clone(), config());
        let report = ingestor
            .ingest("manual", &manual(), &IngestOptions::default())
            .await
            .unwrap();

        let redone = ingestor
            .reprocess(
                &ReprocessTarget::Document("manual".into()),
                ReprocessMode::AllChunks,
            )
            .await
            .unwrap();
        assert_eq!(redone.document_id, "manual");
        assert_eq!(redone.chunks_written, report.total());

        let nothing = ingestor
            .reprocess(&ReprocessTarget::All, ReprocessMode::MissingOnly)
            .await
            .unwrap();
        assert_eq!(nothing.total(), 0);
    }

    #[tokio::test]
    async fn test_wrong_dimension_fails_document() {
        let store = Arc::new(MemoryStore::new(32));
        let ingestor = Ingestor::new(Arc::new(HashEmbedder::new(64)), store.clone(), config());

        let err = ingestor
            .ingest("manual", &manual(), &IngestOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            IngestError::DimensionMismatch {
                expected: 32,
                actual: 64
            }
        ));
        assert!(store.document_chunks("manual").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_validation() {
        let store = Arc::new(MemoryStore::new(64));
        let ingestor = Ingestor::new(Arc::new(HashEmbedder::new(64)), store, config());

        assert!(matches!(
            ingestor.ingest(" ", "text", &IngestOptions::default()).await,
            Err(IngestError::Validation(_))
        ));
        assert!(matches!(
            ingestor.ingest("doc", "  \n ", &IngestOptions::default()).await,
            Err(IngestError::Validation(_))
        ));

        let options = IngestOptions {
            chunk_size: Some(50),
            overlap: Some(50),
            ..Default::default()
        };
        assert!(matches!(
            ingestor.ingest("doc", "text", &options).await,
            Err(IngestError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_batch_isolates_failures() {
        let store = Arc::new(MemoryStore::new(64));
        let ingestor = Ingestor::new(Arc::new(HashEmbedder::new(64)), store.clone(), config());

        let outcomes = ingestor
            .ingest_batch(vec![
                DocumentInput {
                    document_id: "empty".into(),
                    text: "".into(),
                    options: IngestOptions::default(),
                },
                DocumentInput {
                    document_id: "manual".into(),
                    text: manual(),
                    options: IngestOptions::default(),
                },
            ])
            .await;

        assert!(outcomes[0].1.is_err());
        assert!(outcomes[1].1.is_ok());
        assert_eq!(store.stats().await.unwrap().documents, 1);
    }
}

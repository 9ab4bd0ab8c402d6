//! Deterministic fakes shared by unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{EmbeddingError, GenerationError, StoreError};
use crate::models::{Chunk, Message, MetadataFilter, RetrievalResult};
use crate::services::budget::{AlertNotifier, BudgetLevel, BudgetStatus};
use crate::services::chunk_store::{ChunkStore, MemoryStore, StoreStats};
use crate::services::embedding::{Embedder, HashEmbedder};
use crate::services::generation::{Completion, Generator};

/// Hash embedder that fails the first `failures` calls with a transient error.
#[derive(Debug)]
pub struct FlakyEmbedder {
    inner: HashEmbedder,
    failures: usize,
    calls: AtomicUsize,
}

impl FlakyEmbedder {
    pub fn new(dimension: usize, failures: usize) -> Self {
        Self {
            inner: HashEmbedder::new(dimension),
            failures,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Embedder for FlakyEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(EmbeddingError::ConnectionError("connection reset".into()));
        }
        self.inner.embed(texts).await
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
}

/// Hash embedder that sleeps before every call.
#[derive(Debug)]
pub struct SlowEmbedder {
    inner: HashEmbedder,
    delay: Duration,
}

impl SlowEmbedder {
    pub fn new(dimension: usize, delay: Duration) -> Self {
        Self {
            inner: HashEmbedder::new(dimension),
            delay,
        }
    }
}

#[async_trait]
impl Embedder for SlowEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        tokio::time::sleep(self.delay).await;
        self.inner.embed(texts).await
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
}

/// Memory store whose searches sleep first; every other call passes through.
#[derive(Debug)]
pub struct SlowSearchStore {
    inner: MemoryStore,
    delay: Duration,
}

impl SlowSearchStore {
    pub fn new(dimension: usize, delay: Duration) -> Self {
        Self {
            inner: MemoryStore::new(dimension),
            delay,
        }
    }
}

#[async_trait]
impl ChunkStore for SlowSearchStore {
    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn backend_name(&self) -> &'static str {
        "slow"
    }

    async fn health_check(&self) -> Result<bool, StoreError> {
        self.inner.health_check().await
    }

    async fn initialize(&self) -> Result<(), StoreError> {
        self.inner.initialize().await
    }

    async fn replace_document(
        &self,
        document_id: &str,
        chunks: Vec<Chunk>,
    ) -> Result<(), StoreError> {
        self.inner.replace_document(document_id, chunks).await
    }

    async fn update_embedding(
        &self,
        chunk_id: &str,
        embedding: Vec<f32>,
    ) -> Result<(), StoreError> {
        self.inner.update_embedding(chunk_id, embedding).await
    }

    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filters: &MetadataFilter,
    ) -> Result<Vec<RetrievalResult>, StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.search(query, top_k, filters).await
    }

    async fn chunks_for_reprocessing(
        &self,
        document_id: Option<&str>,
        missing_only: bool,
    ) -> Result<Vec<Chunk>, StoreError> {
        self.inner
            .chunks_for_reprocessing(document_id, missing_only)
            .await
    }

    async fn document_chunks(&self, document_id: &str) -> Result<Vec<Chunk>, StoreError> {
        self.inner.document_chunks(document_id).await
    }

    async fn delete_document(&self, document_id: &str) -> Result<u64, StoreError> {
        self.inner.delete_document(document_id).await
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        self.inner.stats().await
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.inner.clear().await
    }
}

/// Generator that plays back queued outcomes, then repeats a default reply.
#[derive(Debug)]
pub struct ScriptedGenerator {
    model: String,
    reply: String,
    script: Mutex<VecDeque<Result<Completion, GenerationError>>>,
    delay: Option<Duration>,
    calls: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedGenerator {
    pub fn replying(reply: impl Into<String>) -> Self {
        Self {
            model: "gpt-4o-mini".into(),
            reply: reply.into(),
            script: Mutex::new(VecDeque::new()),
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn then_fail(self, error: GenerationError) -> Self {
        self.script.lock().unwrap().push_back(Err(error));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn last_messages(&self) -> Option<Vec<Message>> {
        self.calls.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn complete(&self, messages: &[Message]) -> Result<Completion, GenerationError> {
        self.calls.lock().unwrap().push(messages.to_vec());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| {
            Ok(Completion {
                text: self.reply.clone(),
                prompt_tokens: 1000,
                completion_tokens: 500,
            })
        })
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    alerts: Mutex<Vec<BudgetStatus>>,
}

impl RecordingNotifier {
    pub fn levels(&self) -> Vec<BudgetLevel> {
        self.alerts.lock().unwrap().iter().map(|s| s.level).collect()
    }
}

impl AlertNotifier for RecordingNotifier {
    fn notify(&self, status: &BudgetStatus) {
        self.alerts.lock().unwrap().push(status.clone());
    }
}

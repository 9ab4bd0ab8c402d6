//! Chunks, their metadata, and similarity-search results.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A bounded text segment of a document, the unit of retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    /// Position within the document, starting at 0.
    pub ordinal: u32,
    pub text: String,
    /// `None` when embedding failed; such chunks are never searchable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub metadata: ChunkMetadata,
    #[serde(default)]
    pub needs_embedding: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub document_title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_title: Option<String>,
    pub language: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl Chunk {
    /// Deterministic chunk id: UUIDv5 of `document_id:ordinal`.
    pub fn generate_id(document_id: &str, ordinal: u32) -> String {
        let name = format!("{}:{}", document_id, ordinal);
        Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
    }

    /// Create a chunk awaiting its embedding.
    pub fn new(document_id: &str, ordinal: u32, text: String, metadata: ChunkMetadata) -> Self {
        Self {
            id: Self::generate_id(document_id, ordinal),
            document_id: document_id.to_string(),
            ordinal,
            text,
            embedding: None,
            metadata,
            needs_embedding: true,
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self.needs_embedding = false;
        self
    }

    pub fn is_searchable(&self) -> bool {
        self.embedding.is_some() && !self.needs_embedding
    }

    /// Value of a filterable field. Known fields first, then `extra`.
    pub fn field(&self, key: &str) -> Option<String> {
        match key {
            "document_id" => Some(self.document_id.clone()),
            "document_title" => Some(self.metadata.document_title.clone()),
            "language" => Some(self.metadata.language.clone()),
            "page_number" => self.metadata.page_number.map(|p| p.to_string()),
            "section_title" => self.metadata.section_title.clone(),
            other => self.metadata.extra.get(other).cloned(),
        }
    }
}

/// Conjunctive equality filter over chunk metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataFilter(BTreeMap<String, String>);

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn matches(&self, chunk: &Chunk) -> bool {
        self.0
            .iter()
            .all(|(key, value)| chunk.field(key).as_deref() == Some(value.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MetadataFilter {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// One similarity-search hit.
#[derive(Debug, Clone)]
pub struct RetrievalResult {
    pub chunk_id: String,
    /// Cosine similarity clamped to `[0, 1]`.
    pub score: f32,
    /// Unclamped cosine similarity in `[-1, 1]`; results are ranked by this.
    pub similarity: f32,
    pub chunk: Arc<Chunk>,
}

impl RetrievalResult {
    pub fn new(chunk: Arc<Chunk>, similarity: f32) -> Self {
        let similarity = if similarity.is_nan() { -1.0 } else { similarity };
        Self {
            chunk_id: chunk.id.clone(),
            score: similarity.clamp(0.0, 1.0),
            similarity,
            chunk,
        }
    }
}

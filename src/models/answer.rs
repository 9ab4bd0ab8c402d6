//! Answers, citations, conversation turns and callers.

use serde::{Deserialize, Serialize};

use super::chunk::{MetadataFilter, RetrievalResult};
use crate::utils::text::preview;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One conversation turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A reference from an answer back to the chunk that supports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub document_title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_title: Option<String>,
    pub chunk_text_preview: String,
    pub chunk_id: String,
    pub document_id: String,
    pub relevance_score: f32,
}

impl Citation {
    pub fn from_result(result: &RetrievalResult, preview_chars: usize) -> Self {
        let chunk = &result.chunk;
        Self {
            document_title: chunk.metadata.document_title.clone(),
            page_number: chunk.metadata.page_number,
            section_title: chunk.metadata.section_title.clone(),
            chunk_text_preview: preview(&chunk.text, preview_chars),
            chunk_id: result.chunk_id.clone(),
            document_id: chunk.document_id.clone(),
            relevance_score: result.score,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerMetadata {
    pub chunks_retrieved: usize,
    pub chunks_used: usize,
    pub top_similarity_score: Option<f32>,
    pub model: String,
    pub embedding_model: String,
    pub top_k: usize,
    pub similarity_threshold: f32,
    /// False when the prompt carried the no-context marker.
    pub context_used: bool,
    pub language: String,
    pub latency_ms: u64,
}

/// The final product of one question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub content: String,
    pub citations: Vec<Citation>,
    pub method: String,
    pub prompt_version: String,
    pub usage: Usage,
    pub metadata: AnswerMetadata,
}

/// Who is asking. Rate limits are keyed by this.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CallerIdentity {
    Anonymous { address: String },
    User { id: String },
}

impl CallerIdentity {
    pub fn anonymous(address: impl Into<String>) -> Self {
        CallerIdentity::Anonymous {
            address: address.into(),
        }
    }

    pub fn user(id: impl Into<String>) -> Self {
        CallerIdentity::User { id: id.into() }
    }

    /// Stable key for counters and logs.
    pub fn key(&self) -> String {
        match self {
            CallerIdentity::Anonymous { address } => format!("ip:{}", address),
            CallerIdentity::User { id } => format!("user:{}", id),
        }
    }
}

impl std::fmt::Display for CallerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

/// Inbound question for the pipeline facade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerRequest {
    pub question: String,
    #[serde(default)]
    pub history: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language_hint: Option<String>,
    pub caller: CallerIdentity,
    #[serde(default, skip_serializing_if = "MetadataFilter::is_empty")]
    pub filters: MetadataFilter,
}

impl AnswerRequest {
    pub fn new(question: impl Into<String>, caller: CallerIdentity) -> Self {
        Self {
            question: question.into(),
            history: Vec::new(),
            language_hint: None,
            caller,
            filters: MetadataFilter::default(),
        }
    }

    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language_hint = Some(language.into());
        self
    }

    pub fn with_filters(mut self, filters: MetadataFilter) -> Self {
        self.filters = filters;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::chunk::{Chunk, ChunkMetadata};
    use std::sync::Arc;

    #[test]
    fn test_citation_from_result_bounds_preview() {
        let chunk = Chunk::new(
            "doc",
            0,
            "a".repeat(500),
            ChunkMetadata {
                document_title: "Setup Guide".into(),
                page_number: Some(2),
                language: "en".into(),
                ..Default::default()
            },
        );
        let result = RetrievalResult::new(Arc::new(chunk), 0.8);
        let citation = Citation::from_result(&result, 200);

        assert_eq!(citation.document_title, "Setup Guide");
        assert_eq!(citation.page_number, Some(2));
        assert_eq!(citation.chunk_id, result.chunk_id);
        assert_eq!(citation.chunk_text_preview.chars().count(), 203);
    }

    #[test]
    fn test_caller_keys() {
        assert_eq!(CallerIdentity::anonymous("10.0.0.1").key(), "ip:10.0.0.1");
        assert_eq!(CallerIdentity::user("42").key(), "user:42");
    }

    #[test]
    fn test_message_serializes_lowercase_role() {
        let json = serde_json::to_string(&Message::assistant("hi")).unwrap();
        assert_eq!(json, r#"{"role":"assistant","content":"hi"}"#);
    }
}

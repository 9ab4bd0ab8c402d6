//! Error types for the answer pipeline.
//!
//! Provider errors carry enough shape to decide retryability; [`PipelineError`]
//! is the typed error surfaced to the transport layer, each variant mapping to
//! a stable machine-readable code.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::utils::retry::Retryable;

/// Errors from embedding providers (remote API or local model).
#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("failed to connect to embedding provider: {0}")]
    ConnectionError(String),

    #[error("embedding provider returned status {status}: {message}")]
    ServerError { status: u16, message: String },

    #[error("embedding provider rejected credentials: {0}")]
    AuthError(String),

    #[error("embedding request failed: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("invalid embedding response: {0}")]
    InvalidResponse(String),

    #[error("embedding model error: {0}")]
    ModelError(String),

    #[error("embedding timeout")]
    Timeout,
}

impl Retryable for EmbeddingError {
    fn is_retryable(&self) -> bool {
        match self {
            EmbeddingError::ConnectionError(_) | EmbeddingError::Timeout => true,
            // Throttling and gateway failures are transient
            EmbeddingError::ServerError { status, .. } => *status == 429 || *status >= 500,
            EmbeddingError::RequestError(e) => e.is_timeout() || e.is_connect(),
            EmbeddingError::AuthError(_)
            | EmbeddingError::InvalidResponse(_)
            | EmbeddingError::ModelError(_) => false,
        }
    }
}

/// Errors from the generation (chat completion) provider.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("failed to connect to generation provider: {0}")]
    ConnectionError(String),

    #[error("generation provider throttled the request: {message}")]
    Throttled {
        message: String,
        retry_after_secs: Option<u64>,
    },

    #[error("generation provider returned status {status}: {message}")]
    ServerError { status: u16, message: String },

    #[error("generation provider rejected credentials: {0}")]
    AuthError(String),

    #[error("generation request rejected: {0}")]
    InvalidRequest(String),

    #[error("generation request failed: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("invalid generation response: {0}")]
    InvalidResponse(String),

    #[error("generation provider returned an empty completion")]
    EmptyResponse,

    #[error("generation timeout")]
    Timeout,
}

impl Retryable for GenerationError {
    fn is_retryable(&self) -> bool {
        match self {
            GenerationError::ConnectionError(_)
            | GenerationError::Throttled { .. }
            | GenerationError::Timeout => true,
            GenerationError::ServerError { status, .. } => *status >= 500,
            GenerationError::RequestError(e) => e.is_timeout() || e.is_connect(),
            GenerationError::AuthError(_)
            | GenerationError::InvalidRequest(_)
            | GenerationError::InvalidResponse(_)
            | GenerationError::EmptyResponse => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            GenerationError::Throttled {
                retry_after_secs: Some(secs),
                ..
            } => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }
}

/// Errors related to chunk store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to connect to chunk store: {0}")]
    ConnectionError(String),

    #[error("table error: {0}")]
    CollectionError(String),

    #[error("upsert error: {0}")]
    UpsertError(String),

    #[error("search error: {0}")]
    SearchError(String),

    #[error("delete error: {0}")]
    DeleteError(String),

    #[error("PostgreSQL error: {0}")]
    PostgresError(String),

    #[error("pgvector extension error: {0}")]
    PgVectorExtensionError(String),

    #[error("snapshot error: {0}")]
    SnapshotError(String),

    #[error("chunk not found: {0}")]
    NotFound(String),

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("invalid chunk: {0}")]
    InvalidChunk(String),
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        match self {
            StoreError::ConnectionError(_) => true,
            StoreError::CollectionError(msg)
            | StoreError::UpsertError(msg)
            | StoreError::SearchError(msg)
            | StoreError::DeleteError(msg)
            | StoreError::PostgresError(msg) => {
                let msg_lower = msg.to_lowercase();
                msg_lower.contains("timeout")
                    || msg_lower.contains("connection")
                    || msg_lower.contains("pool timed out")
            }
            StoreError::PgVectorExtensionError(_)
            | StoreError::SnapshotError(_)
            | StoreError::NotFound(_)
            | StoreError::DimensionMismatch { .. }
            | StoreError::InvalidChunk(_) => false,
        }
    }
}

/// Errors related to document ingestion.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid document: {0}")]
    Validation(String),

    #[error("file read error: {0}")]
    FileReadError(String),

    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("chunk store error: {0}")]
    Store(#[from] StoreError),

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Errors from the spend ledger persistence.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("invalid ledger row: {0}")]
    InvalidRow(String),
}

/// Errors related to configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),

    #[error("path error: {0}")]
    PathError(String),

    #[error("validation error: {0}")]
    ValidationError(String),
}

/// The I/O step of a request that timed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Embedding,
    Retrieval,
    Generation,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Embedding => write!(f, "embedding"),
            Step::Retrieval => write!(f, "retrieval"),
            Step::Generation => write!(f, "generation"),
        }
    }
}

/// Typed error returned by the pipeline facade and answer strategy.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("rate limit exceeded for scope {scope}, retry after {retry_after_secs}s")]
    RateLimited {
        scope: String,
        retry_after_secs: u64,
    },

    #[error("daily budget exceeded: spent ${spent_usd:.2} of ${budget_usd:.2}")]
    BudgetExceeded { spent_usd: f64, budget_usd: f64 },

    #[error("embedding provider error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("generation provider error: {0}")]
    Generation(#[from] GenerationError),

    #[error("chunk store error: {0}")]
    Store(StoreError),

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("{step} step timed out after {timeout_ms}ms")]
    Timeout { step: Step, timeout_ms: u64 },

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DimensionMismatch { expected, actual } => {
                PipelineError::DimensionMismatch { expected, actual }
            }
            other => PipelineError::Store(other),
        }
    }
}

impl PipelineError {
    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::Validation(_) => "validation_error",
            PipelineError::RateLimited { .. } => "rate_limited",
            PipelineError::BudgetExceeded { .. } => "budget_exceeded",
            PipelineError::Embedding(e) => provider_code(e.is_retryable()),
            PipelineError::Generation(e) => provider_code(e.is_retryable()),
            PipelineError::Store(_) => "store_error",
            PipelineError::DimensionMismatch { .. } => "dimension_mismatch",
            PipelineError::Timeout { .. } => "timeout",
            PipelineError::Internal(_) => "internal_error",
        }
    }

    /// Seconds the caller should wait before retrying, when that is known.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            PipelineError::RateLimited {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            PipelineError::Generation(GenerationError::Throttled {
                retry_after_secs, ..
            }) => *retry_after_secs,
            _ => None,
        }
    }

    /// Whether the same request may succeed if retried later today.
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::RateLimited { .. } | PipelineError::Timeout { .. } => true,
            PipelineError::Embedding(e) => e.is_retryable(),
            PipelineError::Generation(e) => e.is_retryable(),
            PipelineError::Store(e) => e.is_retryable(),
            _ => false,
        }
    }
}

fn provider_code(transient: bool) -> &'static str {
    if transient {
        "provider_transient"
    } else {
        "provider_fatal"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttled_generation_exposes_retry_after() {
        let throttled = GenerationError::Throttled {
            message: "slow down".into(),
            retry_after_secs: Some(3),
        };
        assert_eq!(throttled.retry_after(), Some(Duration::from_secs(3)));
        assert_eq!(GenerationError::Timeout.retry_after(), None);
    }

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(
            PipelineError::Validation("empty".into()).code(),
            "validation_error"
        );
        assert_eq!(
            PipelineError::BudgetExceeded {
                spent_usd: 10.0,
                budget_usd: 10.0
            }
            .code(),
            "budget_exceeded"
        );
        assert_eq!(
            PipelineError::Generation(GenerationError::Throttled {
                message: "slow down".into(),
                retry_after_secs: Some(3),
            })
            .code(),
            "provider_transient"
        );
        assert_eq!(
            PipelineError::Generation(GenerationError::AuthError("bad key".into())).code(),
            "provider_fatal"
        );
        assert_eq!(
            PipelineError::Timeout {
                step: Step::Generation,
                timeout_ms: 30_000
            }
            .code(),
            "timeout"
        );
    }

    #[test]
    fn test_store_dimension_mismatch_is_promoted() {
        let err: PipelineError = StoreError::DimensionMismatch {
            expected: 384,
            actual: 12,
        }
        .into();
        assert_eq!(err.code(), "dimension_mismatch");
    }

    #[test]
    fn test_rate_limited_message_carries_retry_after() {
        let err = PipelineError::RateLimited {
            scope: "chat".into(),
            retry_after_secs: 42,
        };
        assert_eq!(err.retry_after_secs(), Some(42));
        assert!(err.to_string().contains("42s"));
    }

    #[test]
    fn test_budget_message_carries_amounts() {
        let err = PipelineError::BudgetExceeded {
            spent_usd: 10.25,
            budget_usd: 10.0,
        };
        assert_eq!(
            err.to_string(),
            "daily budget exceeded: spent $10.25 of $10.00"
        );
    }

    #[test]
    fn test_provider_retryability() {
        assert!(
            EmbeddingError::ServerError {
                status: 503,
                message: "unavailable".into()
            }
            .is_retryable()
        );
        assert!(
            !EmbeddingError::ServerError {
                status: 400,
                message: "bad input".into()
            }
            .is_retryable()
        );
        assert!(!GenerationError::EmptyResponse.is_retryable());
        assert!(GenerationError::Timeout.is_retryable());
    }
}

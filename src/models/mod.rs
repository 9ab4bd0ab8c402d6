mod answer;
mod chunk;
mod config;
mod format;

pub use answer::{
    Answer, AnswerMetadata, AnswerRequest, CallerIdentity, Citation, Message, Role, Usage,
};
pub use chunk::{Chunk, ChunkMetadata, MetadataFilter, RetrievalResult};
pub use config::{
    AnswerConfig, BudgetConfig, Config, DEFAULT_EMBEDDING_DIMENSION, DEFAULT_EMBEDDING_MODEL,
    DEFAULT_GENERATION_MODEL, DEFAULT_PROMPT_VERSION, EmbeddingConfig, EmbeddingProvider,
    GenerationConfig, IngestionConfig, MemoryStoreConfig, ModelPrice, PostgresConfig,
    PricingConfig, RateLimitConfig, RetrievalConfig, SUPPORTED_LANGUAGES, StoreConfig,
    StoreDriver,
};
pub use format::OutputFormat;

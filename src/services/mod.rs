pub mod budget;
pub mod chunk_store;
pub mod chunker;
pub mod citation;
pub mod embedding;
pub mod generation;
pub mod ingest;
pub mod ledger;
pub mod pricing;
pub mod prompt;
pub mod rate_limit;
pub mod retriever;
pub mod strategy;

#[cfg(test)]
pub(crate) mod testing;

pub use budget::{BudgetGuard, BudgetLevel, BudgetStatus, SpendRecorder};
pub use chunk_store::{ChunkStore, MemoryStore, PgVectorStore, StoreStats, create_store};
pub use chunker::TextChunker;
pub use embedding::{Embedder, create_embedder};
pub use generation::{Completion, Generator, create_generator};
pub use ingest::{IngestOptions, IngestionReport, Ingestor, ReprocessMode, ReprocessTarget};
pub use ledger::{LedgerStore, SqliteLedger};
pub use rate_limit::{RateDecision, RateLimit, RateLimiter, Scope};
pub use retriever::Retriever;
pub use strategy::{AnswerStrategy, BaselineStrategy, StrategySettings};

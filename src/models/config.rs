use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::services::rate_limit::RateLimit;

use super::format::OutputFormat;

pub const DEFAULT_EMBEDDING_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_EMBEDDING_MODEL: &str = "all-MiniLM-L6-v2";
pub const DEFAULT_EMBEDDING_DIMENSION: u32 = 384;
pub const DEFAULT_GENERATION_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_GENERATION_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_TABLE: &str = "document_chunks";
pub const DEFAULT_PROMPT_VERSION: &str = "v1.0";

/// Languages the prompt templates can answer in.
pub const SUPPORTED_LANGUAGES: &[&str] = &["en", "de", "fr", "es"];

const ENV_GENERATION_API_KEY: &str = "DOCSAGE_GENERATION_API_KEY";
const ENV_OPENROUTER_API_KEY: &str = "OPENROUTER_API_KEY";
const ENV_EMBEDDING_API_KEY: &str = "DOCSAGE_EMBEDDING_API_KEY";
const ENV_DATABASE_URL: &str = "DOCSAGE_DATABASE_URL";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub generation: GenerationConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub ingestion: IngestionConfig,

    #[serde(default)]
    pub retrieval: RetrievalConfig,

    #[serde(default)]
    pub answer: AnswerConfig,

    #[serde(default)]
    pub budget: BudgetConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub pricing: PricingConfig,

    #[serde(default)]
    pub output: OutputConfig,
}

impl Config {
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("docsage").join("config.toml"))
    }

    /// Directory for the spend ledger and memory-store snapshots.
    pub fn data_dir() -> Option<PathBuf> {
        dirs::data_local_dir().map(|p| p.join("docsage"))
    }

    /// Load from the default location, falling back to defaults when no file
    /// exists. Environment overrides are applied and the result validated.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match Self::config_path() {
            Some(path) if path.exists() => Self::load_from(&path)?,
            _ => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let path = Self::config_path().ok_or_else(|| {
            ConfigError::PathError("could not determine config directory".to_string())
        })?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Secrets and connection strings never need to live in the config file.
    pub fn apply_env_overrides(&mut self) {
        if let Some(key) = env_non_empty(ENV_GENERATION_API_KEY)
            .or_else(|| env_non_empty(ENV_OPENROUTER_API_KEY))
        {
            self.generation.api_key = Some(key);
        }
        if let Some(key) = env_non_empty(ENV_EMBEDDING_API_KEY) {
            self.embedding.api_key = Some(key);
        }
        if let Some(url) = env_non_empty(ENV_DATABASE_URL) {
            self.store.postgres.url = Some(url);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: String| Err(ConfigError::ValidationError(msg));

        if self.embedding.dimension == 0 {
            return fail("embedding.dimension must be greater than 0".into());
        }
        if self.ingestion.batch_size == 0 {
            return fail("ingestion.batch_size must be greater than 0".into());
        }
        if self.ingestion.chunk_size == 0 {
            return fail("ingestion.chunk_size must be greater than 0".into());
        }
        if self.ingestion.chunk_overlap >= self.ingestion.chunk_size {
            return fail(format!(
                "ingestion.chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.ingestion.chunk_overlap, self.ingestion.chunk_size
            ));
        }
        if self.retrieval.top_k == 0 {
            return fail("retrieval.top_k must be greater than 0".into());
        }
        if !(0.0..=1.0).contains(&self.retrieval.similarity_threshold) {
            return fail("retrieval.similarity_threshold must be within [0, 1]".into());
        }
        if !(self.budget.daily_budget_usd > 0.0) {
            return fail("budget.daily_budget_usd must be positive".into());
        }
        if !(self.budget.warning_threshold > 0.0 && self.budget.warning_threshold < 1.0) {
            return fail("budget.warning_threshold must be within (0, 1)".into());
        }
        if !SUPPORTED_LANGUAGES.contains(&self.answer.default_language.as_str()) {
            return fail(format!(
                "answer.default_language '{}' is not one of {:?}",
                self.answer.default_language, SUPPORTED_LANGUAGES
            ));
        }
        if crate::services::prompt::PromptTemplate::get(&self.answer.prompt_version).is_none() {
            return fail(format!(
                "answer.prompt_version '{}' is not one of {:?}",
                self.answer.prompt_version,
                crate::services::prompt::versions().collect::<Vec<_>>()
            ));
        }
        if self.store.driver == StoreDriver::Postgres && self.store.postgres.url.is_none() {
            return fail(format!(
                "store.postgres.url is required for the postgres driver (or set {ENV_DATABASE_URL})"
            ));
        }
        Ok(())
    }

    /// Ledger database path, resolved against the data directory when unset.
    pub fn ledger_path(&self) -> Option<PathBuf> {
        self.budget
            .ledger_path
            .clone()
            .or_else(|| Self::data_dir().map(|d| d.join("ledger.db")))
    }

    /// Memory-store snapshot path, resolved against the data directory when unset.
    pub fn snapshot_path(&self) -> Option<PathBuf> {
        self.store
            .memory
            .snapshot_path
            .clone()
            .or_else(|| Self::data_dir().map(|d| d.join("chunks.json")))
    }
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    /// OpenAI-compatible `/embeddings` endpoint
    Http,
    /// Local ONNX sentence-transformer model
    #[default]
    Onnx,
    /// Deterministic feature hashing, no model required
    Hash,
}

impl std::fmt::Display for EmbeddingProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmbeddingProvider::Http => write!(f, "http"),
            EmbeddingProvider::Onnx => write!(f, "onnx"),
            EmbeddingProvider::Hash => write!(f, "hash"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub provider: EmbeddingProvider,

    #[serde(default = "default_embedding_url")]
    pub url: String,

    #[serde(default = "default_embedding_model")]
    pub model: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_embedding_dimension")]
    pub dimension: u32,

    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,

    /// Attempts per query embedding at answer time, including the first.
    #[serde(default = "default_embedding_retries")]
    pub max_retries: u32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// Directory holding `model.onnx` and `tokenizer.json`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_path: Option<PathBuf>,
}

fn default_embedding_url() -> String {
    DEFAULT_EMBEDDING_URL.to_string()
}

fn default_embedding_model() -> String {
    DEFAULT_EMBEDDING_MODEL.to_string()
}

fn default_embedding_dimension() -> u32 {
    DEFAULT_EMBEDDING_DIMENSION
}

fn default_embedding_timeout() -> u64 {
    30
}

fn default_embedding_retries() -> u32 {
    3
}

fn default_max_tokens() -> usize {
    256
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::default(),
            url: default_embedding_url(),
            model: default_embedding_model(),
            api_key: None,
            dimension: default_embedding_dimension(),
            timeout_secs: default_embedding_timeout(),
            max_retries: default_embedding_retries(),
            max_tokens: default_max_tokens(),
            model_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_generation_url")]
    pub url: String,

    #[serde(default = "default_generation_model")]
    pub model: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_generation_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_generation_timeout")]
    pub timeout_secs: u64,

    /// Attempts per generation call, including the first.
    #[serde(default = "default_generation_retries")]
    pub max_retries: u32,
}

fn default_generation_url() -> String {
    DEFAULT_GENERATION_URL.to_string()
}

fn default_generation_model() -> String {
    DEFAULT_GENERATION_MODEL.to_string()
}

fn default_temperature() -> f32 {
    0.1
}

fn default_generation_max_tokens() -> u32 {
    1000
}

fn default_generation_timeout() -> u64 {
    60
}

fn default_generation_retries() -> u32 {
    3
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            url: default_generation_url(),
            model: default_generation_model(),
            api_key: None,
            temperature: default_temperature(),
            max_tokens: default_generation_max_tokens(),
            timeout_secs: default_generation_timeout(),
            max_retries: default_generation_retries(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreDriver {
    #[default]
    Memory,
    Postgres,
}

impl std::fmt::Display for StoreDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreDriver::Memory => write!(f, "memory"),
            StoreDriver::Postgres => write!(f, "postgres"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoreConfig {
    #[serde(default)]
    pub driver: StoreDriver,

    #[serde(default)]
    pub memory: MemoryStoreConfig,

    #[serde(default)]
    pub postgres: PostgresConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryStoreConfig {
    /// Persist a JSON snapshot so CLI invocations share one corpus.
    #[serde(default = "default_true")]
    pub persist: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_path: Option<PathBuf>,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            persist: true,
            snapshot_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default = "default_schema")]
    pub schema: String,

    #[serde(default = "default_table")]
    pub table: String,

    #[serde(default = "default_pool_max")]
    pub pool_max: u32,

    #[serde(default = "default_pool_acquire_timeout")]
    pub pool_acquire_timeout_secs: u64,

    /// Base `hnsw.ef_search`; widened when metadata filters are present.
    #[serde(default = "default_ef_search")]
    pub ef_search: u32,
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_table() -> String {
    DEFAULT_TABLE.to_string()
}

fn default_pool_max() -> u32 {
    10
}

fn default_pool_acquire_timeout() -> u64 {
    30
}

fn default_ef_search() -> u32 {
    40
}

impl PostgresConfig {
    pub fn qualified_table_name(&self) -> String {
        format!("\"{}\".\"{}\"", self.schema, self.table)
    }
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            url: None,
            schema: default_schema(),
            table: default_table(),
            pool_max: default_pool_max(),
            pool_acquire_timeout_secs: default_pool_acquire_timeout(),
            ef_search: default_ef_search(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    /// Target window size in characters.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,

    /// Chunks per embedding request.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Attempts per embedding batch, including the first.
    #[serde(default = "default_ingest_retries")]
    pub max_retries: u32,

    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    #[serde(default = "default_exclude_patterns")]
    pub exclude_patterns: Vec<String>,
}

fn default_chunk_size() -> usize {
    1200
}

fn default_chunk_overlap() -> usize {
    200
}

fn default_batch_size() -> usize {
    32
}

fn default_ingest_retries() -> u32 {
    3
}

fn default_max_file_size() -> u64 {
    10 * 1024 * 1024
}

fn default_exclude_patterns() -> Vec<String> {
    vec![
        "**/.git/**".to_string(),
        "**/node_modules/**".to_string(),
        "**/target/**".to_string(),
    ]
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            batch_size: default_batch_size(),
            max_retries: default_ingest_retries(),
            max_file_size: default_max_file_size(),
            exclude_patterns: default_exclude_patterns(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,

    #[serde(default = "default_retrieval_timeout")]
    pub timeout_secs: u64,
}

fn default_top_k() -> usize {
    10
}

fn default_similarity_threshold() -> f32 {
    0.3
}

fn default_retrieval_timeout() -> u64 {
    10
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            similarity_threshold: default_similarity_threshold(),
            timeout_secs: default_retrieval_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerConfig {
    #[serde(default = "default_prompt_version")]
    pub prompt_version: String,

    #[serde(default = "default_history_turns")]
    pub max_history_turns: usize,

    #[serde(default = "default_preview_chars")]
    pub preview_chars: usize,

    #[serde(default = "default_language")]
    pub default_language: String,

    #[serde(default = "default_max_question_chars")]
    pub max_question_chars: usize,
}

fn default_prompt_version() -> String {
    DEFAULT_PROMPT_VERSION.to_string()
}

fn default_history_turns() -> usize {
    6
}

fn default_preview_chars() -> usize {
    200
}

fn default_language() -> String {
    "en".to_string()
}

fn default_max_question_chars() -> usize {
    4000
}

impl Default for AnswerConfig {
    fn default() -> Self {
        Self {
            prompt_version: default_prompt_version(),
            max_history_turns: default_history_turns(),
            preview_chars: default_preview_chars(),
            default_language: default_language(),
            max_question_chars: default_max_question_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "default_daily_budget")]
    pub daily_budget_usd: f64,

    /// Fraction of the budget at which the level becomes `warning`.
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,

    /// Persist the ledger so a restart resumes today's total.
    #[serde(default = "default_true")]
    pub persist: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ledger_path: Option<PathBuf>,
}

fn default_daily_budget() -> f64 {
    50.0
}

fn default_warning_threshold() -> f64 {
    0.8
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily_budget_usd: default_daily_budget(),
            warning_threshold: default_warning_threshold(),
            persist: true,
            ledger_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_anonymous_limit")]
    pub anonymous: RateLimit,

    #[serde(default = "default_user_limit")]
    pub user: RateLimit,

    #[serde(default = "default_chat_limit")]
    pub chat: RateLimit,

    #[serde(default = "default_upload_limit")]
    pub upload: RateLimit,

    #[serde(default = "default_burst_limit")]
    pub burst: RateLimit,
}

fn default_anonymous_limit() -> RateLimit {
    RateLimit::per_minute(100)
}

fn default_user_limit() -> RateLimit {
    RateLimit::per_hour(1000)
}

fn default_chat_limit() -> RateLimit {
    RateLimit::per_minute(50)
}

fn default_upload_limit() -> RateLimit {
    RateLimit::per_hour(10)
}

fn default_burst_limit() -> RateLimit {
    RateLimit::per_minute(20)
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            anonymous: default_anonymous_limit(),
            user: default_user_limit(),
            chat: default_chat_limit(),
            upload: default_upload_limit(),
            burst: default_burst_limit(),
        }
    }
}

/// Per-model price, USD per one million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub input: f64,
    pub output: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PricingConfig {
    /// Extra or replacement entries keyed by model id.
    #[serde(default)]
    pub models: BTreeMap<String, ModelPrice>,

    /// Price for models missing from the table. When unset, the most
    /// expensive known price is used so unknown models never run free.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<ModelPrice>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OutputConfig {
    #[serde(default)]
    pub default_format: OutputFormat,
}

fn default_true() -> bool {
    true
}

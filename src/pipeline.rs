//! Facade over ingestion and answering.
//!
//! Every answer passes validation, the rate limiter and the budget guard
//! before the strategy runs; the usage row is appended afterwards.

use std::sync::Arc;

use crate::error::{IngestError, PipelineError};
use crate::models::{Answer, AnswerRequest, CallerIdentity, Config, SUPPORTED_LANGUAGES};
use crate::services::budget::{AlertNotifier, BudgetGuard, BudgetStatus};
use crate::services::chunk_store::{ChunkStore, StoreStats, create_store};
use crate::services::embedding::{Embedder, create_embedder};
use crate::services::generation::{Generator, create_generator};
use crate::services::ingest::{
    DocumentInput, IngestOptions, IngestionReport, Ingestor, ReprocessMode, ReprocessTarget,
};
use crate::services::ledger::{AnswerLogEntry, LedgerStore, SqliteLedger};
use crate::services::pricing::PricingTable;
use crate::services::rate_limit::{RateDecision, RateLimiter, Scope};
use crate::services::retriever::Retriever;
use crate::services::strategy::{AnswerStrategy, BaselineStrategy, StrategySettings};
use crate::utils::clock::{Clock, SystemClock};

/// Assembles a [`Pipeline`], creating whatever was not injected from config.
#[derive(Debug)]
pub struct PipelineBuilder {
    config: Config,
    embedder: Option<Arc<dyn Embedder>>,
    store: Option<Arc<dyn ChunkStore>>,
    generator: Option<Arc<dyn Generator>>,
    ledger: Option<Arc<dyn LedgerStore>>,
    notifier: Option<Arc<dyn AlertNotifier>>,
    clock: Option<Arc<dyn Clock>>,
}

impl PipelineBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            embedder: None,
            store: None,
            generator: None,
            ledger: None,
            notifier: None,
            clock: None,
        }
    }

    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn store(mut self, store: Arc<dyn ChunkStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn generator(mut self, generator: Arc<dyn Generator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn ledger(mut self, ledger: Arc<dyn LedgerStore>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn AlertNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub async fn build(self) -> Result<Pipeline, PipelineError> {
        let config = self.config;

        let embedder = match self.embedder {
            Some(e) => e,
            None => create_embedder(&config.embedding)?,
        };
        let store = match self.store {
            Some(s) => s,
            None => create_store(&config, embedder.dimension()).await?,
        };
        if embedder.dimension() != store.dimension() {
            return Err(PipelineError::DimensionMismatch {
                expected: store.dimension(),
                actual: embedder.dimension(),
            });
        }

        let generator = match self.generator {
            Some(g) => g,
            None => create_generator(&config.generation)?,
        };
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let ledger = match self.ledger {
            Some(l) => Some(l),
            None if config.budget.persist => {
                let path = config.ledger_path().ok_or_else(|| {
                    PipelineError::Internal("could not determine ledger path".into())
                })?;
                let ledger = SqliteLedger::open(&path).map_err(|e| {
                    PipelineError::Internal(format!(
                        "failed to open ledger {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Some(Arc::new(ledger) as Arc<dyn LedgerStore>)
            }
            None => None,
        };

        let mut budget = BudgetGuard::new(&config.budget, clock.clone());
        if let Some(notifier) = self.notifier {
            budget = budget.with_notifier(notifier);
        }
        if let Some(ledger) = &ledger {
            budget = budget
                .with_store(ledger.clone())
                .map_err(|e| PipelineError::Internal(format!("failed to load ledger: {}", e)))?;
        }
        let budget = Arc::new(budget);

        let limiter = Arc::new(RateLimiter::new(&config.rate_limit, clock.clone()));

        let retriever = Retriever::new(store.clone(), config.retrieval.similarity_threshold);
        let strategy = BaselineStrategy::new(
            embedder.clone(),
            retriever,
            generator,
            budget.clone(),
            StrategySettings::from_config(&config),
        )?
        .with_pricing(PricingTable::from_config(&config.pricing));

        let ingestor = Ingestor::new(embedder.clone(), store.clone(), config.ingestion.clone());

        tracing::info!(
            backend = store.backend_name(),
            embedding_model = embedder.model_name(),
            dimension = embedder.dimension(),
            rate_limiting = limiter.is_enabled(),
            "pipeline ready"
        );

        Ok(Pipeline {
            config,
            embedder,
            store,
            ingestor,
            strategy: Arc::new(strategy),
            budget,
            limiter,
            ledger,
            clock,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    config: Config,
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn ChunkStore>,
    ingestor: Ingestor,
    strategy: Arc<dyn AnswerStrategy>,
    budget: Arc<BudgetGuard>,
    limiter: Arc<RateLimiter>,
    ledger: Option<Arc<dyn LedgerStore>>,
    clock: Arc<dyn Clock>,
}

impl Pipeline {
    pub fn builder(config: Config) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    /// Build every component from configuration.
    pub async fn from_config(config: Config) -> Result<Self, PipelineError> {
        PipelineBuilder::new(config).build().await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    pub fn store(&self) -> &Arc<dyn ChunkStore> {
        &self.store
    }

    pub fn ledger(&self) -> Option<&Arc<dyn LedgerStore>> {
        self.ledger.as_ref()
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub async fn answer(&self, request: AnswerRequest) -> Result<Answer, PipelineError> {
        let question = request.question.trim();
        if question.is_empty() {
            return Err(PipelineError::Validation("question is empty".into()));
        }
        let max_chars = self.config.answer.max_question_chars;
        if question.chars().count() > max_chars {
            return Err(PipelineError::Validation(format!(
                "question is longer than {} characters",
                max_chars
            )));
        }

        let scopes = [Scope::for_caller(&request.caller), Scope::Chat, Scope::Burst];
        self.admit(&request.caller, &scopes)?;

        self.budget.ensure_allowed()?;

        let language = self.resolve_language(request.language_hint.as_deref());
        let answer = self
            .strategy
            .generate_answer(question, &request.history, &language, &request.filters)
            .await?;

        self.log_answer(&request.caller, &answer);
        Ok(answer)
    }

    /// Charge one upload against the caller's scope and the upload scope.
    pub fn admit_upload(&self, caller: &CallerIdentity) -> Result<RateDecision, PipelineError> {
        self.admit(caller, &[Scope::for_caller(caller), Scope::Upload])
    }

    pub async fn ingest_document(
        &self,
        document_id: &str,
        text: &str,
        options: &IngestOptions,
    ) -> Result<IngestionReport, IngestError> {
        self.ingestor.ingest(document_id, text, options).await
    }

    pub async fn ingest_batch(
        &self,
        documents: Vec<DocumentInput>,
    ) -> Vec<(String, Result<IngestionReport, IngestError>)> {
        self.ingestor.ingest_batch(documents).await
    }

    pub async fn reprocess(
        &self,
        target: &ReprocessTarget,
        mode: ReprocessMode,
    ) -> Result<IngestionReport, IngestError> {
        self.ingestor.reprocess(target, mode).await
    }

    pub fn budget_status(&self) -> BudgetStatus {
        self.budget.check()
    }

    pub async fn store_stats(&self) -> Result<StoreStats, PipelineError> {
        Ok(self.store.stats().await?)
    }

    /// Reset counters. With no identity every counter is cleared; with no
    /// scope every counter of the identity is.
    pub fn clear_rate_limits(&self, identity: Option<&str>, scope: Option<Scope>) -> usize {
        match (identity, scope) {
            (Some(id), Some(scope)) => usize::from(self.limiter.clear(id, scope)),
            (Some(id), None) => self.limiter.clear_identity(id),
            (None, _) => self.limiter.clear_all(),
        }
    }

    fn admit(
        &self,
        caller: &CallerIdentity,
        scopes: &[Scope],
    ) -> Result<RateDecision, PipelineError> {
        let decision = self.limiter.allow_all(&caller.key(), scopes);
        if !decision.allowed {
            tracing::info!(
                caller = %caller,
                scope = %decision.scope,
                retry_after_secs = decision.reset_seconds,
                "request rate limited"
            );
            return Err(PipelineError::RateLimited {
                scope: decision.scope.to_string(),
                retry_after_secs: decision.reset_seconds,
            });
        }
        Ok(decision)
    }

    fn resolve_language(&self, hint: Option<&str>) -> String {
        let default = &self.config.answer.default_language;
        match hint.map(|h| h.trim().to_lowercase()) {
            Some(code) if SUPPORTED_LANGUAGES.contains(&code.as_str()) => code,
            Some(code) if !code.is_empty() => {
                tracing::warn!(
                    requested = %code,
                    fallback = %default,
                    "unsupported language, using default"
                );
                default.clone()
            }
            _ => default.clone(),
        }
    }

    fn log_answer(&self, caller: &CallerIdentity, answer: &Answer) {
        let Some(ledger) = &self.ledger else {
            return;
        };
        let entry = AnswerLogEntry {
            created_at: self.clock.now(),
            caller: caller.key(),
            model: answer.metadata.model.clone(),
            method: answer.method.clone(),
            prompt_version: answer.prompt_version.clone(),
            prompt_tokens: answer.usage.prompt_tokens,
            completion_tokens: answer.usage.completion_tokens,
            cost_usd: answer.usage.cost_usd,
            chunks_used: answer.metadata.chunks_used,
            latency_ms: answer.metadata.latency_ms,
        };
        if let Err(e) = ledger.append_answer(&entry) {
            tracing::warn!(error = %e, "failed to append answer log");
        }
    }
}

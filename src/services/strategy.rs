//! Answer strategies: retrieve, prompt, generate, cite.
//!
//! [`BaselineStrategy`] walks a fixed state machine:
//!
//! ```text
//! Idle -> Retrieving -> Prompting -> Generating -> Citing -> Done
//!            \______________\______________\__________\---> Failed
//! ```
//!
//! Retries happen only inside the embedding and generation steps. The
//! generation call runs on its own task, so dropping the answer future stops
//! the wait but the provider call still completes and its cost is booked.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;

use crate::error::{EmbeddingError, GenerationError, PipelineError, Step};
use crate::models::{Answer, AnswerMetadata, Config, Message, MetadataFilter, Usage};
use crate::services::budget::SpendRecorder;
use crate::services::citation::CitationExtractor;
use crate::services::embedding::Embedder;
use crate::services::generation::{Completion, Generator};
use crate::services::pricing::PricingTable;
use crate::services::prompt::PromptTemplate;
use crate::services::retriever::Retriever;
use crate::utils::retry::{RetryConfig, RetryResult, with_retry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyState {
    Idle,
    Retrieving,
    Prompting,
    Generating,
    Citing,
    Done,
    Failed,
}

impl StrategyState {
    pub fn can_transition_to(&self, next: StrategyState) -> bool {
        use StrategyState::*;
        matches!(
            (self, next),
            (Idle, Retrieving)
                | (Retrieving, Prompting)
                | (Prompting, Generating)
                | (Generating, Citing)
                | (Citing, Done)
                | (Retrieving | Prompting | Generating | Citing, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StrategyState::Done | StrategyState::Failed)
    }
}

impl fmt::Display for StrategyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StrategyState::Idle => "idle",
            StrategyState::Retrieving => "retrieving",
            StrategyState::Prompting => "prompting",
            StrategyState::Generating => "generating",
            StrategyState::Citing => "citing",
            StrategyState::Done => "done",
            StrategyState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct Run {
    state: StrategyState,
}

impl Run {
    fn new() -> Self {
        Self {
            state: StrategyState::Idle,
        }
    }

    fn advance(&mut self, next: StrategyState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid transition {} -> {}",
            self.state,
            next
        );
        tracing::trace!(from = %self.state, to = %next, "strategy transition");
        self.state = next;
    }

    fn fail(&mut self, error: PipelineError) -> PipelineError {
        tracing::debug!(state = %self.state, code = error.code(), "strategy failed");
        self.advance(StrategyState::Failed);
        error
    }
}

#[async_trait]
pub trait AnswerStrategy: Send + Sync + fmt::Debug {
    /// Recorded as `Answer::method`.
    fn method(&self) -> &'static str;

    async fn generate_answer(
        &self,
        query: &str,
        history: &[Message],
        language: &str,
        filters: &MetadataFilter,
    ) -> Result<Answer, PipelineError>;
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Tunables for [`BaselineStrategy`].
#[derive(Debug, Clone)]
pub struct StrategySettings {
    pub prompt_version: String,
    pub top_k: usize,
    pub similarity_threshold: f32,
    pub max_history_turns: usize,
    pub preview_chars: usize,
    pub embedding_timeout: Duration,
    pub retrieval_timeout: Duration,
    pub generation_timeout: Duration,
    pub embedding_retry: RetryConfig,
    pub generation_retry: RetryConfig,
}

impl StrategySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            prompt_version: config.answer.prompt_version.clone(),
            top_k: config.retrieval.top_k,
            similarity_threshold: config.retrieval.similarity_threshold,
            max_history_turns: config.answer.max_history_turns,
            preview_chars: config.answer.preview_chars,
            embedding_timeout: Duration::from_secs(config.embedding.timeout_secs),
            retrieval_timeout: Duration::from_secs(config.retrieval.timeout_secs),
            generation_timeout: Duration::from_secs(config.generation.timeout_secs),
            embedding_retry: RetryConfig::new(config.embedding.max_retries),
            generation_retry: RetryConfig::new(config.generation.max_retries),
        }
    }
}

impl Default for StrategySettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Dense retrieval, one prompt, one generation.
#[derive(Debug, Clone)]
pub struct BaselineStrategy {
    embedder: Arc<dyn Embedder>,
    retriever: Retriever,
    generator: Arc<dyn Generator>,
    spend: Arc<dyn SpendRecorder>,
    pricing: Arc<PricingTable>,
    template: &'static PromptTemplate,
    citations: CitationExtractor,
    settings: StrategySettings,
}

impl BaselineStrategy {
    pub const METHOD: &'static str = "baseline";

    pub fn new(
        embedder: Arc<dyn Embedder>,
        retriever: Retriever,
        generator: Arc<dyn Generator>,
        spend: Arc<dyn SpendRecorder>,
        settings: StrategySettings,
    ) -> Result<Self, PipelineError> {
        let template = PromptTemplate::get(&settings.prompt_version).ok_or_else(|| {
            PipelineError::Internal(format!(
                "unknown prompt version {}",
                settings.prompt_version
            ))
        })?;

        Ok(Self {
            embedder,
            retriever,
            generator,
            spend,
            pricing: Arc::new(PricingTable::builtin()),
            template,
            citations: CitationExtractor::new(settings.preview_chars),
            settings,
        })
    }

    pub fn with_pricing(mut self, pricing: PricingTable) -> Self {
        self.pricing = Arc::new(pricing);
        self
    }

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>, PipelineError> {
        let timeout = self.settings.embedding_timeout;
        let embedder = &self.embedder;

        let result = with_retry(&self.settings.embedding_retry, || async move {
            tokio::time::timeout(timeout, embedder.embed_query(query))
                .await
                .unwrap_or(Err(EmbeddingError::Timeout))
        })
        .await;

        match result.into_result() {
            Ok(embedding) => Ok(embedding),
            Err(EmbeddingError::Timeout) => Err(PipelineError::Timeout {
                step: Step::Embedding,
                timeout_ms: millis(timeout),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Run the provider call on its own task and book its cost there.
    async fn generate(&self, messages: Vec<Message>) -> Result<(Completion, f64), PipelineError> {
        let generator = self.generator.clone();
        let spend = self.spend.clone();
        let pricing = self.pricing.clone();
        let retry = self.settings.generation_retry.clone();
        let timeout = self.settings.generation_timeout;

        let task = tokio::spawn(async move {
            let provider = &generator;
            let messages = &messages;
            let result = with_retry(&retry, || async move {
                tokio::time::timeout(timeout, provider.complete(messages))
                    .await
                    .unwrap_or(Err(GenerationError::Timeout))
            })
            .await;

            match result {
                RetryResult::Success { value, attempts } => {
                    let cost =
                        pricing.cost(generator.model(), value.prompt_tokens, value.completion_tokens);
                    spend.record(cost);
                    tracing::debug!(
                        model = generator.model(),
                        attempts,
                        prompt_tokens = value.prompt_tokens,
                        completion_tokens = value.completion_tokens,
                        cost_usd = cost,
                        "generation completed"
                    );
                    Ok((value, cost))
                }
                RetryResult::Failed {
                    last_error,
                    attempts,
                } => {
                    tracing::warn!(error = %last_error, attempts, "generation failed");
                    Err(last_error)
                }
            }
        });

        match task.await {
            Ok(Ok(done)) => Ok(done),
            Ok(Err(GenerationError::Timeout)) => Err(PipelineError::Timeout {
                step: Step::Generation,
                timeout_ms: millis(timeout),
            }),
            Ok(Err(e)) => Err(e.into()),
            Err(e) => Err(PipelineError::Internal(format!(
                "generation task failed: {}",
                e
            ))),
        }
    }
}

#[async_trait]
impl AnswerStrategy for BaselineStrategy {
    fn method(&self) -> &'static str {
        Self::METHOD
    }

    async fn generate_answer(
        &self,
        query: &str,
        history: &[Message],
        language: &str,
        filters: &MetadataFilter,
    ) -> Result<Answer, PipelineError> {
        let started = Instant::now();
        let mut run = Run::new();

        if query.trim().is_empty() {
            return Err(PipelineError::Validation("question is empty".into()));
        }

        run.advance(StrategyState::Retrieving);
        let embedding = match self.embed_query(query).await {
            Ok(e) => e,
            Err(e) => return Err(run.fail(e)),
        };

        let retrieval = tokio::time::timeout(
            self.settings.retrieval_timeout,
            self.retriever
                .search_relevant(&embedding, self.settings.top_k, filters),
        )
        .await;
        let retrieved = match retrieval {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => return Err(run.fail(e.into())),
            Err(_) => {
                return Err(run.fail(PipelineError::Timeout {
                    step: Step::Retrieval,
                    timeout_ms: millis(self.settings.retrieval_timeout),
                }));
            }
        };
        if retrieved.results.is_empty() {
            tracing::info!(
                candidates = retrieved.candidates,
                "no chunks above threshold, answering without context"
            );
        }

        run.advance(StrategyState::Prompting);
        let messages = self.template.render(
            query,
            &retrieved.results,
            history,
            self.settings.max_history_turns,
            language,
        );

        run.advance(StrategyState::Generating);
        let (completion, cost_usd) = match self.generate(messages).await {
            Ok(done) => done,
            Err(e) => return Err(run.fail(e)),
        };

        run.advance(StrategyState::Citing);
        let citations = self.citations.extract(&completion.text, &retrieved.results);

        run.advance(StrategyState::Done);
        let answer = Answer {
            content: completion.text,
            citations,
            method: Self::METHOD.to_string(),
            prompt_version: self.template.version.to_string(),
            usage: Usage {
                prompt_tokens: completion.prompt_tokens,
                completion_tokens: completion.completion_tokens,
                cost_usd,
            },
            metadata: AnswerMetadata {
                chunks_retrieved: retrieved.candidates,
                chunks_used: retrieved.results.len(),
                top_similarity_score: retrieved.top_score(),
                model: self.generator.model().to_string(),
                embedding_model: self.embedder.model_name().to_string(),
                top_k: self.settings.top_k,
                similarity_threshold: self.retriever.similarity_threshold(),
                context_used: !retrieved.results.is_empty(),
                language: language.to_string(),
                latency_ms: started.elapsed().as_millis() as u64,
            },
        };

        tracing::info!(
            citations = answer.citations.len(),
            chunks_used = answer.metadata.chunks_used,
            cost_usd = answer.usage.cost_usd,
            latency_ms = answer.metadata.latency_ms,
            "answer generated"
        );
        Ok(answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BudgetConfig, Chunk, ChunkMetadata};
    use crate::services::budget::BudgetGuard;
    use crate::services::chunk_store::{ChunkStore, MemoryStore};
    use crate::services::embedding::HashEmbedder;
    use crate::services::prompt::NO_CONTEXT_MARKER;
    use crate::services::testing::{ScriptedGenerator, SlowEmbedder, SlowSearchStore};
    use crate::utils::clock::SystemClock;

    const DIM: usize = 64;

    struct Fixture {
        strategy: BaselineStrategy,
        generator: Arc<ScriptedGenerator>,
        budget: Arc<BudgetGuard>,
    }

    fn settings() -> StrategySettings {
        StrategySettings {
            similarity_threshold: 0.2,
            generation_retry: RetryConfig::new(2).with_initial_delay(Duration::from_millis(1)),
            embedding_retry: RetryConfig::once(),
            ..Default::default()
        }
    }

    async fn fixture(generator: ScriptedGenerator, settings: StrategySettings) -> Fixture {
        let embedder = Arc::new(HashEmbedder::new(DIM));
        let store = Arc::new(MemoryStore::new(DIM));

        let passages = [
            ("Reset", 3, "To reset the router hold the reset button for ten seconds."),
            ("Ports", 4, "Connect the DMX input cable to port one and terminate the line."),
        ];
        let chunks: Vec<Chunk> = passages
            .iter()
            .enumerate()
            .map(|(i, (section, page, text))| {
                let metadata = ChunkMetadata {
                    document_title: "Router Manual".into(),
                    page_number: Some(*page),
                    section_title: Some(section.to_string()),
                    language: "en".into(),
                    ..Default::default()
                };
                Chunk::new("manual", i as u32, text.to_string(), metadata)
                    .with_embedding(embedder.embed_text(text))
            })
            .collect();
        store.replace_document("manual", chunks).await.unwrap();

        let generator = Arc::new(generator);
        let budget = Arc::new(BudgetGuard::new(
            &BudgetConfig::default(),
            Arc::new(SystemClock),
        ));
        let retriever = Retriever::new(store, settings.similarity_threshold);
        let strategy = BaselineStrategy::new(
            embedder,
            retriever,
            generator.clone(),
            budget.clone(),
            settings,
        )
        .unwrap();

        Fixture {
            strategy,
            generator,
            budget,
        }
    }

    #[test]
    fn test_transitions() {
        use StrategyState::*;
        assert!(Idle.can_transition_to(Retrieving));
        assert!(Citing.can_transition_to(Done));
        assert!(Generating.can_transition_to(Failed));
        assert!(!Idle.can_transition_to(Generating));
        assert!(!Done.can_transition_to(Failed));
        assert!(!Idle.can_transition_to(Failed));
        assert!(Done.is_terminal() && Failed.is_terminal());
    }

    #[tokio::test]
    async fn test_answer_with_citations_and_cost() {
        let f = fixture(
            ScriptedGenerator::replying("Hold the reset button for ten seconds [S1]."),
            settings(),
        )
        .await;

        let answer = f
            .strategy
            .generate_answer(
                "how do I reset the router button",
                &[],
                "en",
                &MetadataFilter::new(),
            )
            .await
            .unwrap();

        assert_eq!(answer.method, "baseline");
        assert_eq!(answer.prompt_version, "v1.0");
        assert!(answer.metadata.context_used);
        assert_eq!(answer.citations.len(), 1);
        assert_eq!(answer.citations[0].section_title.as_deref(), Some("Reset"));
        assert_eq!(answer.usage.prompt_tokens, 1000);
        // gpt-4o-mini: 1000 * 0.15 + 500 * 0.60 per million
        assert!((answer.usage.cost_usd - 0.00045).abs() < 1e-12);

        let status = f.budget.check();
        assert_eq!(status.request_count, 1);
        assert!((status.spent_usd - 0.00045).abs() < 1e-12);

        let prompt = f.generator.last_messages().unwrap();
        assert!(prompt[0].content.contains("[S1] Document: Router Manual | Page: 3"));
    }

    #[tokio::test]
    async fn test_no_relevant_chunks_still_answers() {
        let mut s = settings();
        s.similarity_threshold = 0.99;
        let f = fixture(ScriptedGenerator::replying("I could not find that."), s).await;

        let answer = f
            .strategy
            .generate_answer("weather in paris", &[], "en", &MetadataFilter::new())
            .await
            .unwrap();

        assert!(answer.citations.is_empty());
        assert!(!answer.metadata.context_used);
        assert_eq!(answer.metadata.top_similarity_score, None);
        let prompt = f.generator.last_messages().unwrap();
        assert!(prompt[0].content.contains(NO_CONTEXT_MARKER));
    }

    #[tokio::test]
    async fn test_transient_generation_error_is_retried() {
        let generator = ScriptedGenerator::replying("ok").then_fail(GenerationError::Throttled {
            message: "slow down".into(),
            retry_after_secs: None,
        });
        let f = fixture(generator, settings()).await;

        f.strategy
            .generate_answer("reset router", &[], "en", &MetadataFilter::new())
            .await
            .unwrap();
        assert_eq!(f.generator.call_count(), 2);
    }

    #[tokio::test]
    async fn test_fatal_generation_error_fails_fast() {
        let generator = ScriptedGenerator::replying("ok")
            .then_fail(GenerationError::AuthError("bad key".into()));
        let f = fixture(generator, settings()).await;

        let err = f
            .strategy
            .generate_answer("reset router", &[], "en", &MetadataFilter::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "provider_fatal");
        assert_eq!(f.generator.call_count(), 1);
        assert_eq!(f.budget.check().request_count, 0);
    }

    #[tokio::test]
    async fn test_generation_timeout() {
        let mut s = settings();
        s.generation_timeout = Duration::from_millis(20);
        s.generation_retry = RetryConfig::once();
        let generator = ScriptedGenerator::replying("late").with_delay(Duration::from_millis(500));
        let f = fixture(generator, s).await;

        let err = f
            .strategy
            .generate_answer("reset router", &[], "en", &MetadataFilter::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Timeout {
                step: Step::Generation,
                ..
            }
        ));
    }

    fn slow_strategy(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn ChunkStore>,
        settings: StrategySettings,
    ) -> (BaselineStrategy, Arc<ScriptedGenerator>) {
        let generator = Arc::new(ScriptedGenerator::replying("unused"));
        let strategy = BaselineStrategy::new(
            embedder,
            Retriever::new(store, settings.similarity_threshold),
            generator.clone(),
            Arc::new(BudgetGuard::new(&BudgetConfig::default(), Arc::new(SystemClock))),
            settings,
        )
        .unwrap();
        (strategy, generator)
    }

    #[tokio::test]
    async fn test_embedding_timeout() {
        let mut s = settings();
        s.embedding_timeout = Duration::from_millis(20);
        let (strategy, generator) = slow_strategy(
            Arc::new(SlowEmbedder::new(DIM, Duration::from_millis(500))),
            Arc::new(MemoryStore::new(DIM)),
            s,
        );

        let err = strategy
            .generate_answer("reset router", &[], "en", &MetadataFilter::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Timeout {
                step: Step::Embedding,
                timeout_ms: 20
            }
        ));
        assert_eq!(err.code(), "timeout");
        assert_eq!(err.to_string(), "embedding step timed out after 20ms");
        assert_eq!(generator.call_count(), 0);
    }

    #[tokio::test]
    async fn test_retrieval_timeout() {
        let mut s = settings();
        s.retrieval_timeout = Duration::from_millis(20);
        let (strategy, generator) = slow_strategy(
            Arc::new(HashEmbedder::new(DIM)),
            Arc::new(SlowSearchStore::new(DIM, Duration::from_millis(500))),
            s,
        );

        let err = strategy
            .generate_answer("reset router", &[], "en", &MetadataFilter::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Timeout {
                step: Step::Retrieval,
                timeout_ms: 20
            }
        ));
        assert_eq!(err.code(), "timeout");
        assert_eq!(generator.call_count(), 0);
    }

    #[test]
    fn test_query_embedding_retries_come_from_embedding_config() {
        let mut config = Config::default();
        config.embedding.max_retries = 5;
        config.ingestion.max_retries = 1;
        let s = StrategySettings::from_config(&config);
        assert_eq!(s.embedding_retry.max_attempts, 5);
    }

    #[tokio::test]
    async fn test_cancelled_caller_still_books_cost() {
        let generator = ScriptedGenerator::replying("done").with_delay(Duration::from_millis(100));
        let f = fixture(generator, settings()).await;

        let cancelled = tokio::time::timeout(
            Duration::from_millis(30),
            f.strategy
                .generate_answer("reset router", &[], "en", &MetadataFilter::new()),
        )
        .await;
        assert!(cancelled.is_err());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(f.budget.check().request_count, 1);
    }

    #[tokio::test]
    async fn test_unknown_prompt_version_is_rejected() {
        let mut s = settings();
        s.prompt_version = "v0.1".into();
        let embedder = Arc::new(HashEmbedder::new(DIM));
        let store: Arc<dyn ChunkStore> = Arc::new(MemoryStore::new(DIM));
        let result = BaselineStrategy::new(
            embedder,
            Retriever::new(store, 0.3),
            Arc::new(ScriptedGenerator::replying("x")),
            Arc::new(BudgetGuard::new(&BudgetConfig::default(), Arc::new(SystemClock))),
            s,
        );
        assert!(matches!(result, Err(PipelineError::Internal(_))));
    }
}

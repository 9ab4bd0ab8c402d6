//! Text generation providers.

mod openai;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::GenerationError;
use crate::models::{GenerationConfig, Message};

pub use openai::OpenAiGenerator;

/// Generated text plus the token counts billed for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[async_trait]
pub trait Generator: Send + Sync + fmt::Debug {
    async fn complete(&self, messages: &[Message]) -> Result<Completion, GenerationError>;

    /// Model identifier, used for pricing.
    fn model(&self) -> &str;
}

pub fn create_generator(
    config: &GenerationConfig,
) -> Result<Arc<dyn Generator>, GenerationError> {
    Ok(Arc::new(OpenAiGenerator::new(config)?))
}

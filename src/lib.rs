pub mod cli;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod services;
pub mod utils;

pub use cli::{Cli, Commands};
pub use error::PipelineError;
pub use models::{Answer, AnswerRequest, CallerIdentity, Config, OutputFormat};
pub use pipeline::{Pipeline, PipelineBuilder};

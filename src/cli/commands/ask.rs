use anyhow::{Context, Result};
use clap::Args;
use std::path::{Path, PathBuf};

use crate::cli::output::get_formatter;
use crate::error::PipelineError;
use crate::models::{AnswerRequest, CallerIdentity, Config, Message, MetadataFilter, OutputFormat};
use crate::pipeline::Pipeline;

use super::parse_key_value;

#[derive(Debug, Args)]
pub struct AskArgs {
    #[arg(required = true, num_args = 1.., help = "Question to answer")]
    pub question: Vec<String>,

    #[arg(long, short = 'u', conflicts_with = "ip", help = "Ask as this user id")]
    pub user: Option<String>,

    #[arg(long, help = "Ask as an anonymous caller from this address")]
    pub ip: Option<String>,

    #[arg(long, short = 'l', help = "Answer language (en, de, fr, es)")]
    pub language: Option<String>,

    #[arg(
        long,
        value_parser = parse_key_value,
        help = "Restrict retrieval to chunks with this metadata (key=value, repeatable)"
    )]
    pub filter: Vec<(String, String)>,

    #[arg(long, help = "JSON file with prior conversation turns [{role, content}]")]
    pub history: Option<PathBuf>,

    #[arg(long, short = 'k', help = "Number of chunks to retrieve")]
    pub top_k: Option<usize>,

    #[arg(long, help = "Minimum similarity score (0.0-1.0)")]
    pub threshold: Option<f32>,
}

impl AskArgs {
    fn caller(&self) -> CallerIdentity {
        match (&self.user, &self.ip) {
            (Some(id), _) => CallerIdentity::user(id.clone()),
            (None, Some(address)) => CallerIdentity::anonymous(address.clone()),
            (None, None) => CallerIdentity::anonymous("127.0.0.1"),
        }
    }
}

pub async fn handle_ask(args: AskArgs, format: OutputFormat, verbose: bool) -> Result<()> {
    let question = args.question.join(" ");
    if question.trim().is_empty() {
        anyhow::bail!("question cannot be empty");
    }

    let mut config = Config::load()?;
    if let Some(top_k) = args.top_k {
        if top_k == 0 {
            anyhow::bail!("top-k must be at least 1");
        }
        config.retrieval.top_k = top_k;
    }
    if let Some(threshold) = args.threshold {
        if !(0.0..=1.0).contains(&threshold) {
            anyhow::bail!("threshold must be between 0.0 and 1.0");
        }
        config.retrieval.similarity_threshold = threshold;
    }

    let history = match &args.history {
        Some(path) => load_history(path)?,
        None => Vec::new(),
    };

    let formatter = get_formatter(format);
    let pipeline = Pipeline::from_config(config)
        .await
        .context("failed to initialize pipeline")?;

    let caller = args.caller();
    if verbose {
        eprintln!("Question: \"{}\"", question);
        eprintln!("  Caller: {}", caller);
        if !args.filter.is_empty() {
            eprintln!("  Filters: {:?}", args.filter);
        }
    }

    let mut request = AnswerRequest::new(question, caller)
        .with_history(history)
        .with_filters(args.filter.iter().cloned().collect::<MetadataFilter>());
    if let Some(ref language) = args.language {
        request = request.with_language(language.clone());
    }

    match pipeline.answer(request).await {
        Ok(answer) => {
            print!("{}", formatter.format_answer(&answer));
            Ok(())
        }
        Err(e) => Err(describe_failure(&e)),
    }
}

fn load_history(path: &Path) -> Result<Vec<Message>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read history file {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("invalid history file {}", path.display()))
}

fn describe_failure(error: &PipelineError) -> anyhow::Error {
    match error.retry_after_secs() {
        Some(secs) => anyhow::anyhow!("{} [{}], retry in {}s", error, error.code(), secs),
        None => anyhow::anyhow!("{} [{}]", error, error.code()),
    }
}

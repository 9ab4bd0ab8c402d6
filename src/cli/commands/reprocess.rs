use anyhow::{Context, Result};
use clap::Args;
use std::time::Instant;

use crate::cli::output::{IngestSummary, get_formatter};
use crate::models::{Config, OutputFormat};
use crate::pipeline::Pipeline;
use crate::services::{ReprocessMode, ReprocessTarget};

#[derive(Debug, Args)]
pub struct ReprocessArgs {
    #[arg(long, short = 'd', help = "Only reprocess this document id")]
    pub document: Option<String>,

    #[arg(
        long,
        help = "Re-embed every chunk, not just those missing an embedding (e.g. after a model change)"
    )]
    pub all_chunks: bool,
}

impl ReprocessArgs {
    fn target(&self) -> ReprocessTarget {
        match &self.document {
            Some(id) => ReprocessTarget::Document(id.clone()),
            None => ReprocessTarget::All,
        }
    }

    fn mode(&self) -> ReprocessMode {
        if self.all_chunks {
            ReprocessMode::AllChunks
        } else {
            ReprocessMode::MissingOnly
        }
    }
}

pub async fn handle_reprocess(
    args: ReprocessArgs,
    format: OutputFormat,
    verbose: bool,
) -> Result<()> {
    let config = Config::load()?;
    let formatter = get_formatter(format);
    let start_time = Instant::now();

    let pipeline = Pipeline::from_config(config)
        .await
        .context("failed to initialize pipeline")?;

    let target = args.target();
    let mode = args.mode();
    if verbose {
        eprintln!("Reprocessing {} ({:?})", target, mode);
    }

    let report = pipeline
        .reprocess(&target, mode)
        .await
        .with_context(|| format!("failed to reprocess {}", target))?;

    let summary = IngestSummary {
        documents: vec![report],
        duration_ms: start_time.elapsed().as_millis() as u64,
        ..Default::default()
    };
    print!("{}", formatter.format_ingest(&summary));

    Ok(())
}

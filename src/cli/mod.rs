//! Operator CLI for the answer pipeline.

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};

use crate::models::OutputFormat;

/// Answer questions from your documents, with citations and a spend cap.
#[derive(Debug, Parser)]
#[command(name = "docsage")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[arg(
        long,
        short = 'f',
        global = true,
        help = "Output format: text, json, or markdown"
    )]
    pub format: Option<OutputFormat>,

    #[arg(long, short = 'v', global = true, help = "Enable verbose output")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Chunk, embed and store documents
    Ingest(commands::IngestArgs),

    /// Re-embed stored chunks (missing embeddings, or all after a model change)
    Reprocess(commands::ReprocessArgs),

    /// Ask a question and get a cited answer
    Ask(commands::AskArgs),

    /// Show store, model, budget and rate-limit status
    Status,

    /// Summarize spend from the ledger
    CostReport(commands::CostReportArgs),

    /// Manage configuration
    #[command(subcommand)]
    Config(commands::ConfigCommand),
}

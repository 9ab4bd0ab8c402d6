use std::sync::Arc;

use anyhow::{Context, Result};

use crate::cli::output::{LimitInfo, StatusInfo, get_formatter};
use crate::models::{Config, OutputFormat, StoreDriver};
use crate::pipeline::Pipeline;
use crate::services::budget::{BudgetGuard, BudgetStatus};
use crate::services::{RateLimiter, Scope, SqliteLedger};
use crate::utils::clock::SystemClock;

pub async fn handle_status(format: OutputFormat, verbose: bool) -> Result<()> {
    let config = Config::load()?;
    let formatter = get_formatter(format);

    let limiter = RateLimiter::new(&config.rate_limit, Arc::new(SystemClock));
    let limits = Scope::ALL
        .iter()
        .map(|scope| LimitInfo {
            scope: scope.to_string(),
            limit: limiter.limit(*scope).to_string(),
        })
        .collect();

    let mut status = StatusInfo {
        store_backend: config.store.driver.to_string(),
        store_connected: false,
        store: None,
        embedding_model: config.embedding.model.clone(),
        dimension: config.embedding.dimension as usize,
        generation_model: config.generation.model.clone(),
        prompt_version: config.answer.prompt_version.clone(),
        budget: standalone_budget(&config)?,
        rate_limiting: limiter.is_enabled(),
        limits,
    };

    match Pipeline::from_config(config.clone()).await {
        Ok(pipeline) => {
            status.store_connected = pipeline.store().health_check().await.unwrap_or(false);
            if status.store_connected {
                status.store = pipeline.store_stats().await.ok();
            }
            status.embedding_model = pipeline.embedder().model_name().to_string();
            status.dimension = pipeline.embedder().dimension();
            status.budget = pipeline.budget_status();
        }
        Err(e) => {
            if verbose {
                eprintln!("Pipeline unavailable: {}", e);
            }
        }
    }

    print!("{}", formatter.format_status(&status));

    if !status.store_connected {
        eprintln!();
        match config.store.driver {
            StoreDriver::Memory => {
                eprintln!("Warning: chunk snapshot could not be loaded. Check the snapshot path.");
            }
            StoreDriver::Postgres => {
                eprintln!("Warning: PostgreSQL not accessible. Check store.postgres.url.");
            }
        }
    }
    if status.store.is_some_and(|s| s.pending_embeddings > 0) {
        eprintln!("Hint: some chunks have no embedding. Run `docsage reprocess`.");
    }

    Ok(())
}

/// Today's budget read straight from the ledger, without building providers.
fn standalone_budget(config: &Config) -> Result<BudgetStatus> {
    let guard = BudgetGuard::new(&config.budget, Arc::new(SystemClock));
    if !config.budget.persist {
        return Ok(guard.check());
    }
    let Some(path) = config.ledger_path().filter(|p| p.exists()) else {
        return Ok(guard.check());
    };
    let ledger = SqliteLedger::open(&path)
        .with_context(|| format!("failed to open ledger {}", path.display()))?;
    let guard = guard
        .with_store(Arc::new(ledger))
        .context("failed to read ledger")?;
    Ok(guard.check())
}

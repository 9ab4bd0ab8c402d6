use anyhow::{Context, Result};
use chrono::{TimeDelta, Utc};
use clap::Args;

use crate::cli::output::{BreakdownReport, CostReport, get_formatter};
use crate::models::{Config, OutputFormat};
use crate::services::LedgerStore;
use crate::services::ledger::{Breakdown, SqliteLedger};

#[derive(Debug, Args)]
pub struct CostReportArgs {
    #[arg(long, short = 'd', default_value_t = 7, help = "Number of days to include")]
    pub days: u32,

    #[arg(long, conflicts_with = "by_method", help = "Break spend down by model")]
    pub by_model: bool,

    #[arg(long, help = "Break spend down by answer method")]
    pub by_method: bool,
}

impl CostReportArgs {
    fn breakdown(&self) -> Option<Breakdown> {
        if self.by_model {
            Some(Breakdown::Model)
        } else if self.by_method {
            Some(Breakdown::Method)
        } else {
            None
        }
    }
}

pub async fn handle_cost_report(
    args: CostReportArgs,
    format: OutputFormat,
    _verbose: bool,
) -> Result<()> {
    if args.days == 0 {
        anyhow::bail!("days must be at least 1");
    }

    let config = Config::load()?;
    let formatter = get_formatter(format);

    let path = config
        .ledger_path()
        .ok_or_else(|| anyhow::anyhow!("could not determine ledger path"))?;
    if !path.exists() {
        println!(
            "{}",
            formatter.format_message(&format!("No spend recorded yet ({})", path.display()))
        );
        return Ok(());
    }
    let ledger = SqliteLedger::open(&path)
        .with_context(|| format!("failed to open ledger {}", path.display()))?;

    let report = build_report(&ledger, args.days, args.breakdown())?;
    print!("{}", formatter.format_cost_report(&report));
    Ok(())
}

fn build_report(
    ledger: &dyn LedgerStore,
    days: u32,
    breakdown: Option<Breakdown>,
) -> Result<CostReport> {
    let now = Utc::now();
    // Today counts as the first day of the window
    let start = now - TimeDelta::days(i64::from(days) - 1);
    let since = start.date_naive();
    let since_ts = since
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
        .unwrap_or(start);

    let summary = ledger
        .usage_summary(since_ts)
        .context("failed to summarize usage")?;
    let daily = ledger
        .daily_totals(since)
        .context("failed to read daily totals")?;
    let breakdown = breakdown
        .map(|by| -> Result<BreakdownReport> {
            let rows = ledger
                .usage_breakdown(since_ts, by)
                .context("failed to break down usage")?;
            let by = match by {
                Breakdown::Model => "model",
                Breakdown::Method => "method",
            };
            Ok(BreakdownReport {
                by: by.to_string(),
                rows,
            })
        })
        .transpose()?;

    Ok(CostReport {
        days,
        since,
        summary,
        daily,
        breakdown,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::budget::SpendLedger;
    use crate::services::ledger::AnswerLogEntry;

    fn entry(model: &str, cost: f64) -> AnswerLogEntry {
        AnswerLogEntry {
            created_at: Utc::now(),
            caller: "user:1".into(),
            model: model.into(),
            method: "baseline".into(),
            prompt_version: "v1.0".into(),
            prompt_tokens: 100,
            completion_tokens: 50,
            cost_usd: cost,
            chunks_used: 2,
            latency_ms: 300,
        }
    }

    #[test]
    fn test_report_by_model() {
        let ledger = SqliteLedger::in_memory().unwrap();
        ledger.append_answer(&entry("gpt-4o-mini", 0.001)).unwrap();
        ledger.append_answer(&entry("gpt-4o-mini", 0.001)).unwrap();
        ledger.append_answer(&entry("gpt-4o", 0.01)).unwrap();
        ledger
            .save_day(&SpendLedger {
                date: Utc::now().date_naive(),
                total_cost_usd: 0.012,
                request_count: 3,
            })
            .unwrap();

        let report = build_report(&ledger, 7, Some(Breakdown::Model)).unwrap();
        assert_eq!(report.summary.requests, 3);
        assert_eq!(report.daily.len(), 1);

        let breakdown = report.breakdown.unwrap();
        assert_eq!(breakdown.by, "model");
        assert_eq!(breakdown.rows[0].key, "gpt-4o");
        assert_eq!(breakdown.rows[1].requests, 2);
    }

    #[test]
    fn test_report_without_breakdown() {
        let ledger = SqliteLedger::in_memory().unwrap();
        let report = build_report(&ledger, 1, None).unwrap();
        assert_eq!(report.summary.requests, 0);
        assert!(report.breakdown.is_none());
        assert_eq!(report.since, Utc::now().date_naive());
    }
}

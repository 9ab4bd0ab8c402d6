use std::fmt::{self, Write as FmtWrite};

use chrono::NaiveDate;
use serde::Serialize;

use crate::models::{Answer, OutputFormat};
use crate::services::budget::{BudgetStatus, SpendLedger};
use crate::services::ledger::{UsageBreakdown, UsageSummary};
use crate::services::{IngestionReport, StoreStats};
use crate::utils::text::normalize_whitespace;

pub trait Formatter {
    fn format_answer(&self, answer: &Answer) -> String;
    fn format_ingest(&self, summary: &IngestSummary) -> String;
    fn format_status(&self, status: &StatusInfo) -> String;
    fn format_cost_report(&self, report: &CostReport) -> String;
    fn format_message(&self, message: &str) -> String;
    fn format_error(&self, error: &str) -> String;
}

/// Outcome of an `ingest` or `reprocess` run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestSummary {
    pub files_scanned: u64,
    pub files_skipped: u64,
    pub documents: Vec<IngestionReport>,
    pub failures: Vec<IngestFailure>,
    pub duration_ms: u64,
}

impl IngestSummary {
    pub fn chunks_written(&self) -> u64 {
        self.documents.iter().map(|d| d.chunks_written as u64).sum()
    }

    pub fn chunks_failed(&self) -> u64 {
        self.documents.iter().map(|d| d.chunks_failed as u64).sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestFailure {
    pub document_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LimitInfo {
    pub scope: String,
    pub limit: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusInfo {
    pub store_backend: String,
    pub store_connected: bool,
    pub store: Option<StoreStats>,
    pub embedding_model: String,
    pub dimension: usize,
    pub generation_model: String,
    pub prompt_version: String,
    pub budget: BudgetStatus,
    pub rate_limiting: bool,
    pub limits: Vec<LimitInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CostReport {
    pub days: u32,
    pub since: NaiveDate,
    pub summary: UsageSummary,
    pub daily: Vec<SpendLedger>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breakdown: Option<BreakdownReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakdownReport {
    pub by: String,
    pub rows: Vec<UsageBreakdown>,
}

fn render(build: impl FnOnce(&mut String) -> fmt::Result) -> String {
    let mut output = String::new();
    // Writing into a String cannot fail
    let _ = build(&mut output);
    output
}

fn page_label(page: Option<u32>) -> String {
    page.map_or_else(|| "-".to_string(), |p| p.to_string())
}

pub struct TextFormatter;

impl Formatter for TextFormatter {
    fn format_answer(&self, answer: &Answer) -> String {
        render(|out| {
            writeln!(out, "{}", answer.content.trim_end())?;
            writeln!(out)?;

            if answer.citations.is_empty() {
                writeln!(out, "Sources: none")?;
            } else {
                writeln!(out, "Sources")?;
                writeln!(out, "-------")?;
                for (i, c) in answer.citations.iter().enumerate() {
                    write!(out, "{}. {}", i + 1, c.document_title)?;
                    if let Some(page) = c.page_number {
                        write!(out, ", page {}", page)?;
                    }
                    if let Some(ref section) = c.section_title {
                        write!(out, " ({})", section)?;
                    }
                    writeln!(out, " [score: {:.3}]", c.relevance_score)?;
                    writeln!(out, "   {}", normalize_whitespace(&c.chunk_text_preview))?;
                }
            }

            writeln!(out)?;
            writeln!(
                out,
                "Model: {} | Chunks: {}/{} | Tokens: {}+{} | Cost: ${:.6} | {}ms",
                answer.metadata.model,
                answer.metadata.chunks_used,
                answer.metadata.chunks_retrieved,
                answer.usage.prompt_tokens,
                answer.usage.completion_tokens,
                answer.usage.cost_usd,
                answer.metadata.latency_ms
            )
        })
    }

    fn format_ingest(&self, summary: &IngestSummary) -> String {
        render(|out| {
            writeln!(out, "Ingestion Complete")?;
            writeln!(out, "------------------")?;
            if summary.files_scanned > 0 {
                writeln!(out, "Files scanned:  {}", summary.files_scanned)?;
                writeln!(out, "Files skipped:  {}", summary.files_skipped)?;
            }
            writeln!(out, "Documents:      {}", summary.documents.len())?;
            writeln!(out, "Chunks written: {}", summary.chunks_written())?;
            writeln!(out, "Chunks failed:  {}", summary.chunks_failed())?;
            writeln!(out, "Duration:       {}ms", summary.duration_ms)?;

            if summary.chunks_failed() > 0 {
                writeln!(out)?;
                writeln!(
                    out,
                    "Some chunks have no embedding yet. Run `docsage reprocess` to retry."
                )?;
            }
            if !summary.failures.is_empty() {
                writeln!(out)?;
                writeln!(out, "Failed documents:")?;
                for f in &summary.failures {
                    writeln!(out, "  {}: {}", f.document_id, f.error)?;
                }
            }
            Ok(())
        })
    }

    fn format_status(&self, status: &StatusInfo) -> String {
        render(|out| {
            writeln!(out, "Status")?;
            writeln!(out, "------")?;

            let store_state = if status.store_connected {
                "[CONNECTED]"
            } else {
                "[DISCONNECTED]"
            };
            writeln!(out, "Chunk Store:   {} {}", status.store_backend, store_state)?;
            if let Some(ref stats) = status.store {
                writeln!(out, "  Documents:   {}", stats.documents)?;
                writeln!(out, "  Chunks:      {}", stats.chunks)?;
                writeln!(out, "  Pending:     {}", stats.pending_embeddings)?;
            }
            writeln!(out)?;

            writeln!(out, "Embedding:     {}", status.embedding_model)?;
            writeln!(out, "  Dimension:   {}", status.dimension)?;
            writeln!(out, "Generation:    {}", status.generation_model)?;
            writeln!(out, "  Prompt:      {}", status.prompt_version)?;
            writeln!(out)?;

            let budget = &status.budget;
            writeln!(out, "Budget:        [{}]", budget.level.to_string().to_uppercase())?;
            writeln!(out, "  Date:        {}", budget.date)?;
            writeln!(
                out,
                "  Spent:       ${:.4} of ${:.2} ({:.1}%)",
                budget.spent_usd,
                budget.budget_usd,
                budget.used_pct()
            )?;
            writeln!(out, "  Requests:    {}", budget.request_count)?;
            writeln!(out)?;

            if status.rate_limiting {
                writeln!(out, "Rate Limits:")?;
                for l in &status.limits {
                    writeln!(out, "  {:<12} {}", l.scope, l.limit)?;
                }
            } else {
                writeln!(out, "Rate Limits:   disabled")?;
            }
            Ok(())
        })
    }

    fn format_cost_report(&self, report: &CostReport) -> String {
        render(|out| {
            writeln!(out, "Cost Report (last {} days, since {})", report.days, report.since)?;
            writeln!(out, "-----------")?;
            let s = &report.summary;
            writeln!(out, "Requests:     {}", s.requests)?;
            writeln!(out, "Total cost:   ${:.4}", s.total_cost_usd)?;
            writeln!(out, "Total tokens: {}", s.total_tokens)?;
            writeln!(out, "Avg latency:  {}ms", s.avg_latency_ms)?;

            if !report.daily.is_empty() {
                writeln!(out)?;
                writeln!(out, "Daily spend:")?;
                for day in &report.daily {
                    writeln!(
                        out,
                        "  {}  ${:>10.4}  {:>6} requests",
                        day.date, day.total_cost_usd, day.request_count
                    )?;
                }
            }

            if let Some(ref breakdown) = report.breakdown {
                writeln!(out)?;
                writeln!(out, "By {}:", breakdown.by)?;
                if breakdown.rows.is_empty() {
                    writeln!(out, "  (no answers logged)")?;
                }
                for row in &breakdown.rows {
                    writeln!(
                        out,
                        "  {:<32} ${:>10.4}  {:>6} requests  {:>8} tokens  {:.1} chunks avg",
                        row.key, row.cost_usd, row.requests, row.tokens, row.avg_chunks
                    )?;
                }
            }
            Ok(())
        })
    }

    fn format_message(&self, message: &str) -> String {
        format!("{}\n", message)
    }

    fn format_error(&self, error: &str) -> String {
        format!("Error: {}\n", error)
    }
}

pub struct JsonFormatter {
    pub pretty: bool,
}

impl JsonFormatter {
    pub fn new(pretty: bool) -> Self {
        Self { pretty }
    }

    fn to_json<T: Serialize>(&self, value: &T) -> String {
        let result = if self.pretty {
            serde_json::to_string_pretty(value)
        } else {
            serde_json::to_string(value)
        };
        result.unwrap_or_else(|e| serde_json::json!({ "error": e.to_string() }).to_string())
    }
}

impl Formatter for JsonFormatter {
    fn format_answer(&self, answer: &Answer) -> String {
        self.to_json(answer)
    }

    fn format_ingest(&self, summary: &IngestSummary) -> String {
        let json = serde_json::json!({
            "files_scanned": summary.files_scanned,
            "files_skipped": summary.files_skipped,
            "chunks_written": summary.chunks_written(),
            "chunks_failed": summary.chunks_failed(),
            "duration_ms": summary.duration_ms,
            "documents": summary.documents,
            "failures": summary.failures,
        });
        self.to_json(&json)
    }

    fn format_status(&self, status: &StatusInfo) -> String {
        self.to_json(status)
    }

    fn format_cost_report(&self, report: &CostReport) -> String {
        self.to_json(report)
    }

    fn format_message(&self, message: &str) -> String {
        serde_json::json!({"message": message}).to_string()
    }

    fn format_error(&self, error: &str) -> String {
        serde_json::json!({"error": error}).to_string()
    }
}

pub struct MarkdownFormatter;

impl Formatter for MarkdownFormatter {
    fn format_answer(&self, answer: &Answer) -> String {
        render(|out| {
            writeln!(out, "## Answer\n")?;
            writeln!(out, "{}\n", answer.content.trim_end())?;

            writeln!(out, "### Sources\n")?;
            if answer.citations.is_empty() {
                writeln!(out, "*No sources cited.*\n")?;
            } else {
                writeln!(out, "| # | Document | Page | Section | Score |")?;
                writeln!(out, "|---|----------|------|---------|-------|")?;
                for (i, c) in answer.citations.iter().enumerate() {
                    writeln!(
                        out,
                        "| {} | {} | {} | {} | {:.3} |",
                        i + 1,
                        c.document_title,
                        page_label(c.page_number),
                        c.section_title.as_deref().unwrap_or("-"),
                        c.relevance_score
                    )?;
                }
                writeln!(out)?;
            }

            writeln!(
                out,
                "*{} · {} chunks · {} tokens · ${:.6} · {}ms*",
                answer.metadata.model,
                answer.metadata.chunks_used,
                answer.usage.prompt_tokens + answer.usage.completion_tokens,
                answer.usage.cost_usd,
                answer.metadata.latency_ms
            )
        })
    }

    fn format_ingest(&self, summary: &IngestSummary) -> String {
        render(|out| {
            writeln!(out, "## Ingestion Complete\n")?;
            writeln!(out, "| Metric | Value |")?;
            writeln!(out, "|--------|-------|")?;
            writeln!(out, "| Files scanned | {} |", summary.files_scanned)?;
            writeln!(out, "| Files skipped | {} |", summary.files_skipped)?;
            writeln!(out, "| Documents | {} |", summary.documents.len())?;
            writeln!(out, "| Chunks written | {} |", summary.chunks_written())?;
            writeln!(out, "| Chunks failed | {} |", summary.chunks_failed())?;
            writeln!(out, "| Duration | {}ms |", summary.duration_ms)?;

            if !summary.failures.is_empty() {
                writeln!(out, "\n### Failed documents\n")?;
                for f in &summary.failures {
                    writeln!(out, "- `{}`: {}", f.document_id, f.error)?;
                }
            }
            Ok(())
        })
    }

    fn format_status(&self, status: &StatusInfo) -> String {
        render(|out| {
            writeln!(out, "## Status\n")?;

            let store_state = if status.store_connected { "✅" } else { "❌" };
            writeln!(out, "### Chunk Store ({}) {}\n", status.store_backend, store_state)?;
            if let Some(ref stats) = status.store {
                writeln!(out, "- **Documents:** {}", stats.documents)?;
                writeln!(out, "- **Chunks:** {}", stats.chunks)?;
                writeln!(out, "- **Pending embeddings:** {}", stats.pending_embeddings)?;
            }
            writeln!(out)?;

            writeln!(out, "### Models\n")?;
            writeln!(
                out,
                "- **Embedding:** {} ({} dims)",
                status.embedding_model, status.dimension
            )?;
            writeln!(out, "- **Generation:** {}", status.generation_model)?;
            writeln!(out, "- **Prompt:** {}\n", status.prompt_version)?;

            let budget = &status.budget;
            writeln!(out, "### Budget ({})\n", budget.level)?;
            writeln!(
                out,
                "- **Spent:** ${:.4} of ${:.2} ({:.1}%)",
                budget.spent_usd,
                budget.budget_usd,
                budget.used_pct()
            )?;
            writeln!(out, "- **Requests today:** {}\n", budget.request_count)?;

            writeln!(out, "### Rate Limits\n")?;
            if status.rate_limiting {
                writeln!(out, "| Scope | Limit |")?;
                writeln!(out, "|-------|-------|")?;
                for l in &status.limits {
                    writeln!(out, "| {} | {} |", l.scope, l.limit)?;
                }
            } else {
                writeln!(out, "*Disabled*")?;
            }
            Ok(())
        })
    }

    fn format_cost_report(&self, report: &CostReport) -> String {
        render(|out| {
            writeln!(out, "## Cost Report\n")?;
            writeln!(out, "Last {} days (since {})\n", report.days, report.since)?;
            let s = &report.summary;
            writeln!(out, "| Metric | Value |")?;
            writeln!(out, "|--------|-------|")?;
            writeln!(out, "| Requests | {} |", s.requests)?;
            writeln!(out, "| Total cost | ${:.4} |", s.total_cost_usd)?;
            writeln!(out, "| Total tokens | {} |", s.total_tokens)?;
            writeln!(out, "| Avg latency | {}ms |", s.avg_latency_ms)?;

            if !report.daily.is_empty() {
                writeln!(out, "\n### Daily spend\n")?;
                writeln!(out, "| Date | Cost | Requests |")?;
                writeln!(out, "|------|------|----------|")?;
                for day in &report.daily {
                    writeln!(
                        out,
                        "| {} | ${:.4} | {} |",
                        day.date, day.total_cost_usd, day.request_count
                    )?;
                }
            }

            if let Some(ref breakdown) = report.breakdown {
                writeln!(out, "\n### By {}\n", breakdown.by)?;
                writeln!(out, "| {} | Requests | Cost | Tokens | Avg chunks |", breakdown.by)?;
                writeln!(out, "|---|----------|------|--------|------------|")?;
                for row in &breakdown.rows {
                    writeln!(
                        out,
                        "| `{}` | {} | ${:.4} | {} | {:.1} |",
                        row.key, row.requests, row.cost_usd, row.tokens, row.avg_chunks
                    )?;
                }
            }
            Ok(())
        })
    }

    fn format_message(&self, message: &str) -> String {
        format!("> {}\n", message)
    }

    fn format_error(&self, error: &str) -> String {
        format!("> ⚠️ **Error:** {}\n", error)
    }
}

pub fn get_formatter(format: OutputFormat) -> Box<dyn Formatter> {
    match format {
        OutputFormat::Text => Box::new(TextFormatter),
        OutputFormat::Json => Box::new(JsonFormatter::new(true)),
        OutputFormat::Markdown => Box::new(MarkdownFormatter),
    }
}

mod ask;
mod config;
mod cost_report;
mod ingest;
mod reprocess;
mod status;

pub use ask::AskArgs;
pub use config::ConfigCommand;
pub use cost_report::CostReportArgs;
pub use ingest::IngestArgs;
pub use reprocess::ReprocessArgs;

pub use ask::handle_ask;
pub use config::handle_config;
pub use cost_report::handle_cost_report;
pub use ingest::handle_ingest;
pub use reprocess::handle_reprocess;
pub use status::handle_status;

/// Parse a `key=value` argument.
pub(crate) fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", s))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in '{}'", s));
    }
    Ok((key.to_string(), value.trim().to_string()))
}

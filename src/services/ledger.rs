//! SQLite persistence for daily spend and the per-answer usage log.

use std::fmt;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;
use crate::services::budget::SpendLedger;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS spend_ledger (
    date TEXT PRIMARY KEY,
    total_cost_usd REAL NOT NULL,
    request_count INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS answer_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at TEXT NOT NULL,
    caller TEXT NOT NULL,
    model TEXT NOT NULL,
    method TEXT NOT NULL,
    prompt_version TEXT NOT NULL,
    prompt_tokens INTEGER NOT NULL,
    completion_tokens INTEGER NOT NULL,
    cost_usd REAL NOT NULL,
    chunks_used INTEGER NOT NULL,
    latency_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_answer_log_created_at ON answer_log(created_at);
"#;

/// One answered question, as written to the usage log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerLogEntry {
    pub created_at: DateTime<Utc>,
    pub caller: String,
    pub model: String,
    pub method: String,
    pub prompt_version: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub cost_usd: f64,
    pub chunks_used: usize,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub requests: u64,
    pub total_cost_usd: f64,
    pub total_tokens: u64,
    pub avg_latency_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Breakdown {
    Model,
    Method,
}

impl Breakdown {
    fn column(&self) -> &'static str {
        match self {
            Breakdown::Model => "model",
            Breakdown::Method => "method",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageBreakdown {
    pub key: String,
    pub requests: u64,
    pub cost_usd: f64,
    pub tokens: u64,
    pub avg_chunks: f64,
}

/// Durable storage behind the budget guard.
///
/// Calls happen inside the guard's critical section, so implementations are
/// synchronous and should be quick.
pub trait LedgerStore: Send + Sync + fmt::Debug {
    fn load_day(&self, date: NaiveDate) -> Result<Option<SpendLedger>, LedgerError>;

    fn save_day(&self, ledger: &SpendLedger) -> Result<(), LedgerError>;

    fn append_answer(&self, entry: &AnswerLogEntry) -> Result<(), LedgerError>;

    /// Ledger rows from `since` onwards, oldest first.
    fn daily_totals(&self, since: NaiveDate) -> Result<Vec<SpendLedger>, LedgerError>;

    fn usage_summary(&self, since: DateTime<Utc>) -> Result<UsageSummary, LedgerError>;

    /// Usage grouped by model or method, most expensive first.
    fn usage_breakdown(
        &self,
        since: DateTime<Utc>,
        by: Breakdown,
    ) -> Result<Vec<UsageBreakdown>, LedgerError>;
}

pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

impl fmt::Debug for SqliteLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteLedger").finish_non_exhaustive()
    }
}

impl SqliteLedger {
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self, LedgerError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, LedgerError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_date(raw: &str) -> Result<NaiveDate, LedgerError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| LedgerError::InvalidRow(format!("bad date {:?}: {}", raw, e)))
}

impl LedgerStore for SqliteLedger {
    fn load_day(&self, date: NaiveDate) -> Result<Option<SpendLedger>, LedgerError> {
        let row = self
            .conn()
            .query_row(
                "SELECT total_cost_usd, request_count FROM spend_ledger WHERE date = ?1",
                params![date.to_string()],
                |row| Ok((row.get::<_, f64>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;

        Ok(row.map(|(total_cost_usd, count)| SpendLedger {
            date,
            total_cost_usd,
            request_count: count.max(0) as u64,
        }))
    }

    fn save_day(&self, ledger: &SpendLedger) -> Result<(), LedgerError> {
        self.conn().execute(
            "INSERT INTO spend_ledger (date, total_cost_usd, request_count)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(date) DO UPDATE SET
                total_cost_usd = excluded.total_cost_usd,
                request_count = excluded.request_count",
            params![
                ledger.date.to_string(),
                ledger.total_cost_usd,
                ledger.request_count as i64
            ],
        )?;
        Ok(())
    }

    fn append_answer(&self, entry: &AnswerLogEntry) -> Result<(), LedgerError> {
        self.conn().execute(
            "INSERT INTO answer_log (created_at, caller, model, method, prompt_version,
                prompt_tokens, completion_tokens, cost_usd, chunks_used, latency_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                timestamp(&entry.created_at),
                entry.caller,
                entry.model,
                entry.method,
                entry.prompt_version,
                entry.prompt_tokens,
                entry.completion_tokens,
                entry.cost_usd,
                entry.chunks_used as i64,
                entry.latency_ms as i64,
            ],
        )?;
        Ok(())
    }

    fn daily_totals(&self, since: NaiveDate) -> Result<Vec<SpendLedger>, LedgerError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT date, total_cost_usd, request_count FROM spend_ledger
             WHERE date >= ?1 ORDER BY date",
        )?;
        let rows = stmt.query_map(params![since.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, f64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut totals = Vec::new();
        for row in rows {
            let (date, total_cost_usd, count) = row?;
            totals.push(SpendLedger {
                date: parse_date(&date)?,
                total_cost_usd,
                request_count: count.max(0) as u64,
            });
        }
        Ok(totals)
    }

    fn usage_summary(&self, since: DateTime<Utc>) -> Result<UsageSummary, LedgerError> {
        let summary = self.conn().query_row(
            "SELECT
                COUNT(*),
                COALESCE(SUM(cost_usd), 0),
                COALESCE(SUM(prompt_tokens + completion_tokens), 0),
                COALESCE(AVG(latency_ms), 0)
             FROM answer_log
             WHERE created_at >= ?1",
            params![timestamp(&since)],
            |row| {
                Ok(UsageSummary {
                    requests: row.get::<_, i64>(0)?.max(0) as u64,
                    total_cost_usd: row.get(1)?,
                    total_tokens: row.get::<_, i64>(2)?.max(0) as u64,
                    avg_latency_ms: row.get::<_, f64>(3)?.max(0.0) as u64,
                })
            },
        )?;
        Ok(summary)
    }

    fn usage_breakdown(
        &self,
        since: DateTime<Utc>,
        by: Breakdown,
    ) -> Result<Vec<UsageBreakdown>, LedgerError> {
        let query = format!(
            "SELECT {column}, COUNT(*), SUM(cost_usd),
                SUM(prompt_tokens + completion_tokens), AVG(chunks_used)
             FROM answer_log
             WHERE created_at >= ?1
             GROUP BY {column}
             ORDER BY SUM(cost_usd) DESC, {column}",
            column = by.column()
        );

        let conn = self.conn();
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(params![timestamp(&since)], |row| {
            Ok(UsageBreakdown {
                key: row.get(0)?,
                requests: row.get::<_, i64>(1)?.max(0) as u64,
                cost_usd: row.get(2)?,
                tokens: row.get::<_, i64>(3)?.max(0) as u64,
                avg_chunks: row.get(4)?,
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>().map_err(LedgerError::from)
    }
}

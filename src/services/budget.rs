//! Daily spend budget.
//!
//! The guard owns one [`SpendLedger`] behind a mutex. Day rollover, cost
//! recording and persistence all happen inside the same critical section, so
//! a cost can never be booked against the wrong UTC day. Alerts are sent after
//! the lock is released.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, PipelineError};
use crate::models::BudgetConfig;
use crate::services::ledger::LedgerStore;
use crate::utils::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetLevel {
    Normal,
    Warning,
    Critical,
}

impl fmt::Display for BudgetLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BudgetLevel::Normal => write!(f, "normal"),
            BudgetLevel::Warning => write!(f, "warning"),
            BudgetLevel::Critical => write!(f, "critical"),
        }
    }
}

/// Spend for one UTC day.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpendLedger {
    pub date: NaiveDate,
    pub total_cost_usd: f64,
    pub request_count: u64,
}

impl SpendLedger {
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            total_cost_usd: 0.0,
            request_count: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetStatus {
    /// False once the level is critical.
    pub allowed: bool,
    pub level: BudgetLevel,
    pub spent_usd: f64,
    pub budget_usd: f64,
    pub request_count: u64,
    pub date: NaiveDate,
}

impl BudgetStatus {
    pub fn used_pct(&self) -> f64 {
        if self.budget_usd > 0.0 {
            self.spent_usd / self.budget_usd * 100.0
        } else {
            100.0
        }
    }
}

/// Receives budget alerts. Called at most once per level per day.
pub trait AlertNotifier: Send + Sync + fmt::Debug {
    fn notify(&self, status: &BudgetStatus);
}

/// Emits alerts as log events.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl AlertNotifier for LogNotifier {
    fn notify(&self, status: &BudgetStatus) {
        match status.level {
            BudgetLevel::Critical => tracing::error!(
                date = %status.date,
                spent_usd = status.spent_usd,
                budget_usd = status.budget_usd,
                requests = status.request_count,
                "daily budget exceeded, answers are blocked until the next UTC day"
            ),
            _ => tracing::warn!(
                date = %status.date,
                spent_usd = status.spent_usd,
                budget_usd = status.budget_usd,
                used_pct = format!("{:.1}", status.used_pct()),
                "daily budget threshold reached"
            ),
        }
    }
}

/// Where incurred generation cost is booked.
pub trait SpendRecorder: Send + Sync + fmt::Debug {
    fn record(&self, cost_usd: f64) -> BudgetStatus;
}

#[derive(Debug)]
struct Inner {
    ledger: SpendLedger,
    notified: HashSet<BudgetLevel>,
}

#[derive(Debug)]
pub struct BudgetGuard {
    daily_budget_usd: f64,
    warning_threshold: f64,
    clock: Arc<dyn Clock>,
    store: Option<Arc<dyn LedgerStore>>,
    notifier: Arc<dyn AlertNotifier>,
    inner: Mutex<Inner>,
}

impl BudgetGuard {
    pub fn new(config: &BudgetConfig, clock: Arc<dyn Clock>) -> Self {
        let today = clock.now().date_naive();
        Self {
            daily_budget_usd: config.daily_budget_usd,
            warning_threshold: config.warning_threshold,
            clock,
            store: None,
            notifier: Arc::new(LogNotifier),
            inner: Mutex::new(Inner {
                ledger: SpendLedger::empty(today),
                notified: HashSet::new(),
            }),
        }
    }

    /// Attach persistence and resume today's total from it.
    pub fn with_store(mut self, store: Arc<dyn LedgerStore>) -> Result<Self, LedgerError> {
        let today = self.clock.now().date_naive();
        if let Some(ledger) = store.load_day(today)? {
            tracing::debug!(
                date = %today,
                spent_usd = ledger.total_cost_usd,
                "resumed spend ledger"
            );
            self.lock().ledger = ledger;
        }
        self.store = Some(store);
        Ok(self)
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn AlertNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn daily_budget_usd(&self) -> f64 {
        self.daily_budget_usd
    }

    pub fn store(&self) -> Option<&Arc<dyn LedgerStore>> {
        self.store.as_ref()
    }

    pub fn level_for(&self, spent_usd: f64) -> BudgetLevel {
        if self.daily_budget_usd <= 0.0 {
            return BudgetLevel::Critical;
        }
        let ratio = spent_usd / self.daily_budget_usd;
        if ratio >= 1.0 {
            BudgetLevel::Critical
        } else if ratio >= self.warning_threshold {
            BudgetLevel::Warning
        } else {
            BudgetLevel::Normal
        }
    }

    /// Current status for today. Crossing into warning or critical notifies once.
    pub fn check(&self) -> BudgetStatus {
        let (status, alert) = {
            let mut inner = self.lock();
            self.roll_over(&mut inner);
            let status = self.status_of(&inner.ledger);
            let alert = Self::take_alert(&mut inner, &status);
            (status, alert)
        };
        self.send(alert);
        status
    }

    /// [`check`](Self::check), failing with `BudgetExceeded` when critical.
    pub fn ensure_allowed(&self) -> Result<BudgetStatus, PipelineError> {
        let status = self.check();
        if !status.allowed {
            tracing::warn!(
                spent_usd = status.spent_usd,
                budget_usd = status.budget_usd,
                "request blocked by daily budget"
            );
            return Err(PipelineError::BudgetExceeded {
                spent_usd: status.spent_usd,
                budget_usd: status.budget_usd,
            });
        }
        Ok(status)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn roll_over(&self, inner: &mut Inner) {
        let today = self.clock.now().date_naive();
        if inner.ledger.date != today {
            tracing::info!(
                previous = %inner.ledger.date,
                spent_usd = inner.ledger.total_cost_usd,
                "budget day rolled over"
            );
            inner.ledger = SpendLedger::empty(today);
            inner.notified.clear();
        }
    }

    fn status_of(&self, ledger: &SpendLedger) -> BudgetStatus {
        let level = self.level_for(ledger.total_cost_usd);
        BudgetStatus {
            allowed: level != BudgetLevel::Critical,
            level,
            spent_usd: ledger.total_cost_usd,
            budget_usd: self.daily_budget_usd,
            request_count: ledger.request_count,
            date: ledger.date,
        }
    }

    fn take_alert(inner: &mut Inner, status: &BudgetStatus) -> Option<BudgetStatus> {
        (status.level != BudgetLevel::Normal && inner.notified.insert(status.level))
            .then(|| status.clone())
    }

    fn send(&self, alert: Option<BudgetStatus>) {
        if let Some(status) = alert {
            self.notifier.notify(&status);
        }
    }
}

impl SpendRecorder for BudgetGuard {
    /// Book one generation call. Negative or non-finite costs count the
    /// request but add nothing.
    fn record(&self, cost_usd: f64) -> BudgetStatus {
        let cost = if cost_usd.is_finite() && cost_usd >= 0.0 {
            cost_usd
        } else {
            tracing::warn!(cost_usd, "ignoring invalid cost");
            0.0
        };

        let (status, alert) = {
            let mut inner = self.lock();
            self.roll_over(&mut inner);
            inner.ledger.total_cost_usd += cost;
            inner.ledger.request_count += 1;

            if let Some(store) = &self.store
                && let Err(e) = store.save_day(&inner.ledger)
            {
                tracing::warn!(error = %e, "failed to persist spend ledger");
            }

            let status = self.status_of(&inner.ledger);
            let alert = Self::take_alert(&mut inner, &status);
            (status, alert)
        };

        tracing::debug!(
            cost_usd = cost,
            spent_usd = status.spent_usd,
            level = %status.level,
            "recorded spend"
        );
        self.send(alert);
        status
    }
}

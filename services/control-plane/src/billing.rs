//! Billing worker.
//!
//! Periodically computes a spend summary for every budgeted account and
//! logs it. Accounts close to or over their budget are reported at `warn`.
//! Enforcement itself happens in the per-account controllers.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::budget::{BudgetEnforcer, SpendSummary};
use crate::error::Result;

/// Billing worker tuning.
#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub interval: Duration,

    /// Remaining fraction of the total below which an account is reported
    /// as nearly exhausted.
    pub low_fraction: f64,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            interval: skyway_reconcile::DEFAULT_RECONCILE_INTERVAL,
            low_fraction: 0.1,
        }
    }
}

/// Standing of one account after a billing pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetHealth {
    Ok,
    Low,
    Exhausted,
}

/// Periodic spend reporter.
#[derive(Clone)]
pub struct BillingWorker {
    enforcer: BudgetEnforcer,
    config: BillingConfig,
}

impl BillingWorker {
    pub fn new(enforcer: BudgetEnforcer, config: BillingConfig) -> Self {
        Self { enforcer, config }
    }

    pub fn classify(&self, summary: &SpendSummary) -> BudgetHealth {
        if summary.remaining < 0.0 {
            BudgetHealth::Exhausted
        } else if summary.remaining < summary.total * self.config.low_fraction {
            BudgetHealth::Low
        } else {
            BudgetHealth::Ok
        }
    }

    /// Summarize every budgeted account as of `now`.
    pub fn evaluate_at(&self, now: i64) -> Result<Vec<(SpendSummary, BudgetHealth)>> {
        let mut out = Vec::new();
        for budget in self.enforcer.list()? {
            let summary = match self.enforcer.summary_at(&budget.account, now) {
                Ok(summary) => summary,
                Err(e) => {
                    error!(account = %budget.account, error = %e, "Failed to compute spend");
                    continue;
                }
            };
            let health = self.classify(&summary);
            match health {
                BudgetHealth::Exhausted => warn!(
                    account = %summary.account,
                    spend = summary.spend_to_date,
                    total = summary.total,
                    "Budget exceeded"
                ),
                BudgetHealth::Low => warn!(
                    account = %summary.account,
                    remaining = summary.remaining,
                    total = summary.total,
                    "Budget nearly exhausted"
                ),
                BudgetHealth::Ok => debug!(
                    account = %summary.account,
                    spend = summary.spend_to_date,
                    rate = summary.current_rate,
                    "Budget ok"
                ),
            }
            out.push((summary, health));
        }
        Ok(out)
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        info!(interval_secs = self.config.interval.as_secs(), "Starting billing worker");
        let mut interval = tokio::time::interval(self.config.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.evaluate_at(Utc::now().timestamp()) {
                        error!(error = %e, "Billing pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Billing worker shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }
}

//! Budget enforcement.
//!
//! Spend is derived from the live node map and the usage journal; nothing is
//! accumulated separately. A node's hourly rate is fixed when it is admitted
//! (`min(catalog price, max_rate)`), so spend for a period only ever grows.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use skyway_reconcile::{order_for_eviction, EvictionInput, EvictionOrder};
use tracing::{debug, info};

use crate::catalog::NodeTypeCatalog;
use crate::error::{Error, Result};
use crate::store::{Budget, CloudAccount, NodeStatus, StateStore};

/// Tolerance for spend comparisons. Spend at exactly the total admits.
const SPEND_EPSILON: f64 = 1e-9;

const SECS_PER_HOUR: f64 = 3600.0;

/// Enforcer tuning.
#[derive(Debug, Clone)]
pub struct EnforcerConfig {
    /// Overage window L, in currency units.
    pub overage_allowance: f64,

    /// How far ahead a new node's cost is projected at admission.
    pub admission_horizon: Duration,

    /// How far ahead kept nodes are projected when choosing evictions.
    pub eviction_horizon: Duration,

    pub eviction_order: EvictionOrder,
}

impl Default for EnforcerConfig {
    fn default() -> Self {
        Self {
            overage_allowance: 0.0,
            admission_horizon: Duration::from_secs(3600),
            eviction_horizon: skyway_reconcile::DEFAULT_RECONCILE_INTERVAL,
            eviction_order: EvictionOrder::default(),
        }
    }
}

/// Budget field that may be changed by an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetField {
    Amount,
    Rate,
}

impl std::str::FromStr for BudgetField {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "amount" => Ok(Self::Amount),
            "rate" | "max_rate" => Ok(Self::Rate),
            other => Err(Error::Validation(format!(
                "unknown budget field '{other}' (expected amount or rate)"
            ))),
        }
    }
}

/// Why an admission was denied.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "kebab-case")]
pub enum DenyReason {
    BudgetExceeded {
        spend: f64,
        projected: f64,
        total: f64,
    },
    AccountInactive,
    NoBudget,
}

impl DenyReason {
    /// Short machine-readable reason.
    pub fn code(&self) -> &'static str {
        match self {
            Self::BudgetExceeded { .. } => "budget-exceeded",
            Self::AccountInactive => "account-inactive",
            Self::NoBudget => "no-budget",
        }
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BudgetExceeded {
                spend,
                projected,
                total,
            } => write!(
                f,
                "budget-exceeded: spend {spend:.2} + projected {projected:.2} > total {total:.2}"
            ),
            other => f.write_str(other.code()),
        }
    }
}

/// Outcome of [`BudgetEnforcer::authorize`].
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Admitted; the node will be billed at `rate` per hour.
    Allow { rate: f64 },
    Deny(DenyReason),
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow { .. })
    }

    /// Convert a denial into a `BudgetExceeded` error.
    pub fn into_result(self) -> Result<f64> {
        match self {
            Self::Allow { rate } => Ok(rate),
            Self::Deny(reason) => Err(Error::BudgetExceeded(reason.to_string())),
        }
    }
}

/// Read-only spend snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SpendSummary {
    pub account: String,
    pub period_start: NaiveDate,
    pub total: f64,
    pub max_rate: f64,
    pub spend_to_date: f64,
    pub remaining: f64,
    /// Sum of hourly rates of live, billable nodes.
    pub current_rate: f64,
    pub live_nodes: usize,
}

/// Hours and cost per node type in the current period.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TypeUsage {
    pub hours: f64,
    pub cost: f64,
}

/// Computes spend, admits or denies provisioning and picks evictions.
///
/// Holds read-only access to the node map; callers that act on a decision
/// must hold the account lock across the decision and the commit.
#[derive(Clone)]
pub struct BudgetEnforcer {
    store: Arc<StateStore>,
    catalog: Arc<NodeTypeCatalog>,
    config: EnforcerConfig,
}

impl BudgetEnforcer {
    pub fn new(store: Arc<StateStore>, catalog: Arc<NodeTypeCatalog>, config: EnforcerConfig) -> Self {
        Self {
            store,
            catalog,
            config,
        }
    }

    pub fn config(&self) -> &EnforcerConfig {
        &self.config
    }

    // =========================================================================
    // Budget records
    // =========================================================================

    /// Create the budget of an account.
    pub fn create(&self, account: &str, start_date: NaiveDate, amount: f64, max_rate: f64) -> Result<Budget> {
        validate_positive("amount", amount)?;
        validate_positive("rate", max_rate)?;

        let budget = Budget {
            account: account.to_string(),
            start_date,
            amount,
            max_rate,
        };
        self.store.insert_budget(&budget)?;
        info!(account, amount, max_rate, %start_date, "Budget created");
        Ok(budget)
    }

    pub fn get(&self, account: &str) -> Result<Budget> {
        self.store
            .get_budget(account)?
            .ok_or_else(|| Error::NotFound(format!("budget for account {account}")))
    }

    pub fn list(&self) -> Result<Vec<Budget>> {
        Ok(self.store.list_budgets()?)
    }

    /// Change the total amount or the per-node rate cap.
    ///
    /// A new cap applies to nodes admitted afterwards.
    pub fn set(&self, account: &str, field: BudgetField, value: f64) -> Result<()> {
        match field {
            BudgetField::Amount => {
                validate_positive("amount", value)?;
                self.store.set_budget_amount(account, value)?;
            }
            BudgetField::Rate => {
                validate_positive("rate", value)?;
                self.store.set_budget_rate(account, value)?;
            }
        }
        info!(account, ?field, value, "Budget updated");
        Ok(())
    }

    /// Begin a new billing period.
    pub fn reset_period(&self, account: &str, start_date: NaiveDate) -> Result<()> {
        self.store.set_budget_start(account, start_date)?;
        info!(account, %start_date, "Billing period reset");
        Ok(())
    }

    // =========================================================================
    // Spend
    // =========================================================================

    /// Cost of live nodes since the later of their start and the period start.
    pub fn running_cost_at(&self, account: &str, now: i64) -> Result<f64> {
        let budget = self.get(account)?;
        self.running_cost(&budget, now)
    }

    fn running_cost(&self, budget: &Budget, now: i64) -> Result<f64> {
        let period_start = budget.period_start();
        Ok(self
            .store
            .list_nodes(&budget.account)?
            .iter()
            .map(|n| cost(n.started_at.max(period_start), now, n.rate))
            .sum())
    }

    /// Running cost plus closed journal entries of the current period.
    pub fn cumulative_spend_at(&self, account: &str, now: i64) -> Result<f64> {
        let budget = self.get(account)?;
        self.cumulative_spend(&budget, now)
    }

    pub fn cumulative_spend(&self, budget: &Budget, now: i64) -> Result<f64> {
        let period_start = budget.period_start();
        let closed: f64 = self
            .store
            .closed_journal_since(&budget.account, period_start)?
            .iter()
            .filter_map(|e| {
                e.ended_at
                    .map(|end| cost(e.started_at.max(period_start), end, e.rate))
            })
            .sum();

        Ok(closed + self.running_cost(budget, now)?)
    }

    /// Hourly rate a new node of `node_type` would be billed at.
    pub fn node_rate(&self, account: &CloudAccount, budget: &Budget, node_type: &str) -> Result<f64> {
        let price = self
            .catalog
            .rate(account.vendor, node_type)
            .ok_or_else(|| {
                Error::Validation(format!(
                    "unknown node type '{node_type}' for vendor {}",
                    account.vendor
                ))
            })?;
        Ok(price.min(budget.max_rate))
    }

    // =========================================================================
    // Admission and eviction
    // =========================================================================

    /// Decide whether one more node of `node_type` fits in the budget.
    ///
    /// Admits iff spend to date plus one admission horizon of every live
    /// node and of the new node stays at or below the total.
    pub fn authorize(&self, account: &str, node_type: &str) -> Result<Admission> {
        self.authorize_at(account, node_type, Utc::now().timestamp())
    }

    pub fn authorize_at(&self, account: &str, node_type: &str, now: i64) -> Result<Admission> {
        let record = self.store.require_account(account)?;
        if !record.active {
            return Ok(Admission::Deny(DenyReason::AccountInactive));
        }
        let Some(budget) = self.store.get_budget(account)? else {
            return Ok(Admission::Deny(DenyReason::NoBudget));
        };

        let rate = self.node_rate(&record, &budget, node_type)?;
        let horizon = hours(self.config.admission_horizon);
        let spend = self.cumulative_spend(&budget, now)?;
        // Live nodes keep their reservation until archived, so nodes
        // admitted a moment ago count even though they have accrued nothing.
        let reserved: f64 = self
            .store
            .list_nodes(account)?
            .iter()
            .map(|n| n.rate * horizon)
            .sum();
        let projected = reserved + rate * horizon;

        debug!(account, node_type, spend, projected, total = budget.amount, "Admission check");

        if spend + projected <= budget.amount + SPEND_EPSILON {
            Ok(Admission::Allow { rate })
        } else {
            Ok(Admission::Deny(DenyReason::BudgetExceeded {
                spend,
                projected,
                total: budget.amount,
            }))
        }
    }

    /// Hostnames to drain so projected spend returns within `total + L`.
    ///
    /// Empty while spend is at or below the total. Nodes already draining are
    /// not candidates and are not counted as kept.
    pub fn eviction_candidates(&self, account: &str) -> Result<Vec<String>> {
        self.eviction_candidates_at(account, Utc::now().timestamp())
    }

    pub fn eviction_candidates_at(&self, account: &str, now: i64) -> Result<Vec<String>> {
        let Some(budget) = self.store.get_budget(account)? else {
            return Ok(Vec::new());
        };

        let spend = self.cumulative_spend(&budget, now)?;
        if spend <= budget.amount + SPEND_EPSILON {
            return Ok(Vec::new());
        }

        let horizon = hours(self.config.eviction_horizon);
        let kept: Vec<EvictionInput<String>> = self
            .store
            .list_nodes(account)?
            .into_iter()
            .filter(|n| n.status != NodeStatus::Draining)
            .map(|n| EvictionInput {
                key: n.hostname,
                started_at: n.started_at,
                rate: n.rate,
            })
            .collect();

        let limit = budget.amount + self.config.overage_allowance;
        let mut projection = spend + kept.iter().map(|n| n.rate * horizon).sum::<f64>();

        let mut candidates = Vec::new();
        for node in order_for_eviction(kept, self.config.eviction_order) {
            if projection <= limit + SPEND_EPSILON {
                break;
            }
            projection -= node.rate * horizon;
            candidates.push(node.key);
        }

        if !candidates.is_empty() {
            info!(account, spend, total = budget.amount, count = candidates.len(), "Budget overrun, evicting nodes");
        }
        Ok(candidates)
    }

    // =========================================================================
    // Reporting
    // =========================================================================

    pub fn summary(&self, account: &str) -> Result<SpendSummary> {
        self.summary_at(account, Utc::now().timestamp())
    }

    pub fn summary_at(&self, account: &str, now: i64) -> Result<SpendSummary> {
        let budget = self.get(account)?;
        let spend = self.cumulative_spend(&budget, now)?;
        let nodes = self.store.list_nodes(account)?;

        Ok(SpendSummary {
            account: budget.account.clone(),
            period_start: budget.start_date,
            total: budget.amount,
            max_rate: budget.max_rate,
            spend_to_date: spend,
            remaining: budget.amount - spend,
            current_rate: nodes.iter().map(|n| n.rate).sum(),
            live_nodes: nodes.len(),
        })
    }

    /// Hours and cost per node type in the current period.
    pub fn usage_by_type(&self, account: &str) -> Result<BTreeMap<String, TypeUsage>> {
        self.usage_by_type_at(account, Utc::now().timestamp())
    }

    pub fn usage_by_type_at(&self, account: &str, now: i64) -> Result<BTreeMap<String, TypeUsage>> {
        let budget = self.get(account)?;
        let period_start = budget.period_start();
        let mut usage: BTreeMap<String, TypeUsage> = BTreeMap::new();

        let mut add = |node_type: &str, start: i64, end: i64, rate: f64| {
            let entry = usage.entry(node_type.to_string()).or_default();
            let start = start.max(period_start);
            entry.hours += elapsed_hours(start, end);
            entry.cost += cost(start, end, rate);
        };

        for entry in self.store.closed_journal_since(account, period_start)? {
            if let Some(end) = entry.ended_at {
                add(&entry.node_type, entry.started_at, end, entry.rate);
            }
        }
        for node in self.store.list_nodes(account)? {
            add(&node.node_type, node.started_at, now, node.rate);
        }

        Ok(usage)
    }
}

fn validate_positive(field: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value <= 0.0 {
        return Err(Error::Validation(format!("{field} must be positive, got {value}")));
    }
    Ok(())
}

fn hours(d: Duration) -> f64 {
    d.as_secs_f64() / SECS_PER_HOUR
}

fn elapsed_hours(start: i64, end: i64) -> f64 {
    (end - start).max(0) as f64 / SECS_PER_HOUR
}

fn cost(start: i64, end: i64, rate: f64) -> f64 {
    elapsed_hours(start, end) * rate
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use super::*;
    use crate::catalog::NodeTypeSpec;
    use crate::store::{NodeInstance, Vendor};

    const HOUR: i64 = 3600;

    fn t0() -> i64 {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc()
            .timestamp()
    }

    fn spec(price: f64) -> NodeTypeSpec {
        NodeTypeSpec {
            name: format!("shape-{price}"),
            price,
            cores: 2,
            memgb: 4,
            gpu: None,
            gpu_type: None,
        }
    }

    fn setup(total: f64, max_rate: f64) -> (Arc<StateStore>, BudgetEnforcer) {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        store
            .insert_account(&CloudAccount {
                name: "rcc-aws".to_string(),
                owner: "pi".to_string(),
                vendor: Vendor::Aws,
                vendor_account_id: "1".to_string(),
                endpoints: BTreeMap::new(),
                protected_nodes: BTreeSet::new(),
                active: true,
                created_at: 0,
            })
            .unwrap();

        let mut catalog = NodeTypeCatalog::default();
        catalog.insert(Vendor::Aws, "t1", spec(2.0));
        catalog.insert(Vendor::Aws, "g1", spec(9.0));

        let enforcer = BudgetEnforcer::new(store.clone(), Arc::new(catalog), EnforcerConfig::default());
        enforcer
            .create("rcc-aws", NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(), total, max_rate)
            .unwrap();
        (store, enforcer)
    }

    fn start_node(store: &StateStore, host: &str, started_at: i64, rate: f64) {
        store
            .insert_node(
                &NodeInstance {
                    hostname: host.to_string(),
                    node_type: "t1".to_string(),
                    account: "rcc-aws".to_string(),
                    instance_id: Some(format!("i-{host}")),
                    ip: None,
                    started_at,
                    status: NodeStatus::Ready,
                    rate,
                    drain_started_at: None,
                },
                None,
            )
            .unwrap();
    }

    #[test]
    fn test_budget_exhaustion_scenario() {
        let (store, enforcer) = setup(10.0, 6.0);

        let admission = enforcer.authorize_at("rcc-aws", "t1", t0()).unwrap();
        assert_eq!(admission, Admission::Allow { rate: 2.0 });

        start_node(&store, "rcc-aws-t1-001", t0(), 2.0);

        let later = t0() + 5 * HOUR;
        let spend = enforcer.cumulative_spend_at("rcc-aws", later).unwrap();
        assert!((spend - 10.0).abs() < 1e-9);

        match enforcer.authorize_at("rcc-aws", "t1", later).unwrap() {
            Admission::Deny(reason) => assert_eq!(reason.code(), "budget-exceeded"),
            other => panic!("expected deny, got {other:?}"),
        }
    }

    #[test]
    fn test_boundary_admits_at_equality() {
        let (store, enforcer) = setup(10.0, 6.0);
        start_node(&store, "rcc-aws-t1-001", t0(), 2.0);

        // 3h of spend (6.0) + 1h of the live node + 1h of the new one == total.
        let at = t0() + 3 * HOUR;
        assert!(enforcer.authorize_at("rcc-aws", "t1", at).unwrap().is_allowed());
        assert!(!enforcer
            .authorize_at("rcc-aws", "t1", at + 1)
            .unwrap()
            .is_allowed());
    }

    #[test]
    fn test_live_nodes_reserve_horizon() {
        let (store, enforcer) = setup(10.0, 6.0);
        start_node(&store, "rcc-aws-t1-001", t0(), 2.0);

        // Spend 6.5 + 2.0 for the new node alone would fit; the live node's
        // hour (2.0) pushes the projection to 10.5.
        let at = t0() + 3 * HOUR + 15 * 60;
        match enforcer.authorize_at("rcc-aws", "t1", at).unwrap() {
            Admission::Deny(DenyReason::BudgetExceeded { spend, projected, total }) => {
                assert!((spend - 6.5).abs() < 1e-9);
                assert!((projected - 4.0).abs() < 1e-9);
                assert_eq!(total, 10.0);
            }
            other => panic!("expected budget denial, got {other:?}"),
        }
    }

    #[test]
    fn test_rate_cap_applies_per_node() {
        let (_store, enforcer) = setup(100.0, 6.0);
        assert_eq!(
            enforcer.authorize_at("rcc-aws", "g1", t0()).unwrap(),
            Admission::Allow { rate: 6.0 }
        );
    }

    #[test]
    fn test_closed_entries_before_period_are_ignored() {
        let (store, enforcer) = setup(10.0, 6.0);
        start_node(&store, "rcc-aws-t1-001", t0() - 2 * HOUR, 2.0);
        store
            .archive_node("rcc-aws-t1-001", NodeStatus::Terminated, t0() + HOUR, None)
            .unwrap();

        // Only the hour inside the period counts.
        let spend = enforcer.cumulative_spend_at("rcc-aws", t0() + 10 * HOUR).unwrap();
        assert!((spend - 2.0).abs() < 1e-9);

        let usage = enforcer.usage_by_type_at("rcc-aws", t0() + 10 * HOUR).unwrap();
        assert!((usage["t1"].hours - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_node_type_is_validation_error() {
        let (_store, enforcer) = setup(10.0, 6.0);
        let err = enforcer.authorize_at("rcc-aws", "zz", t0()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[test]
    fn test_inactive_account_denied() {
        let (store, enforcer) = setup(10.0, 6.0);
        store.set_account_active("rcc-aws", false).unwrap();
        assert_eq!(
            enforcer.authorize_at("rcc-aws", "t1", t0()).unwrap(),
            Admission::Deny(DenyReason::AccountInactive)
        );
    }

    #[rstest::rstest]
    #[case(BudgetField::Amount, 0.0)]
    #[case(BudgetField::Amount, -5.0)]
    #[case(BudgetField::Rate, 0.0)]
    #[case(BudgetField::Rate, f64::NAN)]
    fn test_set_rejects_non_positive(#[case] field: BudgetField, #[case] value: f64) {
        let (_store, enforcer) = setup(10.0, 6.0);
        let err = enforcer.set("rcc-aws", field, value).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[test]
    fn test_eviction_newest_first() {
        let (store, enforcer) = setup(10.0, 6.0);
        start_node(&store, "rcc-aws-t1-001", t0(), 2.0);
        start_node(&store, "rcc-aws-t1-002", t0() + HOUR, 2.0);
        start_node(&store, "rcc-aws-t1-003", t0() + 2 * HOUR, 2.0);

        // Spend at 3h: 6 + 4 + 2 = 12 > 10.
        let now = t0() + 3 * HOUR;
        assert!(enforcer.eviction_candidates_at("rcc-aws", now - 2 * HOUR).unwrap().is_empty());

        let candidates = enforcer.eviction_candidates_at("rcc-aws", now).unwrap();
        // Spend is already over the total with L = 0, so every kept node goes.
        assert_eq!(
            candidates,
            vec!["rcc-aws-t1-003", "rcc-aws-t1-002", "rcc-aws-t1-001"]
        );
    }

    #[test]
    fn test_eviction_stops_within_overage() {
        let (store, enforcer) = setup(10.0, 6.0);
        let enforcer = BudgetEnforcer::new(
            store.clone(),
            enforcer.catalog.clone(),
            EnforcerConfig {
                overage_allowance: 5.0,
                eviction_horizon: Duration::from_secs(3600),
                ..EnforcerConfig::default()
            },
        );
        start_node(&store, "rcc-aws-t1-001", t0(), 2.0);
        start_node(&store, "rcc-aws-t1-002", t0() + HOUR, 2.0);

        // Spend one minute past 3h: just over 10.
        let now = t0() + 3 * HOUR + 60;
        // Projection 10.07 + 2 + 2 = 14.07 <= 15, nothing to evict.
        assert!(enforcer.eviction_candidates_at("rcc-aws", now).unwrap().is_empty());

        start_node(&store, "rcc-aws-t1-003", now, 2.0);
        // Projection 10.07 + 6 = 16.07 > 15: evict the newest only.
        assert_eq!(
            enforcer.eviction_candidates_at("rcc-aws", now).unwrap(),
            vec!["rcc-aws-t1-003"]
        );

        store.set_draining("rcc-aws-t1-003", now).unwrap();
        // Draining nodes are no longer candidates.
        assert!(enforcer.eviction_candidates_at("rcc-aws", now).unwrap().is_empty());
    }

    #[test]
    fn test_summary() {
        let (store, enforcer) = setup(10.0, 6.0);
        start_node(&store, "rcc-aws-t1-001", t0(), 2.0);

        let summary = enforcer.summary_at("rcc-aws", t0() + 2 * HOUR).unwrap();
        assert!((summary.spend_to_date - 4.0).abs() < 1e-9);
        assert!((summary.remaining - 6.0).abs() < 1e-9);
        assert!((summary.current_rate - 2.0).abs() < 1e-9);
        assert_eq!(summary.live_nodes, 1);
    }
}

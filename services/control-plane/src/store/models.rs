//! Persisted entities.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Cloud vendor tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vendor {
    Aws,
    Gcp,
    Azure,
}

impl Vendor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aws => "aws",
            Self::Gcp => "gcp",
            Self::Azure => "azure",
        }
    }
}

impl std::fmt::Display for Vendor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Vendor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aws" => Ok(Self::Aws),
            "gcp" => Ok(Self::Gcp),
            "azure" => Ok(Self::Azure),
            other => Err(format!("unknown vendor '{other}' (expected aws, gcp or azure)")),
        }
    }
}

/// A billable, vendor-scoped account under which nodes are provisioned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudAccount {
    /// Vendor-qualified name, e.g. `rcc-aws`.
    pub name: String,
    /// Owning principal (PI) id.
    pub owner: String,
    pub vendor: Vendor,
    /// Vendor-side account / project / subscription id.
    pub vendor_account_id: String,
    /// Named connectivity endpoints (`name -> host[:port]`).
    pub endpoints: BTreeMap<String, String>,
    /// Instance names never imported, terminated or billed.
    pub protected_nodes: BTreeSet<String>,
    pub active: bool,
    pub created_at: i64,
}

/// Spending limits for one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Budget {
    pub account: String,
    /// First day of the billing period.
    pub start_date: NaiveDate,
    /// Total budget for the period.
    pub amount: f64,
    /// Per-node hourly rate cap.
    pub max_rate: f64,
}

impl Budget {
    /// Start of the billing period as Unix seconds (midnight UTC).
    pub fn period_start(&self) -> i64 {
        let midnight = self.start_date.and_hms_opt(0, 0, 0).unwrap_or_default();
        Utc.from_utc_datetime(&midnight).timestamp()
    }
}

/// Lifecycle status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Provisioning,
    Ready,
    Draining,
    Terminated,
    Failed,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provisioning => "provisioning",
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        }
    }

    pub(crate) fn from_str(s: &str) -> Option<Self> {
        match s {
            "provisioning" => Some(Self::Provisioning),
            "ready" => Some(Self::Ready),
            "draining" => Some(Self::Draining),
            "terminated" => Some(Self::Terminated),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Terminal states archive the node and close its journal entry.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A live node in `node_map`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInstance {
    pub hostname: String,
    pub node_type: String,
    pub account: String,
    /// Vendor runtime id; empty until the launch completes.
    pub instance_id: Option<String>,
    pub ip: Option<String>,
    /// Unix seconds.
    pub started_at: i64,
    pub status: NodeStatus,
    /// Catalog price per hour at admission time.
    pub rate: f64,
    pub drain_started_at: Option<i64>,
}

/// One row of the append-only usage journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: i64,
    pub hostname: String,
    pub node_type: String,
    pub account: String,
    pub instance_id: Option<String>,
    pub started_at: i64,
    pub ended_at: Option<i64>,
    pub rate: f64,
    /// Free-form annotation (`orphan`, failure reason, ...).
    pub note: Option<String>,
}

impl JournalEntry {
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// A queued `{node_type, count}` provisioning request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRequest {
    pub id: i64,
    pub account: String,
    pub node_type: String,
    /// Nodes still to be admitted.
    pub count: u32,
    /// Admission attempts that were denied.
    pub attempts: u32,
    pub created_at: i64,
    pub last_reason: Option<String>,
}

/// Membership rows are versioned by the feed that produced them.
///
/// Version 1 is the legacy onboarding table; it is the only supported source.
pub const LEGACY_MEMBERSHIP_VERSION: u32 = 1;

/// Username to account association, fed by account onboarding.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Membership {
    pub username: String,
    pub account: String,
    pub source_version: u32,
}

/// Closed set of supervised service kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum UnitKind {
    /// Periodic spend evaluation across all budgets.
    Billing,
    /// Node lifecycle reconciliation for one account.
    Controller { account: String },
    /// Scheduler association synchronization.
    AssociationSync,
}

impl UnitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Billing => "billing",
            Self::Controller { .. } => "controller",
            Self::AssociationSync => "association-sync",
        }
    }

    /// Account targeted by the unit, if any.
    pub fn target(&self) -> Option<&str> {
        match self {
            Self::Controller { account } => Some(account),
            Self::Billing | Self::AssociationSync => None,
        }
    }

    /// Rebuild a kind from its persisted parts.
    pub fn from_parts(kind: &str, target: Option<&str>) -> Result<Self, String> {
        match (kind, target) {
            ("billing", _) => Ok(Self::Billing),
            ("association-sync", _) => Ok(Self::AssociationSync),
            ("controller", Some(account)) if !account.is_empty() => Ok(Self::Controller {
                account: account.to_string(),
            }),
            ("controller", _) => Err("controller units require an account".to_string()),
            (other, _) => Err(format!(
                "unknown service kind '{other}' (expected billing, controller or association-sync)"
            )),
        }
    }
}

impl std::fmt::Display for UnitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Controller { account } => write!(f, "controller({account})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Operator-requested state of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    Running,
    Stopped,
}

impl DesiredState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }

    pub(crate) fn from_str(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "stopped" => Some(Self::Stopped),
            _ => None,
        }
    }
}

/// State last observed by the supervisor's health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObservedState {
    /// Not yet checked.
    Unknown,
    Running,
    Stopped,
    /// Exited unexpectedly; a restart is pending.
    Crashed,
    /// Crash-restart budget exhausted; waiting for an operator.
    Degraded,
}

impl ObservedState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Crashed => "crashed",
            Self::Degraded => "degraded",
        }
    }

    pub(crate) fn from_str(s: &str) -> Option<Self> {
        match s {
            "unknown" => Some(Self::Unknown),
            "running" => Some(Self::Running),
            "stopped" => Some(Self::Stopped),
            "crashed" => Some(Self::Crashed),
            "degraded" => Some(Self::Degraded),
            _ => None,
        }
    }
}

/// A registered, supervised service unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceUnit {
    pub name: String,
    pub kind: UnitKind,
    pub desired: DesiredState,
    pub observed: ObservedState,
    pub restart_count: u32,
    pub last_restart_at: Option<i64>,
    /// When the current run started (Unix seconds).
    pub started_at: Option<i64>,
    /// Set by an operator `restart`; cleared when the supervisor acts on it.
    pub restart_requested: bool,
}

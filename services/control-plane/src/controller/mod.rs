//! Node lifecycle controller.
//!
//! Drives each node through
//! `requested -> provisioning -> ready -> draining -> terminated`, with
//! `provisioning -> failed` when the vendor launch cannot be completed.
//!
//! All mutations of one account's node set are serialized by
//! [`AccountLocks`]. Vendor calls that may take long (launch, terminate) run
//! outside the lock; only the store commits before and after them are
//! locked.
//!
//! A launch in progress is tracked by an [`InFlight`] guard so the reconciler
//! leaves its row alone. The guard is released when the launch finishes or
//! its future is dropped, after which a stuck row times out normally.

mod locks;
mod reconciler;
mod worker;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use skyway_reconcile::{retry, InventoryDiff, RetryPolicy};
use tokio::sync::Notify;
use tracing::{error, info, instrument, warn};

pub use locks::AccountLocks;
pub use reconciler::ReconcileStats;
pub use worker::ControllerWorker;

use crate::association::SchedulerBackend;
use crate::budget::BudgetEnforcer;
use crate::catalog::{self, NodeTypeCatalog};
use crate::connectivity::{self, Channel};
use crate::error::{Error, Result};
use crate::store::{CloudAccount, NodeInstance, NodeStatus, StateStore};
use crate::vendor::{LaunchRequest, VendorApi, VendorInstance};

/// What happens to a queued request when admission is denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DenyPolicy {
    /// Keep the request and retry on the next pass, up to the attempt limit.
    #[default]
    Requeue,
    /// Drop the request on the first denial.
    Reject,
}

impl std::str::FromStr for DenyPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "requeue" => Ok(Self::Requeue),
            "reject" => Ok(Self::Reject),
            other => Err(format!("unknown deny policy '{other}' (expected requeue or reject)")),
        }
    }
}

/// Controller tuning.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub reconcile_interval: Duration,

    /// Draining nodes are terminated after this long even if jobs remain.
    pub drain_grace: Duration,

    /// Unrecognized vendor instances older than this are terminated.
    pub orphan_grace: Duration,

    /// Provisioning rows with no launch in flight are failed after this long.
    pub provision_timeout: Duration,

    pub deny_policy: DenyPolicy,

    pub max_admission_attempts: u32,

    /// Retries for vendor calls.
    pub vendor_retry: RetryPolicy,

    pub connect_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: skyway_reconcile::DEFAULT_RECONCILE_INTERVAL,
            drain_grace: Duration::from_secs(300),
            orphan_grace: Duration::from_secs(900),
            provision_timeout: Duration::from_secs(1800),
            deny_policy: DenyPolicy::default(),
            max_admission_attempts: 5,
            vendor_retry: RetryPolicy::default(),
            connect_timeout: connectivity::DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Result of [`NodeController::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RemoveOutcome {
    /// The node moved to `draining`.
    Accepted,
    /// The node was already draining; nothing changed.
    AlreadyDraining,
}

/// One diagnostic check of [`NodeController::test`].
#[derive(Debug, Clone, Serialize)]
pub struct Check {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

/// Outcome of [`NodeController::test`].
#[derive(Debug, Clone, Serialize)]
pub struct TestReport {
    pub account: String,
    pub passed: bool,
    pub checks: Vec<Check>,
}

/// Disagreement between the node map and vendor inventory, found without
/// changing either side.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InventoryDrift {
    pub account: String,
    /// Instances with no node row: importable orphans or strangers.
    pub vendor_only: Vec<VendorInstance>,
    /// Launched nodes the vendor no longer reports.
    pub store_only: Vec<String>,
    /// Instances named after a node that is bound to another instance.
    pub duplicates: Vec<VendorInstance>,
}

impl InventoryDrift {
    pub fn is_empty(&self) -> bool {
        self.vendor_only.is_empty() && self.store_only.is_empty() && self.duplicates.is_empty()
    }
}

/// Marks a hostname as launching until dropped.
pub(crate) struct InFlight {
    set: Arc<Mutex<HashSet<String>>>,
    hostname: String,
}

impl InFlight {
    fn new(set: Arc<Mutex<HashSet<String>>>, hostname: &str) -> Self {
        set.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(hostname.to_string());
        Self {
            set,
            hostname: hostname.to_string(),
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.hostname);
    }
}

/// An admitted node whose vendor launch has not run yet.
pub(crate) struct PendingLaunch {
    node: NodeInstance,
    in_flight: InFlight,
}

/// Per-account reconciliation of node sets against vendor inventory.
#[derive(Clone)]
pub struct NodeController {
    store: Arc<StateStore>,
    vendor: Arc<dyn VendorApi>,
    enforcer: BudgetEnforcer,
    catalog: Arc<NodeTypeCatalog>,
    scheduler: Option<Arc<dyn SchedulerBackend>>,
    locks: AccountLocks,
    config: ControllerConfig,
    /// Hostnames whose vendor launch is in progress.
    in_flight: Arc<Mutex<HashSet<String>>>,
    triggers: Arc<Mutex<HashMap<String, Arc<Notify>>>>,
}

impl NodeController {
    pub fn new(
        store: Arc<StateStore>,
        vendor: Arc<dyn VendorApi>,
        enforcer: BudgetEnforcer,
        catalog: Arc<NodeTypeCatalog>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            store,
            vendor,
            enforcer,
            catalog,
            scheduler: None,
            locks: AccountLocks::new(),
            config,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            triggers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Consult the scheduler for active jobs before terminating draining
    /// nodes. Without one, drains always wait for the grace period.
    pub fn with_scheduler(mut self, scheduler: Arc<dyn SchedulerBackend>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn enforcer(&self) -> &BudgetEnforcer {
        &self.enforcer
    }

    // =========================================================================
    // Read-only operations
    // =========================================================================

    /// Live nodes of an account as of the last committed change.
    pub fn list(&self, account: &str) -> Result<Vec<NodeInstance>> {
        self.store.require_account(account)?;
        Ok(self.store.list_nodes(account)?)
    }

    /// Instances the vendor currently reports for an account.
    pub async fn vendor_inventory(&self, account: &str) -> Result<Vec<VendorInstance>> {
        let record = self.store.require_account(account)?;
        self.fetch_inventory(&record).await
    }

    /// Compare the node map with vendor inventory. Read-only: nothing is
    /// imported, archived or terminated.
    pub async fn drift(&self, account: &str) -> Result<InventoryDrift> {
        let record = self.store.require_account(account)?;
        let inventory: Vec<VendorInstance> = self
            .fetch_inventory(&record)
            .await?
            .into_iter()
            .filter(|i| !i.state.is_gone() && !record.protected_nodes.contains(&i.name))
            .collect();
        let nodes = self.store.list_nodes(account)?;

        let diff = InventoryDiff::compute(
            nodes.iter().map(|n| n.hostname.as_str()),
            inventory.iter().map(|i| i.name.as_str()),
        );

        let mut drift = InventoryDrift {
            account: record.name,
            ..Default::default()
        };
        drift.vendor_only = inventory
            .iter()
            .filter(|i| diff.observed_only.contains(&i.name))
            .cloned()
            .collect();
        drift.store_only = nodes
            .iter()
            .filter(|n| n.instance_id.is_some() && diff.recorded_only.contains(&n.hostname))
            .map(|n| n.hostname.clone())
            .collect();
        for node in nodes.iter().filter(|n| diff.matched.contains(&n.hostname)) {
            drift.duplicates.extend(duplicates_of(node, &inventory).into_iter().cloned());
        }
        Ok(drift)
    }

    /// Validate a control channel to a named endpoint or a live node.
    pub async fn connect(&self, account: &str, target: &str) -> Result<Channel> {
        let record = self.store.require_account(account)?;

        let address = match record.endpoints.get(target) {
            Some(address) => address.clone(),
            None => {
                let node = self.store.find_node(account, target)?.ok_or_else(|| {
                    Error::NotFound(format!("endpoint or node '{target}' in account {account}"))
                })?;
                node.ip.ok_or_else(|| {
                    Error::Connectivity(format!("node {} has no address yet", node.hostname))
                })?
            }
        };

        connectivity::probe(target, &address, self.config.connect_timeout).await
    }

    /// Exercise the vendor API and every endpoint without mutating state.
    pub async fn test(&self, account: &str) -> Result<TestReport> {
        let record = self.store.require_account(account)?;
        let mut checks = Vec::new();

        checks.push(Check {
            name: "account".to_string(),
            passed: record.active,
            detail: if record.active { "active" } else { "inactive" }.to_string(),
        });

        let vendor_check = match self.vendor.ping(&record).await {
            Ok(()) => Check {
                name: format!("vendor {}", record.vendor),
                passed: true,
                detail: "API reachable".to_string(),
            },
            Err(e) => Check {
                name: format!("vendor {}", record.vendor),
                passed: false,
                detail: e.to_string(),
            },
        };
        checks.push(vendor_check);

        for (name, address) in &record.endpoints {
            let check = match connectivity::probe(name, address, self.config.connect_timeout).await {
                Ok(channel) => Check {
                    name: format!("endpoint {name}"),
                    passed: true,
                    detail: format!("{} in {}ms", channel.address, channel.latency_ms),
                },
                Err(e) => Check {
                    name: format!("endpoint {name}"),
                    passed: false,
                    detail: e.reason().to_string(),
                },
            };
            checks.push(check);
        }

        let passed = checks.iter().all(|c| c.passed);
        Ok(TestReport {
            account: record.name,
            passed,
            checks,
        })
    }

    // =========================================================================
    // Mutating operations
    // =========================================================================

    /// Request drain-then-terminate of a node by hostname or instance id.
    ///
    /// Repeating the call while the node drains is acknowledged without side
    /// effects; once the node is archived it is no longer found.
    #[instrument(skip(self))]
    pub async fn remove(&self, account: &str, key: &str) -> Result<RemoveOutcome> {
        self.store.require_account(account)?;
        let guard = self.locks.lock(account).await;

        let node = self
            .store
            .find_node(account, key)?
            .ok_or_else(|| Error::NotFound(format!("node '{key}' in account {account}")))?;

        if node.status == NodeStatus::Draining {
            return Ok(RemoveOutcome::AlreadyDraining);
        }

        self.store.set_draining(&node.hostname, Utc::now().timestamp())?;
        info!(account, hostname = %node.hostname, "Node draining on request");
        drop(guard);

        self.trigger(account);
        Ok(RemoveOutcome::Accepted)
    }

    /// Queue `count` nodes of `node_type`. Returns the request id.
    pub fn submit(&self, account: &str, node_type: &str, count: u32) -> Result<i64> {
        let record = self.store.require_account(account)?;
        if count == 0 {
            return Err(Error::Validation("count must be positive".into()));
        }
        if self.catalog.spec(record.vendor, node_type).is_none() {
            return Err(Error::Validation(format!(
                "unknown node type '{node_type}' for vendor {}",
                record.vendor
            )));
        }

        let id = self
            .store
            .enqueue_request(account, node_type, count, Utc::now().timestamp())?;
        info!(account, node_type, count, request_id = id, "Provisioning request queued");
        self.trigger(account);
        Ok(id)
    }

    /// Admit and launch one node right away.
    ///
    /// Admission is checked without the lock first, then re-checked and
    /// committed under the account lock. The launch itself runs unlocked.
    #[instrument(skip(self))]
    pub async fn provision(&self, account: &str, node_type: &str) -> Result<NodeInstance> {
        let record = self.store.require_account(account)?;

        // Cheap early answer; not authoritative.
        self.enforcer.authorize(account, node_type)?.into_result()?;

        let pending = {
            let _guard = self.locks.lock(account).await;
            let now = Utc::now().timestamp();
            let rate = self.enforcer.authorize_at(account, node_type, now)?.into_result()?;
            self.commit_node(&record, node_type, rate, now)?
        };

        self.launch(&record, pending).await
    }

    // =========================================================================
    // Internals shared with the reconciler
    // =========================================================================

    /// Wake the account's worker.
    pub fn trigger(&self, account: &str) {
        self.notifier(account).notify_one();
    }

    pub(crate) fn notifier(&self, account: &str) -> Arc<Notify> {
        let mut triggers = self
            .triggers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        triggers
            .entry(account.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    pub(crate) fn is_in_flight(&self, hostname: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(hostname)
    }

    /// Insert a provisioning node and open its journal entry.
    ///
    /// Caller holds the account lock and has just been admitted.
    pub(crate) fn commit_node(
        &self,
        account: &CloudAccount,
        node_type: &str,
        rate: f64,
        now: i64,
    ) -> Result<PendingLaunch> {
        let taken: HashSet<u32> = self
            .store
            .list_nodes(&account.name)?
            .iter()
            .filter_map(|n| catalog::parse_hostname(&account.name, &n.hostname))
            .filter(|(t, _)| t == node_type)
            .map(|(_, i)| i)
            .collect();
        let index = (1..).find(|i| !taken.contains(i)).unwrap_or(1);

        let node = NodeInstance {
            hostname: catalog::hostname(&account.name, node_type, index),
            node_type: node_type.to_string(),
            account: account.name.clone(),
            instance_id: None,
            ip: None,
            started_at: now,
            status: NodeStatus::Provisioning,
            rate,
            drain_started_at: None,
        };
        self.store.insert_node(&node, None)?;
        let in_flight = InFlight::new(self.in_flight.clone(), &node.hostname);

        info!(account = %account.name, hostname = %node.hostname, node_type, rate, "Node admitted");
        Ok(PendingLaunch { node, in_flight })
    }

    /// Launch a committed node at the vendor and record the outcome.
    ///
    /// Retries first look for an instance left behind by an earlier attempt
    /// whose response was lost, so a launch never creates two instances.
    pub(crate) async fn launch(&self, account: &CloudAccount, pending: PendingLaunch) -> Result<NodeInstance> {
        let PendingLaunch { node, in_flight } = pending;
        let shape = self
            .catalog
            .spec(account.vendor, &node.node_type)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| node.node_type.clone());
        let request = LaunchRequest {
            name: node.hostname.clone(),
            node_type: node.node_type.clone(),
            shape,
        };

        let vendor = self.vendor.clone();
        let result = retry("create instance", &self.config.vendor_retry, |attempt| {
            let vendor = vendor.clone();
            let request = request.clone();
            let account = account.clone();
            async move {
                if attempt > 0 {
                    warn!(hostname = %request.name, attempt, "Retrying instance launch");
                    let existing = vendor
                        .list_instances(&account)
                        .await?
                        .into_iter()
                        .find(|i| i.name == request.name && !i.state.is_gone());
                    if let Some(instance) = existing {
                        info!(hostname = %request.name, instance_id = %instance.instance_id, "Adopting instance from earlier attempt");
                        return Ok(instance);
                    }
                }
                vendor.create_instance(&account, &request).await
            }
        })
        .await;

        let guard = self.locks.lock(&account.name).await;
        drop(in_flight);
        let now = Utc::now().timestamp();

        match result {
            Ok(instance) => {
                let attached = self.store.attach_instance(
                    &node.hostname,
                    &instance.instance_id,
                    instance.ip.as_deref(),
                    now,
                )?;
                drop(guard);

                match attached {
                    Some(updated) => {
                        info!(
                            account = %account.name,
                            hostname = %updated.hostname,
                            instance_id = %instance.instance_id,
                            status = %updated.status,
                            "Node launched"
                        );
                        Ok(updated)
                    }
                    None => {
                        warn!(hostname = %node.hostname, "Node archived during launch, terminating instance");
                        self.terminate_instance(account, &instance.instance_id).await?;
                        Err(Error::NotFound(format!("node {} was archived during launch", node.hostname)))
                    }
                }
            }
            Err(e) => {
                self.store.archive_node(
                    &node.hostname,
                    NodeStatus::Failed,
                    now,
                    Some(&e.to_string()),
                )?;
                drop(guard);

                error!(account = %account.name, hostname = %node.hostname, error = %e, "Node launch failed");
                Err(Error::Connectivity(e.to_string()))
            }
        }
    }

    pub(crate) async fn fetch_inventory(&self, account: &CloudAccount) -> Result<Vec<VendorInstance>> {
        let vendor = self.vendor.clone();
        retry("list instances", &self.config.vendor_retry, |_| {
            let vendor = vendor.clone();
            let account = account.clone();
            async move { vendor.list_instances(&account).await }
        })
        .await
        .map_err(|e| Error::Connectivity(e.to_string()))
    }

    pub(crate) async fn terminate_instance(&self, account: &CloudAccount, instance_id: &str) -> Result<()> {
        let vendor = self.vendor.clone();
        retry("terminate instance", &self.config.vendor_retry, |_| {
            let vendor = vendor.clone();
            let account = account.clone();
            let instance_id = instance_id.to_string();
            async move { vendor.terminate_instance(&account, &instance_id).await }
        })
        .await
        .map_err(|e| Error::Connectivity(e.to_string()))
    }
}

/// Instances carrying `node`'s hostname but not its instance id.
///
/// Only reported while the node's own instance is present, so a vendor-side
/// replacement is not mistaken for a duplicate.
pub(crate) fn duplicates_of<'a>(node: &NodeInstance, inventory: &'a [VendorInstance]) -> Vec<&'a VendorInstance> {
    let Some(own) = node.instance_id.as_deref() else {
        return Vec::new();
    };
    let named: Vec<&VendorInstance> = inventory.iter().filter(|i| i.name == node.hostname).collect();
    if !named.iter().any(|i| i.instance_id == own) {
        return Vec::new();
    }
    named.into_iter().filter(|i| i.instance_id != own).collect()
}

/// Render `/etc/hosts` lines for live nodes. Nodes without an address get
/// the `0.0.0.0` placeholder.
pub fn render_hosts(nodes: &[NodeInstance]) -> String {
    let mut out = String::new();
    for node in nodes {
        let ip = node.ip.as_deref().unwrap_or("0.0.0.0");
        out.push_str(&format!("{ip:<16}{}\n", node.hostname));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deny_policy_parse() {
        assert_eq!("requeue".parse::<DenyPolicy>(), Ok(DenyPolicy::Requeue));
        assert_eq!("reject".parse::<DenyPolicy>(), Ok(DenyPolicy::Reject));
        assert!("drop".parse::<DenyPolicy>().is_err());
    }

    #[test]
    fn test_render_hosts() {
        let node = |host: &str, ip: Option<&str>| NodeInstance {
            hostname: host.to_string(),
            node_type: "t1".to_string(),
            account: "rcc-aws".to_string(),
            instance_id: None,
            ip: ip.map(str::to_string),
            started_at: 0,
            status: NodeStatus::Ready,
            rate: 1.0,
            drain_started_at: None,
        };

        let hosts = render_hosts(&[
            node("rcc-aws-t1-001", Some("10.0.0.4")),
            node("rcc-aws-t1-002", None),
        ]);
        assert_eq!(
            hosts,
            "10.0.0.4        rcc-aws-t1-001\n0.0.0.0         rcc-aws-t1-002\n"
        );
    }

    #[test]
    fn test_duplicates_of() {
        let instance = |id: &str, name: &str| VendorInstance {
            instance_id: id.to_string(),
            name: name.to_string(),
            shape: "t2.micro".to_string(),
            ip: None,
            launched_at: 0,
            state: crate::vendor::InstanceState::Running,
        };
        let mut node = NodeInstance {
            hostname: "rcc-aws-t1-001".to_string(),
            node_type: "t1".to_string(),
            account: "rcc-aws".to_string(),
            instance_id: Some("i-1".to_string()),
            ip: None,
            started_at: 0,
            status: NodeStatus::Ready,
            rate: 1.0,
            drain_started_at: None,
        };

        let inventory = vec![
            instance("i-1", "rcc-aws-t1-001"),
            instance("i-2", "rcc-aws-t1-001"),
            instance("i-3", "rcc-aws-t1-002"),
        ];
        let dups: Vec<&str> = duplicates_of(&node, &inventory)
            .iter()
            .map(|i| i.instance_id.as_str())
            .collect();
        assert_eq!(dups, vec!["i-2"]);

        // Own instance gone: the other one is a replacement, not a duplicate.
        assert!(duplicates_of(&node, &inventory[1..]).is_empty());

        node.instance_id = None;
        assert!(duplicates_of(&node, &inventory).is_empty());
    }

    #[test]
    fn test_in_flight_released_on_drop() {
        let set = Arc::new(Mutex::new(HashSet::new()));
        let guard = InFlight::new(set.clone(), "rcc-aws-t1-001");
        assert!(set.lock().unwrap().contains("rcc-aws-t1-001"));
        drop(guard);
        assert!(set.lock().unwrap().is_empty());
    }
}

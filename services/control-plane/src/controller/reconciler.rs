//! One reconciliation pass for one account.
//!
//! 1. Fetch the vendor inventory (with retries).
//! 2. Under the account lock: diff it against the node map, archive vanished
//!    nodes, import orphans, fail stuck launches, apply evictions, pick
//!    drained nodes to terminate, admit queued requests.
//! 3. Without the lock: terminate and launch at the vendor, then commit the
//!    outcomes under the lock again.

use chrono::Utc;
use serde::Serialize;
use skyway_reconcile::InventoryDiff;
use tracing::{debug, info, instrument, warn};

use super::{duplicates_of, DenyPolicy, NodeController, PendingLaunch};
use crate::budget::Admission;
use crate::catalog;
use crate::error::{Error, Result};
use crate::store::{CloudAccount, NodeInstance, NodeStatus};
use crate::vendor::VendorInstance;

/// Counters from one pass.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    /// Recorded nodes the vendor no longer reports.
    pub vanished: u32,
    /// Vendor instances adopted into the node map.
    pub imported: u32,
    /// Provisioning rows matched to an existing vendor instance.
    pub recovered: u32,
    /// Unrecognized vendor instances terminated after the grace period.
    pub stale_terminated: u32,
    /// Extra instances sharing a launched node's hostname, queued for termination.
    pub duplicates: u32,
    /// Provisioning rows failed after the launch timeout.
    pub timed_out: u32,
    pub evicted: u32,
    pub terminated: u32,
    pub admitted: u32,
    pub denied: u32,
    pub rejected: u32,
    pub launch_failures: u32,
}

impl ReconcileStats {
    pub fn changed(&self) -> bool {
        *self != Self::default()
    }
}

/// Work decided under the lock and carried out after releasing it.
#[derive(Default)]
struct Plan {
    stale: Vec<String>,
    drained: Vec<NodeInstance>,
    launches: Vec<PendingLaunch>,
}

impl NodeController {
    /// Reconcile one account now.
    pub async fn reconcile_account(&self, account: &str) -> Result<ReconcileStats> {
        self.reconcile_account_at(account, Utc::now().timestamp()).await
    }

    /// Reconcile one account as of `now` (Unix seconds).
    #[instrument(skip(self))]
    pub async fn reconcile_account_at(&self, account: &str, now: i64) -> Result<ReconcileStats> {
        let record = self.store.require_account(account)?;
        let inventory: Vec<VendorInstance> = self
            .fetch_inventory(&record)
            .await?
            .into_iter()
            .filter(|i| !i.state.is_gone() && !record.protected_nodes.contains(&i.name))
            .collect();

        let mut stats = ReconcileStats::default();
        let plan = {
            let _guard = self.locks.lock(account).await;
            self.plan_locked(&record, &inventory, now, &mut stats).await?
        };

        self.execute(&record, plan, now, &mut stats).await;

        if stats.changed() {
            info!(account, ?stats, "Reconciliation pass complete");
        }
        Ok(stats)
    }

    async fn plan_locked(
        &self,
        account: &CloudAccount,
        inventory: &[VendorInstance],
        now: i64,
        stats: &mut ReconcileStats,
    ) -> Result<Plan> {
        let mut plan = Plan::default();
        let nodes = self.store.list_nodes(&account.name)?;

        let diff = InventoryDiff::compute(
            nodes.iter().map(|n| n.hostname.as_str()),
            inventory.iter().map(|i| i.name.as_str()),
        );

        // Store-only: the vendor lost the instance.
        for node in nodes.iter().filter(|n| diff.recorded_only.contains(&n.hostname)) {
            if self.is_in_flight(&node.hostname) {
                continue;
            }
            match node.status {
                NodeStatus::Provisioning if node.instance_id.is_none() => {
                    if now - node.started_at >= self.config.provision_timeout.as_secs() as i64 {
                        self.store.archive_node(
                            &node.hostname,
                            NodeStatus::Failed,
                            now,
                            Some("launch did not complete"),
                        )?;
                        warn!(hostname = %node.hostname, "Provisioning timed out");
                        stats.timed_out += 1;
                    }
                }
                _ => {
                    self.store.archive_node(
                        &node.hostname,
                        NodeStatus::Terminated,
                        now,
                        Some("vanished from vendor inventory"),
                    )?;
                    info!(hostname = %node.hostname, "Node vanished from vendor, archived");
                    stats.vanished += 1;
                }
            }
        }

        // Both sides: adopt the instance behind a launch we lost track of,
        // and drop extra instances carrying a launched node's name.
        for node in nodes.iter().filter(|n| diff.matched.contains(&n.hostname)) {
            if self.is_in_flight(&node.hostname) {
                continue;
            }
            if node.instance_id.is_some() {
                for dup in duplicates_of(node, inventory) {
                    warn!(hostname = %node.hostname, instance_id = %dup.instance_id, "Duplicate instance for node");
                    plan.stale.push(dup.instance_id.clone());
                    stats.duplicates += 1;
                }
                continue;
            }
            if let Some(instance) = inventory.iter().find(|i| i.name == node.hostname) {
                self.store.attach_instance(
                    &node.hostname,
                    &instance.instance_id,
                    instance.ip.as_deref(),
                    now,
                )?;
                stats.recovered += 1;
            }
        }

        // Vendor-only: import ours, terminate stale strangers.
        for instance in inventory.iter().filter(|i| diff.observed_only.contains(&i.name)) {
            match self.orphan_node(account, instance, now) {
                Some(node) => match self.store.insert_node(&node, Some("orphan")) {
                    Ok(_) => {
                        info!(hostname = %node.hostname, instance_id = %instance.instance_id, "Imported orphan instance");
                        stats.imported += 1;
                    }
                    Err(e) => warn!(hostname = %node.hostname, error = %e, "Failed to import orphan instance"),
                },
                None => {
                    let age = now - instance.launched_at;
                    if age >= self.config.orphan_grace.as_secs() as i64 {
                        plan.stale.push(instance.instance_id.clone());
                    } else {
                        debug!(name = %instance.name, age, "Unrecognized instance within grace period");
                    }
                }
            }
        }

        // Budget overrun.
        for hostname in self.enforcer.eviction_candidates_at(&account.name, now)? {
            if self.store.set_draining(&hostname, now)? {
                warn!(%hostname, "Evicting node over budget");
                stats.evicted += 1;
            }
        }

        // Drain completion.
        for node in self.store.list_nodes(&account.name)? {
            if node.status != NodeStatus::Draining || self.is_in_flight(&node.hostname) {
                continue;
            }
            if !self.drain_complete(&node, now).await {
                continue;
            }
            if node.instance_id.is_some() {
                plan.drained.push(node);
            } else {
                self.store
                    .archive_node(&node.hostname, NodeStatus::Terminated, now, Some("drained before launch"))?;
                stats.terminated += 1;
            }
        }

        self.admit_queued(account, now, &mut plan, stats)?;
        Ok(plan)
    }

    /// Build a node row for a vendor instance that follows our naming.
    fn orphan_node(&self, account: &CloudAccount, instance: &VendorInstance, now: i64) -> Option<NodeInstance> {
        let (node_type, _) = catalog::parse_hostname(&account.name, &instance.name)?;
        let price = self
            .catalog
            .rate(account.vendor, &node_type)
            .or_else(|| {
                let by_shape = self.catalog.type_for_shape(account.vendor, &instance.shape)?;
                self.catalog.rate(account.vendor, by_shape)
            })?;
        let rate = match self.store.get_budget(&account.name) {
            Ok(Some(budget)) => price.min(budget.max_rate),
            _ => price,
        };

        Some(NodeInstance {
            hostname: instance.name.clone(),
            node_type,
            account: account.name.clone(),
            instance_id: Some(instance.instance_id.clone()),
            ip: instance.ip.clone(),
            started_at: instance.launched_at.min(now),
            status: NodeStatus::Ready,
            rate,
            drain_started_at: None,
        })
    }

    /// Grace period elapsed, or the scheduler confirms no running jobs.
    async fn drain_complete(&self, node: &NodeInstance, now: i64) -> bool {
        let since = node.drain_started_at.unwrap_or(now);
        if now - since >= self.config.drain_grace.as_secs() as i64 {
            return true;
        }
        let Some(scheduler) = &self.scheduler else {
            return false;
        };
        match scheduler.active_jobs(&node.hostname).await {
            Ok(0) => true,
            Ok(jobs) => {
                debug!(hostname = %node.hostname, jobs, "Waiting for jobs to finish");
                false
            }
            Err(e) => {
                warn!(hostname = %node.hostname, error = %e, "Cannot query active jobs");
                false
            }
        }
    }

    fn admit_queued(
        &self,
        account: &CloudAccount,
        now: i64,
        plan: &mut Plan,
        stats: &mut ReconcileStats,
    ) -> Result<()> {
        for request in self.store.list_requests(&account.name)? {
            for _ in 0..request.count {
                let admission = match self.enforcer.authorize_at(&account.name, &request.node_type, now) {
                    Ok(admission) => admission,
                    Err(Error::Validation(reason)) => {
                        warn!(request_id = request.id, %reason, "Dropping invalid request");
                        self.store.delete_request(request.id)?;
                        stats.rejected += 1;
                        break;
                    }
                    Err(e) => return Err(e),
                };

                match admission {
                    Admission::Allow { rate } => {
                        let pending = self.commit_node(account, &request.node_type, rate, now)?;
                        self.store.consume_request(request.id)?;
                        plan.launches.push(pending);
                        stats.admitted += 1;
                    }
                    Admission::Deny(reason) => {
                        let attempts = self.store.record_request_denial(request.id, &reason.to_string())?;
                        stats.denied += 1;
                        let give_up = self.config.deny_policy == DenyPolicy::Reject
                            || attempts >= self.config.max_admission_attempts;
                        if give_up {
                            self.store.delete_request(request.id)?;
                            warn!(request_id = request.id, attempts, %reason, "Provisioning request rejected");
                            stats.rejected += 1;
                        } else {
                            debug!(request_id = request.id, attempts, %reason, "Provisioning request requeued");
                        }
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    async fn execute(&self, account: &CloudAccount, plan: Plan, now: i64, stats: &mut ReconcileStats) {
        for instance_id in plan.stale {
            match self.terminate_instance(account, &instance_id).await {
                Ok(()) => {
                    warn!(account = %account.name, %instance_id, "Terminated unrecognized instance");
                    stats.stale_terminated += 1;
                }
                Err(e) => warn!(account = %account.name, %instance_id, error = %e, "Failed to terminate unrecognized instance"),
            }
        }

        for node in plan.drained {
            let Some(instance_id) = node.instance_id.as_deref() else {
                continue;
            };
            if let Err(e) = self.terminate_instance(account, instance_id).await {
                // Left draining; the next pass tries again.
                warn!(hostname = %node.hostname, error = %e, "Failed to terminate drained node");
                continue;
            }

            let _guard = self.locks.lock(&account.name).await;
            match self.store.archive_node(
                &node.hostname,
                NodeStatus::Terminated,
                now,
                None,
            ) {
                Ok(_) => {
                    info!(hostname = %node.hostname, "Node terminated");
                    stats.terminated += 1;
                }
                Err(e) => warn!(hostname = %node.hostname, error = %e, "Failed to archive terminated node"),
            }
        }

        for pending in plan.launches {
            if self.launch(account, pending).await.is_err() {
                stats.launch_failures += 1;
            }
        }
    }
}

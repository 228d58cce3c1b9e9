//! Association synchronization.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use skyway_reconcile::{retry, BackoffPolicy, RetryPolicy};
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{error, info, instrument, warn};

use super::{Association, SchedulerBackend};
use crate::error::{Error, Result};
use crate::store::{StateStore, LEGACY_MEMBERSHIP_VERSION};

/// Sync tuning.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Upper bound for one `update`, lock wait included.
    pub timeout: Duration,

    /// Retries for each scheduler call.
    pub retry: RetryPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            retry: RetryPolicy {
                max_attempts: 3,
                backoff: BackoffPolicy::default(),
            },
        }
    }
}

/// Changes committed for one account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AccountDelta {
    pub account: String,
    pub grants: Vec<String>,
    pub revocations: Vec<String>,
}

/// An account whose delta was not applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedAccount {
    pub account: String,
    pub reason: String,
}

/// Outcome of [`AssociationSync::update`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub applied: Vec<AccountDelta>,
    pub unchanged: Vec<String>,
    pub failed_accounts: Vec<FailedAccount>,
}

impl SyncReport {
    /// No grants or revocations were committed.
    pub fn is_empty_delta(&self) -> bool {
        self.applied.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Grant,
    Revoke,
}

impl Op {
    fn inverse(self) -> Self {
        match self {
            Self::Grant => Self::Revoke,
            Self::Revoke => Self::Grant,
        }
    }
}

/// Projects account membership into the scheduler.
pub struct AssociationSync {
    store: Arc<StateStore>,
    backend: Arc<dyn SchedulerBackend>,
    config: SyncConfig,
    lock: Mutex<()>,
}

impl AssociationSync {
    pub fn new(store: Arc<StateStore>, backend: Arc<dyn SchedulerBackend>, config: SyncConfig) -> Self {
        Self {
            store,
            backend,
            config,
            lock: Mutex::new(()),
        }
    }

    /// Run one sync bounded by the configured timeout.
    pub async fn update(&self) -> Result<SyncReport> {
        let (_tx, cancel) = watch::channel(false);
        self.update_with_cancel(cancel).await
    }

    /// Run one sync that stops early when `cancel` flips to `true`.
    ///
    /// Accounts not reached before the deadline or cancellation are reported
    /// as failed and left untouched. An account interrupted midway is rolled
    /// back.
    #[instrument(skip_all)]
    pub async fn update_with_cancel(&self, cancel: watch::Receiver<bool>) -> Result<SyncReport> {
        let deadline = Instant::now() + self.config.timeout;

        let _guard = tokio::time::timeout_at(deadline, self.lock.lock())
            .await
            .map_err(|_| Error::Internal("timed out waiting for a running association sync".into()))?;

        let accounts = self.store.list_accounts()?;
        let managed: BTreeSet<String> = accounts.iter().map(|a| a.name.clone()).collect();
        let active: BTreeSet<&str> = accounts
            .iter()
            .filter(|a| a.active)
            .map(|a| a.name.as_str())
            .collect();

        let mut target: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for m in self.store.list_membership()? {
            if m.source_version != LEGACY_MEMBERSHIP_VERSION {
                warn!(username = %m.username, account = %m.account, version = m.source_version, "Ignoring membership from unsupported source");
                continue;
            }
            if active.contains(m.account.as_str()) {
                target.entry(m.account).or_default().insert(m.username);
            }
        }

        let backend = self.backend.clone();
        let current_all = retry("list associations", &self.config.retry, |_| {
            let backend = backend.clone();
            async move { backend.associations().await }
        })
        .await
        .map_err(|e| Error::Connectivity(e.to_string()))?;

        // Only accounts in the registry are managed; anything else on the
        // scheduler belongs to on-premise accounts.
        let mut current: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for assoc in current_all {
            if managed.contains(&assoc.account) {
                current.entry(assoc.account).or_default().insert(assoc.user);
            }
        }

        let mut report = SyncReport::default();
        let empty = BTreeSet::new();

        for account in &managed {
            let want = target.get(account).unwrap_or(&empty);
            let have = current.get(account).unwrap_or(&empty);

            let grants: Vec<String> = want.difference(have).cloned().collect();
            let revocations: Vec<String> = have.difference(want).cloned().collect();

            if grants.is_empty() && revocations.is_empty() {
                report.unchanged.push(account.clone());
                continue;
            }

            if let Some(reason) = interrupted(&cancel, deadline) {
                report.failed_accounts.push(FailedAccount {
                    account: account.clone(),
                    reason: reason.to_string(),
                });
                continue;
            }

            let ops: Vec<(Op, Association)> = grants
                .iter()
                .map(|u| (Op::Grant, Association::new(account, u)))
                .chain(revocations.iter().map(|u| (Op::Revoke, Association::new(account, u))))
                .collect();

            match self.apply_account(&ops, &cancel, deadline).await {
                Ok(()) => {
                    info!(account = %account, grants = grants.len(), revocations = revocations.len(), "Associations updated");
                    report.applied.push(AccountDelta {
                        account: account.clone(),
                        grants,
                        revocations,
                    });
                }
                Err(reason) => {
                    warn!(account = %account, %reason, "Association delta rolled back");
                    report.failed_accounts.push(FailedAccount {
                        account: account.clone(),
                        reason,
                    });
                }
            }
        }

        Ok(report)
    }

    /// Sync on a fixed interval until shutdown.
    ///
    /// A shutdown during a sync cancels it; the account in progress is
    /// rolled back.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        info!(interval_secs = interval.as_secs(), "Starting association sync worker");
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Association sync worker shutting down");
                        return Ok(());
                    }
                    continue;
                }
            }

            match self.update_with_cancel(shutdown.clone()).await {
                Ok(report) if !report.failed_accounts.is_empty() => {
                    warn!(failed = report.failed_accounts.len(), "Association sync incomplete");
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Association sync failed"),
            }
        }
    }

    /// Apply every op or none. On failure the applied prefix is undone in
    /// reverse order.
    async fn apply_account(
        &self,
        ops: &[(Op, Association)],
        cancel: &watch::Receiver<bool>,
        deadline: Instant,
    ) -> std::result::Result<(), String> {
        let mut applied: Vec<(Op, &Association)> = Vec::with_capacity(ops.len());

        for (op, assoc) in ops {
            if let Some(reason) = interrupted(cancel, deadline) {
                self.rollback(&applied).await;
                return Err(reason.to_string());
            }

            match tokio::time::timeout_at(deadline, self.call(*op, assoc)).await {
                Ok(Ok(())) => applied.push((*op, assoc)),
                Ok(Err(e)) => {
                    self.rollback(&applied).await;
                    return Err(format!("{assoc}: {e}"));
                }
                Err(_) => {
                    // The interrupted call may or may not have landed.
                    applied.push((*op, assoc));
                    self.rollback(&applied).await;
                    return Err("timed out".to_string());
                }
            }
        }
        Ok(())
    }

    async fn rollback(&self, applied: &[(Op, &Association)]) {
        for (op, assoc) in applied.iter().rev() {
            if let Err(e) = self.call(op.inverse(), assoc).await {
                error!(association = %assoc, error = %e, "Association rollback failed");
            }
        }
    }

    async fn call(&self, op: Op, assoc: &Association) -> std::result::Result<(), String> {
        let backend = self.backend.clone();
        let name = match op {
            Op::Grant => "grant association",
            Op::Revoke => "revoke association",
        };
        retry(name, &self.config.retry, |_| {
            let backend = backend.clone();
            let assoc = assoc.clone();
            async move {
                match op {
                    Op::Grant => backend.grant(&assoc).await,
                    Op::Revoke => backend.revoke(&assoc).await,
                }
            }
        })
        .await
        .map_err(|e| e.to_string())
    }
}

fn interrupted(cancel: &watch::Receiver<bool>, deadline: Instant) -> Option<&'static str> {
    if *cancel.borrow() {
        Some("cancelled")
    } else if Instant::now() >= deadline {
        Some("timed out")
    } else {
        None
    }
}

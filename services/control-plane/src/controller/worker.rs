//! Per-account controller worker.
//!
//! Runs reconciliation for one account on a fixed interval and whenever the
//! controller is triggered (new request, removal).

use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, instrument};

use super::NodeController;
use crate::error::Error;

/// Background reconciliation loop for one account.
pub struct ControllerWorker {
    controller: NodeController,
    account: String,
    interval: Duration,
}

impl ControllerWorker {
    pub fn new(controller: NodeController, account: impl Into<String>) -> Self {
        let interval = controller.config().reconcile_interval;
        Self {
            controller,
            account: account.into(),
            interval,
        }
    }

    /// Run until shutdown is signaled.
    ///
    /// Returns an error only when the account itself disappears; vendor and
    /// budget failures are logged and retried on the next tick.
    #[instrument(skip(self, shutdown), fields(account = %self.account))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        info!(interval_secs = self.interval.as_secs(), "Starting controller worker");

        let trigger = self.controller.notifier(&self.account);
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = trigger.notified() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Controller worker shutting down");
                        return Ok(());
                    }
                    continue;
                }
            }

            match self.controller.reconcile_account(&self.account).await {
                Ok(_) => {}
                Err(Error::NotFound(what)) => {
                    anyhow::bail!("account {} is gone: {what}", self.account);
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Arc;

    use super::*;
    use crate::budget::{BudgetEnforcer, EnforcerConfig};
    use crate::catalog::NodeTypeCatalog;
    use crate::controller::ControllerConfig;
    use crate::store::{CloudAccount, StateStore, Vendor};
    use crate::vendor::MockVendor;

    fn controller(store: Arc<StateStore>) -> NodeController {
        let catalog = Arc::new(NodeTypeCatalog::default());
        let enforcer = BudgetEnforcer::new(store.clone(), catalog.clone(), EnforcerConfig::default());
        NodeController::new(
            store,
            Arc::new(MockVendor::new()),
            enforcer,
            catalog,
            ControllerConfig {
                reconcile_interval: Duration::from_millis(20),
                ..ControllerConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_worker_stops_on_shutdown() {
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

        let worker = ControllerWorker::new(controller(store), "rcc-aws");
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { worker.run(rx).await });

        tokio::time::sleep(Duration::from_millis(60)).await;
        tx.send(true).unwrap();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_worker_fails_for_unknown_account() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let worker = ControllerWorker::new(controller(store), "missing");
        let (_tx, rx) = watch::channel(false);

        assert!(worker.run(rx).await.is_err());
    }
}

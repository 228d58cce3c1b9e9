//! Maps unit kinds to the workers that implement them.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use super::{Launcher, UnitFuture};
use crate::association::AssociationSync;
use crate::billing::BillingWorker;
use crate::controller::{ControllerWorker, NodeController};
use crate::store::UnitKind;

/// Launcher for the daemon's own components.
pub struct ServiceLauncher {
    billing: BillingWorker,
    controller: NodeController,
    sync: Arc<AssociationSync>,
    sync_interval: Duration,
}

impl ServiceLauncher {
    pub fn new(
        billing: BillingWorker,
        controller: NodeController,
        sync: Arc<AssociationSync>,
        sync_interval: Duration,
    ) -> Self {
        Self {
            billing,
            controller,
            sync,
            sync_interval,
        }
    }
}

impl Launcher for ServiceLauncher {
    fn launch(&self, _name: &str, kind: &UnitKind, shutdown: watch::Receiver<bool>) -> anyhow::Result<UnitFuture> {
        let future: UnitFuture = match kind {
            UnitKind::Billing => {
                let worker = self.billing.clone();
                Box::pin(async move { worker.run(shutdown).await })
            }
            UnitKind::Controller { account } => {
                let worker = ControllerWorker::new(self.controller.clone(), account.clone());
                Box::pin(async move { worker.run(shutdown).await })
            }
            UnitKind::AssociationSync => {
                let sync = self.sync.clone();
                let interval = self.sync_interval;
                Box::pin(async move { sync.run(interval, shutdown).await })
            }
        };
        Ok(future)
    }
}

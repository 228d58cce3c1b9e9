//! Wiring of the components shared by the daemon and the CLI.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::accounts::AccountRegistry;
use crate::association::{AssociationSync, MemoryScheduler, SacctmgrBackend, SchedulerBackend};
use crate::billing::BillingWorker;
use crate::budget::BudgetEnforcer;
use crate::catalog::NodeTypeCatalog;
use crate::config::{Config, SchedulerSelection, VendorSelection};
use crate::controller::NodeController;
use crate::error::Error;
use crate::store::{StateStore, UnitKind};
use crate::supervisor::{ServiceLauncher, Supervisor, UnitRegistry};
use crate::vendor::{DriverVendor, MockVendor, VendorApi};

/// Name of the billing unit.
pub const BILLING_UNIT: &str = "billing";

/// Name of the association sync unit.
pub const ASSOCIATION_SYNC_UNIT: &str = "association-sync";

/// Name of the controller unit of an account.
pub fn controller_unit(account: &str) -> String {
    format!("controller-{account}")
}

/// Every component, built once from configuration.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<StateStore>,
    pub catalog: Arc<NodeTypeCatalog>,
    pub vendor: Arc<dyn VendorApi>,
    pub scheduler: Arc<dyn SchedulerBackend>,
    pub accounts: AccountRegistry,
    pub enforcer: BudgetEnforcer,
    pub controller: NodeController,
    pub sync: Arc<AssociationSync>,
    pub units: UnitRegistry,
    config: Config,
}

impl AppState {
    /// Open the store and build every component from `config`.
    pub fn build(config: Config) -> Result<Self> {
        if let Some(parent) = config.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        let store = StateStore::open(&config.db_path)
            .with_context(|| format!("Failed to open state store {}", config.db_path.display()))?;

        let catalog = if config.cloud_config.exists() {
            NodeTypeCatalog::load(&config.cloud_config)?
        } else {
            warn!(path = %config.cloud_config.display(), "Node-type catalog not found, no node types available");
            NodeTypeCatalog::default()
        };

        let vendor: Arc<dyn VendorApi> = match &config.vendor {
            VendorSelection::Mock => {
                info!("Using in-memory vendor (dev mode)");
                Arc::new(MockVendor::new())
            }
            VendorSelection::Driver(path) => Arc::new(DriverVendor::new(path.clone())),
        };

        let scheduler: Arc<dyn SchedulerBackend> = match config.scheduler {
            SchedulerSelection::Sacctmgr => Arc::new(SacctmgrBackend::new()),
            SchedulerSelection::Memory => Arc::new(MemoryScheduler::new()),
        };

        Ok(Self::from_parts(Arc::new(store), Arc::new(catalog), vendor, scheduler, config))
    }

    /// Build from already constructed capabilities.
    pub fn from_parts(
        store: Arc<StateStore>,
        catalog: Arc<NodeTypeCatalog>,
        vendor: Arc<dyn VendorApi>,
        scheduler: Arc<dyn SchedulerBackend>,
        config: Config,
    ) -> Self {
        let enforcer = BudgetEnforcer::new(store.clone(), catalog.clone(), config.enforcer.clone());
        let controller = NodeController::new(
            store.clone(),
            vendor.clone(),
            enforcer.clone(),
            catalog.clone(),
            config.controller.clone(),
        )
        .with_scheduler(scheduler.clone());
        let sync = Arc::new(AssociationSync::new(store.clone(), scheduler.clone(), config.sync.clone()));

        Self {
            accounts: AccountRegistry::new(store.clone()),
            units: UnitRegistry::new(store.clone()),
            store,
            catalog,
            vendor,
            scheduler,
            enforcer,
            controller,
            sync,
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Supervisor running this state's components.
    pub fn supervisor(&self) -> Supervisor {
        let launcher = ServiceLauncher::new(
            BillingWorker::new(self.enforcer.clone(), self.config.billing.clone()),
            self.controller.clone(),
            self.sync.clone(),
            self.config.sync_interval,
        );
        Supervisor::new(self.store.clone(), Arc::new(launcher), self.config.supervisor.clone())
    }

    /// Register the billing, association sync and per-account controller
    /// units that are not registered yet. Returns the names added.
    pub fn register_default_units(&self) -> crate::error::Result<Vec<String>> {
        let mut wanted = vec![
            (BILLING_UNIT.to_string(), UnitKind::Billing),
            (ASSOCIATION_SYNC_UNIT.to_string(), UnitKind::AssociationSync),
        ];
        for account in self.accounts.list()? {
            wanted.push((
                controller_unit(&account.name),
                UnitKind::Controller {
                    account: account.name,
                },
            ));
        }

        let mut added = Vec::new();
        for (name, kind) in wanted {
            match self.units.register(&name, &kind) {
                Ok(()) => added.push(name),
                Err(Error::Duplicate(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(added)
    }
}

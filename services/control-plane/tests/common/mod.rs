#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use skyway_control_plane::{
    accounts::NewAccount,
    association::MemoryScheduler,
    catalog::{NodeTypeCatalog, NodeTypeSpec},
    config::Config,
    state::AppState,
    store::{StateStore, Vendor},
    vendor::MockVendor,
};
use skyway_reconcile::{BackoffPolicy, RetryPolicy};

pub struct Harness {
    pub state: AppState,
    pub vendor: Arc<MockVendor>,
    pub scheduler: Arc<MemoryScheduler>,
}

fn spec(name: &str, price: f64) -> NodeTypeSpec {
    NodeTypeSpec {
        name: name.to_string(),
        price,
        cores: 4,
        memgb: 16,
        gpu: None,
        gpu_type: None,
    }
}

/// `c5` costs 2.0/h and `t3` 0.5/h on aws.
pub fn catalog() -> NodeTypeCatalog {
    let mut catalog = NodeTypeCatalog::default();
    catalog.insert(Vendor::Aws, "c5", spec("c5.xlarge", 2.0));
    catalog.insert(Vendor::Aws, "t3", spec("t3.medium", 0.5));
    catalog
}

pub fn config() -> Config {
    let mut config = Config::from_vars(|key| match key {
        "SKYWAY_VENDOR_MOCK" => Some("1".to_string()),
        "SKYWAY_SCHEDULER" => Some("memory".to_string()),
        _ => None,
    })
    .unwrap();

    let fast = RetryPolicy {
        max_attempts: 2,
        backoff: BackoffPolicy::immediate(),
    };
    config.controller.vendor_retry = fast.clone();
    config.controller.connect_timeout = Duration::from_millis(200);
    config.sync.retry = fast;
    config.sync.timeout = Duration::from_secs(5);
    config.supervisor.backoff = BackoffPolicy::immediate();
    config.supervisor.stop_timeout = Duration::from_millis(200);
    config
}

pub fn harness() -> Harness {
    harness_with(config())
}

pub fn harness_with(config: Config) -> Harness {
    let vendor = Arc::new(MockVendor::new());
    let scheduler = Arc::new(MemoryScheduler::new());
    let state = AppState::from_parts(
        Arc::new(StateStore::open_in_memory().unwrap()),
        Arc::new(catalog()),
        vendor.clone(),
        scheduler.clone(),
        config,
    );
    Harness {
        state,
        vendor,
        scheduler,
    }
}

pub fn new_account(name: &str) -> NewAccount {
    NewAccount {
        name: name.to_string(),
        owner: "pi-lab".to_string(),
        vendor: Vendor::Aws,
        vendor_account_id: "123456789012".to_string(),
        endpoints: BTreeMap::new(),
        protected_nodes: BTreeSet::new(),
    }
}

/// Create an account with a budget period that began yesterday.
pub fn funded_account(h: &Harness, name: &str, amount: f64, max_rate: f64) {
    h.state.accounts.create(new_account(name)).unwrap();
    let start = chrono::Utc::now().date_naive().pred_opt().unwrap();
    h.state.enforcer.create(name, start, amount, max_rate).unwrap();
}

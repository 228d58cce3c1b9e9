mod common;

use std::time::Duration;

use chrono::Utc;
use skyway_control_plane::{
    controller::{DenyPolicy, RemoveOutcome},
    error::ErrorKind,
    store::NodeStatus,
    vendor::{InstanceState, VendorInstance},
};

use common::{config, funded_account, harness, harness_with};

const ACCOUNT: &str = "rcc-aws";

fn instance(id: &str, name: &str, launched_at: i64) -> VendorInstance {
    VendorInstance {
        instance_id: id.to_string(),
        name: name.to_string(),
        shape: "c5.xlarge".to_string(),
        ip: Some("10.0.0.7".to_string()),
        launched_at,
        state: InstanceState::Running,
    }
}

#[tokio::test]
async fn provision_then_remove_closes_journal_once() {
    let h = harness();
    funded_account(&h, ACCOUNT, 100.0, 10.0);
    let controller = &h.state.controller;

    let node = controller.provision(ACCOUNT, "c5").await.unwrap();
    assert_eq!(node.hostname, "rcc-aws-c5-001");
    assert_eq!(node.status, NodeStatus::Ready);
    assert!(node.instance_id.is_some());
    assert_eq!(h.vendor.instances(ACCOUNT).len(), 1);

    assert_eq!(
        controller.remove(ACCOUNT, &node.hostname).await.unwrap(),
        RemoveOutcome::Accepted
    );
    assert_eq!(
        controller.remove(ACCOUNT, &node.hostname).await.unwrap(),
        RemoveOutcome::AlreadyDraining
    );

    // No jobs on the node, so the drain completes on the next pass.
    let stats = controller.reconcile_account(ACCOUNT).await.unwrap();
    assert_eq!(stats.terminated, 1);
    assert!(controller.list(ACCOUNT).unwrap().is_empty());
    assert!(h.vendor.instances(ACCOUNT).is_empty());
    assert_eq!(h.vendor.terminate_count(), 1);

    let err = controller.remove(ACCOUNT, &node.hostname).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    // Another pass changes nothing.
    let stats = controller.reconcile_account(ACCOUNT).await.unwrap();
    assert!(!stats.changed());

    let journal = h.state.store.list_journal(ACCOUNT).unwrap();
    assert_eq!(journal.len(), 1);
    assert!(!journal[0].is_open());
}

#[tokio::test]
async fn remove_by_instance_id() {
    let h = harness();
    funded_account(&h, ACCOUNT, 100.0, 10.0);

    let node = h.state.controller.provision(ACCOUNT, "t3").await.unwrap();
    let instance_id = node.instance_id.clone().unwrap();

    assert_eq!(
        h.state.controller.remove(ACCOUNT, &instance_id).await.unwrap(),
        RemoveOutcome::Accepted
    );
    let listed = h.state.controller.list(ACCOUNT).unwrap();
    assert_eq!(listed[0].status, NodeStatus::Draining);
}

#[tokio::test]
async fn drain_waits_for_running_jobs() {
    let h = harness();
    funded_account(&h, ACCOUNT, 100.0, 10.0);
    let controller = &h.state.controller;

    let node = controller.provision(ACCOUNT, "t3").await.unwrap();
    h.scheduler.set_active_jobs(&node.hostname, 2);
    controller.remove(ACCOUNT, &node.hostname).await.unwrap();

    let stats = controller.reconcile_account(ACCOUNT).await.unwrap();
    assert_eq!(stats.terminated, 0);
    assert_eq!(controller.list(ACCOUNT).unwrap().len(), 1);

    h.scheduler.set_active_jobs(&node.hostname, 0);
    let stats = controller.reconcile_account(ACCOUNT).await.unwrap();
    assert_eq!(stats.terminated, 1);
}

#[tokio::test]
async fn concurrent_provisioning_admits_one() {
    let h = harness();
    // One c5 (2.0/h) fits an hour of headroom, two do not.
    funded_account(&h, ACCOUNT, 2.5, 10.0);

    let a = h.state.controller.clone();
    let b = h.state.controller.clone();
    let (first, second) = tokio::join!(
        async move { a.provision(ACCOUNT, "c5").await },
        async move { b.provision(ACCOUNT, "c5").await },
    );

    let results = [first, second];
    let admitted = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(admitted, 1);
    let denied = results.iter().find_map(|r| r.as_ref().err()).unwrap();
    assert_eq!(denied.kind(), ErrorKind::BudgetExceeded);

    assert_eq!(h.state.controller.list(ACCOUNT).unwrap().len(), 1);
    assert_eq!(h.vendor.create_count(), 1);
}

#[tokio::test]
async fn abandoned_launch_fails_after_timeout() {
    let mut config = config();
    config.controller.provision_timeout = Duration::ZERO;
    let h = harness_with(config);
    funded_account(&h, ACCOUNT, 1000.0, 10.0);
    h.vendor.set_create_delay(Duration::from_secs(3600));
    let later = Utc::now().timestamp() + 100_000;

    let controller = h.state.controller.clone();
    let launch = tokio::spawn(async move { controller.provision(ACCOUNT, "c5").await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The launch is still running, so its row is left alone.
    let stats = h.state.controller.reconcile_account_at(ACCOUNT, later).await.unwrap();
    assert_eq!(stats.timed_out, 0);
    let nodes = h.state.controller.list(ACCOUNT).unwrap();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].status, NodeStatus::Provisioning);

    // Dropping the launch (a halted worker) releases the row.
    launch.abort();
    assert!(launch.await.unwrap_err().is_cancelled());

    let stats = h.state.controller.reconcile_account_at(ACCOUNT, later).await.unwrap();
    assert_eq!(stats.timed_out, 1);
    assert!(h.state.controller.list(ACCOUNT).unwrap().is_empty());
    assert_eq!(h.vendor.create_count(), 0);

    let journal = h.state.store.list_journal(ACCOUNT).unwrap();
    assert_eq!(journal.len(), 1);
    assert!(!journal[0].is_open());
    assert!(journal[0].note.as_deref().unwrap().starts_with("failed"));
}

#[tokio::test]
async fn retried_launch_adopts_instance_from_lost_response() {
    let h = harness();
    funded_account(&h, ACCOUNT, 100.0, 10.0);
    let controller = &h.state.controller;
    h.vendor.lose_next_create_responses(1);

    let node = controller.provision(ACCOUNT, "c5").await.unwrap();
    assert_eq!(h.vendor.create_count(), 1);
    let instances = h.vendor.instances(ACCOUNT);
    assert_eq!(instances.len(), 1);
    assert_eq!(node.instance_id.as_deref(), Some(instances[0].instance_id.as_str()));

    controller.remove(ACCOUNT, &node.hostname).await.unwrap();
    for _ in 0..3 {
        controller.reconcile_account(ACCOUNT).await.unwrap();
    }

    // Nothing is left running and nothing comes back as an orphan.
    assert!(h.vendor.instances(ACCOUNT).is_empty());
    assert!(controller.list(ACCOUNT).unwrap().is_empty());
    let journal = h.state.store.list_journal(ACCOUNT).unwrap();
    assert_eq!(journal.len(), 1);
    assert!(!journal[0].is_open());
}

#[tokio::test]
async fn duplicate_instance_is_terminated() {
    let h = harness();
    funded_account(&h, ACCOUNT, 100.0, 10.0);
    let controller = &h.state.controller;
    let now = Utc::now().timestamp();

    let node = controller.provision(ACCOUNT, "c5").await.unwrap();
    h.vendor
        .insert_instance(ACCOUNT, instance("i-extra", &node.hostname, now - 60));

    let stats = controller.reconcile_account(ACCOUNT).await.unwrap();
    assert_eq!(stats.duplicates, 1);
    assert_eq!(stats.stale_terminated, 1);

    let left = h.vendor.instances(ACCOUNT);
    assert_eq!(left.len(), 1);
    assert_eq!(Some(left[0].instance_id.clone()), node.instance_id);

    let nodes = controller.list(ACCOUNT).unwrap();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].instance_id, node.instance_id);
}

#[tokio::test]
async fn drift_reports_without_changing_anything() {
    let h = harness();
    funded_account(&h, ACCOUNT, 100.0, 10.0);
    let controller = &h.state.controller;
    let now = Utc::now().timestamp();

    let node = controller.provision(ACCOUNT, "t3").await.unwrap();
    h.vendor
        .remove_instance(ACCOUNT, node.instance_id.as_deref().unwrap());
    h.vendor
        .insert_instance(ACCOUNT, instance("i-orphan", "rcc-aws-c5-007", now - 7200));

    let drift = controller.drift(ACCOUNT).await.unwrap();
    assert!(!drift.is_empty());
    assert_eq!(drift.store_only, vec![node.hostname.clone()]);
    assert_eq!(drift.vendor_only.len(), 1);
    assert_eq!(drift.vendor_only[0].instance_id, "i-orphan");
    assert!(drift.duplicates.is_empty());

    // The orphan was not imported and the vanished node was not archived.
    let nodes = controller.list(ACCOUNT).unwrap();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].hostname, node.hostname);
    assert_eq!(h.vendor.instances(ACCOUNT).len(), 1);
    assert_eq!(h.state.store.list_journal(ACCOUNT).unwrap().len(), 1);
}

#[tokio::test]
async fn inactive_account_is_denied() {
    let h = harness();
    funded_account(&h, ACCOUNT, 100.0, 10.0);
    h.state.accounts.set_active(ACCOUNT, false).unwrap();

    let err = h.state.controller.provision(ACCOUNT, "c5").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BudgetExceeded);
    assert_eq!(h.vendor.create_count(), 0);
}

#[tokio::test]
async fn unknown_node_type_is_invalid() {
    let h = harness();
    funded_account(&h, ACCOUNT, 100.0, 10.0);

    let err = h.state.controller.provision(ACCOUNT, "p4d").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    let err = h.state.controller.submit(ACCOUNT, "p4d", 1).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn failed_launch_is_archived() {
    let h = harness();
    funded_account(&h, ACCOUNT, 100.0, 10.0);
    h.vendor.fail_next_creates(5);

    let err = h.state.controller.provision(ACCOUNT, "c5").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connectivity);
    assert!(h.state.controller.list(ACCOUNT).unwrap().is_empty());

    let journal = h.state.store.list_journal(ACCOUNT).unwrap();
    assert_eq!(journal.len(), 1);
    assert!(!journal[0].is_open());
}

#[tokio::test]
async fn orphan_is_imported_and_vanished_node_archived() {
    let h = harness();
    funded_account(&h, ACCOUNT, 100.0, 10.0);
    let controller = &h.state.controller;
    let now = Utc::now().timestamp();

    h.vendor
        .insert_instance(ACCOUNT, instance("i-orphan", "rcc-aws-c5-007", now - 600));
    let stats = controller.reconcile_account(ACCOUNT).await.unwrap();
    assert_eq!(stats.imported, 1);

    let nodes = controller.list(ACCOUNT).unwrap();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].hostname, "rcc-aws-c5-007");
    assert_eq!(nodes[0].status, NodeStatus::Ready);
    assert_eq!(nodes[0].started_at, now - 600);

    let journal = h.state.store.list_journal(ACCOUNT).unwrap();
    assert_eq!(journal[0].note.as_deref(), Some("orphan"));

    h.vendor.remove_instance(ACCOUNT, "i-orphan");
    let stats = controller.reconcile_account(ACCOUNT).await.unwrap();
    assert_eq!(stats.vanished, 1);
    assert!(controller.list(ACCOUNT).unwrap().is_empty());

    let journal = h.state.store.list_journal(ACCOUNT).unwrap();
    assert_eq!(journal.len(), 1);
    assert!(!journal[0].is_open());
}

#[tokio::test]
async fn stale_unrecognized_instance_is_terminated() {
    let h = harness();
    let mut account = common::new_account(ACCOUNT);
    account.protected_nodes.insert("login".to_string());
    h.state.accounts.create(account).unwrap();
    let now = Utc::now().timestamp();

    h.vendor.insert_instance(ACCOUNT, instance("i-stray", "someone-else", now - 7200));
    h.vendor.insert_instance(ACCOUNT, instance("i-fresh", "just-booted", now));
    h.vendor.insert_instance(ACCOUNT, instance("i-login", "login", now - 7200));

    let stats = h.state.controller.reconcile_account(ACCOUNT).await.unwrap();
    assert_eq!(stats.stale_terminated, 1);
    assert_eq!(stats.imported, 0);

    let left: Vec<String> = h
        .vendor
        .instances(ACCOUNT)
        .into_iter()
        .map(|i| i.instance_id)
        .collect();
    assert_eq!(left, vec!["i-fresh".to_string(), "i-login".to_string()]);
    assert!(h.state.controller.list(ACCOUNT).unwrap().is_empty());
}

#[tokio::test]
async fn overrun_evicts_newest_node() {
    let mut config = config();
    config.enforcer.overage_allowance = 1.0;
    config.enforcer.eviction_horizon = Duration::from_secs(3600);
    let h = harness_with(config);
    funded_account(&h, ACCOUNT, 3.0, 10.0);
    let controller = &h.state.controller;
    let now = Utc::now().timestamp();

    h.vendor
        .insert_instance(ACCOUNT, instance("i-older", "rcc-aws-t3-001", now - 7200));
    h.vendor
        .insert_instance(ACCOUNT, instance("i-newer", "rcc-aws-t3-002", now - 3600));
    let stats = controller.reconcile_account_at(ACCOUNT, now).await.unwrap();
    assert_eq!(stats.imported, 2);
    assert_eq!(stats.evicted, 0);

    // Two hours on: spend 3.5 over a total of 3.0. Keeping both projects
    // 4.5 against a limit of 4.0; dropping the newer node is enough.
    let stats = controller
        .reconcile_account_at(ACCOUNT, now + 2 * 3600)
        .await
        .unwrap();
    assert_eq!(stats.evicted, 1);
    assert_eq!(stats.terminated, 1);

    let remaining: Vec<String> = controller
        .list(ACCOUNT)
        .unwrap()
        .into_iter()
        .map(|n| n.hostname)
        .collect();
    assert_eq!(remaining, vec!["rcc-aws-t3-001".to_string()]);
    assert_eq!(h.vendor.instances(ACCOUNT).len(), 1);
}

#[tokio::test]
async fn queued_request_requeues_then_admits() {
    let h = harness();
    funded_account(&h, ACCOUNT, 2.5, 10.0);
    let controller = &h.state.controller;

    controller.submit(ACCOUNT, "c5", 2).unwrap();
    let stats = controller.reconcile_account(ACCOUNT).await.unwrap();
    assert_eq!(stats.admitted, 1);
    assert_eq!(stats.denied, 1);

    let requests = h.state.store.list_requests(ACCOUNT).unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].count, 1);
    assert_eq!(requests[0].attempts, 1);
    assert!(requests[0]
        .last_reason
        .as_deref()
        .unwrap()
        .starts_with("budget-exceeded"));

    // More money: the remaining node is admitted on the next pass.
    h.state
        .enforcer
        .set(ACCOUNT, "amount".parse().unwrap(), 10.0)
        .unwrap();
    let stats = controller.reconcile_account(ACCOUNT).await.unwrap();
    assert_eq!(stats.admitted, 1);
    assert!(h.state.store.list_requests(ACCOUNT).unwrap().is_empty());
    assert_eq!(controller.list(ACCOUNT).unwrap().len(), 2);
}

#[tokio::test]
async fn reject_policy_drops_denied_request() {
    let mut config = config();
    config.controller.deny_policy = DenyPolicy::Reject;
    let h = harness_with(config);
    funded_account(&h, ACCOUNT, 1.0, 10.0);

    h.state.controller.submit(ACCOUNT, "c5", 1).unwrap();
    let stats = h.state.controller.reconcile_account(ACCOUNT).await.unwrap();
    assert_eq!(stats.denied, 1);
    assert_eq!(stats.rejected, 1);
    assert!(h.state.store.list_requests(ACCOUNT).unwrap().is_empty());
    assert_eq!(h.vendor.create_count(), 0);
}

#[tokio::test]
async fn unreachable_vendor_is_connectivity_error() {
    let h = harness();
    funded_account(&h, ACCOUNT, 100.0, 10.0);
    h.vendor.set_unreachable(true);

    let err = h.state.controller.reconcile_account(ACCOUNT).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connectivity);

    let report = h.state.controller.test(ACCOUNT).await.unwrap();
    assert!(!report.passed);
}

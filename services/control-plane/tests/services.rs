mod common;

use std::time::Duration;

use skyway_control_plane::{
    association::Association,
    error::ErrorKind,
    state::{controller_unit, ASSOCIATION_SYNC_UNIT, BILLING_UNIT},
    store::{DesiredState, ObservedState, UnitKind},
};

use common::{funded_account, harness};

async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[tokio::test]
async fn crashed_billing_unit_is_restarted() {
    let h = harness();
    let supervisor = h.state.supervisor();

    supervisor.register("billing", &UnitKind::Billing).unwrap();
    supervisor.check_health().await.unwrap();

    let status = supervisor.status_of("billing").unwrap();
    assert_eq!(status.observed, ObservedState::Running);
    assert!(status.uptime_secs.is_some());

    supervisor.abort_unit("billing").await.unwrap();
    settle().await;
    supervisor.check_health().await.unwrap();

    let status = supervisor.status_of("billing").unwrap();
    assert_eq!(status.observed, ObservedState::Running);
    assert_eq!(status.restart_count, 1);
}

#[tokio::test]
async fn default_units_cover_every_account() {
    let h = harness();
    funded_account(&h, "rcc-aws", 100.0, 10.0);
    funded_account(&h, "lab-aws", 100.0, 10.0);

    let added = h.state.register_default_units().unwrap();
    assert_eq!(added.len(), 4);
    assert!(added.contains(&BILLING_UNIT.to_string()));
    assert!(added.contains(&ASSOCIATION_SYNC_UNIT.to_string()));
    assert!(added.contains(&controller_unit("rcc-aws")));

    // Registering again adds nothing.
    assert!(h.state.register_default_units().unwrap().is_empty());

    let supervisor = h.state.supervisor();
    supervisor.check_health().await.unwrap();
    for status in supervisor.status().unwrap() {
        assert_eq!(status.observed, ObservedState::Running, "{}", status.name);
    }

    supervisor.stop(&controller_unit("lab-aws")).await.unwrap();
    let status = supervisor.status_of(&controller_unit("lab-aws")).unwrap();
    assert_eq!(status.desired, DesiredState::Stopped);
    assert_eq!(status.observed, ObservedState::Stopped);
}

#[tokio::test]
async fn desired_state_written_by_operator_is_applied() {
    let h = harness();
    let supervisor = h.state.supervisor();
    supervisor
        .register(ASSOCIATION_SYNC_UNIT, &UnitKind::AssociationSync)
        .unwrap();
    supervisor.check_health().await.unwrap();

    // The CLI only writes the store.
    h.state.units.stop(ASSOCIATION_SYNC_UNIT).unwrap();
    supervisor.check_health().await.unwrap();
    assert_eq!(
        supervisor.status_of(ASSOCIATION_SYNC_UNIT).unwrap().observed,
        ObservedState::Stopped
    );

    h.state.units.start(ASSOCIATION_SYNC_UNIT).unwrap();
    supervisor.check_health().await.unwrap();
    assert_eq!(
        supervisor.status_of(ASSOCIATION_SYNC_UNIT).unwrap().observed,
        ObservedState::Running
    );

    let err = h.state.units.start("nope").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn membership_sync_converges() {
    let h = harness();
    funded_account(&h, "rcc-aws", 100.0, 10.0);
    h.state.accounts.add_member("rcc-aws", "alice").unwrap();
    h.state.accounts.add_member("rcc-aws", "bob").unwrap();

    let report = h.state.sync.update().await.unwrap();
    assert_eq!(report.applied.len(), 1);
    assert!(h
        .scheduler
        .snapshot()
        .contains(&Association::new("rcc-aws", "alice")));

    let report = h.state.sync.update().await.unwrap();
    assert!(report.is_empty_delta());

    h.state.accounts.set_active("rcc-aws", false).unwrap();
    let report = h.state.sync.update().await.unwrap();
    assert_eq!(report.applied[0].revocations.len(), 2);
    assert!(h.scheduler.snapshot().is_empty());
}

#[tokio::test]
async fn spend_summary_tracks_nodes() {
    let h = harness();
    funded_account(&h, "rcc-aws", 100.0, 1.5);

    // c5 lists at 2.0/h; the cap bills it at 1.5/h.
    let node = h.state.controller.provision("rcc-aws", "c5").await.unwrap();
    assert_eq!(node.rate, 1.5);

    let summary = h.state.enforcer.summary("rcc-aws").unwrap();
    assert_eq!(summary.live_nodes, 1);
    assert_eq!(summary.current_rate, 1.5);
    assert!(summary.remaining <= 100.0);

    let usage = h.state.enforcer.usage_by_type("rcc-aws").unwrap();
    assert!(usage.contains_key("c5"));
}

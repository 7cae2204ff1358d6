// tests/integration/stopper_test.rs

//! Integration tests for the Stopper: sequenced stops, the STOPPING wait and
//! stop failures leaving the plan alone.

use super::test_helpers::{
    MapRules, TestCluster, TestStopper, inventory_entry, process_event,
};
use fleetd::core::commander::Commander;
use fleetd::core::process::{ProcessRules, ProcessState};
use fleetd::core::remote::DispatchRequest;

const LOCAL: &str = "10.0.0.1:7777";
const PEER_B: &str = "10.0.0.2:7777";
const PEER_C: &str = "10.0.0.3:7777";

fn stopped_namespecs(requests: &[DispatchRequest]) -> Vec<(String, String)> {
    requests
        .iter()
        .filter_map(|request| match request {
            DispatchRequest::StopProcess { address, namespec } => {
                Some((address.clone(), namespec.clone()))
            }
            _ => None,
        })
        .collect()
}

fn sequenced_rules() -> MapRules {
    let mut rules = MapRules::default();
    for (namespec, rank) in [("app1:p1", 1), ("app1:p2", 2)] {
        rules.programs.insert(
            namespec.to_string(),
            ProcessRules {
                stop_sequence: rank,
                ..Default::default()
            },
        );
    }
    rules
}

#[tokio::test]
async fn test_stop_application_walks_the_stop_sequence() {
    let mut cluster = TestCluster::new(&[LOCAL, PEER_B], LOCAL, false, sequenced_rules());
    cluster.requester.set_inventory(
        PEER_B,
        vec![
            inventory_entry("app1", "p1", ProcessState::Running),
            inventory_entry("app1", "p2", ProcessState::Running),
        ],
    );
    cluster.clock.set(100);
    cluster.ctx.on_tick(PEER_B, 100).await.unwrap();
    let mut stopper = TestStopper::new(cluster.clock.clone());

    let done = stopper.stopper.stop_application(&mut cluster.ctx, "app1");
    assert!(!done);
    assert_eq!(
        stopped_namespecs(&stopper.drain_dispatch()),
        vec![(PEER_B.to_string(), "app1:p1".to_string())]
    );

    // STOPPING does not terminate: the stopper keeps waiting.
    let event = process_event(PEER_B, "app1", "p1", ProcessState::Stopping);
    let namespec = cluster.ctx.on_process_event(&event).unwrap();
    stopper.stopper.on_event(&mut cluster.ctx, &namespec);
    assert!(stopper.drain_dispatch().is_empty());
    assert!(stopper.stopper.in_progress());

    // STOPPED releases the barrier and rank 2 follows.
    let event = process_event(PEER_B, "app1", "p1", ProcessState::Stopped);
    let namespec = cluster.ctx.on_process_event(&event).unwrap();
    stopper.stopper.on_event(&mut cluster.ctx, &namespec);
    assert_eq!(
        stopped_namespecs(&stopper.drain_dispatch()),
        vec![(PEER_B.to_string(), "app1:p2".to_string())]
    );

    let event = process_event(PEER_B, "app1", "p2", ProcessState::Stopped);
    let namespec = cluster.ctx.on_process_event(&event).unwrap();
    stopper.stopper.on_event(&mut cluster.ctx, &namespec);
    assert!(!stopper.stopper.in_progress());
}

#[tokio::test]
async fn test_stop_process_targets_every_running_address() {
    let mut cluster = TestCluster::new(&[LOCAL, PEER_B, PEER_C], LOCAL, false, MapRules::default());
    cluster.requester.set_inventory(
        PEER_B,
        vec![inventory_entry("app1", "p1", ProcessState::Running)],
    );
    cluster.requester.set_inventory(
        PEER_C,
        vec![inventory_entry("app1", "p1", ProcessState::Running)],
    );
    cluster.clock.set(100);
    cluster.ctx.on_tick(PEER_B, 100).await.unwrap();
    cluster.ctx.on_tick(PEER_C, 100).await.unwrap();
    let mut stopper = TestStopper::new(cluster.clock.clone());

    let done = stopper.stopper.stop_process(&mut cluster.ctx, "app1:p1");
    assert!(!done);

    let mut targets = stopped_namespecs(&stopper.drain_dispatch());
    targets.sort();
    assert_eq!(
        targets,
        vec![
            (PEER_B.to_string(), "app1:p1".to_string()),
            (PEER_C.to_string(), "app1:p1".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_stop_already_stopped_process_is_done() {
    let mut cluster = TestCluster::new(&[LOCAL, PEER_B], LOCAL, false, MapRules::default());
    cluster.requester.set_inventory(
        PEER_B,
        vec![inventory_entry("app1", "p1", ProcessState::Stopped)],
    );
    cluster.clock.set(100);
    cluster.ctx.on_tick(PEER_B, 100).await.unwrap();
    let mut stopper = TestStopper::new(cluster.clock.clone());

    let done = stopper.stopper.stop_process(&mut cluster.ctx, "app1:p1");
    assert!(done);
    assert!(stopper.drain_dispatch().is_empty());
}

#[tokio::test]
async fn test_stop_timeout_forces_unknown_and_keeps_plan_shape() {
    let mut cluster = TestCluster::new(&[LOCAL, PEER_B], LOCAL, false, MapRules::default());
    cluster.requester.set_inventory(
        PEER_B,
        vec![inventory_entry("app1", "p1", ProcessState::Running)],
    );
    cluster.clock.set(100);
    cluster.ctx.on_tick(PEER_B, 100).await.unwrap();
    let mut stopper = TestStopper::new(cluster.clock.clone());

    cluster.clock.set(200);
    stopper.stopper.stop_process(&mut cluster.ctx, "app1:p1");
    stopper.drain_dispatch();

    cluster.clock.set(206);
    assert!(!stopper.stopper.check_progress(&mut cluster.ctx));

    let process = cluster.ctx.process("app1:p1").unwrap();
    assert_eq!(process.state(), ProcessState::Unknown);
    assert_eq!(
        process.spawnerr,
        "Still running 5 seconds after stop request"
    );

    // The synthetic event releases the in-flight entry; stop failures never
    // abort anything else.
    for namespec in cluster.ctx.take_forced_events() {
        stopper.stopper.on_event(&mut cluster.ctx, &namespec);
    }
    assert!(!stopper.stopper.in_progress());
}

#[tokio::test]
async fn test_stop_applications_enqueues_every_live_application() {
    let mut rules = MapRules::default();
    rules.applications.insert(
        "app1".to_string(),
        fleetd::core::application::ApplicationRules {
            stop_sequence: 2,
            ..Default::default()
        },
    );
    rules.applications.insert(
        "app2".to_string(),
        fleetd::core::application::ApplicationRules {
            stop_sequence: 1,
            ..Default::default()
        },
    );
    let mut cluster = TestCluster::new(&[LOCAL, PEER_B], LOCAL, false, rules);
    cluster.requester.set_inventory(
        PEER_B,
        vec![
            inventory_entry("app1", "p1", ProcessState::Running),
            inventory_entry("app2", "q1", ProcessState::Running),
            inventory_entry("app3", "r1", ProcessState::Stopped),
        ],
    );
    cluster.clock.set(100);
    cluster.ctx.on_tick(PEER_B, 100).await.unwrap();
    let mut stopper = TestStopper::new(cluster.clock.clone());

    stopper.stopper.stop_applications(&mut cluster.ctx);

    // app2 has the lower stop rank and goes first; app3 is already stopped
    // and was never enqueued.
    assert_eq!(
        stopped_namespecs(&stopper.drain_dispatch()),
        vec![(PEER_B.to_string(), "app2:q1".to_string())]
    );
    let event = process_event(PEER_B, "app2", "q1", ProcessState::Stopped);
    let namespec = cluster.ctx.on_process_event(&event).unwrap();
    stopper.stopper.on_event(&mut cluster.ctx, &namespec);
    assert_eq!(
        stopped_namespecs(&stopper.drain_dispatch()),
        vec![(PEER_B.to_string(), "app1:p1".to_string())]
    );
}

// tests/integration/starter_test.rs

//! Integration tests for the Starter: sequenced starts, barriers, placement
//! failures, failure strategies and command timeouts.

use super::test_helpers::{
    MapRules, TestCluster, TestStarter, inventory_entry, process_event,
};
use fleetd::core::application::{ApplicationRules, StartingFailureStrategy};
use fleetd::core::commander::Commander;
use fleetd::core::placement::PlacementStrategy;
use fleetd::core::process::{ProcessRules, ProcessState};
use fleetd::core::remote::DispatchRequest;

const LOCAL: &str = "10.0.0.1:7777";
const PEER_B: &str = "10.0.0.2:7777";

fn sequenced_rules() -> MapRules {
    let mut rules = MapRules::default();
    for (namespec, rank) in [("app1:p1", 1), ("app1:p2", 1), ("app1:p3", 2)] {
        rules.programs.insert(
            namespec.to_string(),
            ProcessRules {
                start_sequence: rank,
                ..Default::default()
            },
        );
    }
    rules
}

/// Brings one address up with the given inventory so placement has a target.
async fn prepare(cluster: &mut TestCluster, peer: &str, inventory: Vec<(&str, &str)>) {
    let entries = inventory
        .into_iter()
        .map(|(group, name)| inventory_entry(group, name, ProcessState::Stopped))
        .collect();
    cluster.requester.set_inventory(peer, entries);
    cluster.clock.set(100);
    cluster.ctx.on_tick(peer, 100).await.unwrap();
}

fn started_namespecs(requests: &[DispatchRequest]) -> Vec<String> {
    requests
        .iter()
        .filter_map(|request| match request {
            DispatchRequest::StartProcess { namespec, .. } => Some(namespec.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_start_sequence_respects_inner_rank_barrier() {
    let mut cluster = TestCluster::new(&[LOCAL, PEER_B], LOCAL, false, sequenced_rules());
    prepare(
        &mut cluster,
        PEER_B,
        vec![("app1", "p1"), ("app1", "p2"), ("app1", "p3")],
    )
    .await;
    let mut starter = TestStarter::new(cluster.clock.clone());

    let done =
        starter
            .starter
            .start_application(&mut cluster.ctx, PlacementStrategy::Config, "app1");
    assert!(!done);

    // Rank 1 dispatches p1 and p2 (any order), but not p3.
    let mut first_batch = started_namespecs(&starter.drain_dispatch());
    first_batch.sort();
    assert_eq!(first_batch, vec!["app1:p1", "app1:p2"]);

    // p1 running alone does not release the barrier.
    let event = process_event(PEER_B, "app1", "p1", ProcessState::Running);
    let namespec = cluster.ctx.on_process_event(&event).unwrap();
    starter.starter.on_event(&mut cluster.ctx, &namespec);
    assert!(starter.drain_dispatch().is_empty());

    // Both running: rank 2 follows.
    let event = process_event(PEER_B, "app1", "p2", ProcessState::Running);
    let namespec = cluster.ctx.on_process_event(&event).unwrap();
    starter.starter.on_event(&mut cluster.ctx, &namespec);
    assert_eq!(
        started_namespecs(&starter.drain_dispatch()),
        vec!["app1:p3"]
    );

    // p3 running drains the whole plan.
    let event = process_event(PEER_B, "app1", "p3", ProcessState::Running);
    let namespec = cluster.ctx.on_process_event(&event).unwrap();
    starter.starter.on_event(&mut cluster.ctx, &namespec);
    assert!(!starter.starter.in_progress());
}

#[tokio::test]
async fn test_start_application_already_running_is_done() {
    let mut cluster = TestCluster::new(&[LOCAL, PEER_B], LOCAL, false, MapRules::default());
    cluster.requester.set_inventory(
        PEER_B,
        vec![inventory_entry("app1", "p1", ProcessState::Running)],
    );
    cluster.clock.set(100);
    cluster.ctx.on_tick(PEER_B, 100).await.unwrap();
    let mut starter = TestStarter::new(cluster.clock.clone());

    let done =
        starter
            .starter
            .start_application(&mut cluster.ctx, PlacementStrategy::Config, "app1");
    assert!(done);
    assert!(starter.drain_dispatch().is_empty());
}

#[tokio::test]
async fn test_placement_failure_forces_fatal() {
    // No address ever ticks: there is nowhere to place the process.
    let mut rules = MapRules::default();
    rules.programs.insert(
        "app1:p1".to_string(),
        ProcessRules {
            required: false,
            ..Default::default()
        },
    );
    let mut cluster = TestCluster::new(&[LOCAL, PEER_B], LOCAL, false, rules);
    prepare(&mut cluster, PEER_B, vec![("app1", "p1")]).await;
    // Silence the only running address so the load snapshot is empty.
    cluster.clock.set(120);
    cluster.ctx.on_timer();
    let mut starter = TestStarter::new(cluster.clock.clone());

    let done = starter.starter.start_process(
        &mut cluster.ctx,
        PlacementStrategy::LessLoaded,
        "app1:p1",
        "",
    );
    assert!(done);
    assert!(starter.drain_dispatch().is_empty());

    // The fallback arm of the forced failure applied FATAL in-process.
    let process = cluster.ctx.process("app1:p1").unwrap();
    assert_eq!(process.state(), ProcessState::Fatal);
    assert_eq!(process.spawnerr, "no resource available");
}

fn two_application_plan(starter: &mut TestStarter) {
    // planned_jobs = {app2: {0: [pA]}, app3: {1: [pB]}}
    let plan = starter.starter.plan_mut();
    plan.planned_jobs
        .entry("app2".to_string())
        .or_default()
        .entry(0)
        .or_default()
        .push("app2:pA".to_string());
    plan.planned_jobs
        .entry("app3".to_string())
        .or_default()
        .entry(1)
        .or_default()
        .push("app3:pB".to_string());
}

async fn failure_strategy_cluster(strategy: StartingFailureStrategy) -> TestCluster {
    let mut rules = MapRules::default();
    rules.applications.insert(
        "app2".to_string(),
        ApplicationRules {
            starting_failure_strategy: strategy,
            ..Default::default()
        },
    );
    rules.programs.insert(
        "app2:pA".to_string(),
        ProcessRules {
            required: true,
            ..Default::default()
        },
    );
    let mut cluster = TestCluster::new(&[LOCAL, PEER_B], LOCAL, false, rules);
    prepare(
        &mut cluster,
        PEER_B,
        vec![("app2", "pA"), ("app3", "pB")],
    )
    .await;
    cluster
}

#[tokio::test]
async fn test_abort_starting_failure_drops_the_application() {
    let mut cluster = failure_strategy_cluster(StartingFailureStrategy::Abort).await;
    let mut starter = TestStarter::new(cluster.clock.clone());
    two_application_plan(&mut starter);

    starter
        .starter
        .process_failure(&mut cluster.ctx, "app2:pA", "boom", false);

    let plan = starter.starter.plan();
    assert!(!plan.planned_jobs.contains_key("app2"));
    assert!(plan.planned_jobs.contains_key("app3"));
    assert_eq!(plan.planned_jobs["app3"][&1], vec!["app3:pB".to_string()]);
    // The Stopper was not involved.
    assert!(starter.drain_stop_requests().is_empty());
}

#[tokio::test]
async fn test_stop_starting_failure_requests_application_stop() {
    let mut cluster = failure_strategy_cluster(StartingFailureStrategy::Stop).await;
    let mut starter = TestStarter::new(cluster.clock.clone());
    two_application_plan(&mut starter);

    starter
        .starter
        .process_failure(&mut cluster.ctx, "app2:pA", "boom", false);

    let plan = starter.starter.plan();
    assert!(!plan.planned_jobs.contains_key("app2"));
    assert!(plan.planned_jobs.contains_key("app3"));
    assert_eq!(starter.drain_stop_requests(), vec!["app2".to_string()]);
}

#[tokio::test]
async fn test_continue_starting_failure_keeps_the_plan() {
    let mut cluster = failure_strategy_cluster(StartingFailureStrategy::Continue).await;
    let mut starter = TestStarter::new(cluster.clock.clone());
    two_application_plan(&mut starter);

    starter
        .starter
        .process_failure(&mut cluster.ctx, "app2:pA", "boom", false);

    let plan = starter.starter.plan();
    assert!(plan.planned_jobs.contains_key("app2"));
    assert!(plan.planned_jobs.contains_key("app3"));
    assert!(starter.drain_stop_requests().is_empty());
}

#[tokio::test]
async fn test_optional_process_failure_never_touches_the_plan() {
    let mut cluster = failure_strategy_cluster(StartingFailureStrategy::Abort).await;
    let mut starter = TestStarter::new(cluster.clock.clone());
    two_application_plan(&mut starter);

    // pB is optional: whatever the application strategy, the plan survives.
    starter
        .starter
        .process_failure(&mut cluster.ctx, "app3:pB", "boom", false);

    let plan = starter.starter.plan();
    assert!(plan.planned_jobs.contains_key("app2"));
    assert!(plan.planned_jobs.contains_key("app3"));
}

#[tokio::test]
async fn test_command_timeout_fails_stuck_start() {
    let mut cluster = TestCluster::new(&[LOCAL, PEER_B], LOCAL, false, MapRules::default());
    prepare(&mut cluster, PEER_B, vec![("app1", "p1")]).await;
    let mut starter = TestStarter::new(cluster.clock.clone());

    cluster.clock.set(200);
    let done = starter.starter.start_process(
        &mut cluster.ctx,
        PlacementStrategy::Config,
        "app1:p1",
        "",
    );
    assert!(!done);
    assert_eq!(started_namespecs(&starter.drain_dispatch()), vec!["app1:p1"]);

    // Within the timeout nothing happens.
    cluster.clock.set(204);
    assert!(!starter.starter.check_progress(&mut cluster.ctx));
    assert_eq!(
        cluster.ctx.process("app1:p1").unwrap().state(),
        ProcessState::Stopped
    );

    // Past the timeout the command is declared failed, once.
    cluster.clock.set(206);
    assert!(!starter.starter.check_progress(&mut cluster.ctx));
    let process = cluster.ctx.process("app1:p1").unwrap();
    assert_eq!(process.state(), ProcessState::Fatal);
    assert_eq!(
        process.spawnerr,
        "Still stopped 5 seconds after start request"
    );
    assert_eq!(cluster.ctx.take_forced_events(), vec!["app1:p1".to_string()]);

    // The synthetic event finally releases the in-flight entry.
    starter.starter.on_event(&mut cluster.ctx, "app1:p1");
    assert!(!starter.starter.in_progress());
}

#[tokio::test]
async fn test_start_marked_processes_restarts_and_clears_marks() {
    let mut rules = MapRules::default();
    rules.programs.insert(
        "app1:p1".to_string(),
        ProcessRules {
            required: true,
            ..Default::default()
        },
    );
    let mut cluster = TestCluster::new(&[LOCAL, PEER_B], LOCAL, false, rules);
    cluster.requester.set_inventory(
        PEER_B,
        vec![
            inventory_entry("app1", "p1", ProcessState::Running),
            inventory_entry("app1", "p2", ProcessState::Stopped),
        ],
    );
    cluster.clock.set(100);
    cluster.ctx.on_tick(PEER_B, 100).await.unwrap();
    // Losing B marks p1; bring B back so there is somewhere to restart.
    cluster.clock.set(120);
    cluster.ctx.on_timer();
    assert_eq!(cluster.ctx.marked_processes(), vec!["app1:p1".to_string()]);
    cluster.requester.set_inventory(
        PEER_B,
        vec![
            inventory_entry("app1", "p1", ProcessState::Stopped),
            inventory_entry("app1", "p2", ProcessState::Stopped),
        ],
    );
    cluster.ctx.on_tick(PEER_B, 121).await.unwrap();

    let mut starter = TestStarter::new(cluster.clock.clone());
    starter.starter.start_marked_processes(&mut cluster.ctx);

    assert!(cluster.ctx.marked_processes().is_empty());
    assert_eq!(started_namespecs(&starter.drain_dispatch()), vec!["app1:p1"]);
}

#[tokio::test]
async fn test_start_applications_uses_configured_outer_ranks() {
    let mut rules = sequenced_rules();
    rules.applications.insert(
        "app1".to_string(),
        ApplicationRules {
            start_sequence: 2,
            ..Default::default()
        },
    );
    rules.applications.insert(
        "app0".to_string(),
        ApplicationRules {
            start_sequence: 1,
            ..Default::default()
        },
    );
    let mut cluster = TestCluster::new(&[LOCAL, PEER_B], LOCAL, false, rules);
    prepare(
        &mut cluster,
        PEER_B,
        vec![
            ("app0", "boot"),
            ("app1", "p1"),
            ("app1", "p2"),
            ("app1", "p3"),
        ],
    )
    .await;
    let mut starter = TestStarter::new(cluster.clock.clone());

    starter.starter.start_applications(&mut cluster.ctx);

    // Outer rank 1 (app0) goes first; app1 waits behind the barrier.
    assert_eq!(
        started_namespecs(&starter.drain_dispatch()),
        vec!["app0:boot"]
    );

    let event = process_event(PEER_B, "app0", "boot", ProcessState::Running);
    let namespec = cluster.ctx.on_process_event(&event).unwrap();
    starter.starter.on_event(&mut cluster.ctx, &namespec);

    let mut second_batch = started_namespecs(&starter.drain_dispatch());
    second_batch.sort();
    assert_eq!(second_batch, vec!["app1:p1", "app1:p2"]);
}

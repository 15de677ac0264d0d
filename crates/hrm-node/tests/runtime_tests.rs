//! Tests for the tokio node runtime.
//!
//! Verifies:
//! - Nodes running as tasks over in-memory channels elect a coordinator
//! - Snapshots expose addresses once the coordinator distributed them
//! - Route requests and shutdown go through the node handles

use std::time::Duration;

use hrm_node::{NodeConfig, NodeRuntime, NodeSnapshot};
use hrm_protocol::{ClusterKey, HierarchyLevel, NodeName, RouteResult};

/// A line of three nodes with timers shortened for wall-clock tests.
fn fast_line() -> NodeConfig {
    let mut config = NodeConfig::line(3);
    config.protocol.reply_timeout_ms = 50;
    config.protocol.announce_timeout_ms = 200;
    config.protocol.alive_interval_ms = 100;
    config.protocol.coordinator_timeout_ms = 400;
    config.protocol.address_distribution_delay_ms = 100;
    config.protocol.discovery_timeout_ms = 500;
    config
}

async fn wait_for<F>(runtime: &NodeRuntime, mut done: F) -> Vec<NodeSnapshot>
where
    F: FnMut(&[NodeSnapshot]) -> bool,
{
    let mut snapshots = runtime.snapshots().await;
    for _ in 0..100 {
        if done(&snapshots) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        snapshots = runtime.snapshots().await;
    }
    snapshots
}

fn follows(snapshot: &NodeSnapshot, key: ClusterKey, coordinator: &NodeName) -> bool {
    snapshot
        .coordinators
        .iter()
        .any(|(cluster, name)| *cluster == key && name == coordinator)
}

// ═══════════════════════════════════════════════════════════════
// Elections
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn tasks_elect_highest_priority() {
    let runtime = NodeRuntime::spawn(&fast_line()).unwrap();
    runtime.start().unwrap();

    let key = ClusterKey::new(1, HierarchyLevel::BASE);
    let winner = NodeName::from("node-2");
    let snapshots = wait_for(&runtime, |snapshots| {
        snapshots.iter().all(|snapshot| follows(snapshot, key, &winner))
    })
    .await;

    assert_eq!(snapshots.len(), 3);
    for snapshot in &snapshots {
        assert!(follows(snapshot, key, &winner), "{} disagrees", snapshot.name);
    }
    runtime.shutdown().await;
}

#[tokio::test]
async fn addresses_reach_every_node() {
    let runtime = NodeRuntime::spawn(&fast_line()).unwrap();
    runtime.start().unwrap();

    let snapshots = wait_for(&runtime, |snapshots| {
        snapshots
            .iter()
            .all(|snapshot| !snapshot.hrmids.is_empty() && snapshot.routing_entries >= 3)
    })
    .await;

    for snapshot in &snapshots {
        assert_eq!(snapshot.hrmids.len(), 1, "{}", snapshot.name);
        assert!(snapshot.routing_entries >= 3, "{}", snapshot.name);
    }

    let source = runtime.handle(&NodeName::from("node-0")).unwrap();
    let target = snapshots
        .iter()
        .find(|snapshot| snapshot.name == NodeName::from("node-2"))
        .map(|snapshot| snapshot.hrmids[0].1)
        .unwrap();
    let session = source.route_request(target, Vec::new()).await.unwrap();
    let outcome = source.route_result(session).await.unwrap().unwrap();
    assert_eq!(outcome.result, RouteResult::Success);
    assert_eq!(outcome.route.len(), 1);

    runtime.shutdown().await;
}

// ═══════════════════════════════════════════════════════════════
// Lifecycle
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn stopped_node_rejects_commands() {
    let runtime = NodeRuntime::spawn(&NodeConfig::line(2)).unwrap();
    let handle = runtime.handle(&NodeName::from("node-1")).unwrap().clone();
    runtime.shutdown().await;
    assert!(handle.start().is_err());
    assert!(handle.route_request(hrm_protocol::Hrmid::new(1), Vec::new()).await.is_err());
}

#[tokio::test]
async fn link_to_unknown_node_is_rejected() {
    let mut config = NodeConfig::line(2);
    config.links[0].b = "ghost".into();
    assert!(NodeRuntime::spawn(&config).is_err());
}

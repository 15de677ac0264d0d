//! End-to-end scenarios on the deterministic simulation.
//!
//! Verifies:
//! - A single cluster elects exactly one coordinator, the highest priority
//! - A node outside any cluster learns the coordinator of an adjacent cluster,
//!   even when only one of its neighbors knows one
//! - Coordinators learn neighbor clusters through gossip as logical links
//! - Forged, untrusted or altered TopologyData never touches the routing table
//! - Election results do not depend on the seed or on link order
//! - Every node ends up with a unique address and entries for all others
//! - Link failures and crashes lead to re-election
//! - A lost link shrinks membership and withdraws the routes through it
//! - Route requests are answered locally and by the coordinator

use hrm_hierarchy::LinkType;
use hrm_node::{LinkSpec, NodeConfig, NodeSpec, Simulation};
use hrm_protocol::{
    ClusterKey, ClusterName, Envelope, FibEntry, HierarchyLevel, HrmMessage, HrmSignature, Hrmid,
    L2Address, NodeIdentity, NodeName, RouteResult, TopologyData,
};

const SETTLE_MS: u64 = 30_000;

fn base_key(id: i64) -> ClusterKey {
    ClusterKey::new(id, HierarchyLevel::BASE)
}

fn name(s: &str) -> NodeName {
    NodeName::from(s)
}

fn settled(config: &NodeConfig) -> Simulation {
    let mut simulation = Simulation::from_config(config).unwrap();
    simulation.start();
    simulation.run_for(SETTLE_MS);
    simulation
}

fn coordinator_seen_by(simulation: &Simulation, node: &str, key: ClusterKey) -> Option<NodeName> {
    simulation.controller(&name(node)).unwrap().coordinator_of(&key)
}

/// Two clusters joined at node b: a-b in cluster 1, b-c-d in cluster 2.
fn two_clusters(seed: u64) -> NodeConfig {
    let mut config = NodeConfig {
        nodes: vec![
            NodeSpec::new("a", 500.0),
            NodeSpec::new("b", 1.0),
            NodeSpec::new("c", 2.0),
            NodeSpec::new("d", 500.0),
        ],
        links: vec![
            LinkSpec::new("a", "b", Some(1)),
            LinkSpec::new("b", "c", Some(2)),
            LinkSpec::new("c", "d", Some(2)),
        ],
        ..NodeConfig::default()
    };
    config.simulation.seed = seed;
    config
}

// ═══════════════════════════════════════════════════════════════
// Single cluster
// ═══════════════════════════════════════════════════════════════

#[test]
fn line_elects_highest_priority_once() {
    let simulation = settled(&NodeConfig::line(4));
    let key = base_key(1);

    let coordinators: Vec<&NodeName> = simulation
        .controllers()
        .filter(|controller| controller.is_coordinator_of(&key))
        .map(|controller| controller.name())
        .collect();
    assert_eq!(coordinators, vec![&name("node-3")]);

    for controller in simulation.controllers() {
        assert_eq!(
            controller.coordinator_of(&key),
            Some(name("node-3")),
            "{} disagrees",
            controller.name()
        );
    }
}

#[test]
fn members_share_the_coordinator_token() {
    let simulation = settled(&NodeConfig::line(4));
    let key = base_key(1);
    let tokens: Vec<i32> = simulation
        .controllers()
        .map(|controller| controller.cluster(&key).unwrap().token())
        .collect();
    assert!(tokens[0] != 0);
    assert!(tokens.iter().all(|token| *token == tokens[0]));
}

// ═══════════════════════════════════════════════════════════════
// Coordinator lookup
// ═══════════════════════════════════════════════════════════════

#[test]
fn outside_node_learns_adjacent_coordinator() {
    let mut config = NodeConfig::line(4);
    config.nodes.push(NodeSpec::new("edge", 1.0));
    config.links.push(LinkSpec::new("edge", "node-1", None));
    let mut simulation = settled(&config);

    let edge = name("edge");
    simulation.request_coordinator(&edge).unwrap();
    simulation.run_for(1_000);

    let controller = simulation.controller(&edge).unwrap();
    let answers = controller.coordinator_answers();
    assert_eq!(answers.len(), 1);
    assert!(answers[0].coordinator_known);
    let entry = answers[0]
        .discovery_entries
        .iter()
        .find(|entry| entry.cluster_id == 1)
        .unwrap();
    assert_eq!(entry.cluster_hops, 1);
    assert_eq!(entry.coordinator_name, name("node-3"));

    assert!(controller.cluster_keys().is_empty());
    let remote = controller.registry().remote(&base_key(1)).unwrap();
    assert_eq!(remote.coordinator_name, name("node-3"));
    assert!(controller.pending_requests().is_empty());
}

#[test]
fn lookup_request_expires_without_answer() {
    let mut config = NodeConfig::line(2);
    config.nodes.push(NodeSpec::new("edge", 1.0));
    config.links.push(LinkSpec::new("edge", "node-0", None));
    let mut simulation = settled(&config);

    simulation.crash(&name("node-0")).unwrap();
    simulation.request_coordinator(&name("edge")).unwrap();
    simulation.run_for(hrm_protocol::DISCOVERY_REPLY_TIMEOUT_MS + 1);

    let controller = simulation.controller(&name("edge")).unwrap();
    assert!(controller.coordinator_answers().is_empty());
    assert!(controller.pending_requests().is_empty());
    assert_eq!(controller.pending_requests().expired(), 1);
}

#[test]
fn lookup_waits_for_the_neighbor_that_knows() {
    let mut config = NodeConfig::line(3);
    config.nodes.push(NodeSpec::new("edge", 1.0));
    config.nodes.push(NodeSpec::new("lonely", 1.0));
    config.links.push(LinkSpec::new("edge", "lonely", None));
    config.links.push(LinkSpec::new("edge", "node-1", None));
    let mut simulation = settled(&config);

    let edge = name("edge");
    simulation.request_coordinator(&edge).unwrap();
    simulation.run_for(1_000);

    let controller = simulation.controller(&edge).unwrap();
    let answers = controller.coordinator_answers();
    assert!(answers.iter().any(|answer| answer.coordinator_known));
    let remote = controller.registry().remote(&base_key(1)).unwrap();
    assert_eq!(remote.coordinator_name, name("node-2"));
    assert!(controller.pending_requests().is_empty());
    assert_eq!(controller.pending_requests().expired(), 0);
}

// ═══════════════════════════════════════════════════════════════
// Neighbor clusters
// ═══════════════════════════════════════════════════════════════

#[test]
fn coordinators_learn_neighbor_clusters_logically() {
    let simulation = settled(&two_clusters(1));
    assert_eq!(coordinator_seen_by(&simulation, "b", base_key(1)), Some(name("a")));
    assert_eq!(coordinator_seen_by(&simulation, "b", base_key(2)), Some(name("d")));

    let d = simulation.controller(&name("d")).unwrap();
    let remotes: Vec<_> = d
        .neighbor_clusters()
        .into_iter()
        .filter(|remote| remote.name.key() == base_key(1))
        .collect();
    assert_eq!(remotes.len(), 1);
    assert_eq!(remotes[0].coordinator_name, name("a"));

    let own = d.cluster(&base_key(2)).unwrap().name();
    let graph = d.graph();
    let graph = graph.read().unwrap();
    assert_eq!(graph.link_type(&own, &remotes[0].name), Some(LinkType::LogicalLink));
    assert!(graph
        .links()
        .iter()
        .all(|link| link.link_type == LinkType::LogicalLink));
}

#[test]
fn shared_node_links_its_clusters_physically() {
    let simulation = settled(&two_clusters(1));
    let b = simulation.controller(&name("b")).unwrap();
    let first = b.cluster(&base_key(1)).unwrap().name();
    let second = b.cluster(&base_key(2)).unwrap().name();
    let graph = b.graph();
    let graph = graph.read().unwrap();
    assert_eq!(graph.link_type(&first, &second), Some(LinkType::PhysicalLink));
}

// ═══════════════════════════════════════════════════════════════
// Forwarding state
// ═══════════════════════════════════════════════════════════════

#[test]
fn every_node_gets_a_unique_address() {
    let simulation = settled(&NodeConfig::line(4));
    let mut addresses: Vec<Hrmid> = Vec::new();
    for controller in simulation.controllers() {
        let hrmid = controller.primary_hrmid().unwrap();
        assert!(!hrmid.is_unassigned());
        assert!(!addresses.contains(&hrmid), "duplicate {}", hrmid);
        addresses.push(hrmid);
    }

    for controller in simulation.controllers() {
        let table = controller.routing_table();
        let table = table.read().unwrap();
        for hrmid in &addresses {
            assert!(table.lookup(hrmid).is_some(), "{} has no entry for {}", controller.name(), hrmid);
        }
        let own = table.get(&controller.primary_hrmid().unwrap()).unwrap();
        assert!(own.write_protected);
        assert_eq!(own.entry.next_hop, controller.address());
    }
}

fn forged_push(cluster: ClusterName, signature: HrmSignature) -> TopologyData {
    let mut data = TopologyData::new(Hrmid::new(0xEE), cluster, signature.clone());
    data.add_entry(FibEntry {
        destination: Hrmid::new(0xAB),
        next_hop: L2Address(99),
        next_cluster: cluster,
        farthest_cluster: Some(cluster),
        signature,
        routing_vectors: Vec::new(),
    });
    data
}

#[test]
fn untrusted_topology_is_ignored() {
    let mut simulation = settled(&NodeConfig::line(3));
    let target = name("node-0");
    let key = base_key(1);
    let (cluster, before_hrmid, before, genuine) = {
        let controller = simulation.controller(&target).unwrap();
        let table = controller.routing_table();
        let table = table.read().unwrap();
        let genuine = table
            .iter()
            .map(|(_, routing)| routing)
            .find(|routing| !routing.write_protected)
            .map(|routing| routing.entry.signature.clone())
            .unwrap();
        (
            controller.cluster(&key).unwrap().name(),
            controller.primary_hrmid(),
            table.destinations(),
            genuine,
        )
    };
    assert!(before_hrmid.is_some());
    assert_eq!(genuine.signer, name("node-2"));

    // Keys rebuilt from the coordinator's name alone, a stranger's key,
    // and the coordinator's real signature lifted onto altered content.
    let mut pushes = vec![
        forged_push(cluster, NodeIdentity::derived(name("mallory")).sign(HierarchyLevel::BASE)),
        forged_push(cluster, genuine),
    ];
    let mut sealed = forged_push(cluster, NodeIdentity::derived(name("node-2")).sign(HierarchyLevel::BASE));
    sealed.seal(&NodeIdentity::derived(name("node-2")));
    assert!(sealed.verify().is_ok());
    pushes.push(sealed);

    for data in pushes {
        let envelope = Envelope::new(1, cluster, cluster, name("node-1"), HrmMessage::TopologyData(data));
        simulation
            .inject(&name("node-1"), &target, envelope.encode().unwrap())
            .unwrap();
    }

    let controller = simulation.controller(&target).unwrap();
    let table = controller.routing_table();
    assert_eq!(table.read().unwrap().destinations(), before);
    assert!(table.read().unwrap().lookup(&Hrmid::new(0xAB)).is_none());
    assert_eq!(controller.primary_hrmid(), before_hrmid);
}

// ═══════════════════════════════════════════════════════════════
// Determinism
// ═══════════════════════════════════════════════════════════════

fn winners(simulation: &Simulation) -> Vec<(NodeName, ClusterKey, Option<NodeName>)> {
    let mut winners = Vec::new();
    for controller in simulation.controllers() {
        for key in controller.cluster_keys() {
            if key.level.is_base_level() {
                winners.push((controller.name().clone(), key, controller.coordinator_of(&key)));
            }
        }
    }
    winners
}

#[test]
fn winners_do_not_depend_on_seed_or_link_order() {
    let reference = winners(&settled(&two_clusters(1)));
    assert!(reference.iter().all(|(_, _, coordinator)| coordinator.is_some()));

    for seed in [2u64, 7, 1234] {
        assert_eq!(winners(&settled(&two_clusters(seed))), reference, "seed {}", seed);

        let mut reversed = two_clusters(seed);
        reversed.links.reverse();
        assert_eq!(winners(&settled(&reversed)), reference, "reversed, seed {}", seed);
    }
}

#[test]
fn same_seed_reproduces_tokens() {
    let tokens = |simulation: &Simulation| -> Vec<ClusterName> {
        simulation
            .controllers()
            .flat_map(|controller| controller.clusters().map(|cluster| cluster.name()).collect::<Vec<_>>())
            .collect()
    };
    let first = settled(&two_clusters(42));
    let second = settled(&two_clusters(42));
    assert_eq!(tokens(&first), tokens(&second));
    assert_eq!(first.link_stats().delivered, second.link_stats().delivered);
}

// ═══════════════════════════════════════════════════════════════
// Failover
// ═══════════════════════════════════════════════════════════════

#[test]
fn failed_link_splits_and_reelects() {
    let mut simulation = settled(&NodeConfig::line(4));
    simulation.fail_link(&name("node-2"), &name("node-3")).unwrap();
    simulation.run_for(60_000);

    let key = base_key(1);
    for node in ["node-0", "node-1", "node-2"] {
        assert_eq!(coordinator_seen_by(&simulation, node, key), Some(name("node-2")), "{}", node);
    }
    assert_eq!(coordinator_seen_by(&simulation, "node-3", key), Some(name("node-3")));
    assert!(simulation.fail_link(&name("node-2"), &name("node-3")).is_err());
}

#[test]
fn failed_link_shrinks_membership_and_withdraws_routes() {
    let mut simulation = settled(&NodeConfig::line(4));
    let key = base_key(1);
    let far = simulation.controller(&name("node-0")).unwrap().primary_hrmid().unwrap();
    let lost_hop = simulation.controller(&name("node-2")).unwrap().address();
    assert_eq!(simulation.controller(&name("node-3")).unwrap().coordinator(&key).unwrap().member_count(), 4);

    simulation.fail_link(&name("node-2"), &name("node-3")).unwrap();
    simulation.run_for(120_000);

    let split = simulation.controller(&name("node-3")).unwrap();
    assert_eq!(split.cluster(&key).unwrap().member_count(), 0);
    let members: Vec<&NodeName> = split
        .coordinator(&key)
        .unwrap()
        .members()
        .map(|member| &member.name)
        .collect();
    assert_eq!(members, vec![&name("node-3")]);
    {
        let table = split.routing_table();
        let table = table.read().unwrap();
        assert!(table.iter().all(|(_, routing)| routing.entry.next_hop != lost_hop));
        assert!(table.lookup(&far).is_none());
    }

    let session = simulation.route_request(&name("node-3"), far, Vec::new()).unwrap();
    simulation.run_for(100);
    let outcome = simulation.route_result(&name("node-3"), session).unwrap();
    assert_eq!(outcome.result, RouteResult::Unfeasible);

    let remaining = simulation.controller(&name("node-2")).unwrap().coordinator(&key).unwrap();
    assert_eq!(remaining.member_count(), 3);
    for node in ["node-0", "node-1", "node-2"] {
        let controller = simulation.controller(&name(node)).unwrap();
        let table = controller.routing_table();
        let table = table.read().unwrap();
        assert!(
            table
                .iter()
                .all(|(_, routing)| routing.write_protected || routing.entry.signature.signer != name("node-3")),
            "{} still routes on node-3's pushes",
            node
        );
    }
}

#[test]
fn crashed_coordinator_is_replaced() {
    let mut simulation = settled(&NodeConfig::line(4));
    let before = simulation
        .controller(&name("node-2"))
        .unwrap()
        .cluster(&base_key(1))
        .unwrap()
        .name();

    simulation.crash(&name("node-3")).unwrap();
    simulation.run_for(60_000);

    let key = base_key(1);
    for node in ["node-0", "node-1", "node-2"] {
        assert_eq!(coordinator_seen_by(&simulation, node, key), Some(name("node-2")), "{}", node);
    }
    let after = simulation
        .controller(&name("node-2"))
        .unwrap()
        .cluster(&key)
        .unwrap()
        .name();
    assert_ne!(before.token, after.token);
    assert!(simulation.is_crashed(&name("node-3")));
    assert_eq!(simulation.live_nodes().len(), 3);
}

// ═══════════════════════════════════════════════════════════════
// Route requests
// ═══════════════════════════════════════════════════════════════

#[test]
fn route_to_known_address_is_resolved_locally() {
    let mut simulation = settled(&NodeConfig::line(4));
    let target = simulation.controller(&name("node-3")).unwrap().primary_hrmid().unwrap();
    let next_hop = simulation.controller(&name("node-1")).unwrap().address();

    let session = simulation.route_request(&name("node-0"), target, Vec::new()).unwrap();
    let outcome = simulation.route_result(&name("node-0"), session).unwrap();
    assert_eq!(outcome.result, RouteResult::Success);
    assert_eq!(outcome.route, vec![next_hop]);

    let own = simulation.controller(&name("node-0")).unwrap().primary_hrmid().unwrap();
    let session = simulation.route_request(&name("node-0"), own, Vec::new()).unwrap();
    let outcome = simulation.route_result(&name("node-0"), session).unwrap();
    assert_eq!(outcome.result, RouteResult::Success);
    assert!(outcome.route.is_empty());
}

#[test]
fn missing_required_cluster_yields_alternative() {
    let mut simulation = settled(&NodeConfig::line(4));
    let target = simulation.controller(&name("node-3")).unwrap().primary_hrmid().unwrap();
    let elsewhere = ClusterName::new(5, 99, HierarchyLevel::BASE);

    let session = simulation
        .route_request(&name("node-0"), target, vec![elsewhere])
        .unwrap();
    let outcome = simulation.route_result(&name("node-0"), session).unwrap();
    assert_eq!(outcome.result, RouteResult::Alternative);
    assert!(!outcome.route.is_empty());
}

#[test]
fn unknown_destination_is_asked_upstream() {
    let mut simulation = settled(&NodeConfig::line(4));
    let unknown = Hrmid::from_digits(&[0, 9, 9]).unwrap();

    let session = simulation.route_request(&name("node-0"), unknown, Vec::new()).unwrap();
    assert!(simulation.route_result(&name("node-0"), session).is_none());
    simulation.run_for(100);
    let outcome = simulation.route_result(&name("node-0"), session).unwrap();
    assert_eq!(outcome.result, RouteResult::Unfeasible);
}

#[test]
fn node_without_clusters_cannot_route() {
    let mut config = NodeConfig::line(2);
    config.nodes.push(NodeSpec::new("edge", 1.0));
    config.links.push(LinkSpec::new("edge", "node-0", None));
    let mut simulation = settled(&config);

    let session = simulation
        .route_request(&name("edge"), Hrmid::new(0x0101), Vec::new())
        .unwrap();
    let outcome = simulation.route_result(&name("edge"), session).unwrap();
    assert_eq!(outcome.result, RouteResult::Unfeasible);
}

// ═══════════════════════════════════════════════════════════════
// Driver
// ═══════════════════════════════════════════════════════════════

#[test]
fn crashed_node_drops_its_timers() {
    let mut simulation = Simulation::from_config(&NodeConfig::line(2)).unwrap();
    simulation.start();
    assert!(simulation.pending_timers() > 0);
    simulation.crash(&name("node-0")).unwrap();
    simulation.crash(&name("node-1")).unwrap();
    assert_eq!(simulation.pending_timers(), 0);
    simulation.run_for(SETTLE_MS);
    assert_eq!(simulation.now_ms(), SETTLE_MS);
}

#[test]
fn status_reports_every_node() {
    let simulation = settled(&NodeConfig::line(3));
    let status = simulation.status();
    assert_eq!(status["now_ms"].as_u64(), Some(SETTLE_MS));
    let nodes = status["nodes"].as_array().unwrap();
    assert_eq!(nodes.len(), 3);
    assert!(nodes.iter().all(|node| node["crashed"] == serde_json::Value::Bool(false)));
}

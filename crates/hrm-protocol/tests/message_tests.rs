//! Tests for the signaling envelope and the messages it carries.
//!
//! Verifies:
//! - Structural validation of decoded envelopes
//! - Coordinator signatures surviving the wire format
//! - Forwarding pushes bound to their content by the signature
//! - Signed resignations
//! - Answer semantics of RequestCoordinator and RouteRequest
//! - Oversized frames are refused on both sides

use hrm_protocol::*;

fn base_cluster(token: i32, id: i64) -> ClusterName {
    ClusterName::new(token, id, HierarchyLevel::BASE)
}

fn announce(identity: &NodeIdentity, token: i32) -> HrmMessage {
    HrmMessage::BullyAnnounce(BullyAnnounce {
        coordinator_name: identity.name().clone(),
        coordinator_address: L2Address(7),
        priority: BullyPriority::new(12.0),
        signature: identity.sign(HierarchyLevel::BASE),
        token,
        epoch: 1,
        covered_nodes: vec!["node-1".into(), "node-2".into()],
        routing_vectors: vec![RoutingVector::link(identity.name().clone(), "node-1".into())],
    })
}

fn envelope(payload: HrmMessage) -> Envelope {
    Envelope::new(1, base_cluster(3, 1), base_cluster(3, 1), "node-1".into(), payload)
}

fn fib_entry(destination: Hrmid, signature: HrmSignature) -> FibEntry {
    FibEntry {
        destination,
        next_hop: L2Address(2),
        next_cluster: base_cluster(3, 1),
        farthest_cluster: None,
        signature,
        routing_vectors: Vec::new(),
    }
}

// ═══════════════════════════════════════════════════════════════
// Validation
// ═══════════════════════════════════════════════════════════════

#[test]
fn announce_survives_the_wire() {
    let identity = NodeIdentity::derived("coord".into());
    let bytes = envelope(announce(&identity, 44)).encode().unwrap();
    let decoded = Envelope::decode(&bytes).unwrap();

    assert_eq!(decoded.method(), ProtocolMethod::BullyAnnounce);
    let HrmMessage::BullyAnnounce(announce) = decoded.payload else {
        panic!("wrong payload");
    };
    assert_eq!(announce.token, 44);
    assert_eq!(announce.candidate().name, NodeName::from("coord"));
    assert!(announce.signature.verify().is_ok());
}

#[test]
fn announce_without_token_is_rejected() {
    let identity = NodeIdentity::derived("coord".into());
    let bytes = envelope(announce(&identity, 0)).encode().unwrap();
    assert!(matches!(
        Envelope::decode(&bytes),
        Err(ProtocolError::MalformedMessage(_))
    ));
}

#[test]
fn empty_origin_is_rejected() {
    let mut envelope = envelope(HrmMessage::PriorityUpdate(PriorityUpdate {
        priority: BullyPriority::new(1.0),
    }));
    envelope.origin = NodeName::new("");
    assert!(envelope.validate().is_err());
}

#[test]
fn only_coordinator_requests_may_target_undefined_level() {
    let unknown = ClusterName::untokened(ClusterKey::new(0, HierarchyLevel::UNDEFINED));

    let mut request = envelope(HrmMessage::RequestCoordinator(RequestCoordinator::request()));
    request.receiver = unknown;
    assert!(request.validate().is_ok());

    let mut update = envelope(HrmMessage::PriorityUpdate(PriorityUpdate {
        priority: BullyPriority::new(1.0),
    }));
    update.receiver = unknown;
    assert!(update.validate().is_err());
}

#[test]
fn topology_entry_needs_destination() {
    let identity = NodeIdentity::derived("coord".into());
    let signature = identity.sign(HierarchyLevel::BASE);
    let mut data = TopologyData::new(Hrmid::new(1), base_cluster(3, 1), signature.clone());
    data.add_entry(fib_entry(Hrmid::UNASSIGNED, signature));
    assert!(envelope(HrmMessage::TopologyData(data)).validate().is_err());
}

#[test]
fn neighbor_announce_needs_identity() {
    let identity = NodeIdentity::derived("coord".into());
    let mut announce = NeighborClusterAnnounce {
        coordinator_name: "coord".into(),
        coordinator_signature: identity.sign(HierarchyLevel::BASE),
        coordinator_address: L2Address(1),
        token: 5,
        cluster_id: 1,
        level: HierarchyLevel::UNDEFINED,
        priority: BullyPriority::new(1.0),
        epoch: 1,
        routing_vectors: Vec::new(),
        rejected: false,
        foreign: false,
    };
    assert!(envelope(HrmMessage::NeighborClusterAnnounce(announce.clone()))
        .validate()
        .is_err());

    announce.level = HierarchyLevel::BASE;
    announce.add_hop("coord".into(), "node-1".into());
    let checked = envelope(HrmMessage::NeighborClusterAnnounce(announce));
    assert!(checked.validate().is_ok());
}

#[test]
fn oversized_frame_is_refused() {
    let oversized = vec![b' '; MAX_FRAME_BYTES + 1];
    assert!(matches!(
        Envelope::decode(&oversized),
        Err(ProtocolError::FrameTooLarge { .. })
    ));

    let identity = NodeIdentity::derived("coord".into());
    let mut message = announce(&identity, 1);
    if let HrmMessage::BullyAnnounce(announce) = &mut message {
        announce.covered_nodes = (0..100_000).map(|i| NodeName::new(format!("node-{}", i))).collect();
    }
    assert!(matches!(
        envelope(message).encode(),
        Err(ProtocolError::FrameTooLarge { .. })
    ));
}

// ═══════════════════════════════════════════════════════════════
// Signatures
// ═══════════════════════════════════════════════════════════════

fn sealed_push(identity: &NodeIdentity) -> TopologyData {
    let mut data = TopologyData::new(Hrmid::new(2), base_cluster(3, 1), identity.sign(HierarchyLevel::BASE));
    data.add_entry(fib_entry(Hrmid::new(1), identity.sign(HierarchyLevel::BASE)));
    data.add_entry(fib_entry(Hrmid::new(3), identity.sign(HierarchyLevel::BASE)));
    data.seal(identity);
    data
}

fn decoded_push(data: TopologyData) -> TopologyData {
    let bytes = envelope(HrmMessage::TopologyData(data)).encode().unwrap();
    let HrmMessage::TopologyData(decoded) = Envelope::decode(&bytes).unwrap().payload else {
        panic!("wrong payload");
    };
    decoded
}

/// Re-encode the push as JSON, let `edit` change it, and decode it again.
fn edited_push(data: &TopologyData, edit: impl FnOnce(&mut serde_json::Value)) -> TopologyData {
    let mut json = serde_json::to_value(data).unwrap();
    edit(&mut json);
    serde_json::from_value(json).unwrap()
}

#[test]
fn topology_signatures_verify_after_decode() {
    let identity = NodeIdentity::derived("coord".into());
    let mut data = TopologyData::new(Hrmid::new(2), base_cluster(3, 1), identity.sign(HierarchyLevel::BASE));
    data.add_entry(fib_entry(Hrmid::new(1), identity.sign(HierarchyLevel::BASE)));
    let chain = NodeIdentity::derived("superior".into()).sign(HierarchyLevel::new(1));
    data.add_approved_signature(chain.clone());
    data.add_approved_signature(chain);
    data.seal(&identity);

    let decoded = decoded_push(data);
    assert_eq!(decoded.approved_signatures.len(), 1);
    assert_eq!(decoded.level(), HierarchyLevel::BASE);
    assert!(decoded.verify().is_ok());
    for entry in decoded.entries() {
        assert!(entry.signature.verify().is_ok());
        assert_eq!(entry.signature, decoded.signature);
    }
}

#[test]
fn altered_push_fails_verification() {
    let identity = NodeIdentity::derived("coord".into());
    let data = sealed_push(&identity);
    assert!(data.verify().is_ok());

    let redirected = edited_push(&data, |json| json["entries"][0]["next_hop"] = serde_json::json!(99));
    assert!(redirected.verify().is_err());

    let readdressed = edited_push(&data, |json| json["hrmid"] = serde_json::json!(0xEE));
    assert!(readdressed.verify().is_err());

    let truncated = edited_push(&data, |json| {
        json["entries"].as_array_mut().unwrap().pop();
    });
    assert!(truncated.verify().is_err());

    // Every signature inside still verifies on its own.
    assert!(redirected.signature.verify().is_ok());
}

#[test]
fn signature_cannot_be_moved_to_another_push() {
    let identity = NodeIdentity::derived("coord".into());
    let genuine = sealed_push(&identity);

    let mut forged = TopologyData::new(Hrmid::new(0xEE), base_cluster(3, 1), genuine.signature.clone());
    forged.add_entry(FibEntry {
        destination: Hrmid::new(0xAB),
        next_hop: L2Address(99),
        ..fib_entry(Hrmid::new(0xAB), genuine.signature.clone())
    });
    assert!(forged.verify().is_err());

    // A bare coordinator claim covers no content at all.
    let mut bare = TopologyData::new(Hrmid::new(2), base_cluster(3, 1), identity.sign(HierarchyLevel::BASE));
    bare.add_entry(fib_entry(Hrmid::new(1), bare.signature.clone()));
    assert!(bare.verify().is_err());
}

#[test]
fn push_resealed_by_another_key_names_that_key() {
    let honest = NodeIdentity::derived("coord".into());
    let forger = NodeIdentity::derived("mallory".into());
    let mut data = sealed_push(&honest);
    data.seal(&forger);
    assert!(data.verify().is_ok());
    assert_eq!(data.signature.signer, NodeName::from("mallory"));
}

#[test]
fn resignation_is_bound_to_its_coordinator_and_epoch() {
    let identity = NodeIdentity::derived("coord".into());
    let resign = BullyResign::new(&identity, HierarchyLevel::BASE, BullyPriority::new(4.0), 3);
    assert!(resign.verify().is_ok());

    let bytes = envelope(HrmMessage::BullyResign(resign.clone())).encode().unwrap();
    let decoded = Envelope::decode(&bytes).unwrap();
    assert_eq!(decoded.method(), ProtocolMethod::BullyResign);

    let mut replayed = resign.clone();
    replayed.epoch = 4;
    assert!(replayed.verify().is_err());

    let mut impersonated = resign;
    impersonated.coordinator_name = "node-9".into();
    assert!(impersonated.verify().is_err());
}

#[test]
fn signature_from_another_key_fails() {
    let honest = NodeIdentity::derived("coord".into());
    let forger = NodeIdentity::derived("mallory".into());

    let mut forged = forger.sign(HierarchyLevel::BASE);
    forged.signer = "coord".into();
    assert!(forged.verify().is_err());

    let mut swapped = honest.sign(HierarchyLevel::BASE);
    swapped.public_key = forger.sign(HierarchyLevel::BASE).public_key;
    assert!(swapped.verify().is_err());
}

#[test]
fn derived_identities_differ_per_name() {
    let a = NodeIdentity::derived("node-a".into());
    let b = NodeIdentity::derived("node-b".into());
    assert_ne!(a.verifying_key(), b.verifying_key());

    let seeded = NodeIdentity::from_seed("node-a".into(), crypto::sha256(b"node-a"));
    assert_eq!(seeded.verifying_key(), a.verifying_key());
}

// ═══════════════════════════════════════════════════════════════
// Requests and answers
// ═══════════════════════════════════════════════════════════════

#[test]
fn coordinator_answer_without_entries_is_unknown() {
    let request = RequestCoordinator::request();
    assert!(!request.is_answer);

    let empty = RequestCoordinator::answer(request.correlation_id, Vec::new());
    assert!(empty.is_answer);
    assert!(!empty.coordinator_known);
    assert_eq!(empty.correlation_id, request.correlation_id);

    let entry = DiscoveryEntry {
        token: 3,
        coordinator_name: "coord".into(),
        cluster_id: 1,
        coordinator_address: L2Address(7),
        priority: BullyPriority::new(12.0),
        level: HierarchyLevel::BASE,
        cluster_hops: 1,
        predecessor: None,
        routing_vectors: Vec::new(),
        foreign: false,
    };
    let known = RequestCoordinator::answer(request.correlation_id, vec![entry.clone()]);
    assert!(known.coordinator_known);
    assert_eq!(known.discovery_entries[0].cluster_name(), base_cluster(3, 1));
}

#[test]
fn membership_notices_survive_the_wire() {
    let left = envelope(HrmMessage::InformClusterLeft(InformClusterLeft {
        left: "node-3".into(),
        reporter: "node-2".into(),
    }));
    let decoded = Envelope::decode(&left.encode().unwrap()).unwrap();
    assert_eq!(decoded.method(), ProtocolMethod::InformClusterLeft);

    let canceled = envelope(HrmMessage::InformClusterMembershipCanceled(InformClusterMembershipCanceled {
        coordinator: "node-2".into(),
        member: "node-1".into(),
    }));
    let json: serde_json::Value = serde_json::from_slice(&canceled.encode().unwrap()).unwrap();
    assert_eq!(json["payload"]["method"], "cluster.membership_canceled");
    assert_eq!(json["payload"]["params"]["member"], "node-1");
}

#[test]
fn route_answer_carries_result() {
    let target = Hrmid::from_digits(&[0, 1, 2]).unwrap();
    let mut request = RouteRequest::new(Hrmid::new(1), target, 9, "node-1".into());
    assert!(!request.is_answer);
    assert!(request.result.is_none());

    request.set_result(RouteResult::Success, vec![L2Address(4)]);
    let bytes = envelope(HrmMessage::RouteRequest(request)).encode().unwrap();
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(json["payload"]["params"]["result"], "SUCCESS");
    assert_eq!(json["payload"]["params"]["session"], 9);
}

#[test]
fn nested_discovery_deduplicates_entries() {
    let mut nested = NestedDiscovery::new(1, 3, HierarchyLevel::BASE, EXPANSION_MAX_RADIUS);
    nested.tokens.push(3);
    assert!(nested.knows_token(3));
    assert!(!nested.knows_token(4));

    let entry = DiscoveryEntry {
        token: 5,
        coordinator_name: "coord".into(),
        cluster_id: 2,
        coordinator_address: L2Address(2),
        priority: BullyPriority::new(1.0),
        level: HierarchyLevel::BASE,
        cluster_hops: 2,
        predecessor: Some(base_cluster(3, 1)),
        routing_vectors: Vec::new(),
        foreign: false,
    };
    nested.add_discovery_entry(entry.clone());
    nested.add_discovery_entry(entry);
    assert_eq!(nested.discovery_entries.len(), 1);
}

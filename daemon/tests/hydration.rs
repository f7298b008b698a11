//! Hydration reconciliation against the in-memory platform fakes

use std::sync::Arc;

use warden::conf::WindowsConf;
use warden::models::{
    AclPolicy, Direction, EventType, Events, IpSetMetadata, IpSetSnapshot, NpmNetworkPolicy,
    PodMetadata, POLICY_APPLY, SET_APPLY, SetType, TranslatedIpSet, Verdict,
};
use warden_daemon::GoalStateProcessor;
use warden_dataplane::hns::Hns;
use warden_dataplane::test_utilities::FakeHns;
use warden_dataplane::{Backend, DataPlane, Dataplane};

/// Stand up a Windows dataplane over a fake HNS
async fn windows_dataplane() -> (Arc<FakeHns>, Arc<DataPlane>) {
    let hns = Arc::new(FakeHns::new("azure"));
    let network = hns.get_network_by_name("azure").await.unwrap();
    let backend = Backend::windows(Box::new(hns.clone()), network, WindowsConf::default());
    let dataplane = Arc::new(DataPlane::new("node-1", backend));
    dataplane.bootup().await.unwrap();
    (hns, dataplane)
}

/// Build a processor around a dataplane for direct process calls
fn processor(dataplane: Arc<DataPlane>) -> GoalStateProcessor {
    let (_inbound_tx, inbound_rx) = tokio::sync::mpsc::channel(8);
    let (_stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    GoalStateProcessor::new(dataplane, inbound_rx, 16, stop_rx)
}

/// Build a one selector allow policy
fn policy(ns: &str, name: &str, selector: &str) -> NpmNetworkPolicy {
    let meta = IpSetMetadata::new(selector, SetType::KeyValueLabelOfPod);
    let mut policy = NpmNetworkPolicy {
        namespace: ns.to_owned(),
        name: name.to_owned(),
        pod_selector_ipsets: vec![TranslatedIpSet::new(meta)],
        ..NpmNetworkPolicy::default()
    };
    let acl_id = policy.acl_id();
    policy.acls = vec![AclPolicy::new(acl_id, Verdict::Allowed, Direction::Ingress)];
    policy
}

/// Snapshot a hash set with members for a hydration payload
fn snapshot(name: &str, set_type: SetType, ips: &[&str]) -> IpSetSnapshot {
    IpSetSnapshot {
        metadata: Some(IpSetMetadata::new(name, set_type)),
        generation: 1,
        members: ips
            .iter()
            .map(|ip| PodMetadata::new(*ip, "y/b", "node-1"))
            .collect(),
        member_sets: Vec::default(),
    }
}

#[tokio::test]
async fn hydration_replaces_the_node_state() {
    let (hns, dataplane) = windows_dataplane().await;
    // the node starts out with policy P1 and set S1
    let old_member = PodMetadata::new("10.0.0.1", "x/a", "node-1");
    dataplane
        .add_to_sets(
            &[IpSetMetadata::new("old:yes", SetType::KeyValueLabelOfPod)],
            &old_member,
        )
        .await
        .unwrap();
    dataplane.add_policy(policy("x", "p1", "old:yes")).await.unwrap();
    dataplane.apply_dataplane().await.unwrap();
    assert!(dataplane.policies().await.exists("x/p1"));
    assert!(hns.set_names().await.contains("podlabel-old:yes"));
    // the controller hydrates with only P2 and S2 (plus the implicit sets)
    let mut hydration = Events::new(EventType::Hydration);
    let sets = vec![
        IpSetSnapshot {
            metadata: Some(IpSetMetadata::empty_hash_set()),
            generation: 1,
            ..IpSetSnapshot::default()
        },
        IpSetSnapshot {
            metadata: Some(IpSetMetadata::all_namespaces()),
            generation: 1,
            members: Vec::default(),
            member_sets: vec![IpSetMetadata::empty_hash_set()],
        },
        snapshot("new:yes", SetType::KeyValueLabelOfPod, &["10.0.0.9"]),
    ];
    hydration.insert(SET_APPLY, &sets).unwrap();
    hydration
        .insert(POLICY_APPLY, &[policy("y", "p2", "new:yes")])
        .unwrap();
    let processor = processor(dataplane.clone());
    processor.process(&hydration).await.unwrap();
    // P1 is removed and S1 force removed
    assert!(!dataplane.policies().await.exists("x/p1"));
    assert!(!dataplane.ipsets().await.exists("podlabel-old:yes"));
    // P2 and S2 are installed
    assert!(dataplane.policies().await.exists("y/p2"));
    let names = hns.set_names().await;
    assert!(names.contains("podlabel-new:yes"));
    assert!(!names.contains("podlabel-old:yes"));
    let members = hns.resolved_set("podlabel-new:yes").await.unwrap();
    assert!(members.contains("10.0.0.9"));
    // the implicit sets survive hydration
    assert!(names.contains("emptyhashset"));
    assert!(names.contains("all-namespaces"));
}

#[tokio::test]
async fn undecodable_payloads_are_skipped_not_fatal() {
    let (_hns, dataplane) = windows_dataplane().await;
    let mut event = Events::new(EventType::GoalState);
    // a corrupt payload alongside a healthy one
    event.payloads.insert(
        SET_APPLY.to_owned(),
        warden::models::GoalState {
            data: vec![0xff, 0x01],
        },
    );
    event
        .insert(POLICY_APPLY, &[policy("y", "p2", "new:yes")])
        .unwrap();
    let processor = processor(dataplane.clone());
    processor.process(&event).await.unwrap();
    // the healthy payload still applied
    assert!(dataplane.policies().await.exists("y/p2"));
}

#[tokio::test]
async fn applies_with_no_mutation_are_idempotent() {
    let (hns, dataplane) = windows_dataplane().await;
    dataplane.apply_dataplane().await.unwrap();
    let before = hns.set_names().await;
    dataplane.apply_dataplane().await.unwrap();
    assert_eq!(before, hns.set_names().await);
}

//! End to end dataplane scenarios against the in-memory platform fakes

use std::collections::HashSet;
use std::sync::Arc;

use warden::conf::{LinuxConf, WindowsConf};
use warden::models::{
    AclPolicy, Direction, IpSetMetadata, NpmNetworkPolicy, PodMetadata, SetType, TranslatedIpSet,
    Verdict,
};
use warden_dataplane::hns::Hns;
use warden_dataplane::test_utilities::{FakeHns, RecordingRunner};
use warden_dataplane::{Backend, DataPlane, Dataplane, PodUpdate};

/// Stand up a Windows dataplane over a fake HNS
async fn windows_dataplane() -> (Arc<FakeHns>, DataPlane) {
    let hns = Arc::new(FakeHns::new("azure"));
    let network = hns.get_network_by_name("azure").await.unwrap();
    let backend = Backend::windows(Box::new(hns.clone()), network, WindowsConf::default());
    let dataplane = DataPlane::new("node-1", backend);
    dataplane.bootup().await.unwrap();
    (hns, dataplane)
}

/// The sets a pod with one label pair belongs in
fn pod_sets(ns: &str, key: &str, value: &str) -> Vec<IpSetMetadata> {
    vec![
        IpSetMetadata::new(ns, SetType::Namespace),
        IpSetMetadata::new(key, SetType::KeyLabelOfPod),
        IpSetMetadata::new(format!("{key}:{value}"), SetType::KeyValueLabelOfPod),
    ]
}

/// Drive the dataplane the way the pod controller does for a pod add
async fn add_pod(
    dataplane: &DataPlane,
    ns: &str,
    pod: &PodMetadata,
    sets: &[IpSetMetadata],
) {
    // the pod's namespace set always exists and sits in all-namespaces
    let ns_set = IpSetMetadata::new(ns, SetType::Namespace);
    dataplane.create_ipsets(std::slice::from_ref(&ns_set)).await.unwrap();
    dataplane
        .add_to_lists(&[IpSetMetadata::all_namespaces()], std::slice::from_ref(&ns_set))
        .await
        .unwrap();
    dataplane.add_to_sets(sets, pod).await.unwrap();
    dataplane
        .update_pod(&PodUpdate {
            pod_key: pod.pod_key.clone(),
            pod_ip: pod.ip.clone(),
            node_name: pod.node_name.clone(),
            ipsets_to_add: sets.to_vec(),
            ipsets_to_remove: Vec::default(),
            marked_for_delete: false,
        })
        .await
        .unwrap();
    dataplane.apply_dataplane().await.unwrap();
}

/// Build an allow-all policy selecting one pod label pair
fn allow_all_policy(ns: &str, name: &str, key: &str, value: &str) -> NpmNetworkPolicy {
    let selector = IpSetMetadata::new(format!("{key}:{value}"), SetType::KeyValueLabelOfPod);
    let mut policy = NpmNetworkPolicy {
        namespace: ns.to_owned(),
        name: name.to_owned(),
        pod_selector_ipsets: vec![TranslatedIpSet::new(selector)],
        ..NpmNetworkPolicy::default()
    };
    let acl_id = policy.acl_id();
    policy.acls = vec![
        AclPolicy::new(&acl_id, Verdict::Allowed, Direction::Ingress),
        AclPolicy::new(&acl_id, Verdict::Allowed, Direction::Egress),
    ];
    policy
}

#[tokio::test]
async fn add_pod_programs_sets_but_no_acls() {
    let (hns, dataplane) = windows_dataplane().await;
    hns.create_endpoint(&hns.network.id.clone(), "test1", "10.0.0.1").await.unwrap();
    dataplane.refresh_endpoints().await.unwrap();
    let pod = PodMetadata::new("10.0.0.1", "x/a", "node-1");
    add_pod(&dataplane, "x", &pod, &pod_sets("x", "k1", "v1")).await;
    // the implicit sets and the pod's sets are all SetPolicies now
    assert_eq!(hns.resolved_set("emptyhashset").await.unwrap(), HashSet::new());
    let all: HashSet<String> = ["emptyhashset", "ns-x"].iter().map(|s| (*s).to_owned()).collect();
    assert_eq!(hns.resolved_set("all-namespaces").await.unwrap(), all);
    let ip: HashSet<String> = ["10.0.0.1".to_owned()].into_iter().collect();
    assert_eq!(hns.resolved_set("ns-x").await.unwrap(), ip);
    assert_eq!(hns.resolved_set("podlabel-k1").await.unwrap(), ip);
    assert_eq!(hns.resolved_set("podlabel-k1:v1").await.unwrap(), ip);
    // no policy exists so the endpoint carries no ACLs
    assert!(hns.acls_on("test1").await.is_empty());
}

#[tokio::test]
async fn deleted_pod_empties_sets_and_reconcile_collects_them() {
    let (hns, dataplane) = windows_dataplane().await;
    hns.create_endpoint(&hns.network.id.clone(), "test1", "10.0.0.1").await.unwrap();
    dataplane.refresh_endpoints().await.unwrap();
    let pod = PodMetadata::new("10.0.0.1", "x/a", "node-1");
    let sets = pod_sets("x", "k1", "v1");
    add_pod(&dataplane, "x", &pod, &sets).await;
    // the pod goes away
    dataplane.remove_from_sets(&sets, &pod).await.unwrap();
    dataplane
        .update_pod(&PodUpdate {
            pod_key: pod.pod_key.clone(),
            pod_ip: pod.ip.clone(),
            node_name: pod.node_name.clone(),
            ipsets_to_add: Vec::default(),
            ipsets_to_remove: sets.clone(),
            marked_for_delete: true,
        })
        .await
        .unwrap();
    dataplane.apply_dataplane().await.unwrap();
    // memberships are empty but the sets still exist
    assert_eq!(hns.resolved_set("ns-x").await.unwrap(), HashSet::new());
    assert_eq!(hns.resolved_set("podlabel-k1").await.unwrap(), HashSet::new());
    // the reconcile tick garbage collects the label sets entirely
    dataplane.reconcile().await.unwrap();
    let names = hns.set_names().await;
    assert!(!names.contains("podlabel-k1"));
    assert!(!names.contains("podlabel-k1:v1"));
    // namespace sets are never collected
    assert!(names.contains("ns-x"));
}

#[tokio::test]
async fn policy_then_pod_lands_acls_on_the_endpoint() {
    let (hns, dataplane) = windows_dataplane().await;
    hns.create_endpoint(&hns.network.id.clone(), "test1", "10.0.0.1").await.unwrap();
    dataplane.refresh_endpoints().await.unwrap();
    // the policy arrives before any pod matches it
    dataplane
        .add_policy(allow_all_policy("x", "base", "k1", "v1"))
        .await
        .unwrap();
    assert!(hns.acls_on("test1").await.is_empty());
    // now the pod shows up with the selected label
    let pod = PodMetadata::new("10.0.0.1", "x/a", "node-1");
    add_pod(&dataplane, "x", &pod, &pod_sets("x", "k1", "v1")).await;
    let acls = hns.acls_on("test1").await;
    assert_eq!(acls.len(), 2);
    let inbound = acls.iter().find(|acl| acl.direction == "In").unwrap();
    assert_eq!(inbound.id, "azure-acl-x-base");
    assert_eq!(inbound.action, "Allow");
    assert_eq!(inbound.priority, 222);
    let outbound = acls.iter().find(|acl| acl.direction == "Out").unwrap();
    assert_eq!(outbound.action, "Allow");
    assert_eq!(outbound.priority, 222);
}

#[tokio::test]
async fn pod_replacement_on_the_same_ip_leaves_no_stale_state() {
    let (hns, dataplane) = windows_dataplane().await;
    let network_id = hns.network.id.clone();
    // pod a lives on endpoint test1
    hns.create_endpoint(&network_id, "test1", "10.0.0.1").await.unwrap();
    dataplane.refresh_endpoints().await.unwrap();
    let pod_a = PodMetadata::new("10.0.0.1", "x/a", "node-1");
    add_pod(&dataplane, "x", &pod_a, &pod_sets("x", "k1", "v1")).await;
    // endpoint test1 dies and test2 is born with the same ip
    hns.delete_endpoint("test1").await.unwrap();
    hns.create_endpoint(&network_id, "test2", "10.0.0.1").await.unwrap();
    dataplane.refresh_endpoints().await.unwrap();
    // pod b takes the ip over with a different label
    let pod_b = PodMetadata::new("10.0.0.1", "x/b", "node-1");
    add_pod(&dataplane, "x", &pod_b, &pod_sets("x", "k2", "v2")).await;
    // a policy selecting the dead pod's label must not land anywhere
    dataplane
        .add_policy(allow_all_policy("x", "base", "k1", "v1"))
        .await
        .unwrap();
    assert!(hns.acls_on("test2").await.is_empty());
    // the old label set no longer claims the reassigned ip
    let stale = hns.resolved_set("podlabel-k1:v1").await;
    if let Some(members) = stale {
        assert!(!members.contains("10.0.0.1"));
    }
}

#[tokio::test]
async fn retranslated_policies_release_their_old_sets() {
    let (hns, dataplane) = windows_dataplane().await;
    dataplane
        .add_policy(allow_all_policy("x", "base", "k1", "v1"))
        .await
        .unwrap();
    {
        let ipsets = dataplane.ipsets().await;
        let old = ipsets.get("podlabel-k1:v1").unwrap();
        assert!(old.netpol_references.contains("x/base"));
    }
    // the same policy comes back retranslated with a different selector
    dataplane
        .add_policy(allow_all_policy("x", "base", "k2", "v2"))
        .await
        .unwrap();
    {
        let ipsets = dataplane.ipsets().await;
        // the fresh selector set holds the policy now
        let fresh = ipsets.get("podlabel-k2:v2").unwrap();
        assert!(fresh.netpol_references.contains("x/base"));
        // the old selector set lost its hold and, being empty, is gone
        assert!(ipsets.get("podlabel-k1:v1").is_none());
    }
    // the platform saw the old set removed in the same flush
    let names = hns.set_names().await;
    assert!(!names.contains("podlabel-k1:v1"));
    assert!(names.contains("podlabel-k2:v2"));
    // in-place updates keep the generation and bump the revision
    let policies = dataplane.policies().await;
    let installed = policies.get("x/base").unwrap();
    assert_eq!((installed.generation, installed.revision), (1, 2));
}

#[tokio::test]
async fn linux_apply_writes_restore_files() {
    let runner = Arc::new(RecordingRunner::new());
    let backend = Backend::linux(Box::new(runner.clone()), LinuxConf::default());
    let dataplane = DataPlane::new("node-1", backend);
    dataplane.bootup().await.unwrap();
    let pod = PodMetadata::new("10.0.0.1", "x/a", "node-1");
    add_pod(&dataplane, "x", &pod, &pod_sets("x", "k1", "v1")).await;
    // bootup installed the base chains through iptables-restore
    let chain_files = runner.files_for("iptables-restore").await;
    assert!(chain_files.iter().any(|file| file.contains(":AZURE-NPM - -")));
    // the pod's membership went through ipset restore with a swap
    let set_files = runner.files_for("ipset").await;
    let last = set_files.last().unwrap();
    assert!(last.contains("create "));
    assert!(last.contains("add "));
    assert!(last.contains("swap "));
    // update_pod is a no-op on linux
    assert!(
        dataplane
            .update_pod(&PodUpdate::default())
            .await
            .is_ok()
    );
}

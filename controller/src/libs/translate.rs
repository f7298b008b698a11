//! Translates Kubernetes NetworkPolicies into the dataplane's own model
//!
//! Selectors become IP sets, rule peers become src/dst set matches, and CIDR
//! peers become literal member sets. Features the Windows dataplane cannot
//! enforce are rejected here with named errors instead of being partially
//! installed; the netpol controller treats those as permanent failures.

use k8s_openapi::api::networking::v1::{
    IPBlock, NetworkPolicy, NetworkPolicyPeer, NetworkPolicyPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::str::FromStr;

use warden::Error;
use warden::conf::Platform;
use warden::models::{
    AclPolicy, Direction, IpSetMetadata, NpmNetworkPolicy, Ports, Protocol, SetInfo, SetType,
    TranslatedIpSet, Verdict,
};

/// What one NetworkPolicyPort translated to
#[derive(Debug, Default)]
struct PortMatch {
    /// The protocol to match if any
    protocol: Option<Protocol>,
    /// The numbered port or range to match if any
    ports: Option<Ports>,
    /// The named port set to match if any
    named: Option<IpSetMetadata>,
}

/// What one rule peer translated to
#[derive(Debug, Default)]
struct PeerMatch {
    /// The set matches for this peer
    infos: Vec<SetInfo>,
    /// The sets this peer needs materialized
    sets: Vec<TranslatedIpSet>,
}

/// Translate one Kubernetes NetworkPolicy
///
/// # Arguments
///
/// * `netpol` - The policy to translate
/// * `platform` - The platform the translation must be enforceable on
pub fn translate(netpol: &NetworkPolicy, platform: Platform) -> Result<NpmNetworkPolicy, Error> {
    let mut policy = NpmNetworkPolicy {
        namespace: netpol.metadata.namespace.clone().unwrap_or_default(),
        name: netpol.metadata.name.clone().unwrap_or_default(),
        ..NpmNetworkPolicy::default()
    };
    let Some(spec) = &netpol.spec else {
        return Ok(policy);
    };
    policy.pod_selector_ipsets =
        selector_sets(&policy.namespace, &spec.pod_selector, platform)?;
    // figure out which directions this policy constrains
    let types = match &spec.policy_types {
        Some(types) => types.clone(),
        // the k8s default: ingress always, egress only with egress rules
        None => {
            let mut types = vec!["Ingress".to_owned()];
            if spec.egress.is_some() {
                types.push("Egress".to_owned());
            }
            types
        }
    };
    let acl_id = policy.acl_id();
    if types.iter().any(|kind| kind == "Ingress") {
        let rules: Vec<(Option<&Vec<NetworkPolicyPeer>>, Option<&Vec<NetworkPolicyPort>>)> = spec
            .ingress
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|rule| (rule.from.as_ref(), rule.ports.as_ref()))
            .collect();
        let acls = direction_acls(
            &mut policy,
            &acl_id,
            Direction::Ingress,
            &rules,
            platform,
        )?;
        policy.acls.extend(acls);
    }
    if types.iter().any(|kind| kind == "Egress") {
        let rules: Vec<(Option<&Vec<NetworkPolicyPeer>>, Option<&Vec<NetworkPolicyPort>>)> = spec
            .egress
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|rule| (rule.to.as_ref(), rule.ports.as_ref()))
            .collect();
        let acls = direction_acls(&mut policy, &acl_id, Direction::Egress, &rules, platform)?;
        policy.acls.extend(acls);
    }
    Ok(policy)
}

/// Build the ACLs for one direction of a policy
///
/// A direction with no rules at all denies everything for the selected pods.
/// Otherwise each rule contributes allow ACLs, and a default deny backstops
/// them unless some rule already allows everything.
///
/// # Arguments
///
/// * `policy` - The policy being built (collects rule sets)
/// * `acl_id` - The id every ACL of this policy carries
/// * `direction` - The direction being built
/// * `rules` - The peers and ports of each rule in this direction
/// * `platform` - The platform the translation must be enforceable on
fn direction_acls(
    policy: &mut NpmNetworkPolicy,
    acl_id: &str,
    direction: Direction,
    rules: &[(Option<&Vec<NetworkPolicyPeer>>, Option<&Vec<NetworkPolicyPort>>)],
    platform: Platform,
) -> Result<Vec<AclPolicy>, Error> {
    // a constrained direction with no rules is a full deny
    if rules.is_empty() {
        return Ok(vec![AclPolicy::new(acl_id, Verdict::Dropped, direction)]);
    }
    let mut acls = Vec::new();
    let mut allows_everything = false;
    for (rule_index, (peers, ports)) in rules.iter().enumerate() {
        // translate the peers of this rule
        let mut peer_match = PeerMatch::default();
        if let Some(peers) = peers {
            for (peer_index, peer) in peers.iter().enumerate() {
                let translated =
                    peer_sets(policy, peer, direction, rule_index, peer_index, platform)?;
                peer_match.infos.extend(translated.infos);
                peer_match.sets.extend(translated.sets);
            }
        }
        policy.rule_ipsets.extend(peer_match.sets);
        // translate the ports of this rule
        let port_matches = match ports {
            Some(ports) if !ports.is_empty() => ports
                .iter()
                .map(|port| port_match(port, platform))
                .collect::<Result<Vec<PortMatch>, Error>>()?,
            _ => vec![PortMatch::default()],
        };
        let open_peers = peer_match.infos.is_empty();
        // one ACL per port shape
        for port in port_matches {
            let open_ports = port.ports.is_none() && port.named.is_none() && port.protocol.is_none();
            if open_peers && open_ports {
                allows_everything = true;
            }
            let mut acl = AclPolicy::new(acl_id, Verdict::Allowed, direction);
            match direction {
                Direction::Ingress => acl.src_list = peer_match.infos.clone(),
                Direction::Egress => acl.dst_list = peer_match.infos.clone(),
            }
            acl.protocol = port.protocol;
            acl.ports = port.ports;
            if let Some(named) = port.named {
                policy.rule_ipsets.push(TranslatedIpSet::new(named.clone()));
                acl.dst_list.push(SetInfo::included(named));
            }
            acls.push(acl);
        }
    }
    // rules that do not allow everything need the default deny behind them
    if !allows_everything {
        acls.push(AclPolicy::new(acl_id, Verdict::Dropped, direction));
    }
    Ok(acls)
}

/// Translate a policy's pod selector into its selector sets
///
/// # Arguments
///
/// * `namespace` - The namespace the policy lives in
/// * `selector` - The pod selector to translate
/// * `platform` - The platform the translation must be enforceable on
fn selector_sets(
    namespace: &str,
    selector: &LabelSelector,
    platform: Platform,
) -> Result<Vec<TranslatedIpSet>, Error> {
    // the namespace set always scopes the selector
    let mut sets = vec![TranslatedIpSet::new(IpSetMetadata::new(
        namespace,
        SetType::Namespace,
    ))];
    let (included, excluded) = label_sets(
        selector,
        SetType::KeyLabelOfPod,
        SetType::KeyValueLabelOfPod,
        Some(SetType::NestedLabelOfPod),
        platform,
    )?;
    if !excluded.is_empty() {
        // the selector model has no way to express exclusion
        return Err(Error::unsupported(
            "negative matchExpressions are not supported in pod selectors",
        ));
    }
    sets.extend(included);
    Ok(sets)
}

/// Translate one rule peer into set matches
///
/// # Arguments
///
/// * `policy` - The policy being built
/// * `peer` - The peer to translate
/// * `direction` - The direction the peer sits in
/// * `rule_index` - The index of the rule inside its direction
/// * `peer_index` - The index of the peer inside its rule
/// * `platform` - The platform the translation must be enforceable on
fn peer_sets(
    policy: &NpmNetworkPolicy,
    peer: &NetworkPolicyPeer,
    direction: Direction,
    rule_index: usize,
    peer_index: usize,
    platform: Platform,
) -> Result<PeerMatch, Error> {
    let mut translated = PeerMatch::default();
    if let Some(block) = &peer.ip_block {
        let meta = cidr_set(policy, direction, rule_index, peer_index);
        translated.sets.push(TranslatedIpSet::with_members(
            meta.clone(),
            cidr_members(block, platform)?,
        ));
        translated.infos.push(SetInfo::included(meta));
        return Ok(translated);
    }
    match (&peer.namespace_selector, &peer.pod_selector) {
        (Some(namespaces), pods) => {
            // an empty namespace selector means every namespace
            if namespaces.match_labels.is_none() && namespaces.match_expressions.is_none() {
                let all = IpSetMetadata::all_namespaces();
                translated.sets.push(TranslatedIpSet::new(all.clone()));
                translated.infos.push(SetInfo::included(all));
            } else {
                // namespace label sets are already lists, so nothing can
                // hold a multi value In for them
                let (included, excluded) = label_sets(
                    namespaces,
                    SetType::KeyLabelOfNamespace,
                    SetType::KeyValueLabelOfNamespace,
                    None,
                    platform,
                )?;
                for set in included {
                    if let Some(meta) = &set.metadata {
                        translated.infos.push(SetInfo::included(meta.clone()));
                    }
                    translated.sets.push(set);
                }
                for set in excluded {
                    if let Some(meta) = &set.metadata {
                        translated.infos.push(SetInfo::excluded(meta.clone()));
                    }
                    translated.sets.push(set);
                }
            }
            if let Some(pods) = pods {
                translated.extend_with_pods(pods, platform)?;
            }
        }
        (None, Some(pods)) => {
            // a bare pod selector is scoped to the policy's own namespace
            let ns = IpSetMetadata::new(&policy.namespace, SetType::Namespace);
            translated.sets.push(TranslatedIpSet::new(ns.clone()));
            translated.infos.push(SetInfo::included(ns));
            translated.extend_with_pods(pods, platform)?;
        }
        // a peer with nothing in it matches everything
        (None, None) => (),
    }
    Ok(translated)
}

impl PeerMatch {
    /// Add the pod label sets of a peer's pod selector
    ///
    /// # Arguments
    ///
    /// * `pods` - The pod selector to translate
    /// * `platform` - The platform the translation must be enforceable on
    fn extend_with_pods(&mut self, pods: &LabelSelector, platform: Platform) -> Result<(), Error> {
        let (included, excluded) = label_sets(
            pods,
            SetType::KeyLabelOfPod,
            SetType::KeyValueLabelOfPod,
            Some(SetType::NestedLabelOfPod),
            platform,
        )?;
        for set in included {
            if let Some(meta) = &set.metadata {
                self.infos.push(SetInfo::included(meta.clone()));
            }
            self.sets.push(set);
        }
        for set in excluded {
            if let Some(meta) = &set.metadata {
                self.infos.push(SetInfo::excluded(meta.clone()));
            }
            self.sets.push(set);
        }
        Ok(())
    }
}

/// Translate a label selector into included and excluded sets
///
/// Negative operators are rejected outright on Windows; everywhere else they
/// come back in the excluded bucket.
///
/// # Arguments
///
/// * `selector` - The label selector to translate
/// * `key_type` - The set type for bare key matches
/// * `pair_type` - The set type for key=value matches
/// * `nested_type` - The set type for multi value In matches, if one exists
/// * `platform` - The platform the translation must be enforceable on
fn label_sets(
    selector: &LabelSelector,
    key_type: SetType,
    pair_type: SetType,
    nested_type: Option<SetType>,
    platform: Platform,
) -> Result<(Vec<TranslatedIpSet>, Vec<TranslatedIpSet>), Error> {
    let mut included = Vec::new();
    let mut excluded = Vec::new();
    if let Some(labels) = &selector.match_labels {
        for (key, value) in labels {
            included.push(TranslatedIpSet::new(IpSetMetadata::new(
                format!("{key}:{value}"),
                pair_type,
            )));
        }
    }
    for expr in selector.match_expressions.as_deref().unwrap_or_default() {
        let values = expr.values.as_deref().unwrap_or_default();
        match expr.operator.as_str() {
            "Exists" => {
                included.push(TranslatedIpSet::new(IpSetMetadata::new(
                    &expr.key, key_type,
                )));
            }
            "In" if values.len() == 1 => {
                included.push(TranslatedIpSet::new(IpSetMetadata::new(
                    format!("{}:{}", expr.key, values[0]),
                    pair_type,
                )));
            }
            "In" => {
                // a multi value In becomes a nested set of its pair sets
                let Some(nested_type) = nested_type else {
                    return Err(Error::unsupported(format!(
                        "multi value In on {} has no nested set to land in",
                        expr.key
                    )));
                };
                let members: Vec<IpSetMetadata> = values
                    .iter()
                    .map(|value| IpSetMetadata::new(format!("{}:{value}", expr.key), pair_type))
                    .collect();
                let name = format!("{}:{}", expr.key, values.join(":"));
                included.push(TranslatedIpSet::with_member_sets(
                    IpSetMetadata::new(name, nested_type),
                    members,
                ));
            }
            "DoesNotExist" => {
                if platform == Platform::Windows {
                    return Err(Error::unsupported(
                        "DoesNotExist matchExpressions are not supported on Windows",
                    ));
                }
                excluded.push(TranslatedIpSet::new(IpSetMetadata::new(
                    &expr.key, key_type,
                )));
            }
            "NotIn" => {
                if platform == Platform::Windows {
                    return Err(Error::unsupported(
                        "NotIn matchExpressions are not supported on Windows",
                    ));
                }
                for value in values {
                    excluded.push(TranslatedIpSet::new(IpSetMetadata::new(
                        format!("{}:{value}", expr.key),
                        pair_type,
                    )));
                }
            }
            other => {
                return Err(Error::validation(format!(
                    "unknown matchExpressions operator {other}"
                )));
            }
        }
    }
    Ok((included, excluded))
}

/// The metadata of a rule peer's CIDR set
///
/// # Arguments
///
/// * `policy` - The policy the peer belongs to
/// * `direction` - The direction the peer sits in
/// * `rule_index` - The index of the rule inside its direction
/// * `peer_index` - The index of the peer inside its rule
fn cidr_set(
    policy: &NpmNetworkPolicy,
    direction: Direction,
    rule_index: usize,
    peer_index: usize,
) -> IpSetMetadata {
    let dir = match direction {
        Direction::Ingress => "in",
        Direction::Egress => "out",
    };
    IpSetMetadata::new(
        format!(
            "{}-{}-{dir}-{rule_index}-{peer_index}",
            policy.namespace, policy.name
        ),
        SetType::CidrBlocks,
    )
}

/// Translate an IP block into literal set members
///
/// Excepted sub-blocks become nomatch entries on Linux and are rejected on
/// Windows.
///
/// # Arguments
///
/// * `block` - The IP block to translate
/// * `platform` - The platform the translation must be enforceable on
fn cidr_members(block: &IPBlock, platform: Platform) -> Result<Vec<String>, Error> {
    // the dataplane is IPv4 only
    let cidr = cidr::Ipv4Cidr::from_str(&block.cidr)
        .map_err(|_| Error::validation(format!("{} is not an IPv4 CIDR", block.cidr)))?;
    let mut members = vec![cidr.to_string()];
    if let Some(except) = &block.except {
        if !except.is_empty() && platform == Platform::Windows {
            return Err(Error::unsupported(
                "except blocks in ipBlock peers are not supported on Windows",
            ));
        }
        for raw in except {
            let sub = cidr::Ipv4Cidr::from_str(raw)
                .map_err(|_| Error::validation(format!("{raw} is not an IPv4 CIDR")))?;
            members.push(format!("{sub} nomatch"));
        }
    }
    Ok(members)
}

/// Translate one NetworkPolicyPort
///
/// # Arguments
///
/// * `port` - The port to translate
/// * `platform` - The platform the translation must be enforceable on
fn port_match(port: &NetworkPolicyPort, platform: Platform) -> Result<PortMatch, Error> {
    let mut matched = PortMatch::default();
    if let Some(raw) = &port.protocol {
        let protocol = Protocol::from_str(raw)
            .map_err(|_| Error::validation(format!("unknown protocol {raw}")))?;
        if protocol == Protocol::Sctp && platform == Platform::Windows {
            return Err(Error::unsupported("SCTP is not supported on Windows"));
        }
        matched.protocol = Some(protocol);
    }
    match &port.port {
        Some(IntOrString::Int(number)) => {
            let number = u16::try_from(*number)
                .map_err(|_| Error::validation(format!("port {number} is out of range")))?;
            matched.ports = Some(match port.end_port {
                Some(end) => {
                    let end = u16::try_from(end)
                        .map_err(|_| Error::validation(format!("end port {end} is out of range")))?;
                    Ports::range(number, end)
                }
                None => Ports::single(number),
            });
        }
        Some(IntOrString::String(name)) => {
            if platform == Platform::Windows {
                return Err(Error::unsupported(format!(
                    "named port {name} is not supported on Windows"
                )));
            }
            matched.named = Some(IpSetMetadata::new(name, SetType::NamedPorts));
        }
        None => (),
    }
    // k8s defaults the protocol to TCP whenever a port is named
    if matched.protocol.is_none() && (matched.ports.is_some() || matched.named.is_some()) {
        matched.protocol = Some(Protocol::Tcp);
    }
    Ok(matched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::networking::v1::{
        NetworkPolicyEgressRule, NetworkPolicyIngressRule, NetworkPolicySpec,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;
    use std::collections::BTreeMap;

    /// Build a policy skeleton selecting one label pair
    fn base_policy() -> NetworkPolicy {
        let mut labels = BTreeMap::new();
        labels.insert("k1".to_owned(), "v1".to_owned());
        let mut netpol = NetworkPolicy::default();
        netpol.metadata.namespace = Some("x".to_owned());
        netpol.metadata.name = Some("base".to_owned());
        netpol.spec = Some(NetworkPolicySpec {
            pod_selector: LabelSelector {
                match_labels: Some(labels),
                match_expressions: None,
            },
            ..NetworkPolicySpec::default()
        });
        netpol
    }

    #[test]
    fn allow_all_both_ways_yields_two_acls() {
        let mut netpol = base_policy();
        let spec = netpol.spec.as_mut().unwrap();
        spec.policy_types = Some(vec!["Ingress".to_owned(), "Egress".to_owned()]);
        spec.ingress = Some(vec![NetworkPolicyIngressRule::default()]);
        spec.egress = Some(vec![NetworkPolicyEgressRule::default()]);
        let policy = translate(&netpol, Platform::Windows).unwrap();
        assert_eq!(policy.key(), "x/base");
        // one allow per direction and no default deny behind an allow-all
        assert_eq!(policy.acls.len(), 2);
        assert!(policy.acls.iter().all(|acl| acl.target == Verdict::Allowed));
        assert!(policy.acls.iter().all(|acl| acl.policy_id == "azure-acl-x-base"));
        // the selector is the namespace set plus the label pair set
        let names: Vec<String> = policy
            .selector_metadata()
            .iter()
            .map(|meta| meta.prefixed_name())
            .collect();
        assert_eq!(names, vec!["ns-x", "podlabel-k1:v1"]);
    }

    #[test]
    fn constrained_directions_get_a_default_deny() {
        let mut netpol = base_policy();
        let spec = netpol.spec.as_mut().unwrap();
        spec.policy_types = Some(vec!["Ingress".to_owned()]);
        spec.ingress = Some(vec![NetworkPolicyIngressRule {
            from: Some(vec![NetworkPolicyPeer {
                namespace_selector: Some(LabelSelector::default()),
                ..NetworkPolicyPeer::default()
            }]),
            ports: None,
        }]);
        let policy = translate(&netpol, Platform::Windows).unwrap();
        // the all-namespaces allow plus the default deny
        assert_eq!(policy.acls.len(), 2);
        assert_eq!(policy.acls[0].target, Verdict::Allowed);
        assert_eq!(
            policy.acls[0].src_list[0].metadata.prefixed_name(),
            "all-namespaces"
        );
        assert_eq!(policy.acls[1].target, Verdict::Dropped);
    }

    #[test]
    fn no_rules_at_all_denies_everything() {
        let mut netpol = base_policy();
        let spec = netpol.spec.as_mut().unwrap();
        spec.policy_types = Some(vec!["Ingress".to_owned()]);
        let policy = translate(&netpol, Platform::Windows).unwrap();
        assert_eq!(policy.acls.len(), 1);
        assert_eq!(policy.acls[0].target, Verdict::Dropped);
    }

    #[test]
    fn cidr_excepts_are_nomatch_on_linux_and_fatal_on_windows() {
        let mut netpol = base_policy();
        let spec = netpol.spec.as_mut().unwrap();
        spec.policy_types = Some(vec!["Egress".to_owned()]);
        spec.egress = Some(vec![NetworkPolicyEgressRule {
            to: Some(vec![NetworkPolicyPeer {
                ip_block: Some(IPBlock {
                    cidr: "10.0.0.0/8".to_owned(),
                    except: Some(vec!["10.1.0.0/16".to_owned()]),
                }),
                ..NetworkPolicyPeer::default()
            }]),
            ports: None,
        }]);
        let policy = translate(&netpol, Platform::Linux).unwrap();
        let cidr_set = policy
            .rule_ipsets
            .iter()
            .find(|set| set.metadata.as_ref().unwrap().set_type == SetType::CidrBlocks)
            .unwrap();
        assert_eq!(cidr_set.members, vec!["10.0.0.0/8", "10.1.0.0/16 nomatch"]);
        // the same policy is rejected outright for windows
        let out = translate(&netpol, Platform::Windows);
        assert!(matches!(out, Err(Error::Unsupported(_))));
    }

    #[test]
    fn windows_rejects_named_ports_and_sctp() {
        let mut netpol = base_policy();
        {
            let spec = netpol.spec.as_mut().unwrap();
            spec.policy_types = Some(vec!["Ingress".to_owned()]);
            spec.ingress = Some(vec![NetworkPolicyIngressRule {
                from: None,
                ports: Some(vec![NetworkPolicyPort {
                    port: Some(IntOrString::String("serve-http".to_owned())),
                    end_port: None,
                    protocol: Some("TCP".to_owned()),
                }]),
            }]);
        }
        assert!(matches!(
            translate(&netpol, Platform::Windows),
            Err(Error::Unsupported(_))
        ));
        // the same named port is fine on linux as a NamedPorts set
        let policy = translate(&netpol, Platform::Linux).unwrap();
        assert!(policy.rule_ipsets.iter().any(|set| {
            set.metadata.as_ref().unwrap().prefixed_name() == "namedport-serve-http"
        }));
        // sctp ports are windows fatal too
        netpol.spec.as_mut().unwrap().ingress = Some(vec![NetworkPolicyIngressRule {
            from: None,
            ports: Some(vec![NetworkPolicyPort {
                port: Some(IntOrString::Int(80)),
                end_port: None,
                protocol: Some("SCTP".to_owned()),
            }]),
        }]);
        assert!(matches!(
            translate(&netpol, Platform::Windows),
            Err(Error::Unsupported(_))
        ));
        assert!(translate(&netpol, Platform::Linux).is_ok());
    }

    #[test]
    fn multi_value_in_becomes_a_nested_set() {
        let mut netpol = base_policy();
        let spec = netpol.spec.as_mut().unwrap();
        spec.policy_types = Some(vec!["Ingress".to_owned()]);
        spec.ingress = Some(vec![NetworkPolicyIngressRule {
            from: Some(vec![NetworkPolicyPeer {
                pod_selector: Some(LabelSelector {
                    match_labels: None,
                    match_expressions: Some(vec![LabelSelectorRequirement {
                        key: "tier".to_owned(),
                        operator: "In".to_owned(),
                        values: Some(vec!["web".to_owned(), "api".to_owned()]),
                    }]),
                }),
                ..NetworkPolicyPeer::default()
            }]),
            ports: None,
        }]);
        let policy = translate(&netpol, Platform::Windows).unwrap();
        let nested = policy
            .rule_ipsets
            .iter()
            .find(|set| {
                set.metadata.as_ref().unwrap().set_type == SetType::NestedLabelOfPod
            })
            .unwrap();
        assert_eq!(nested.metadata.as_ref().unwrap().name, "tier:web:api");
        assert_eq!(nested.member_sets.len(), 2);
    }

    #[test]
    fn negative_pod_selectors_are_rejected() {
        let mut netpol = base_policy();
        let spec = netpol.spec.as_mut().unwrap();
        spec.pod_selector = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "k1".to_owned(),
                operator: "DoesNotExist".to_owned(),
                values: None,
            }]),
        };
        assert!(matches!(
            translate(&netpol, Platform::Linux),
            Err(Error::Unsupported(_))
        ));
    }
}

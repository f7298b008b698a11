//! Flushes the IP set graph to HNS as SetPolicies

use tracing::{Level, event};

use warden::Error;
use warden::models::{IpSetSnapshot, SetKind, SetType, hashed_name};

use crate::hns::{Hns, PolicyOp, SetPolicyKind, SetPolicySetting};

/// Build the SetPolicy for one set snapshot
///
/// Named port sets have no HNS representation and yield nothing.
///
/// # Arguments
///
/// * `snapshot` - The set to build a policy for
pub fn set_policy(snapshot: &IpSetSnapshot) -> Option<SetPolicySetting> {
    let meta = snapshot.metadata.as_ref()?;
    if meta.set_type == SetType::NamedPorts {
        return None;
    }
    let policy = match meta.kind() {
        SetKind::Hash => SetPolicySetting {
            id: meta.hashed_name(),
            name: meta.prefixed_name(),
            kind: SetPolicyKind::IpSet,
            values: snapshot
                .members
                .iter()
                .map(|member| member.ip.clone())
                .collect::<Vec<String>>()
                .join(","),
        },
        // lists reference their member sets by hashed id
        SetKind::List => SetPolicySetting {
            id: meta.hashed_name(),
            name: meta.prefixed_name(),
            kind: SetPolicyKind::NestedIpSet,
            values: snapshot
                .member_sets
                .iter()
                .map(|member| member.hashed_name())
                .collect::<Vec<String>>()
                .join(","),
        },
    };
    Some(policy)
}

/// Flush dirty sets to HNS
///
/// # Arguments
///
/// * `hns` - The HNS client to program through
/// * `network_id` - The id of the network to program
/// * `to_update` - The sets to create or rebuild
/// * `to_delete` - The prefixed names of the sets to remove
pub async fn apply(
    hns: &dyn Hns,
    network_id: &str,
    to_update: &[IpSetSnapshot],
    to_delete: &[String],
) -> Result<(), Error> {
    // removals go first so a delete and re-create lands in the right order
    let removals: Vec<SetPolicySetting> = to_delete
        .iter()
        .map(|name| SetPolicySetting {
            id: hashed_name(name),
            name: name.clone(),
            kind: SetPolicyKind::IpSet,
            values: String::default(),
        })
        .collect();
    if !removals.is_empty() {
        hns.apply_network_policies(network_id, PolicyOp::Remove, removals)
            .await?;
    }
    let updates: Vec<SetPolicySetting> = to_update.iter().filter_map(set_policy).collect();
    if !updates.is_empty() {
        event!(Level::DEBUG, count = updates.len(), "applying SetPolicies");
        hns.apply_network_policies(network_id, PolicyOp::Update, updates)
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden::models::{IpSetMetadata, PodMetadata};

    #[test]
    fn hash_sets_carry_their_ips() {
        let snapshot = IpSetSnapshot {
            metadata: Some(IpSetMetadata::new("x", SetType::Namespace)),
            generation: 1,
            members: vec![PodMetadata::new("10.0.0.1", "x/a", "node-1")],
            member_sets: Vec::default(),
        };
        let policy = set_policy(&snapshot).unwrap();
        assert_eq!(policy.kind, SetPolicyKind::IpSet);
        assert_eq!(policy.name, "ns-x");
        assert_eq!(policy.values, "10.0.0.1");
    }

    #[test]
    fn lists_carry_member_ids() {
        let member = IpSetMetadata::new("x", SetType::Namespace);
        let snapshot = IpSetSnapshot {
            metadata: Some(IpSetMetadata::all_namespaces()),
            generation: 1,
            members: Vec::default(),
            member_sets: vec![member.clone()],
        };
        let policy = set_policy(&snapshot).unwrap();
        assert_eq!(policy.kind, SetPolicyKind::NestedIpSet);
        assert_eq!(policy.values, member.hashed_name());
    }

    #[test]
    fn named_port_sets_are_skipped() {
        let snapshot = IpSetSnapshot {
            metadata: Some(IpSetMetadata::new("serve-80", SetType::NamedPorts)),
            ..IpSetSnapshot::default()
        };
        assert!(set_policy(&snapshot).is_none());
    }
}

//! Installs translated policies as HNS endpoint ACLs
//!
//! Each [`AclPolicy`] becomes one HNS ACL referencing SetPolicies by their
//! hashed ids. ACLs land on every endpoint the policy's selector resolved to.

use tracing::{Level, event};

use warden::Error;
use warden::models::{AclPolicy, Direction, NpmNetworkPolicy, Protocol, SetInfo, Verdict};

use crate::hns::{AclPolicySetting, Hns, PolicyOp};

/// The priority allow ACLs install at
pub const ALLOW_PRIORITY: u16 = 222;

/// The priority block ACLs install at
pub const BLOCK_PRIORITY: u16 = 3000;

/// The prefix every npm owned ACL id carries
const ACL_PREFIX: &str = "azure-acl-";

/// Render one side of an ACL as comma joined SetPolicy ids
///
/// # Arguments
///
/// * `sets` - The sets matched on that side
fn addresses(sets: &[SetInfo]) -> String {
    sets.iter()
        .map(|info| info.metadata.hashed_name())
        .collect::<Vec<String>>()
        .join(",")
}

/// Render an ACL's destination ports
///
/// # Arguments
///
/// * `acl` - The ACL to render ports for
fn ports(acl: &AclPolicy) -> String {
    match acl.ports {
        Some(ports) => match ports.end_port {
            Some(end) => format!("{}-{end}", ports.port),
            None => ports.port.to_string(),
        },
        None => String::default(),
    }
}

/// Build the HNS ACLs for one policy, bucketed by direction
///
/// # Arguments
///
/// * `policy` - The policy to build ACLs for
pub fn build_acls(policy: &NpmNetworkPolicy) -> Vec<AclPolicySetting> {
    policy
        .acls
        .iter()
        .map(|acl| {
            let (direction, local, remote, local_ports, remote_ports) = match acl.direction {
                // inbound traffic arrives from the src sets onto the dst side
                Direction::Ingress => (
                    "In",
                    addresses(&acl.dst_list),
                    addresses(&acl.src_list),
                    ports(acl),
                    String::default(),
                ),
                Direction::Egress => (
                    "Out",
                    addresses(&acl.src_list),
                    addresses(&acl.dst_list),
                    String::default(),
                    ports(acl),
                ),
            };
            AclPolicySetting {
                id: acl.policy_id.clone(),
                action: match acl.target {
                    Verdict::Allowed => "Allow".to_owned(),
                    Verdict::Dropped => "Block".to_owned(),
                },
                direction: direction.to_owned(),
                local_addresses: local,
                remote_addresses: remote,
                local_ports,
                remote_ports,
                protocols: acl.protocol.unwrap_or(Protocol::Any).number().to_string(),
                priority: match acl.target {
                    Verdict::Allowed => ALLOW_PRIORITY,
                    Verdict::Dropped => BLOCK_PRIORITY,
                },
            }
        })
        .collect()
}

/// Install a policy's ACLs on every endpoint it resolved to
///
/// # Arguments
///
/// * `hns` - The HNS client to program through
/// * `policy` - The policy to install
pub async fn install(hns: &dyn Hns, policy: &NpmNetworkPolicy) -> Result<(), Error> {
    let acls = build_acls(policy);
    if acls.is_empty() {
        return Ok(());
    }
    for endpoint_id in policy.pod_endpoints.values() {
        hns.apply_endpoint_policies(endpoint_id, PolicyOp::Add, acls.clone())
            .await?;
    }
    event!(
        Level::INFO,
        policy = %policy.key(),
        endpoints = policy.pod_endpoints.len(),
        "installed endpoint ACLs"
    );
    Ok(())
}

/// Install a policy's ACLs on a single endpoint
///
/// # Arguments
///
/// * `hns` - The HNS client to program through
/// * `endpoint_id` - The endpoint to program
/// * `policy` - The policy to install
pub async fn install_on_endpoint(
    hns: &dyn Hns,
    endpoint_id: &str,
    policy: &NpmNetworkPolicy,
) -> Result<(), Error> {
    let acls = build_acls(policy);
    if !acls.is_empty() {
        hns.apply_endpoint_policies(endpoint_id, PolicyOp::Add, acls)
            .await?;
    }
    Ok(())
}

/// Remove a policy's ACLs from every endpoint it was installed on
///
/// # Arguments
///
/// * `hns` - The HNS client to program through
/// * `policy` - The policy to remove
pub async fn remove(hns: &dyn Hns, policy: &NpmNetworkPolicy) -> Result<(), Error> {
    for endpoint_id in policy.pod_endpoints.values() {
        remove_from_endpoint(hns, endpoint_id, &policy.acl_id()).await?;
    }
    Ok(())
}

/// Remove the ACLs of one policy id from a single endpoint
///
/// # Arguments
///
/// * `hns` - The HNS client to program through
/// * `endpoint_id` - The endpoint to clean
/// * `acl_id` - The policy id the ACLs are tagged with
pub async fn remove_from_endpoint(
    hns: &dyn Hns,
    endpoint_id: &str,
    acl_id: &str,
) -> Result<(), Error> {
    let installed = hns.get_endpoint_policies(endpoint_id).await?;
    let doomed: Vec<AclPolicySetting> = installed
        .into_iter()
        .filter(|acl| acl.id == acl_id)
        .collect();
    if !doomed.is_empty() {
        hns.apply_endpoint_policies(endpoint_id, PolicyOp::Remove, doomed)
            .await?;
    }
    Ok(())
}

/// Strip every npm owned ACL from one endpoint
///
/// # Arguments
///
/// * `hns` - The HNS client to program through
/// * `endpoint_id` - The endpoint to reset
pub async fn reset_endpoint(hns: &dyn Hns, endpoint_id: &str) -> Result<(), Error> {
    let installed = hns.get_endpoint_policies(endpoint_id).await?;
    let doomed: Vec<AclPolicySetting> = installed
        .into_iter()
        .filter(|acl| acl.id.starts_with(ACL_PREFIX))
        .collect();
    if !doomed.is_empty() {
        event!(Level::DEBUG, endpoint = endpoint_id, count = doomed.len(), "resetting endpoint ACLs");
        hns.apply_endpoint_policies(endpoint_id, PolicyOp::Remove, doomed)
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden::models::{IpSetMetadata, Ports, SetType};

    #[test]
    fn acls_bucket_by_direction() {
        let selector = IpSetMetadata::new("k1:v1", SetType::KeyValueLabelOfPod);
        let peer = IpSetMetadata::new("y", SetType::Namespace);
        let mut ingress = AclPolicy::new("azure-acl-x-base", Verdict::Allowed, Direction::Ingress);
        ingress.src_list = vec![SetInfo::included(peer.clone())];
        ingress.dst_list = vec![SetInfo::included(selector.clone())];
        ingress.ports = Some(Ports::single(80));
        let mut egress = AclPolicy::new("azure-acl-x-base", Verdict::Dropped, Direction::Egress);
        egress.src_list = vec![SetInfo::included(selector)];
        egress.dst_list = vec![SetInfo::included(peer.clone())];
        let policy = NpmNetworkPolicy {
            namespace: "x".to_owned(),
            name: "base".to_owned(),
            acls: vec![ingress, egress],
            ..NpmNetworkPolicy::default()
        };
        let acls = build_acls(&policy);
        assert_eq!(acls.len(), 2);
        assert_eq!(acls[0].direction, "In");
        assert_eq!(acls[0].action, "Allow");
        assert_eq!(acls[0].priority, ALLOW_PRIORITY);
        assert_eq!(acls[0].remote_addresses, peer.hashed_name());
        assert_eq!(acls[0].local_ports, "80");
        assert_eq!(acls[1].direction, "Out");
        assert_eq!(acls[1].action, "Block");
        assert_eq!(acls[1].priority, BLOCK_PRIORITY);
    }
}

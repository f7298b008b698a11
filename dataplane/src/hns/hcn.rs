//! The real HNS client backed by the Host Compute Network api
//!
//! HCN speaks JSON documents over a small set of flat calls. Every request and
//! response here is serde round tripped through the same setting shapes the
//! rest of the dataplane uses.

use serde_json::json;
use windows::Win32::Foundation::ERROR_NOT_FOUND;
use windows::Win32::System::HostComputeNetwork::{
    HcnCloseEndpoint, HcnCloseNetwork, HcnCreateEndpoint, HcnDeleteEndpoint, HcnEnumerateEndpoints,
    HcnEnumerateNetworks, HcnModifyEndpoint, HcnModifyNetwork, HcnOpenEndpoint, HcnOpenNetwork,
    HcnQueryEndpointProperties, HcnQueryNetworkProperties,
};
use windows::core::{GUID, PWSTR};

use warden::Error;
use warden::conf::PolicyMode;

use super::{AclPolicySetting, Hns, HnsEndpoint, HnsNetwork, PolicyOp, SetPolicyKind, SetPolicySetting};

/// The schema version stamped on every HCN request
fn schema() -> serde_json::Value {
    json!({"Major": 2, "Minor": 0})
}

/// Turn a rust string into a wide string HCN accepts
fn wide(raw: &str) -> Vec<u16> {
    raw.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Copy a PWSTR response document into an owned string
unsafe fn take_doc(doc: PWSTR) -> String {
    if doc.is_null() {
        return String::default();
    }
    unsafe { doc.to_string().unwrap_or_default() }
}

/// The real HCN backed client
#[derive(Default)]
pub struct HcnClient;

impl HcnClient {
    /// Create a new HCN client
    pub fn new() -> Self {
        HcnClient
    }

    /// Enumerate object ids matching an HCN query
    ///
    /// # Arguments
    ///
    /// * `filter` - The filter document to match objects against
    /// * `endpoints` - Whether to enumerate endpoints instead of networks
    fn enumerate(&self, filter: serde_json::Value, endpoints: bool) -> Result<Vec<String>, Error> {
        let query = json!({"SchemaVersion": schema(), "Filter": filter.to_string()}).to_string();
        let query = wide(&query);
        let mut doc = PWSTR::null();
        let mut record = PWSTR::null();
        let status = unsafe {
            if endpoints {
                HcnEnumerateEndpoints(PWSTR(query.as_ptr() as *mut _), &mut doc, Some(&mut record))
            } else {
                HcnEnumerateNetworks(PWSTR(query.as_ptr() as *mut _), &mut doc, Some(&mut record))
            }
        };
        if status.is_err() {
            let detail = unsafe { take_doc(record) };
            return Err(Error::transient(format!("hcn enumerate failed: {detail}")));
        }
        let raw = unsafe { take_doc(doc) };
        let ids: Vec<String> = serde_json::from_str(&raw)?;
        Ok(ids)
    }
}

/// The property document HCN returns for a network
#[derive(Deserialize)]
struct NetworkProperties {
    /// The id of the network
    #[serde(rename = "ID", default)]
    id: String,
    /// The name of the network
    #[serde(rename = "Name", default)]
    name: String,
    /// The feature flags the network carries
    #[serde(rename = "Flags", default)]
    flags: u32,
    /// The policies programmed on the network
    #[serde(rename = "Policies", default)]
    policies: Vec<serde_json::Value>,
}

/// The property document HCN returns for an endpoint
#[derive(Deserialize)]
struct EndpointProperties {
    /// The id of the endpoint
    #[serde(rename = "ID", default)]
    id: String,
    /// The name of the endpoint
    #[serde(rename = "Name", default)]
    name: String,
    /// The address block of the endpoint
    #[serde(rename = "IpConfigurations", default)]
    ip_configurations: Vec<IpConfiguration>,
    /// The feature flags the endpoint carries
    #[serde(rename = "Flags", default)]
    flags: u32,
    /// The policies programmed on the endpoint
    #[serde(rename = "Policies", default)]
    policies: Vec<serde_json::Value>,
}

/// One address on an endpoint
#[derive(Deserialize)]
struct IpConfiguration {
    /// The bare IP address
    #[serde(rename = "IpAddress", default)]
    ip_address: String,
}

/// The flag HCN sets on remote endpoints
const REMOTE_ENDPOINT_FLAG: u32 = 1;

/// The flag networks set when SetPolicies match by IP set
const IPSET_POLICY_FLAG: u32 = 1 << 3;

#[async_trait::async_trait]
impl Hns for HcnClient {
    async fn get_network_by_name(&self, name: &str) -> Result<HnsNetwork, Error> {
        let ids = self.enumerate(json!({"Name": name}), false)?;
        let Some(id) = ids.first() else {
            return Err(Error::transient(format!("no hns network named {name}")));
        };
        let props = query_network(id)?;
        Ok(HnsNetwork {
            id: props.id,
            name: props.name,
        })
    }

    async fn list_endpoints_of_network(&self, network_id: &str) -> Result<Vec<HnsEndpoint>, Error> {
        let ids = self.enumerate(json!({"VirtualNetwork": network_id}), true)?;
        let mut endpoints = Vec::with_capacity(ids.len());
        for id in ids {
            let props = query_endpoint(&id)?;
            endpoints.push(HnsEndpoint {
                id: props.id,
                name: props.name,
                ip: props
                    .ip_configurations
                    .first()
                    .map(|config| config.ip_address.clone())
                    .unwrap_or_default(),
                is_remote: props.flags & REMOTE_ENDPOINT_FLAG != 0,
            });
        }
        Ok(endpoints)
    }

    async fn set_policy_supported(&self, network_id: &str, mode: PolicyMode) -> Result<(), Error> {
        if mode != PolicyMode::IpSet {
            return Err(Error::new(format!(
                "unsupported SetPolicy mode {mode:?}: only IpSet is supported"
            )));
        }
        // make sure the ip set flag is present on the network
        let props = query_network(network_id)?;
        if props.flags & IPSET_POLICY_FLAG == 0 {
            return Err(Error::new(format!(
                "network {network_id} does not support IpSet SetPolicies"
            )));
        }
        Ok(())
    }

    async fn apply_network_policies(
        &self,
        network_id: &str,
        op: PolicyOp,
        sets: Vec<SetPolicySetting>,
    ) -> Result<(), Error> {
        let request_type = match op {
            PolicyOp::Add => "Add",
            PolicyOp::Update => "Update",
            PolicyOp::Remove => "Remove",
        };
        let policies: Vec<serde_json::Value> = sets
            .iter()
            .map(|set| {
                json!({
                    "Type": "SetPolicy",
                    "Settings": {
                        "Id": set.id,
                        "Name": set.name,
                        "PolicyType": match set.kind {
                            SetPolicyKind::IpSet => "IPSET",
                            SetPolicyKind::NestedIpSet => "NESTEDIPSET",
                        },
                        "Values": set.values,
                    },
                })
            })
            .collect();
        let request = json!({
            "SchemaVersion": schema(),
            "RequestType": request_type,
            "ResourceType": "Policy",
            "Settings": {"Policies": policies},
        })
        .to_string();
        modify_network(network_id, &request)
    }

    async fn get_network_policies(&self, network_id: &str) -> Result<Vec<SetPolicySetting>, Error> {
        let props = query_network(network_id)?;
        let mut sets = Vec::default();
        for policy in props.policies {
            if policy.get("Type").and_then(|kind| kind.as_str()) != Some("SetPolicy") {
                continue;
            }
            if let Some(settings) = policy.get("Settings") {
                sets.push(SetPolicySetting {
                    id: settings["Id"].as_str().unwrap_or_default().to_owned(),
                    name: settings["Name"].as_str().unwrap_or_default().to_owned(),
                    kind: match settings["PolicyType"].as_str() {
                        Some("NESTEDIPSET") => SetPolicyKind::NestedIpSet,
                        _ => SetPolicyKind::IpSet,
                    },
                    values: settings["Values"].as_str().unwrap_or_default().to_owned(),
                });
            }
        }
        Ok(sets)
    }

    async fn apply_endpoint_policies(
        &self,
        endpoint_id: &str,
        op: PolicyOp,
        acls: Vec<AclPolicySetting>,
    ) -> Result<(), Error> {
        let request_type = match op {
            PolicyOp::Add => "Add",
            PolicyOp::Update => "Update",
            PolicyOp::Remove => "Remove",
        };
        let policies: Vec<serde_json::Value> = acls
            .iter()
            .map(|acl| {
                json!({
                    "Type": "ACL",
                    "Settings": {
                        "Id": acl.id,
                        "Action": acl.action,
                        "Direction": acl.direction,
                        "LocalAddresses": acl.local_addresses,
                        "RemoteAddresses": acl.remote_addresses,
                        "LocalPorts": acl.local_ports,
                        "RemotePorts": acl.remote_ports,
                        "Protocols": acl.protocols,
                        "Priority": acl.priority,
                    },
                })
            })
            .collect();
        let request = json!({
            "SchemaVersion": schema(),
            "RequestType": request_type,
            "ResourceType": "Policy",
            "Settings": {"Policies": policies},
        })
        .to_string();
        modify_endpoint(endpoint_id, &request)
    }

    async fn get_endpoint_policies(
        &self,
        endpoint_id: &str,
    ) -> Result<Vec<AclPolicySetting>, Error> {
        let props = query_endpoint(endpoint_id)?;
        let mut acls = Vec::default();
        for policy in props.policies {
            if policy.get("Type").and_then(|kind| kind.as_str()) != Some("ACL") {
                continue;
            }
            if let Some(settings) = policy.get("Settings") {
                acls.push(AclPolicySetting {
                    id: settings["Id"].as_str().unwrap_or_default().to_owned(),
                    action: settings["Action"].as_str().unwrap_or_default().to_owned(),
                    direction: settings["Direction"].as_str().unwrap_or_default().to_owned(),
                    local_addresses: settings["LocalAddresses"]
                        .as_str()
                        .unwrap_or_default()
                        .to_owned(),
                    remote_addresses: settings["RemoteAddresses"]
                        .as_str()
                        .unwrap_or_default()
                        .to_owned(),
                    local_ports: settings["LocalPorts"].as_str().unwrap_or_default().to_owned(),
                    remote_ports: settings["RemotePorts"].as_str().unwrap_or_default().to_owned(),
                    protocols: settings["Protocols"].as_str().unwrap_or_default().to_owned(),
                    priority: settings["Priority"].as_u64().unwrap_or_default() as u16,
                });
            }
        }
        Ok(acls)
    }

    async fn create_endpoint(
        &self,
        network_id: &str,
        name: &str,
        ip: &str,
    ) -> Result<HnsEndpoint, Error> {
        let guid = GUID::try_from(network_id)
            .map_err(|_| Error::new(format!("bad network id: {network_id}")))?;
        let endpoint_guid = GUID::new()
            .map_err(|err| Error::new(format!("failed to mint an endpoint id: {err}")))?;
        let settings = json!({
            "SchemaVersion": schema(),
            "Name": name,
            "IpConfigurations": [{"IpAddress": ip}],
        })
        .to_string();
        let settings = wide(&settings);
        let mut network = std::ptr::null_mut();
        let mut endpoint = std::ptr::null_mut();
        let mut record = PWSTR::null();
        unsafe {
            HcnOpenNetwork(&guid, &mut network, Some(&mut record))
                .map_err(|err| Error::transient(format!("hcn open network failed: {err}")))?;
            let status = HcnCreateEndpoint(
                network,
                &endpoint_guid,
                PWSTR(settings.as_ptr() as *mut _),
                &mut endpoint,
                Some(&mut record),
            );
            let _ = HcnCloseNetwork(network);
            status.map_err(|err| Error::transient(format!("hcn create endpoint failed: {err}")))?;
            let _ = HcnCloseEndpoint(endpoint);
        }
        Ok(HnsEndpoint {
            id: format!("{endpoint_guid:?}"),
            name: name.to_owned(),
            ip: ip.to_owned(),
            is_remote: false,
        })
    }

    async fn delete_endpoint(&self, endpoint_id: &str) -> Result<(), Error> {
        let guid = GUID::try_from(endpoint_id)
            .map_err(|_| Error::new(format!("bad endpoint id: {endpoint_id}")))?;
        let mut record = PWSTR::null();
        let status = unsafe { HcnDeleteEndpoint(&guid, Some(&mut record)) };
        match status {
            Ok(()) => Ok(()),
            Err(err) if err.code() == ERROR_NOT_FOUND.into() => Ok(()),
            Err(err) => Err(Error::transient(format!(
                "hcn delete endpoint failed: {err}"
            ))),
        }
    }
}

/// Query the property document of one network
///
/// # Arguments
///
/// * `network_id` - The id of the network to query
fn query_network(network_id: &str) -> Result<NetworkProperties, Error> {
    let guid = GUID::try_from(network_id)
        .map_err(|_| Error::new(format!("bad network id: {network_id}")))?;
    let mut handle = std::ptr::null_mut();
    let mut record = PWSTR::null();
    let mut doc = PWSTR::null();
    let query = wide(&json!({"SchemaVersion": schema()}).to_string());
    let props = unsafe {
        HcnOpenNetwork(&guid, &mut handle, Some(&mut record))
            .map_err(|err| Error::transient(format!("hcn open network failed: {err}")))?;
        let status = HcnQueryNetworkProperties(
            handle,
            PWSTR(query.as_ptr() as *mut _),
            &mut doc,
            Some(&mut record),
        );
        let _ = HcnCloseNetwork(handle);
        status.map_err(|err| Error::transient(format!("hcn query network failed: {err}")))?;
        take_doc(doc)
    };
    let props: NetworkProperties = serde_json::from_str(&props)?;
    Ok(props)
}

/// Query the property document of one endpoint
///
/// # Arguments
///
/// * `endpoint_id` - The id of the endpoint to query
fn query_endpoint(endpoint_id: &str) -> Result<EndpointProperties, Error> {
    let guid = GUID::try_from(endpoint_id)
        .map_err(|_| Error::new(format!("bad endpoint id: {endpoint_id}")))?;
    let mut handle = std::ptr::null_mut();
    let mut record = PWSTR::null();
    let mut doc = PWSTR::null();
    let query = wide(&json!({"SchemaVersion": schema()}).to_string());
    let props = unsafe {
        HcnOpenEndpoint(&guid, &mut handle, Some(&mut record))
            .map_err(|err| Error::transient(format!("hcn open endpoint failed: {err}")))?;
        let status = HcnQueryEndpointProperties(
            handle,
            PWSTR(query.as_ptr() as *mut _),
            &mut doc,
            Some(&mut record),
        );
        let _ = HcnCloseEndpoint(handle);
        status.map_err(|err| Error::transient(format!("hcn query endpoint failed: {err}")))?;
        take_doc(doc)
    };
    let props: EndpointProperties = serde_json::from_str(&props)?;
    Ok(props)
}

/// Send a modify request to a network
///
/// # Arguments
///
/// * `network_id` - The id of the network to modify
/// * `request` - The json request document
fn modify_network(network_id: &str, request: &str) -> Result<(), Error> {
    let guid = GUID::try_from(network_id)
        .map_err(|_| Error::new(format!("bad network id: {network_id}")))?;
    let mut handle = std::ptr::null_mut();
    let mut record = PWSTR::null();
    let request = wide(request);
    unsafe {
        HcnOpenNetwork(&guid, &mut handle, Some(&mut record))
            .map_err(|err| Error::transient(format!("hcn open network failed: {err}")))?;
        let status = HcnModifyNetwork(handle, PWSTR(request.as_ptr() as *mut _), Some(&mut record));
        let _ = HcnCloseNetwork(handle);
        status.map_err(|err| Error::transient(format!("hcn modify network failed: {err}")))?;
    }
    Ok(())
}

/// Send a modify request to an endpoint
///
/// # Arguments
///
/// * `endpoint_id` - The id of the endpoint to modify
/// * `request` - The json request document
fn modify_endpoint(endpoint_id: &str, request: &str) -> Result<(), Error> {
    let guid = GUID::try_from(endpoint_id)
        .map_err(|_| Error::new(format!("bad endpoint id: {endpoint_id}")))?;
    let mut handle = std::ptr::null_mut();
    let mut record = PWSTR::null();
    let request = wide(request);
    unsafe {
        HcnOpenEndpoint(&guid, &mut handle, Some(&mut record))
            .map_err(|err| Error::transient(format!("hcn open endpoint failed: {err}")))?;
        let status = HcnModifyEndpoint(handle, PWSTR(request.as_ptr() as *mut _), Some(&mut record));
        let _ = HcnCloseEndpoint(handle);
        status.map_err(|err| Error::transient(format!("hcn modify endpoint failed: {err}")))?;
    }
    Ok(())
}

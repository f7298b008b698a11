//! A thin abstraction over the Windows Host Networking Service
//!
//! Only the handful of calls the dataplane needs are exposed so tests can run
//! against an in-memory fake on any platform. The real client lives behind
//! `cfg(windows)`.

use warden::Error;
use warden::conf::PolicyMode;

/// An HNS network
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct HnsNetwork {
    /// The id of this network
    pub id: String,
    /// The name of this network
    pub name: String,
}

/// An HNS endpoint
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct HnsEndpoint {
    /// The id of this endpoint
    pub id: String,
    /// The name of this endpoint
    pub name: String,
    /// The pod IP attached to this endpoint
    pub ip: String,
    /// Whether this endpoint fronts a pod on another node
    pub is_remote: bool,
}

/// Whether a policy call adds, updates, or removes its settings
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyOp {
    /// Add the settings
    Add,
    /// Replace the settings
    Update,
    /// Remove the settings
    Remove,
}

/// The SetPolicy flavors HNS distinguishes
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetPolicyKind {
    /// Values are IP or CIDR strings
    IpSet,
    /// Values are the ids of other set policies
    NestedIpSet,
}

/// One IP set as HNS stores it on a network
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SetPolicySetting {
    /// The hashed id of this set
    pub id: String,
    /// The canonical name of this set
    pub name: String,
    /// Which flavor of set this is
    pub kind: SetPolicyKind,
    /// The comma joined members of this set
    pub values: String,
}

/// One ACL as HNS stores it on an endpoint
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AclPolicySetting {
    /// The id of the policy this ACL belongs to
    pub id: String,
    /// Allow or Block
    pub action: String,
    /// In or Out
    pub direction: String,
    /// The set ids matched against the local side
    pub local_addresses: String,
    /// The set ids matched against the remote side
    pub remote_addresses: String,
    /// The local ports to match
    pub local_ports: String,
    /// The remote ports to match
    pub remote_ports: String,
    /// The protocol number to match (256 for any)
    pub protocols: String,
    /// Lower wins
    pub priority: u16,
}

/// The calls the dataplane makes into HNS
#[async_trait::async_trait]
pub trait Hns: Send + Sync {
    /// Get a network by its name
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the network to get
    async fn get_network_by_name(&self, name: &str) -> Result<HnsNetwork, Error>;

    /// List the endpoints attached to a network
    ///
    /// # Arguments
    ///
    /// * `network_id` - The id of the network to list endpoints of
    async fn list_endpoints_of_network(&self, network_id: &str) -> Result<Vec<HnsEndpoint>, Error>;

    /// Make sure the network supports SetPolicies in the given mode
    ///
    /// # Arguments
    ///
    /// * `network_id` - The id of the network to check
    /// * `mode` - The mode the dataplane requires
    async fn set_policy_supported(&self, network_id: &str, mode: PolicyMode) -> Result<(), Error>;

    /// Add, update, or remove set policies on a network
    ///
    /// # Arguments
    ///
    /// * `network_id` - The id of the network to program
    /// * `op` - Whether to add, update, or remove
    /// * `sets` - The set policies to program
    async fn apply_network_policies(
        &self,
        network_id: &str,
        op: PolicyOp,
        sets: Vec<SetPolicySetting>,
    ) -> Result<(), Error>;

    /// List the set policies programmed on a network
    ///
    /// # Arguments
    ///
    /// * `network_id` - The id of the network to list
    async fn get_network_policies(&self, network_id: &str) -> Result<Vec<SetPolicySetting>, Error>;

    /// Add or remove ACLs on an endpoint
    ///
    /// # Arguments
    ///
    /// * `endpoint_id` - The id of the endpoint to program
    /// * `op` - Whether to add or remove
    /// * `acls` - The ACLs to program
    async fn apply_endpoint_policies(
        &self,
        endpoint_id: &str,
        op: PolicyOp,
        acls: Vec<AclPolicySetting>,
    ) -> Result<(), Error>;

    /// List the ACLs programmed on an endpoint
    ///
    /// # Arguments
    ///
    /// * `endpoint_id` - The id of the endpoint to list
    async fn get_endpoint_policies(
        &self,
        endpoint_id: &str,
    ) -> Result<Vec<AclPolicySetting>, Error>;

    /// Create an endpoint on a network
    ///
    /// # Arguments
    ///
    /// * `network_id` - The id of the network to create the endpoint on
    /// * `name` - The name of the endpoint
    /// * `ip` - The pod IP to attach
    async fn create_endpoint(
        &self,
        network_id: &str,
        name: &str,
        ip: &str,
    ) -> Result<HnsEndpoint, Error>;

    /// Delete an endpoint
    ///
    /// # Arguments
    ///
    /// * `endpoint_id` - The id of the endpoint to delete
    async fn delete_endpoint(&self, endpoint_id: &str) -> Result<(), Error>;
}

#[async_trait::async_trait]
impl<T: Hns> Hns for std::sync::Arc<T> {
    async fn get_network_by_name(&self, name: &str) -> Result<HnsNetwork, Error> {
        self.as_ref().get_network_by_name(name).await
    }

    async fn list_endpoints_of_network(&self, network_id: &str) -> Result<Vec<HnsEndpoint>, Error> {
        self.as_ref().list_endpoints_of_network(network_id).await
    }

    async fn set_policy_supported(&self, network_id: &str, mode: PolicyMode) -> Result<(), Error> {
        self.as_ref().set_policy_supported(network_id, mode).await
    }

    async fn apply_network_policies(
        &self,
        network_id: &str,
        op: PolicyOp,
        sets: Vec<SetPolicySetting>,
    ) -> Result<(), Error> {
        self.as_ref()
            .apply_network_policies(network_id, op, sets)
            .await
    }

    async fn get_network_policies(&self, network_id: &str) -> Result<Vec<SetPolicySetting>, Error> {
        self.as_ref().get_network_policies(network_id).await
    }

    async fn apply_endpoint_policies(
        &self,
        endpoint_id: &str,
        op: PolicyOp,
        acls: Vec<AclPolicySetting>,
    ) -> Result<(), Error> {
        self.as_ref()
            .apply_endpoint_policies(endpoint_id, op, acls)
            .await
    }

    async fn get_endpoint_policies(
        &self,
        endpoint_id: &str,
    ) -> Result<Vec<AclPolicySetting>, Error> {
        self.as_ref().get_endpoint_policies(endpoint_id).await
    }

    async fn create_endpoint(
        &self,
        network_id: &str,
        name: &str,
        ip: &str,
    ) -> Result<HnsEndpoint, Error> {
        self.as_ref().create_endpoint(network_id, name, ip).await
    }

    async fn delete_endpoint(&self, endpoint_id: &str) -> Result<(), Error> {
        self.as_ref().delete_endpoint(endpoint_id).await
    }
}

cfg_if::cfg_if! {
    if #[cfg(windows)] {
        mod hcn;
        pub use hcn::HcnClient;
    }
}

//! In-memory platform fakes for exercising the dataplane in tests

use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;

use warden::Error;
use warden::conf::PolicyMode;

use crate::hns::{
    AclPolicySetting, Hns, HnsEndpoint, HnsNetwork, PolicyOp, SetPolicyKind, SetPolicySetting,
};
use crate::restore::{CommandOutput, CommandRunner};

/// One command a recording runner saw
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRun {
    /// The command that ran
    pub cmd: String,
    /// The args it ran under
    pub args: Vec<String>,
    /// The file piped to its stdin
    pub stdin: String,
}

/// A command runner that records everything and always succeeds
#[derive(Default)]
pub struct RecordingRunner {
    /// Every run in order
    pub runs: Mutex<Vec<RecordedRun>>,
}

impl RecordingRunner {
    /// Create a new recording runner
    pub fn new() -> Self {
        RecordingRunner::default()
    }

    /// Get every recorded stdin for a command
    ///
    /// # Arguments
    ///
    /// * `cmd` - The command to filter runs by
    pub async fn files_for(&self, cmd: &str) -> Vec<String> {
        self.runs
            .lock()
            .await
            .iter()
            .filter(|run| run.cmd == cmd)
            .map(|run| run.stdin.clone())
            .collect()
    }
}

#[async_trait::async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, cmd: &str, args: &[String], stdin: &str) -> Result<CommandOutput, Error> {
        self.runs.lock().await.push(RecordedRun {
            cmd: cmd.to_owned(),
            args: args.to_vec(),
            stdin: stdin.to_owned(),
        });
        Ok(CommandOutput {
            code: Some(0),
            stdout: String::default(),
            stderr: String::default(),
        })
    }
}

/// The mutable state behind a fake HNS
#[derive(Default)]
struct FakeHnsState {
    /// Every endpoint keyed by id
    endpoints: HashMap<String, HnsEndpoint>,
    /// The ACLs on each endpoint keyed by endpoint id
    endpoint_acls: HashMap<String, Vec<AclPolicySetting>>,
    /// The set policies on the network keyed by id
    set_policies: HashMap<String, SetPolicySetting>,
}

/// An in-memory HNS good enough for dataplane tests
pub struct FakeHns {
    /// The one network this fake hosts
    pub network: HnsNetwork,
    /// The state behind the fake
    state: Mutex<FakeHnsState>,
}

impl FakeHns {
    /// Create a fake HNS hosting one network
    ///
    /// # Arguments
    ///
    /// * `network_name` - The name of the hosted network
    pub fn new(network_name: &str) -> Self {
        FakeHns {
            network: HnsNetwork {
                id: "fake-network-1".to_owned(),
                name: network_name.to_owned(),
            },
            state: Mutex::default(),
        }
    }

    /// Get the ACLs currently on an endpoint
    ///
    /// # Arguments
    ///
    /// * `endpoint_id` - The endpoint to inspect
    pub async fn acls_on(&self, endpoint_id: &str) -> Vec<AclPolicySetting> {
        self.state
            .lock()
            .await
            .endpoint_acls
            .get(endpoint_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Get the names of every set policy on the network
    pub async fn set_names(&self) -> HashSet<String> {
        self.state
            .lock()
            .await
            .set_policies
            .values()
            .map(|set| set.name.clone())
            .collect()
    }

    /// Resolve a set policy down to member names or IPs
    ///
    /// Plain sets resolve to their IPs; nested sets resolve to the names of
    /// their member sets. Returns None when no set policy has the name.
    ///
    /// # Arguments
    ///
    /// * `name` - The canonical name of the set policy
    pub async fn resolved_set(&self, name: &str) -> Option<HashSet<String>> {
        let state = self.state.lock().await;
        let set = state
            .set_policies
            .values()
            .find(|set| set.name == name)?;
        let values = set
            .values
            .split(',')
            .filter(|value| !value.is_empty());
        let resolved = match set.kind {
            SetPolicyKind::IpSet => values.map(ToOwned::to_owned).collect(),
            // map member ids back to the names they were installed under
            SetPolicyKind::NestedIpSet => values
                .filter_map(|id| {
                    state
                        .set_policies
                        .get(id)
                        .map(|member| member.name.clone())
                })
                .collect(),
        };
        Some(resolved)
    }
}

#[async_trait::async_trait]
impl Hns for FakeHns {
    async fn get_network_by_name(&self, name: &str) -> Result<HnsNetwork, Error> {
        if name == self.network.name {
            Ok(self.network.clone())
        } else {
            Err(Error::transient(format!("no hns network named {name}")))
        }
    }

    async fn list_endpoints_of_network(&self, network_id: &str) -> Result<Vec<HnsEndpoint>, Error> {
        if network_id != self.network.id {
            return Err(Error::new(format!("no hns network with id {network_id}")));
        }
        Ok(self.state.lock().await.endpoints.values().cloned().collect())
    }

    async fn set_policy_supported(&self, _network_id: &str, mode: PolicyMode) -> Result<(), Error> {
        if mode == PolicyMode::IpSet {
            Ok(())
        } else {
            Err(Error::new(format!("unsupported SetPolicy mode {mode:?}")))
        }
    }

    async fn apply_network_policies(
        &self,
        network_id: &str,
        op: PolicyOp,
        sets: Vec<SetPolicySetting>,
    ) -> Result<(), Error> {
        if network_id != self.network.id {
            return Err(Error::new(format!("no hns network with id {network_id}")));
        }
        let mut state = self.state.lock().await;
        for set in sets {
            match op {
                PolicyOp::Add | PolicyOp::Update => {
                    state.set_policies.insert(set.id.clone(), set);
                }
                PolicyOp::Remove => {
                    state.set_policies.remove(&set.id);
                }
            }
        }
        Ok(())
    }

    async fn get_network_policies(&self, network_id: &str) -> Result<Vec<SetPolicySetting>, Error> {
        if network_id != self.network.id {
            return Err(Error::new(format!("no hns network with id {network_id}")));
        }
        Ok(self.state.lock().await.set_policies.values().cloned().collect())
    }

    async fn apply_endpoint_policies(
        &self,
        endpoint_id: &str,
        op: PolicyOp,
        acls: Vec<AclPolicySetting>,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        if !state.endpoints.contains_key(endpoint_id) {
            return Err(Error::transient(format!("no endpoint {endpoint_id}")));
        }
        let installed = state.endpoint_acls.entry(endpoint_id.to_owned()).or_default();
        match op {
            PolicyOp::Add | PolicyOp::Update => installed.extend(acls),
            PolicyOp::Remove => installed.retain(|have| !acls.contains(have)),
        }
        Ok(())
    }

    async fn get_endpoint_policies(
        &self,
        endpoint_id: &str,
    ) -> Result<Vec<AclPolicySetting>, Error> {
        let state = self.state.lock().await;
        if !state.endpoints.contains_key(endpoint_id) {
            return Err(Error::transient(format!("no endpoint {endpoint_id}")));
        }
        Ok(state
            .endpoint_acls
            .get(endpoint_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_endpoint(
        &self,
        network_id: &str,
        name: &str,
        ip: &str,
    ) -> Result<HnsEndpoint, Error> {
        if network_id != self.network.id {
            return Err(Error::new(format!("no hns network with id {network_id}")));
        }
        let endpoint = HnsEndpoint {
            id: name.to_owned(),
            name: name.to_owned(),
            ip: ip.to_owned(),
            is_remote: false,
        };
        self.state
            .lock()
            .await
            .endpoints
            .insert(endpoint.id.clone(), endpoint.clone());
        Ok(endpoint)
    }

    async fn delete_endpoint(&self, endpoint_id: &str) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        state.endpoints.remove(endpoint_id);
        state.endpoint_acls.remove(endpoint_id);
        Ok(())
    }
}

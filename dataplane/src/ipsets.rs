//! The in-memory IP set graph and its dirty cache
//!
//! Controllers mutate this graph freely; nothing touches the platform until
//! the facade flushes the dirty cache. Sets are keyed by their canonical
//! prefixed name and carry reverse references by name so the graph stays
//! acyclic: lists know their members, members know the names of the lists and
//! policies holding them alive.

use std::collections::{HashMap, HashSet};
use tracing::{Level, event};

use warden::Error;
use warden::models::{
    ALL_NAMESPACES, DeleteOption, IpSetMetadata, IpSetSnapshot, PodMetadata, ReferenceKind,
    SetKind, SetType, TranslatedIpSet,
};

pub mod linux;
pub mod windows;

/// One set in the in-memory graph
#[derive(Debug, Clone)]
pub struct ControllerIpSet {
    /// The identity of this set
    pub metadata: IpSetMetadata,
    /// The members of a hash set keyed by member string
    pub members: HashMap<String, PodMetadata>,
    /// The member sets of a list set keyed by prefixed name
    pub member_sets: HashMap<String, IpSetMetadata>,
    /// The prefixed names of the lists holding this set
    pub list_references: HashSet<String>,
    /// The keys of the policies selecting or naming this set
    pub netpol_references: HashSet<String>,
    /// Bumped each time this set is re-created after deletion
    pub generation: u64,
}

impl ControllerIpSet {
    /// Create a new set at a generation
    ///
    /// # Arguments
    ///
    /// * `metadata` - The identity of the set
    /// * `generation` - The generation to create the set at
    fn new(metadata: IpSetMetadata, generation: u64) -> Self {
        ControllerIpSet {
            metadata,
            members: HashMap::default(),
            member_sets: HashMap::default(),
            list_references: HashSet::default(),
            netpol_references: HashSet::default(),
            generation,
        }
    }

    /// Get the kind of this set
    pub fn kind(&self) -> SetKind {
        self.metadata.kind()
    }

    /// Whether nothing holds this set alive anymore
    pub fn can_delete(&self) -> bool {
        self.list_references.is_empty() && self.netpol_references.is_empty()
    }

    /// Whether this set has no members of either kind
    pub fn is_empty(&self) -> bool {
        self.members.is_empty() && self.member_sets.is_empty()
    }

    /// Build the wire snapshot of this set
    pub fn snapshot(&self) -> IpSetSnapshot {
        IpSetSnapshot {
            metadata: Some(self.metadata.clone()),
            generation: self.generation,
            members: self.members.values().cloned().collect(),
            member_sets: self.member_sets.values().cloned().collect(),
        }
    }
}

/// The four disjoint buckets of state awaiting the next apply
///
/// Adding a name to a bucket always removes it from the complementary bucket
/// so a delete followed by a re-add never reaches the platform as a delete.
#[derive(Debug, Default, Clone)]
pub struct DirtyCache {
    /// Sets to create or update on the platform
    pub to_add_or_update_sets: HashSet<String>,
    /// Sets to remove from the platform
    pub to_delete_sets: HashSet<String>,
    /// Policies to install on the platform
    pub to_add_or_update_policies: HashSet<String>,
    /// Policies to remove from the platform
    pub to_delete_policies: HashSet<String>,
}

impl DirtyCache {
    /// Mark a set as needing a create or update
    ///
    /// # Arguments
    ///
    /// * `name` - The prefixed name of the set
    pub fn mark_set_dirty(&mut self, name: &str) {
        self.to_delete_sets.remove(name);
        self.to_add_or_update_sets.insert(name.to_owned());
    }

    /// Mark a set as needing removal
    ///
    /// # Arguments
    ///
    /// * `name` - The prefixed name of the set
    pub fn mark_set_deleted(&mut self, name: &str) {
        self.to_add_or_update_sets.remove(name);
        self.to_delete_sets.insert(name.to_owned());
    }

    /// Mark a policy as needing install or update
    ///
    /// # Arguments
    ///
    /// * `key` - The namespace/name key of the policy
    pub fn mark_policy_dirty(&mut self, key: &str) {
        self.to_delete_policies.remove(key);
        self.to_add_or_update_policies.insert(key.to_owned());
    }

    /// Mark a policy as needing removal
    ///
    /// # Arguments
    ///
    /// * `key` - The namespace/name key of the policy
    pub fn mark_policy_deleted(&mut self, key: &str) {
        self.to_add_or_update_policies.remove(key);
        self.to_delete_policies.insert(key.to_owned());
    }

    /// Forget all dirty set state after a successful apply
    pub fn clear_sets(&mut self) {
        self.to_add_or_update_sets.clear();
        self.to_delete_sets.clear();
    }

    /// Forget all dirty policy state after a successful apply
    pub fn clear_policies(&mut self) {
        self.to_add_or_update_policies.clear();
        self.to_delete_policies.clear();
    }

    /// Whether nothing is waiting to be applied
    pub fn is_empty(&self) -> bool {
        self.to_add_or_update_sets.is_empty()
            && self.to_delete_sets.is_empty()
            && self.to_add_or_update_policies.is_empty()
            && self.to_delete_policies.is_empty()
    }
}

/// The in-memory IP set graph with its dirty cache
#[derive(Debug, Default)]
pub struct IpSetManager {
    /// Every live set keyed by prefixed name
    sets: HashMap<String, ControllerIpSet>,
    /// The state awaiting the next apply
    dirty: DirtyCache,
    /// The last generation of every deleted set
    deleted_objects: HashMap<String, u64>,
}

impl IpSetManager {
    /// Create an empty manager
    pub fn new() -> Self {
        IpSetManager::default()
    }

    /// Get a set by its prefixed name
    ///
    /// # Arguments
    ///
    /// * `name` - The prefixed name of the set
    pub fn get(&self, name: &str) -> Option<&ControllerIpSet> {
        self.sets.get(name)
    }

    /// Whether a set currently exists in memory
    ///
    /// # Arguments
    ///
    /// * `name` - The prefixed name of the set
    pub fn exists(&self, name: &str) -> bool {
        self.sets.contains_key(name)
    }

    /// Get the prefixed names of every live set
    pub fn set_names(&self) -> Vec<String> {
        self.sets.keys().cloned().collect()
    }

    /// Get the dirty cache for inspection
    pub fn dirty(&self) -> &DirtyCache {
        &self.dirty
    }

    /// Create a set if it does not exist yet
    ///
    /// Re-creating a set after deletion bumps its generation past the one it
    /// was deleted at.
    ///
    /// # Arguments
    ///
    /// * `meta` - The identity of the set to create
    pub fn create_ipset(&mut self, meta: &IpSetMetadata) {
        let name = meta.prefixed_name();
        if self.sets.contains_key(&name) {
            return;
        }
        let generation = self.deleted_objects.get(&name).copied().unwrap_or_default() + 1;
        self.sets
            .insert(name.clone(), ControllerIpSet::new(meta.clone(), generation));
        self.dirty.mark_set_dirty(&name);
        event!(Level::DEBUG, set = %name, generation, "created ipset");
    }

    /// Create several sets if they do not exist yet
    ///
    /// # Arguments
    ///
    /// * `metas` - The identities of the sets to create
    pub fn create_ipsets(&mut self, metas: &[IpSetMetadata]) {
        for meta in metas {
            self.create_ipset(meta);
        }
    }

    /// Delete a set from memory and mark it for platform removal
    ///
    /// A soft delete is a no-op while anything still references the set; a
    /// force delete (hydration garbage collection) also detaches the set from
    /// any lists holding it.
    ///
    /// # Arguments
    ///
    /// * `name` - The prefixed name of the set to delete
    /// * `option` - Whether live references block the delete
    pub fn delete_ipset(&mut self, name: &str, option: DeleteOption) {
        let Some(set) = self.sets.get(name) else {
            return;
        };
        if option == DeleteOption::Soft && !set.can_delete() {
            return;
        }
        if option == DeleteOption::Force {
            // detach the set from any lists still holding it
            let holders: Vec<String> = set.list_references.iter().cloned().collect();
            for holder in holders {
                if let Some(list) = self.sets.get_mut(&holder) {
                    list.member_sets.remove(name);
                    self.dirty.mark_set_dirty(&holder);
                }
            }
        }
        // the set is gone from memory the moment we commit to deleting it
        let set = self.sets.remove(name).unwrap();
        self.deleted_objects.insert(name.to_owned(), set.generation);
        self.dirty.mark_set_deleted(name);
        event!(Level::DEBUG, set = %name, "deleted ipset from cache");
    }

    /// Add a pod member to several hash sets, creating them as needed
    ///
    /// Assigning an IP that another pod owned overwrites the old owner.
    ///
    /// # Arguments
    ///
    /// * `metas` - The hash sets to add the member to
    /// * `pod` - The member to add
    pub fn add_to_sets(&mut self, metas: &[IpSetMetadata], pod: &PodMetadata) -> Result<(), Error> {
        pod.validate_ipv4()?;
        // a pod IP belongs to exactly one pod: purge the member everywhere a
        // different pod still owns it
        if !pod.pod_key.is_empty() {
            let mut purged = Vec::new();
            for (name, set) in &mut self.sets {
                if let Some(cached) = set.members.get(&pod.ip) {
                    if !cached.pod_key.is_empty() && cached.pod_key != pod.pod_key {
                        set.members.remove(&pod.ip);
                        purged.push(name.clone());
                    }
                }
            }
            for name in purged {
                event!(Level::DEBUG, set = %name, ip = %pod.ip, "purged reassigned member");
                self.dirty.mark_set_dirty(&name);
            }
        }
        for meta in metas {
            if meta.kind() != SetKind::Hash {
                return Err(Error::validation(format!(
                    "cannot add an IP to list set {}",
                    meta.prefixed_name()
                )));
            }
            self.create_ipset(meta);
            let name = meta.prefixed_name();
            let set = self.sets.get_mut(&name).unwrap();
            set.members.insert(pod.ip.clone(), pod.clone());
            self.dirty.mark_set_dirty(&name);
        }
        Ok(())
    }

    /// Remove a pod member from several hash sets
    ///
    /// A remove whose cached owner differs from the caller is a stale delete
    /// and is ignored.
    ///
    /// # Arguments
    ///
    /// * `metas` - The hash sets to remove the member from
    /// * `pod` - The member to remove
    pub fn remove_from_sets(
        &mut self,
        metas: &[IpSetMetadata],
        pod: &PodMetadata,
    ) -> Result<(), Error> {
        for meta in metas {
            if meta.kind() != SetKind::Hash {
                return Err(Error::validation(format!(
                    "cannot remove an IP from list set {}",
                    meta.prefixed_name()
                )));
            }
            let name = meta.prefixed_name();
            let Some(set) = self.sets.get_mut(&name) else {
                continue;
            };
            match set.members.get(&pod.ip) {
                // only the current owner may remove its member
                Some(cached) if cached.pod_key == pod.pod_key => {
                    set.members.remove(&pod.ip);
                    self.dirty.mark_set_dirty(&name);
                }
                Some(cached) => {
                    event!(
                        Level::DEBUG,
                        set = %name,
                        ip = %pod.ip,
                        owner = %cached.pod_key,
                        stale = %pod.pod_key,
                        "ignored stale member delete"
                    );
                }
                None => (),
            }
        }
        Ok(())
    }

    /// Add member sets to several lists, creating everything as needed
    ///
    /// Lists cannot nest inside other lists.
    ///
    /// # Arguments
    ///
    /// * `lists` - The lists to extend
    /// * `members` - The sets to add to each list
    pub fn add_to_lists(
        &mut self,
        lists: &[IpSetMetadata],
        members: &[IpSetMetadata],
    ) -> Result<(), Error> {
        for list in lists {
            if list.kind() != SetKind::List {
                return Err(Error::validation(format!(
                    "{} is not a list set",
                    list.prefixed_name()
                )));
            }
            for member in members {
                if member.kind() == SetKind::List {
                    return Err(Error::validation(format!(
                        "cannot nest list {} inside list {}",
                        member.prefixed_name(),
                        list.prefixed_name()
                    )));
                }
            }
        }
        for list in lists {
            self.create_ipset(list);
            let list_name = list.prefixed_name();
            for member in members {
                self.create_ipset(member);
                let member_name = member.prefixed_name();
                // wire both directions of the membership by name
                self.sets
                    .get_mut(&list_name)
                    .unwrap()
                    .member_sets
                    .insert(member_name.clone(), member.clone());
                self.sets
                    .get_mut(&member_name)
                    .unwrap()
                    .list_references
                    .insert(list_name.clone());
                self.dirty.mark_set_dirty(&member_name);
            }
            self.dirty.mark_set_dirty(&list_name);
        }
        Ok(())
    }

    /// Remove member sets from several lists
    ///
    /// # Arguments
    ///
    /// * `lists` - The lists to shrink
    /// * `members` - The sets to remove from each list
    pub fn remove_from_lists(
        &mut self,
        lists: &[IpSetMetadata],
        members: &[IpSetMetadata],
    ) -> Result<(), Error> {
        for list in lists {
            let list_name = list.prefixed_name();
            if !self.sets.contains_key(&list_name) {
                continue;
            }
            for member in members {
                let member_name = member.prefixed_name();
                if let Some(list_set) = self.sets.get_mut(&list_name) {
                    list_set.member_sets.remove(&member_name);
                }
                if let Some(member_set) = self.sets.get_mut(&member_name) {
                    member_set.list_references.remove(&list_name);
                    self.dirty.mark_set_dirty(&member_name);
                }
            }
            self.dirty.mark_set_dirty(&list_name);
        }
        Ok(())
    }

    /// Record that a referrer holds a set alive
    ///
    /// # Arguments
    ///
    /// * `name` - The prefixed name of the referenced set
    /// * `referrer` - The policy key or list name doing the referencing
    /// * `kind` - Why the referrer holds the set
    pub fn add_reference(
        &mut self,
        name: &str,
        referrer: &str,
        kind: ReferenceKind,
    ) -> Result<(), Error> {
        let Some(set) = self.sets.get_mut(name) else {
            return Err(Error::validation(format!(
                "cannot reference missing set {name}"
            )));
        };
        match kind {
            ReferenceKind::List => set.list_references.insert(referrer.to_owned()),
            ReferenceKind::Selector | ReferenceKind::NetPol => {
                set.netpol_references.insert(referrer.to_owned())
            }
        };
        Ok(())
    }

    /// Drop a referrer's hold on a set
    ///
    /// # Arguments
    ///
    /// * `name` - The prefixed name of the referenced set
    /// * `referrer` - The policy key or list name dropping its hold
    /// * `kind` - Why the referrer held the set
    pub fn delete_reference(&mut self, name: &str, referrer: &str, kind: ReferenceKind) {
        if let Some(set) = self.sets.get_mut(name) {
            match kind {
                ReferenceKind::List => set.list_references.remove(referrer),
                ReferenceKind::Selector | ReferenceKind::NetPol => {
                    set.netpol_references.remove(referrer)
                }
            };
        }
    }

    /// Create a translated set and install its literal or nested members
    ///
    /// # Arguments
    ///
    /// * `translated` - The translated set from a policy
    pub fn populate_translated(&mut self, translated: &TranslatedIpSet) -> Result<(), Error> {
        let Some(meta) = &translated.metadata else {
            return Ok(());
        };
        self.create_ipset(meta);
        let name = meta.prefixed_name();
        // literal members (CIDR entries, ip,port pairs) have no owning pod
        if !translated.members.is_empty() {
            let set = self.sets.get_mut(&name).unwrap();
            for member in &translated.members {
                set.members
                    .insert(member.clone(), PodMetadata::new(member.clone(), "", ""));
            }
            self.dirty.mark_set_dirty(&name);
        }
        if !translated.member_sets.is_empty() {
            self.add_to_lists(std::slice::from_ref(meta), &translated.member_sets)?;
        }
        Ok(())
    }

    /// Resolve a set down to the plain IPs it matches
    ///
    /// Lists resolve to the union of their member sets.
    ///
    /// # Arguments
    ///
    /// * `name` - The prefixed name of the set to resolve
    pub fn resolve_ips(&self, name: &str) -> HashSet<String> {
        let mut ips = HashSet::default();
        let Some(set) = self.sets.get(name) else {
            return ips;
        };
        match set.kind() {
            SetKind::Hash => {
                // strip any ,port suffix down to the bare address
                ips.extend(
                    set.members
                        .keys()
                        .map(|member| member.split(',').next().unwrap_or(member).to_owned()),
                );
            }
            SetKind::List => {
                for member in set.member_sets.keys() {
                    ips.extend(self.resolve_ips(member));
                }
            }
        }
        ips
    }

    /// Get the IPs that are members of every one of the given sets
    ///
    /// # Arguments
    ///
    /// * `names` - The prefixed names of the sets to intersect
    pub fn ips_satisfying_all(&self, names: &[String]) -> HashSet<String> {
        let mut names = names.iter();
        let Some(first) = names.next() else {
            return HashSet::default();
        };
        let mut ips = self.resolve_ips(first);
        for name in names {
            let other = self.resolve_ips(name);
            ips.retain(|ip| other.contains(ip));
        }
        ips
    }

    /// Whether one IP is a member of every one of the given sets
    ///
    /// # Arguments
    ///
    /// * `names` - The prefixed names of the selector sets
    /// * `ip` - The IP to check
    pub fn ip_satisfies_all(&self, names: &[String], ip: &str) -> bool {
        !names.is_empty() && names.iter().all(|name| self.resolve_ips(name).contains(ip))
    }

    /// Drop label sets that have no members and no references left
    ///
    /// Namespace sets and the implicit sets are never collected.
    pub fn garbage_collect(&mut self) -> usize {
        let doomed: Vec<String> = self
            .sets
            .values()
            .filter(|set| {
                matches!(
                    set.metadata.set_type,
                    SetType::KeyLabelOfPod
                        | SetType::KeyValueLabelOfPod
                        | SetType::NestedLabelOfPod
                        | SetType::NamedPorts
                        | SetType::KeyLabelOfNamespace
                        | SetType::KeyValueLabelOfNamespace
                )
            })
            .filter(|set| set.metadata.prefixed_name() != ALL_NAMESPACES)
            .filter(|set| set.is_empty() && set.can_delete())
            .map(|set| set.metadata.prefixed_name())
            .collect();
        let count = doomed.len();
        for name in doomed {
            self.delete_ipset(&name, DeleteOption::Soft);
        }
        count
    }

    /// Snapshot the dirty sets for an apply
    ///
    /// Returns the sets to create or update and the names to remove.
    pub fn to_apply(&self) -> (Vec<IpSetSnapshot>, Vec<String>) {
        let mut to_update: Vec<IpSetSnapshot> = self
            .dirty
            .to_add_or_update_sets
            .iter()
            .filter_map(|name| self.sets.get(name))
            .map(ControllerIpSet::snapshot)
            .collect();
        // order the snapshots so members always precede the lists holding them
        to_update.sort_by_key(|snapshot| {
            snapshot
                .metadata
                .as_ref()
                .map_or(0, |meta| match meta.kind() {
                    SetKind::Hash => 0,
                    SetKind::List => 1,
                })
        });
        let to_delete = self.dirty.to_delete_sets.iter().cloned().collect();
        (to_update, to_delete)
    }

    /// Forget the dirty set state after a successful apply
    pub fn clear_dirty(&mut self) {
        self.dirty.clear_sets();
    }

    /// Put a deferred platform delete back in the dirty cache
    ///
    /// # Arguments
    ///
    /// * `name` - The prefixed name whose platform delete must be retried
    pub fn remark_deleted(&mut self, name: &str) {
        self.dirty.mark_set_deleted(name);
    }

    /// Replay a controller snapshot of one set into this graph
    ///
    /// The snapshot wins wholesale: membership is replaced and the generation
    /// only ever moves forward.
    ///
    /// # Arguments
    ///
    /// * `snapshot` - The set snapshot from the controller
    pub fn apply_snapshot(&mut self, snapshot: &IpSetSnapshot) -> Result<(), Error> {
        let Some(meta) = &snapshot.metadata else {
            return Err(Error::validation("set snapshot without metadata"));
        };
        self.create_ipset(meta);
        let name = meta.prefixed_name();
        // detach any members the snapshot no longer carries
        if meta.kind() == SetKind::List {
            let fresh: HashSet<String> = snapshot
                .member_sets
                .iter()
                .map(IpSetMetadata::prefixed_name)
                .collect();
            let stale: Vec<String> = self.sets[&name]
                .member_sets
                .keys()
                .filter(|member| !fresh.contains(*member))
                .cloned()
                .collect();
            for member in stale {
                if let Some(member_set) = self.sets.get_mut(&member) {
                    member_set.list_references.remove(&name);
                }
                self.sets.get_mut(&name).unwrap().member_sets.remove(&member);
            }
            for member in &snapshot.member_sets {
                self.add_to_lists(std::slice::from_ref(meta), std::slice::from_ref(member))?;
            }
        } else {
            let set = self.sets.get_mut(&name).unwrap();
            set.members = snapshot
                .members
                .iter()
                .map(|pod| (pod.ip.clone(), pod.clone()))
                .collect();
        }
        let set = self.sets.get_mut(&name).unwrap();
        set.generation = set.generation.max(snapshot.generation);
        self.dirty.mark_set_dirty(&name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Shorthand for pod metadata
    fn pod(ip: &str, key: &str) -> PodMetadata {
        PodMetadata::new(ip, key, "node-1")
    }

    /// Shorthand for set metadata
    fn meta(name: &str, set_type: SetType) -> IpSetMetadata {
        IpSetMetadata::new(name, set_type)
    }

    #[test]
    fn generations_climb_across_recreation() {
        let mut mgr = IpSetManager::new();
        let ns = meta("x", SetType::Namespace);
        mgr.create_ipset(&ns);
        assert_eq!(mgr.get("ns-x").unwrap().generation, 1);
        mgr.delete_ipset("ns-x", DeleteOption::Soft);
        assert!(!mgr.exists("ns-x"));
        mgr.create_ipset(&ns);
        assert_eq!(mgr.get("ns-x").unwrap().generation, 2);
    }

    #[test]
    fn ip_reassignment_overwrites_and_stale_deletes_noop() {
        let mut mgr = IpSetManager::new();
        let ns = meta("x", SetType::Namespace);
        mgr.add_to_sets(std::slice::from_ref(&ns), &pod("10.0.0.1", "x/a")).unwrap();
        // pod b takes over the same IP
        mgr.add_to_sets(std::slice::from_ref(&ns), &pod("10.0.0.1", "x/b")).unwrap();
        assert_eq!(mgr.get("ns-x").unwrap().members["10.0.0.1"].pod_key, "x/b");
        // the old owner's delete arrives late and must be ignored
        mgr.remove_from_sets(std::slice::from_ref(&ns), &pod("10.0.0.1", "x/a")).unwrap();
        assert!(mgr.get("ns-x").unwrap().members.contains_key("10.0.0.1"));
        // the real owner's delete works
        mgr.remove_from_sets(std::slice::from_ref(&ns), &pod("10.0.0.1", "x/b")).unwrap();
        assert!(mgr.get("ns-x").unwrap().members.is_empty());
    }

    #[test]
    fn non_ipv4_members_are_refused() {
        let mut mgr = IpSetManager::new();
        let ns = meta("x", SetType::Namespace);
        let out = mgr.add_to_sets(std::slice::from_ref(&ns), &pod("fd00::1", "x/a"));
        assert!(matches!(out, Err(Error::Validation(_))));
    }

    #[test]
    fn lists_cannot_nest_lists() {
        let mut mgr = IpSetManager::new();
        let outer = meta("team", SetType::KeyLabelOfNamespace);
        let inner = meta("other", SetType::KeyLabelOfNamespace);
        let out = mgr.add_to_lists(std::slice::from_ref(&outer), std::slice::from_ref(&inner));
        assert!(matches!(out, Err(Error::Validation(_))));
    }

    #[test]
    fn references_gate_soft_deletes() {
        let mut mgr = IpSetManager::new();
        let list = meta("team", SetType::KeyLabelOfNamespace);
        let member = meta("x", SetType::Namespace);
        mgr.add_to_lists(std::slice::from_ref(&list), std::slice::from_ref(&member)).unwrap();
        // the namespace set is held by the list so a soft delete is a no-op
        mgr.delete_ipset("ns-x", DeleteOption::Soft);
        assert!(mgr.exists("ns-x"));
        mgr.remove_from_lists(std::slice::from_ref(&list), std::slice::from_ref(&member)).unwrap();
        mgr.delete_ipset("ns-x", DeleteOption::Soft);
        assert!(!mgr.exists("ns-x"));
    }

    #[test]
    fn force_deletes_detach_from_lists() {
        let mut mgr = IpSetManager::new();
        let list = meta("team", SetType::KeyLabelOfNamespace);
        let member = meta("x", SetType::Namespace);
        mgr.add_to_lists(std::slice::from_ref(&list), std::slice::from_ref(&member)).unwrap();
        mgr.delete_ipset("ns-x", DeleteOption::Force);
        assert!(!mgr.exists("ns-x"));
        assert!(mgr.get("nslabel-team").unwrap().member_sets.is_empty());
    }

    #[test]
    fn dirty_buckets_stay_disjoint() {
        let mut mgr = IpSetManager::new();
        let ns = meta("x", SetType::Namespace);
        mgr.create_ipset(&ns);
        mgr.delete_ipset("ns-x", DeleteOption::Soft);
        assert!(mgr.dirty().to_delete_sets.contains("ns-x"));
        assert!(!mgr.dirty().to_add_or_update_sets.contains("ns-x"));
        // re-creating moves the set back to the add bucket
        mgr.create_ipset(&ns);
        assert!(!mgr.dirty().to_delete_sets.contains("ns-x"));
        assert!(mgr.dirty().to_add_or_update_sets.contains("ns-x"));
    }

    #[test]
    fn reference_counts_match_holders() {
        let mut mgr = IpSetManager::new();
        let label = meta("k1:v1", SetType::KeyValueLabelOfPod);
        mgr.create_ipset(&label);
        mgr.add_reference("podlabel-k1:v1", "x/base", ReferenceKind::Selector).unwrap();
        mgr.add_reference("podlabel-k1:v1", "x/other", ReferenceKind::NetPol).unwrap();
        assert_eq!(mgr.get("podlabel-k1:v1").unwrap().netpol_references.len(), 2);
        mgr.delete_reference("podlabel-k1:v1", "x/base", ReferenceKind::Selector);
        assert_eq!(mgr.get("podlabel-k1:v1").unwrap().netpol_references.len(), 1);
        // referencing a missing set is a validation error
        let out = mgr.add_reference("podlabel-missing", "x/base", ReferenceKind::Selector);
        assert!(matches!(out, Err(Error::Validation(_))));
    }

    #[test]
    fn garbage_collection_spares_namespaces() {
        let mut mgr = IpSetManager::new();
        mgr.create_ipset(&IpSetMetadata::all_namespaces());
        let ns = meta("x", SetType::Namespace);
        let key = meta("k1", SetType::KeyLabelOfPod);
        let pair = meta("k1:v1", SetType::KeyValueLabelOfPod);
        mgr.add_to_sets(&[ns.clone(), key, pair], &pod("10.0.0.1", "x/a")).unwrap();
        mgr.remove_from_sets(
            &[
                meta("x", SetType::Namespace),
                meta("k1", SetType::KeyLabelOfPod),
                meta("k1:v1", SetType::KeyValueLabelOfPod),
            ],
            &pod("10.0.0.1", "x/a"),
        )
        .unwrap();
        let collected = mgr.garbage_collect();
        assert_eq!(collected, 2);
        assert!(!mgr.exists("podlabel-k1"));
        assert!(!mgr.exists("podlabel-k1:v1"));
        // namespace sets and the implicit list survive
        assert!(mgr.exists("ns-x"));
        assert!(mgr.exists(ALL_NAMESPACES));
    }

    #[test]
    fn selector_resolution_intersects_sets() {
        let mut mgr = IpSetManager::new();
        let ns = meta("x", SetType::Namespace);
        let pair = meta("k1:v1", SetType::KeyValueLabelOfPod);
        mgr.add_to_sets(&[ns.clone(), pair.clone()], &pod("10.0.0.1", "x/a")).unwrap();
        mgr.add_to_sets(std::slice::from_ref(&ns), &pod("10.0.0.2", "x/b")).unwrap();
        let both = vec!["ns-x".to_owned(), "podlabel-k1:v1".to_owned()];
        let ips = mgr.ips_satisfying_all(&both);
        assert_eq!(ips.len(), 1);
        assert!(ips.contains("10.0.0.1"));
        assert!(mgr.ip_satisfies_all(&both, "10.0.0.1"));
        assert!(!mgr.ip_satisfies_all(&both, "10.0.0.2"));
    }

    #[test]
    fn applies_order_hash_sets_before_lists() {
        let mut mgr = IpSetManager::new();
        let list = meta("team", SetType::KeyLabelOfNamespace);
        let member = meta("x", SetType::Namespace);
        mgr.add_to_lists(std::slice::from_ref(&list), std::slice::from_ref(&member)).unwrap();
        let (to_update, to_delete) = mgr.to_apply();
        assert!(to_delete.is_empty());
        assert_eq!(to_update.len(), 2);
        assert_eq!(to_update[0].metadata.as_ref().unwrap().kind(), SetKind::Hash);
        assert_eq!(to_update[1].metadata.as_ref().unwrap().kind(), SetKind::List);
    }
}

//! The structure for namespaces

use std::collections::BTreeMap;

use super::ipsets::{IpSetMetadata, SetType};

/// The namespace state the namespace controller caches
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct NpmNamespace {
    /// The name of this namespace
    pub name: String,
    /// The labels on this namespace
    pub labels: BTreeMap<String, String>,
}

impl NpmNamespace {
    /// Create a new cached namespace
    ///
    /// # Arguments
    ///
    /// * `name` - The name of this namespace
    /// * `labels` - The labels on this namespace
    pub fn new<T: Into<String>>(name: T, labels: BTreeMap<String, String>) -> Self {
        NpmNamespace {
            name: name.into(),
            labels,
        }
    }

    /// Get the metadata of this namespace's hash set
    pub fn set_metadata(&self) -> IpSetMetadata {
        IpSetMetadata::new(&self.name, SetType::Namespace)
    }

    /// Get the label list sets this namespace's set belongs in
    ///
    /// Each label key yields one list and each key:value pair another.
    pub fn label_lists(&self) -> Vec<IpSetMetadata> {
        let mut lists = Vec::with_capacity(self.labels.len() * 2);
        for (key, value) in &self.labels {
            lists.push(IpSetMetadata::new(key, SetType::KeyLabelOfNamespace));
            lists.push(IpSetMetadata::new(
                format!("{key}:{value}"),
                SetType::KeyValueLabelOfNamespace,
            ));
        }
        lists
    }

    /// Diff this namespace's label lists against a fresh label map
    ///
    /// Returns the lists to leave and the lists to join, in that order.
    ///
    /// # Arguments
    ///
    /// * `fresh` - The labels from the incoming event
    pub fn compare_label_lists(
        &self,
        fresh: &BTreeMap<String, String>,
    ) -> (Vec<IpSetMetadata>, Vec<IpSetMetadata>) {
        let fresh_ns = NpmNamespace::new(&self.name, fresh.clone());
        let current = self.label_lists();
        let wanted = fresh_ns.label_lists();
        let to_leave = current
            .iter()
            .filter(|list| !wanted.contains(list))
            .cloned()
            .collect();
        let to_join = wanted
            .iter()
            .filter(|list| !current.contains(list))
            .cloned()
            .collect();
        (to_leave, to_join)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_lists_cover_keys_and_pairs() {
        let mut labels = BTreeMap::new();
        labels.insert("team".to_owned(), "red".to_owned());
        let ns = NpmNamespace::new("x", labels);
        let lists = ns.label_lists();
        assert_eq!(lists.len(), 2);
        assert_eq!(lists[0].prefixed_name(), "nslabel-team");
        assert_eq!(lists[1].prefixed_name(), "nslabel-team:red");
    }

    #[test]
    fn compare_label_lists_diffs_both_ways() {
        let mut old = BTreeMap::new();
        old.insert("team".to_owned(), "red".to_owned());
        let ns = NpmNamespace::new("x", old);
        let mut fresh = BTreeMap::new();
        fresh.insert("team".to_owned(), "blue".to_owned());
        let (to_leave, to_join) = ns.compare_label_lists(&fresh);
        // the key list is shared so only the pair lists differ
        assert_eq!(to_leave.len(), 1);
        assert_eq!(to_leave[0].prefixed_name(), "nslabel-team:red");
        assert_eq!(to_join.len(), 1);
        assert_eq!(to_join[0].prefixed_name(), "nslabel-team:blue");
    }
}

//! The structure for IP sets
//!
//! An IP set is a named collection of IPs (a hash set) or of other sets (a
//! list set) used as a match condition in packet filter rules. Sets are
//! identified by a canonical prefixed name; the kernel and HNS see a short
//! hashed form of that name instead.

use sha2::{Digest, Sha256};

/// The name of the implicit hash set every list keeps as a member
///
/// Platforms refuse to match against an empty list, so every list carries
/// this always empty member set.
pub const EMPTY_HASH_SET: &str = "emptyhashset";

/// The name of the implicit list holding every namespace set
pub const ALL_NAMESPACES: &str = "all-namespaces";

/// The prefix kernel/HNS identifiers are built under
const HASHED_PREFIX: &str = "azure-npm-";

/// The kinds of sets a platform can hold
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SetKind {
    /// Members are IP or IP,port strings
    Hash,
    /// Members are other sets
    List,
}

/// The types of IP sets the controllers maintain
#[derive(
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
)]
pub enum SetType {
    /// All pod IPs in one namespace
    Namespace,
    /// The namespace sets whose namespace carries a label key
    KeyLabelOfNamespace,
    /// The namespace sets whose namespace carries a key=value label
    KeyValueLabelOfNamespace,
    /// All pod IPs carrying a label key
    KeyLabelOfPod,
    /// All pod IPs carrying a key=value label
    KeyValueLabelOfPod,
    /// The pod label sets a multi value selector expands to
    NestedLabelOfPod,
    /// All IP,port members backing a named container port
    NamedPorts,
    /// Literal CIDR members from a policy rule
    CidrBlocks,
    /// The always empty member set
    EmptyHashSet,
}

impl SetType {
    /// Get the kind of set this type is backed by
    ///
    /// Pod label sets hold pod IPs directly; namespace label sets hold
    /// namespace sets, and nested pod label sets hold pod label sets.
    pub fn kind(&self) -> SetKind {
        match self {
            SetType::Namespace
            | SetType::KeyLabelOfPod
            | SetType::KeyValueLabelOfPod
            | SetType::NamedPorts
            | SetType::CidrBlocks
            | SetType::EmptyHashSet => SetKind::Hash,
            SetType::KeyLabelOfNamespace
            | SetType::KeyValueLabelOfNamespace
            | SetType::NestedLabelOfPod => SetKind::List,
        }
    }

    /// Get the prefix canonical names of this type are built under
    pub fn prefix(&self) -> &'static str {
        match self {
            SetType::Namespace => "ns-",
            SetType::KeyLabelOfNamespace | SetType::KeyValueLabelOfNamespace => "nslabel-",
            SetType::KeyLabelOfPod | SetType::KeyValueLabelOfPod => "podlabel-",
            SetType::NestedLabelOfPod => "nestedlabel-",
            SetType::NamedPorts => "namedport-",
            SetType::CidrBlocks => "cidr-",
            SetType::EmptyHashSet => "",
        }
    }
}

/// The identity of an IP set
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct IpSetMetadata {
    /// The unprefixed name of this set
    pub name: String,
    /// The type of this set
    pub set_type: SetType,
}

impl IpSetMetadata {
    /// Create new IP set metadata
    ///
    /// # Arguments
    ///
    /// * `name` - The unprefixed name of this set
    /// * `set_type` - The type of this set
    pub fn new<T: Into<String>>(name: T, set_type: SetType) -> Self {
        IpSetMetadata {
            name: name.into(),
            set_type,
        }
    }

    /// Get the metadata for the implicit empty hash set
    pub fn empty_hash_set() -> Self {
        IpSetMetadata::new(EMPTY_HASH_SET, SetType::EmptyHashSet)
    }

    /// Get the metadata for the implicit all namespaces list
    pub fn all_namespaces() -> Self {
        IpSetMetadata::new(ALL_NAMESPACES, SetType::KeyLabelOfNamespace)
    }

    /// Get the kind of set this metadata names
    pub fn kind(&self) -> SetKind {
        self.set_type.kind()
    }

    /// Get the canonical prefixed name of this set
    pub fn prefixed_name(&self) -> String {
        // the two implicit sets keep their bare names
        if self.name == ALL_NAMESPACES || self.set_type == SetType::EmptyHashSet {
            return self.name.clone();
        }
        format!("{}{}", self.set_type.prefix(), self.name)
    }

    /// Get the hashed identifier the kernel/HNS sees for this set
    pub fn hashed_name(&self) -> String {
        hashed_name(&self.prefixed_name())
    }
}

/// Hash a canonical set name down to its kernel/HNS identifier
///
/// # Arguments
///
/// * `prefixed_name` - The canonical prefixed name to hash
pub fn hashed_name(prefixed_name: &str) -> String {
    // hash the canonical name and keep a short stable prefix of the digest
    let digest = Sha256::digest(prefixed_name.as_bytes());
    format!("{}{}", HASHED_PREFIX, &hex::encode(digest)[..10])
}

/// A set a policy needs together with any literal or nested members
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct TranslatedIpSet {
    /// The identity of the set
    pub metadata: Option<IpSetMetadata>,
    /// Literal members for hash sets (CIDR entries, IP,port pairs)
    #[serde(default)]
    pub members: Vec<String>,
    /// Member sets for list sets
    #[serde(default)]
    pub member_sets: Vec<IpSetMetadata>,
}

impl TranslatedIpSet {
    /// Create a translated set with no literal members
    ///
    /// # Arguments
    ///
    /// * `metadata` - The identity of the set
    pub fn new(metadata: IpSetMetadata) -> Self {
        TranslatedIpSet {
            metadata: Some(metadata),
            members: Vec::default(),
            member_sets: Vec::default(),
        }
    }

    /// Create a translated set carrying literal members
    ///
    /// # Arguments
    ///
    /// * `metadata` - The identity of the set
    /// * `members` - The literal members the set must hold
    pub fn with_members(metadata: IpSetMetadata, members: Vec<String>) -> Self {
        TranslatedIpSet {
            metadata: Some(metadata),
            members,
            member_sets: Vec::default(),
        }
    }

    /// Create a translated list set carrying member sets
    ///
    /// # Arguments
    ///
    /// * `metadata` - The identity of the list
    /// * `member_sets` - The sets the list must hold
    pub fn with_member_sets(metadata: IpSetMetadata, member_sets: Vec<IpSetMetadata>) -> Self {
        TranslatedIpSet {
            metadata: Some(metadata),
            members: Vec::default(),
            member_sets,
        }
    }
}

/// How a set delete should treat live references
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeleteOption {
    /// Only delete the set if nothing references it
    #[default]
    Soft,
    /// Delete the set even if references remain (hydration garbage collection)
    Force,
}

/// Why a referrer holds a set alive
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    /// A policy selects pods through this set
    Selector,
    /// A policy names this set in a rule
    NetPol,
    /// A list set holds this set as a member
    List,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixed_names() {
        let ns = IpSetMetadata::new("x", SetType::Namespace);
        assert_eq!(ns.prefixed_name(), "ns-x");
        let label = IpSetMetadata::new("k1:v1", SetType::KeyValueLabelOfPod);
        assert_eq!(label.prefixed_name(), "podlabel-k1:v1");
        let key = IpSetMetadata::new("k1", SetType::KeyLabelOfPod);
        assert_eq!(key.prefixed_name(), "podlabel-k1");
        // the implicit sets keep their bare names
        assert_eq!(IpSetMetadata::empty_hash_set().prefixed_name(), "emptyhashset");
        assert_eq!(IpSetMetadata::all_namespaces().prefixed_name(), "all-namespaces");
    }

    #[test]
    fn kinds_follow_types() {
        assert_eq!(SetType::Namespace.kind(), SetKind::Hash);
        assert_eq!(SetType::CidrBlocks.kind(), SetKind::Hash);
        assert_eq!(SetType::KeyLabelOfPod.kind(), SetKind::Hash);
        assert_eq!(SetType::KeyValueLabelOfPod.kind(), SetKind::Hash);
        assert_eq!(SetType::KeyLabelOfNamespace.kind(), SetKind::List);
        assert_eq!(SetType::NestedLabelOfPod.kind(), SetKind::List);
    }

    #[test]
    fn hashed_names_are_stable_and_short() {
        let meta = IpSetMetadata::new("x", SetType::Namespace);
        let first = meta.hashed_name();
        assert_eq!(first, meta.hashed_name());
        assert!(first.starts_with("azure-npm-"));
        // ipset names must stay under the kernel's 31 char cap
        assert!(first.len() <= 31);
        // different sets must not collide on their short ids
        let other = IpSetMetadata::new("y", SetType::Namespace);
        assert_ne!(first, other.hashed_name());
    }
}

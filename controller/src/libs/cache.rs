//! The cache the pod and namespace controllers share
//!
//! Both controllers write namespace label lists, so one mutex guards both
//! maps. Sync paths call `apply_dataplane` before releasing the lock so every
//! controller sees its own writes land.

use std::collections::HashMap;

use warden::models::{NpmNamespace, NpmPod};

/// The pod and namespace state behind one shared mutex
#[derive(Debug, Default)]
pub struct SharedCache {
    /// Every tracked pod keyed by namespace/name
    pub pods: HashMap<String, NpmPod>,
    /// Every tracked namespace keyed by name
    pub namespaces: HashMap<String, NpmNamespace>,
}

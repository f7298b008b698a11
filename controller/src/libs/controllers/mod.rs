//! The watch driven reconcilers
//!
//! Each controller owns a reflector store as its lister, a rate limited
//! workqueue, and one worker loop. Sync paths flush the dataplane in a
//! deferred step so even an early error commits whatever progress was made,
//! and the sync and apply errors travel back to the workqueue together.

use tracing::{Level, event};

use warden::Error;

pub mod namespaces;
pub mod netpols;
pub mod pods;

pub use namespaces::NamespaceController;
pub use netpols::NetPolController;
pub use pods::PodController;

/// Get the namespace/name key of a watched object
///
/// # Arguments
///
/// * `obj` - The object to key
pub(crate) fn object_key<K: kube::Resource>(obj: &K) -> Option<String> {
    let name = obj.meta().name.clone()?;
    match &obj.meta().namespace {
        Some(namespace) => Some(format!("{namespace}/{name}")),
        None => Some(name),
    }
}

/// Fold a sync error and a deferred apply error into one
///
/// A permanent sync error stays permanent even when the flush also failed,
/// so the worker can still Forget the key; the apply failure is logged
/// instead of being folded into a generic wrapper.
///
/// # Arguments
///
/// * `sync` - The outcome of the sync itself
/// * `apply` - The outcome of the deferred dataplane flush
pub(crate) fn combine(sync: Result<(), Error>, apply: Result<(), Error>) -> Result<(), Error> {
    match (sync, apply) {
        (Ok(()), Ok(())) => Ok(()),
        (Err(sync), Ok(())) => Err(sync),
        (Ok(()), Err(apply)) => Err(apply),
        (Err(sync), Err(apply)) if sync.is_permanent() => {
            event!(Level::WARN, error = %apply, "apply also failed behind a permanent sync error");
            Err(sync)
        }
        (Err(sync), Err(apply)) => Err(Error::new(format!("{sync}; apply also failed: {apply}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_errors_keep_both_messages() {
        let out = combine(
            Err(Error::new("sync broke")),
            Err(Error::transient("apply broke")),
        );
        let msg = out.unwrap_err().to_string();
        assert!(msg.contains("sync broke"));
        assert!(msg.contains("apply broke"));
        assert!(combine(Ok(()), Ok(())).is_ok());
    }

    #[test]
    fn permanent_sync_errors_survive_apply_failures() {
        // an unsupported policy feature must stay Forgettable even when the
        // deferred flush breaks in the same pass
        let out = combine(
            Err(Error::unsupported("SCTP is not supported on Windows")),
            Err(Error::transient("apply broke")),
        );
        let error = out.unwrap_err();
        assert!(error.is_permanent());
        assert!(matches!(error, Error::Unsupported(_)));
        let out = combine(
            Err(Error::validation("10.0.0.1,8080 is not a usable IPv4 member")),
            Err(Error::transient("apply broke")),
        );
        assert!(out.unwrap_err().is_permanent());
    }
}

//! Finalizer handling for managed objects
//!
//! The finalizer keeps a managed object around after deletion is requested
//! until every resource has run its finalization. Both helpers are sub-steps:
//! their result is demoted before it becomes the enclosing step's result.

use kube::ResourceExt;
use tracing::info;

use super::handle::{ManagedHandle, ManagedObject};
use super::result::StepResult;
use crate::client::{ignore_not_found, ObjectStore};

/// Finalizer name used to protect managed objects
pub const STEWARD_FINALIZER: &str = "steward.dev/finalizer";

/// Add the finalizer if not present
pub async fn add_finalizer<K: ManagedObject>(
    handle: &mut ManagedHandle<K>,
    store: &dyn ObjectStore,
    finalizer: &str,
) -> StepResult {
    if handle.has_finalizer(finalizer) {
        return StepResult::Success;
    }
    handle
        .object_mut()
        .finalizers_mut()
        .push(finalizer.to_string());
    match handle.patch(store).await {
        Ok(_) => {
            info!("Added finalizer to {} {}", K::kind(&()), handle.key());
            StepResult::Success
        }
        Err(e) => StepResult::Error(e),
    }
}

/// Remove the finalizer once cleanup is complete
///
/// Once it is gone the API server completes the deletion. A managed object
/// that vanished in the meantime counts as done.
pub async fn remove_finalizer<K: ManagedObject>(
    handle: &mut ManagedHandle<K>,
    store: &dyn ObjectStore,
    finalizer: &str,
) -> StepResult {
    if !handle.has_finalizer(finalizer) {
        return StepResult::Stop;
    }
    handle.object_mut().finalizers_mut().retain(|f| f != finalizer);
    match ignore_not_found(handle.patch(store).await) {
        Ok(_) => {
            info!("Removed finalizer from {} {}", K::kind(&()), handle.key());
            StepResult::Success
        }
        Err(e) => StepResult::Error(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::Op;
    use crate::client::MemoryStore;
    use crate::controller::test_support::bundle;
    use crate::crd::Bundle;

    #[test]
    fn test_finalizer_name() {
        assert_eq!(STEWARD_FINALIZER, "steward.dev/finalizer");
    }

    #[tokio::test]
    async fn test_add_finalizer_patches_once() {
        let store = MemoryStore::new();
        let obj = bundle("demo", "demo-config");
        store.insert(&obj).unwrap();
        let mut handle = ManagedHandle::new(obj);

        assert!(add_finalizer(&mut handle, &store, STEWARD_FINALIZER)
            .await
            .is_success());
        let stored: Bundle = store.object(&handle.key()).unwrap();
        assert!(stored.finalizers().iter().any(|f| f == STEWARD_FINALIZER));

        let stored_handle = &mut ManagedHandle::new(stored);
        assert!(add_finalizer(stored_handle, &store, STEWARD_FINALIZER)
            .await
            .is_success());
        assert_eq!(store.count(Op::Patch, "Bundle"), 1);
    }

    #[tokio::test]
    async fn test_remove_missing_finalizer_is_step_scoped_stop() {
        let store = MemoryStore::new();
        let mut handle = ManagedHandle::new(bundle("demo", "demo-config"));
        let result = remove_finalizer(&mut handle, &store, STEWARD_FINALIZER).await;
        assert!(matches!(result, StepResult::Stop));
        assert_eq!(store.count(Op::Patch, "Bundle"), 0);
    }
}

//! Managed object handle
//!
//! Holds the in-progress copy of the reconciled object together with the
//! clean snapshot captured when it was loaded. Every patch sent for the
//! managed object is a merge diff against that snapshot.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use serde_json::Value;
use tracing::debug;

use super::conditions;
use crate::client::{merge, patch_status_typed, patch_typed, ObjectKey, ObjectStore, RemoteObject};
use crate::crd::Condition;
use crate::error::Result;

/// Capabilities the engine needs from a managed (primary) object kind
pub trait ManagedObject: RemoteObject {
    fn conditions(&self) -> &[Condition];

    /// Mutable access to status conditions, creating the status if needed
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;

    fn set_observed_generation(&mut self, _generation: Option<i64>) {}
}

/// True if the object carries the pause label with value "true"
pub fn is_paused(meta: &ObjectMeta, label: &str) -> bool {
    meta.labels
        .as_ref()
        .and_then(|l| l.get(label))
        .map(|v| v == "true")
        .unwrap_or(false)
}

pub struct ManagedHandle<K> {
    object: K,
    clean: K,
    status_requested: bool,
}

impl<K: ManagedObject> ManagedHandle<K> {
    pub fn new(object: K) -> Self {
        Self {
            clean: object.clone(),
            object,
            status_requested: false,
        }
    }

    pub fn object(&self) -> &K {
        &self.object
    }

    pub fn object_mut(&mut self) -> &mut K {
        &mut self.object
    }

    /// The snapshot taken when the object was loaded
    pub fn clean(&self) -> &K {
        &self.clean
    }

    /// Replace the primary object; the clean snapshot is retaken
    pub fn set_object(&mut self, object: K) {
        self.clean = object.clone();
        self.object = object;
        self.status_requested = false;
    }

    pub fn into_inner(self) -> K {
        self.object
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::from_meta(self.object.meta())
    }

    pub fn is_being_deleted(&self) -> bool {
        self.object.meta().deletion_timestamp.is_some()
    }

    pub fn is_paused(&self, label: &str) -> bool {
        is_paused(self.object.meta(), label)
    }

    pub fn generation(&self) -> Option<i64> {
        self.object.meta().generation
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.object.finalizers().iter().any(|f| f == finalizer)
    }

    /// Set a condition stamped with the current generation and request a status patch
    pub fn set_condition(&mut self, condition: Condition) {
        let condition = condition.with_observed_generation(self.generation());
        if conditions::set_condition(self.object.conditions_mut(), condition) {
            self.status_requested = true;
        }
    }

    /// Remove a condition and request a status patch if it was present
    pub fn remove_condition(&mut self, type_: &str) {
        let present = conditions::find_condition(self.object.conditions(), type_).is_some();
        if present && conditions::remove_condition(self.object.conditions_mut(), type_) {
            self.status_requested = true;
        }
    }

    pub fn request_status_patch(&mut self) {
        self.status_requested = true;
    }

    pub fn status_requested(&self) -> bool {
        self.status_requested
    }

    fn diff(&self) -> Result<Option<Value>> {
        let clean = serde_json::to_value(&self.clean)?;
        let current = serde_json::to_value(&self.object)?;
        Ok(merge::diff(&clean, &current))
    }

    /// Status-only merge patch against the clean snapshot
    pub fn status_patch(&self) -> Result<Option<Value>> {
        Ok(merge::select(self.diff()?, "status"))
    }

    /// Metadata/spec merge patch against the clean snapshot
    pub fn object_patch(&self) -> Result<Option<Value>> {
        Ok(merge::without(self.diff()?, "status"))
    }

    /// Send the status patch if one was requested and the status changed
    pub async fn flush_status(&mut self, store: &dyn ObjectStore) -> Result<bool> {
        if !self.status_requested {
            return Ok(false);
        }
        self.status_requested = false;
        let Some(patch) = self.status_patch()? else {
            return Ok(false);
        };
        debug!("Patching status of {} {}", K::kind(&()), self.key());
        patch_status_typed::<K>(store, &self.key(), &patch).await?;
        Ok(true)
    }

    /// Send the metadata/spec patch if the object differs from the snapshot
    pub async fn patch(&mut self, store: &dyn ObjectStore) -> Result<bool> {
        let Some(patch) = self.object_patch()? else {
            return Ok(false);
        };
        debug!("Patching {} {}", K::kind(&()), self.key());
        patch_typed::<K>(store, &self.key(), &patch).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::Op;
    use crate::client::MemoryStore;
    use crate::crd::{Bundle, BundleSpec, ConfigMapTemplate};
    use std::collections::BTreeMap;

    fn bundle() -> Bundle {
        let mut b = Bundle::new(
            "demo",
            BundleSpec {
                config_map: ConfigMapTemplate {
                    name: "demo-config".to_string(),
                    enabled: true,
                    data: BTreeMap::new(),
                },
                secret_ref: None,
            },
        );
        b.metadata.namespace = Some("default".to_string());
        b.metadata.generation = Some(3);
        b
    }

    #[test]
    fn test_clean_snapshot_is_not_mutated() {
        let mut handle = ManagedHandle::new(bundle());
        handle.set_condition(Condition::ready(false, "Waiting", "pending"));
        assert!(handle.clean().conditions().is_empty());
        assert_eq!(handle.object().conditions().len(), 1);
        assert_eq!(handle.object().conditions()[0].observed_generation, Some(3));
    }

    #[test]
    fn test_set_object_resets_snapshot() {
        let mut handle = ManagedHandle::new(bundle());
        handle.set_condition(Condition::ready(false, "Waiting", "pending"));
        let updated = handle.object().clone();
        handle.set_object(updated);
        assert_eq!(handle.clean().conditions().len(), 1);
        assert!(handle.status_patch().unwrap().is_none());
        assert!(!handle.status_requested());
    }

    #[test]
    fn test_status_and_object_patches_are_separated() {
        let mut handle = ManagedHandle::new(bundle());
        handle.set_condition(Condition::ready(true, "Reconciled", "ok"));
        handle
            .object_mut()
            .metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .push("steward.dev/finalizer".to_string());

        let status = handle.status_patch().unwrap().unwrap();
        assert!(status.get("status").is_some());
        assert!(status.get("metadata").is_none());

        let object = handle.object_patch().unwrap().unwrap();
        assert!(object.get("status").is_none());
        assert_eq!(object["metadata"]["finalizers"][0], "steward.dev/finalizer");
    }

    #[tokio::test]
    async fn test_flush_status_only_when_requested() {
        let store = MemoryStore::new();
        store.insert(&bundle()).unwrap();
        let mut handle = ManagedHandle::new(bundle());

        assert!(!handle.flush_status(&store).await.unwrap());
        assert_eq!(store.count(Op::PatchStatus, "Bundle"), 0);

        handle.set_condition(Condition::ready(true, "Reconciled", "ok"));
        assert!(handle.flush_status(&store).await.unwrap());
        assert_eq!(store.count(Op::PatchStatus, "Bundle"), 1);

        let stored: Bundle = store.object(&handle.key()).unwrap();
        assert_eq!(stored.conditions().len(), 1);
    }

    #[test]
    fn test_pause_label() {
        let mut b = bundle();
        assert!(!is_paused(&b.metadata, "steward.dev/paused"));
        b.metadata.labels = Some(BTreeMap::from([(
            "steward.dev/paused".to_string(),
            "true".to_string(),
        )]));
        assert!(is_paused(&b.metadata, "steward.dev/paused"));
    }
}

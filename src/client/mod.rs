//! Remote object store abstraction
//!
//! The engine never talks to `kube::Api` directly. Everything goes through
//! [`ObjectStore`], supplied at construction time, so the same reconcile code
//! runs against a live cluster ([`KubeStore`]) or in memory ([`MemoryStore`]).
//! All calls operate on one object at a time.

mod kube_store;
pub mod memory;
pub mod merge;

use std::fmt;

use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::core::{ObjectMeta, TypeMeta};
use kube::discovery::ApiResource;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};

pub use kube_store::KubeStore;
pub use memory::MemoryStore;

/// Namespaced identity of a remote object
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self {
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        }
    }

    pub fn namespaced(namespace: &str, name: &str) -> Self {
        Self::new(Some(namespace), name)
    }

    pub fn from_meta(meta: &ObjectMeta) -> Self {
        Self {
            namespace: meta.namespace.clone(),
            name: meta.name.clone().unwrap_or_default(),
        }
    }

    /// Parse `namespace/name` (or a bare cluster-scoped `name`)
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() => {
                Some(Self::namespaced(ns, name))
            }
            Some(_) => None,
            None => Some(Self::new(None, s)),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Get/Create/Patch/Delete against the remote API
///
/// Implementations map a missing object to [`Error::NotFound`]. Patches are
/// JSON merge patches (RFC 7386).
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, ar: &ApiResource, key: &ObjectKey) -> Result<DynamicObject>;

    async fn create(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject>;

    async fn patch(&self, ar: &ApiResource, key: &ObjectKey, patch: &Value)
        -> Result<DynamicObject>;

    async fn patch_status(
        &self,
        ar: &ApiResource,
        key: &ObjectKey,
        patch: &Value,
    ) -> Result<DynamicObject>;

    async fn delete(&self, ar: &ApiResource, key: &ObjectKey) -> Result<()>;
}

/// A statically typed kind the engine can read and write through a store
pub trait RemoteObject:
    Resource<DynamicType = ()>
    + Clone
    + fmt::Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<T> RemoteObject for T where
    T: Resource<DynamicType = ()>
        + Clone
        + fmt::Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// ApiResource for a statically typed kind
pub fn api_resource<K: Resource<DynamicType = ()>>() -> ApiResource {
    ApiResource::erase::<K>(&())
}

/// Convert a typed object into a `DynamicObject`, filling in type metadata
pub fn to_dynamic<K>(obj: &K) -> Result<DynamicObject>
where
    K: Resource<DynamicType = ()> + Serialize,
{
    let mut dynamic: DynamicObject = serde_json::from_value(serde_json::to_value(obj)?)?;
    if dynamic.types.is_none() {
        dynamic.types = Some(TypeMeta {
            api_version: K::api_version(&()).to_string(),
            kind: K::kind(&()).to_string(),
        });
    }
    Ok(dynamic)
}

/// Convert a `DynamicObject` back into its typed form
pub fn from_dynamic<K: DeserializeOwned>(obj: DynamicObject) -> Result<K> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

pub async fn get_typed<K>(store: &dyn ObjectStore, key: &ObjectKey) -> Result<K>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    from_dynamic(store.get(&api_resource::<K>(), key).await?)
}

pub async fn create_typed<K>(store: &dyn ObjectStore, obj: &K) -> Result<K>
where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
{
    from_dynamic(store.create(&api_resource::<K>(), &to_dynamic(obj)?).await?)
}

pub async fn patch_typed<K>(store: &dyn ObjectStore, key: &ObjectKey, patch: &Value) -> Result<K>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    from_dynamic(store.patch(&api_resource::<K>(), key, patch).await?)
}

pub async fn patch_status_typed<K>(
    store: &dyn ObjectStore,
    key: &ObjectKey,
    patch: &Value,
) -> Result<K>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    from_dynamic(store.patch_status(&api_resource::<K>(), key, patch).await?)
}

/// Delete a typed object, returning whether anything was deleted
pub async fn delete_typed<K>(store: &dyn ObjectStore, key: &ObjectKey) -> Result<bool>
where
    K: Resource<DynamicType = ()>,
{
    Ok(ignore_not_found(store.delete(&api_resource::<K>(), key).await)?.is_some())
}

/// Turn a not-found error into `Ok(None)`
pub fn ignore_not_found<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

pub(crate) fn not_found(ar: &ApiResource, key: &ObjectKey) -> Error {
    Error::not_found(ar.kind.clone(), key.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use std::collections::BTreeMap;

    #[test]
    fn test_object_key_parse_and_display() {
        let key = ObjectKey::parse("team-a/app").unwrap();
        assert_eq!(key, ObjectKey::namespaced("team-a", "app"));
        assert_eq!(key.to_string(), "team-a/app");

        let cluster = ObjectKey::parse("node-1").unwrap();
        assert_eq!(cluster.namespace, None);
        assert_eq!(cluster.to_string(), "node-1");

        assert!(ObjectKey::parse("").is_none());
        assert!(ObjectKey::parse("/name").is_none());
        assert!(ObjectKey::parse("ns/").is_none());
    }

    #[test]
    fn test_typed_dynamic_conversion_keeps_type_meta() {
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some("app".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([("k".to_string(), "v".to_string())])),
            ..Default::default()
        };

        let dynamic = to_dynamic(&cm).unwrap();
        let types = dynamic.types.clone().unwrap();
        assert_eq!(types.kind, "ConfigMap");
        assert_eq!(types.api_version, "v1");
        assert_eq!(dynamic.data["data"]["k"], "v");

        let back: ConfigMap = from_dynamic(dynamic).unwrap();
        assert_eq!(back.data.unwrap()["k"], "v");
    }

    #[test]
    fn test_ignore_not_found() {
        let missing: Result<()> = Err(Error::not_found("ConfigMap", "default/x"));
        assert!(ignore_not_found(missing).unwrap().is_none());

        let other: Result<()> = Err(Error::validation("nope"));
        assert!(ignore_not_found(other).is_err());
    }
}

//! Mapping changed objects back to managed-object reconcile requests

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;

use crate::client::ObjectKey;

/// Turns the metadata of a changed object into the keys to reconcile
pub trait EventMapper: Send + Sync {
    fn map(&self, meta: &ObjectMeta) -> Vec<ObjectKey>;
}

/// Enqueue the changed object itself
pub struct SelfMapper;

impl EventMapper for SelfMapper {
    fn map(&self, meta: &ObjectMeta) -> Vec<ObjectKey> {
        match meta.name {
            Some(_) => vec![ObjectKey::from_meta(meta)],
            None => Vec::new(),
        }
    }
}

fn api_group(api_version: &str) -> &str {
    api_version.rsplit_once('/').map(|(g, _)| g).unwrap_or("")
}

/// Enqueue the controlling owner of the changed object
///
/// Only controller owner references of the managed kind are followed; the
/// API version may differ as long as the group matches.
pub struct OwnerMapper {
    group: String,
    kind: String,
}

impl OwnerMapper {
    pub fn new(api_version: &str, kind: &str) -> Self {
        Self {
            group: api_group(api_version).to_string(),
            kind: kind.to_string(),
        }
    }

    pub fn for_kind<K: Resource<DynamicType = ()>>() -> Self {
        Self::new(&K::api_version(&()), &K::kind(&()))
    }
}

impl EventMapper for OwnerMapper {
    fn map(&self, meta: &ObjectMeta) -> Vec<ObjectKey> {
        meta.owner_references
            .iter()
            .flatten()
            .filter(|o| o.controller == Some(true))
            .filter(|o| o.kind == self.kind && api_group(&o.api_version) == self.group)
            .map(|o| ObjectKey::new(meta.namespace.as_deref(), &o.name))
            .collect()
    }
}

/// Enqueue every managed object listed in a back-reference annotation
///
/// The annotation value is a comma-separated list of `namespace/name` keys.
pub struct AnnotationMapper {
    annotation: String,
}

impl AnnotationMapper {
    pub fn new(annotation: impl Into<String>) -> Self {
        Self {
            annotation: annotation.into(),
        }
    }
}

/// Parse a back-reference annotation value
pub fn parse_dependents(value: &str) -> Vec<ObjectKey> {
    value.split(',').filter_map(ObjectKey::parse).collect()
}

/// Render a back-reference annotation value; sorted and de-duplicated
pub fn render_dependents(keys: &[ObjectKey]) -> String {
    let mut rendered: Vec<String> = keys.iter().map(ToString::to_string).collect();
    rendered.sort();
    rendered.dedup();
    rendered.join(",")
}

impl EventMapper for AnnotationMapper {
    fn map(&self, meta: &ObjectMeta) -> Vec<ObjectKey> {
        meta.annotations
            .as_ref()
            .and_then(|a| a.get(&self.annotation))
            .map(|v| parse_dependents(v))
            .unwrap_or_default()
    }
}

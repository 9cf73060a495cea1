//! Bundle controller
//!
//! A Bundle owns one ConfigMap rendered from its spec and may depend on an
//! externally managed Secret. The ConfigMap identity remembers the name it
//! was last written under, so disabling or renaming removes the object where
//! it actually lives.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::ResourceExt;

use super::dependency::{DependencyDescriptor, DependencyResolver};
use super::handle::{ManagedHandle, ManagedObject};
use super::request::Shape;
use super::resource::{ResourceDescriptor, ResourceReconciler};
use crate::client::ObjectKey;
use crate::crd::{Bundle, BundleStatus, Condition, SecretDependencyRef};
use crate::error::{Error, Result};

pub const CONDITION_SECRET_NOT_FOUND: &str = "SecretNotFound";
pub const CONDITION_SECRET_NOT_READY: &str = "SecretNotReady";

impl ManagedObject for Bundle {
    fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or(&[])
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status.get_or_insert_with(BundleStatus::default).conditions
    }

    fn set_observed_generation(&mut self, generation: Option<i64>) {
        self.status
            .get_or_insert_with(BundleStatus::default)
            .observed_generation = generation;
    }
}

fn namespace(bundle: &Bundle) -> Result<String> {
    bundle
        .namespace()
        .ok_or_else(|| Error::validation(format!("Bundle {} has no namespace", bundle.name_any())))
}

/// Where the ConfigMap lives
///
/// While enabled this is the declared name. Once disabled it is the name the
/// ConfigMap was last written under, falling back to the declared one.
pub fn config_map_key(bundle: &Bundle) -> Result<ObjectKey> {
    let template = &bundle.spec.config_map;
    let recorded = bundle
        .status
        .as_ref()
        .and_then(|s| s.config_map_name.as_deref());
    let name = match (template.enabled, recorded) {
        (false, Some(recorded)) => recorded,
        _ => template.name.as_str(),
    };
    Ok(ObjectKey::namespaced(&namespace(bundle)?, name))
}

fn render_config_map(bundle: &Bundle, cm: &mut ConfigMap) -> Result<()> {
    bundle.spec.validate().map_err(Error::ValidationError)?;
    cm.data = Some(bundle.spec.config_map.data.clone());
    Ok(())
}

fn record_config_map(handle: &mut ManagedHandle<Bundle>, cm: Option<&ConfigMap>) -> Result<()> {
    let name = cm.map(|cm| cm.name_any());
    let status = handle
        .object_mut()
        .status
        .get_or_insert_with(BundleStatus::default);
    if status.config_map_name != name {
        status.config_map_name = name;
        handle.request_status_patch();
    }
    Ok(())
}

fn forget_config_map(handle: &mut ManagedHandle<Bundle>, _: Option<&ConfigMap>) -> Result<()> {
    record_config_map(handle, None)
}

fn secret_key(bundle: &Bundle, secret: &SecretDependencyRef) -> ObjectKey {
    match &secret.namespace {
        Some(ns) => ObjectKey::namespaced(ns, &secret.name),
        None => ObjectKey::new(bundle.namespace().as_deref(), &secret.name),
    }
}

/// A Secret counts as ready once `required_key` is present in it
pub fn secret_ready(secret: &Secret, required_key: Option<&str>) -> bool {
    let Some(key) = required_key else {
        return true;
    };
    secret.data.as_ref().is_some_and(|d| d.contains_key(key))
        || secret.string_data.as_ref().is_some_and(|d| d.contains_key(key))
}

fn secret_dependency(secret: &SecretDependencyRef) -> DependencyDescriptor<Bundle, Secret> {
    let reference = secret.clone();
    let required_key = secret.required_key.clone();
    let ready_key = required_key.clone();
    let optional = secret.optional;

    DependencyDescriptor::new(move |bundle: &Bundle| secret_key(bundle, &reference))
        .optional(optional)
        .wait_for_ready(required_key.is_some())
        .ready(move |s: &Secret| secret_ready(s, ready_key.as_deref()))
        .after(move |handle, found| {
            match found {
                None if optional => {
                    handle.remove_condition(CONDITION_SECRET_NOT_FOUND);
                    handle.remove_condition(CONDITION_SECRET_NOT_READY);
                }
                None => {
                    handle.set_condition(Condition::new(
                        CONDITION_SECRET_NOT_FOUND,
                        true,
                        "Missing",
                        "The referenced Secret does not exist",
                    ));
                    handle.remove_condition(CONDITION_SECRET_NOT_READY);
                }
                Some(found) => {
                    handle.remove_condition(CONDITION_SECRET_NOT_FOUND);
                    if secret_ready(found, required_key.as_deref()) {
                        handle.remove_condition(CONDITION_SECRET_NOT_READY);
                    } else {
                        handle.set_condition(Condition::new(
                            CONDITION_SECRET_NOT_READY,
                            true,
                            "MissingKey",
                            &format!(
                                "Secret {} has no key {}",
                                found.name_any(),
                                required_key.as_deref().unwrap_or_default()
                            ),
                        ));
                    }
                }
            }
            Ok(())
        })
}

/// Resources and dependencies of a Bundle
pub struct BundleShape;

impl Shape<Bundle> for BundleShape {
    fn resources(&self, _: &Bundle) -> Vec<Arc<dyn ResourceReconciler<Bundle>>> {
        let config_map = ResourceDescriptor::<Bundle, ConfigMap>::new(config_map_key, render_config_map)
            .skip_and_delete(|b: &Bundle| !b.spec.config_map.enabled)
            .on_create(record_config_map)
            .on_update(record_config_map)
            .on_delete(forget_config_map);
        vec![Arc::new(config_map)]
    }

    fn dependencies(&self, bundle: &Bundle) -> Vec<Arc<dyn DependencyResolver<Bundle>>> {
        match &bundle.spec.secret_ref {
            Some(secret) => vec![Arc::new(secret_dependency(secret))],
            None => Vec::new(),
        }
    }
}
